//! Ports - 抽象化レイヤー
//!
//! 時刻、ID 生成、イベント通知、割り当て戦略を trait として切り出し、
//! テストや組み込み先で差し替えられるようにしています。

pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod strategy;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{BroadcastEventSink, EventSink, FanoutEventSink, NoopEventSink};
pub use self::id_generator::{IdGenerator, SequentialIdGenerator, UlidGenerator};
pub use self::strategy::AssignmentStrategy;
