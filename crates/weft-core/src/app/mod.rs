//! App - アプリケーション層
//!
//! Task Store と Agent Registry を組み合わせて割り当てループを回し、
//! 各コンポーネントの定期メンテナンスを起動します。
//!
//! # 主要コンポーネント
//! - **CoreBuilder / Core**: 構築とワイヤリング、起動と停止
//! - **Coordinator**: pending タスクの割り当てループ
//! - **MaintenanceLoop**: Task Store / Message Bus の定期掃除
//! - **CoreStatus**: 全体のスナップショット

pub mod builder;
pub mod coordinator;
pub mod maintenance;
pub mod status;

pub use self::builder::{Core, CoreBuilder};
pub use self::coordinator::{Assignment, Coordinator, CoordinatorWakeSink};
pub use self::maintenance::{Maintenance, MaintenanceLoop};
pub use self::status::{AgentCounts, CoreStatus};
