//! IdGenerator port - ID 採番の抽象化
//!
//! # 実装
//! - **UlidGenerator**: Clock の時刻を使う単調増加 ULID（本番用）
//! - **SequentialIdGenerator**: 1, 2, 3... と数えるだけ（テストで順序を固定したいとき）

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;
use ulid::{Generator, Ulid};

use crate::domain::ids::{AgentId, TaskId};
use crate::ports::Clock;

/// Source of fresh ids. Implementations only supply raw ULIDs; the typed
/// helpers are shared.
pub trait IdGenerator: Send + Sync {
    fn next_ulid(&self) -> Ulid;

    fn task_id(&self) -> TaskId {
        TaskId::from_ulid(self.next_ulid())
    }

    fn agent_id(&self) -> AgentId {
        AgentId::from_ulid(self.next_ulid())
    }
}

/// ULIDs stamped with the injected clock, strictly increasing even when
/// several are made within the same millisecond.
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
    inner: Mutex<Generator>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Generator::new()),
        }
    }
}

impl IdGenerator for UlidGenerator {
    fn next_ulid(&self) -> Ulid {
        let now = self.clock.now();
        match self.inner.lock().generate_from_datetime(SystemTime::from(now)) {
            Ok(ulid) => ulid,
            // 同一ミリ秒でランダム部が溢れたときだけ。単調性は諦めて一意性を取る
            Err(_) => Ulid::from_parts(now.timestamp_millis().max(0) as u64, rand::random()),
        }
    }
}

/// Counts up from 1. Ids sort in creation order and are stable across runs.
#[derive(Default)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_ulid(&self) -> Ulid {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        Ulid::from(u128::from(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};

    #[test]
    fn same_instant_still_yields_increasing_ids() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let ids = UlidGenerator::new(Arc::new(FixedClock::new(at)));

        let batch: Vec<TaskId> = (0..5).map(|_| ids.task_id()).collect();
        assert!(batch.windows(2).all(|w| w[0] < w[1]));
        assert!(
            batch
                .iter()
                .all(|id| id.as_ulid().timestamp_ms() == at.timestamp_millis() as u64)
        );
    }

    #[test]
    fn sequential_ids_are_predictable() {
        let ids = SequentialIdGenerator::new();
        let a = ids.agent_id();
        let t = ids.task_id();
        assert_eq!(a.as_ulid(), Ulid::from(1u128));
        assert_eq!(t.as_ulid(), Ulid::from(2u128));
    }
}
