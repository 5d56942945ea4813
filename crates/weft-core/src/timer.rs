//! TimerService - エンティティ ID をキーにした単発タイマー
//!
//! タスクのタイムアウト、エージェントのハートビート監視、KV の TTL はすべて
//! 「キーごとに 1 本だけ生きているタイマー」で表現できます。
//!
//! - `arm()` は同じキーの既存タイマーを置き換える（古い方は abort）
//! - `disarm()` は map からの削除 + abort で O(1)
//! - 発火時は generation を照合し、置き換え済みのタイマーはコールバックを呼ばない
//!
//! タイマーは呼び出し元の tokio runtime、なければ `new()` 時点の runtime に spawn します。
//! どちらもなければ `arm()` は false を返し、何も登録しません。
//!
//! コールバック側でも対象エンティティの存在確認を行うこと。タイマーの発火と
//! エンティティの削除は競合しうる。

use std::borrow::Borrow;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

#[derive(Debug)]
struct TimerEntry {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Debug)]
struct TimerTable<K> {
    entries: Mutex<HashMap<K, TimerEntry>>,
    next_generation: AtomicU64,
}

/// Keyed one-shot timers backed by tokio tasks.
#[derive(Debug)]
pub struct TimerService<K> {
    table: Arc<TimerTable<K>>,
    runtime: Option<Handle>,
}

impl<K> Clone for TimerService<K> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            runtime: self.runtime.clone(),
        }
    }
}

impl<K> Default for TimerService<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TimerService<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            table: Arc::new(TimerTable {
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
            runtime: Handle::try_current().ok(),
        }
    }

    /// Arm (or re-arm) the timer for `key`. `on_fire` runs once after `after`
    /// unless the timer is disarmed or replaced first.
    ///
    /// Returns false, leaving any previous timer for `key` untouched, when
    /// there is no runtime to run the timer on.
    pub fn arm<F, Fut>(&self, key: K, after: Duration, on_fire: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(runtime) = Handle::try_current().ok().or_else(|| self.runtime.clone()) else {
            return false;
        };
        let generation = self.table.next_generation.fetch_add(1, Ordering::Relaxed);
        let table = Arc::clone(&self.table);
        let fire_key = key.clone();

        // ロック中に spawn して、登録前に発火するレースを防ぐ
        let mut entries = self.table.entries.lock();
        let join = runtime.spawn(async move {
            tokio::time::sleep(after).await;
            let still_current = {
                let mut entries = table.entries.lock();
                match entries.get(&fire_key) {
                    Some(entry) if entry.generation == generation => {
                        entries.remove(&fire_key);
                        true
                    }
                    _ => false,
                }
            };
            if still_current {
                on_fire().await;
            }
        });
        if let Some(previous) = entries.insert(
            key,
            TimerEntry {
                generation,
                handle: join.abort_handle(),
            },
        ) {
            previous.handle.abort();
        }
        true
    }

    /// Cancel the timer for `key`. Returns whether one was armed.
    pub fn disarm<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.table.entries.lock().remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.table.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.table.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disarm every timer whose key fails `keep`. Returns how many were removed.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let mut entries = self.table.entries.lock();
        let before = entries.len();
        entries.retain(|key, entry| {
            let kept = keep(key);
            if !kept {
                entry.handle.abort();
            }
            kept
        });
        before - entries.len()
    }

    /// Disarm everything.
    pub fn clear(&self) -> usize {
        let mut entries = self.table.entries.lock();
        let count = entries.len();
        for (_, entry) in entries.drain() {
            entry.handle.abort();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_callback(
        counter: &Arc<AtomicUsize>,
    ) -> impl FnOnce() -> std::future::Ready<()> + Send + use<> {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_once_after_delay() {
        let timers = TimerService::new();
        let fired = Arc::new(AtomicUsize::new(0));

        timers.arm("k", Duration::from_secs(1), counter_callback(&fired));
        assert!(timers.is_armed(&"k"));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.is_armed(&"k"));
    }

    #[tokio::test(start_paused = true)]
    async fn arm_from_plain_thread_uses_creating_runtime() {
        let timers = TimerService::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let armed = std::thread::spawn({
            let timers = timers.clone();
            let callback = counter_callback(&fired);
            move || timers.arm("k", Duration::from_secs(1), callback)
        })
        .join()
        .unwrap();
        assert!(armed);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arm_without_any_runtime_reports_failure() {
        let timers: TimerService<&str> = TimerService::new();
        assert!(!timers.arm("k", Duration::from_secs(1), || async {}));
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_previous_timer() {
        let timers = TimerService::new();
        let fired = Arc::new(AtomicUsize::new(0));

        timers.arm("k", Duration::from_secs(1), counter_callback(&fired));
        tokio::time::sleep(Duration::from_millis(800)).await;
        timers.arm("k", Duration::from_secs(1), counter_callback(&fired));

        // 最初のタイマーの期限を過ぎても発火しない
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_prevents_fire() {
        let timers = TimerService::new();
        let fired = Arc::new(AtomicUsize::new(0));

        timers.arm(7u64, Duration::from_secs(1), counter_callback(&fired));
        assert!(timers.disarm(&7));
        assert!(!timers.disarm(&7));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retain_drops_unwanted_keys() {
        let timers = TimerService::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for key in 0..4u32 {
            timers.arm(key, Duration::from_secs(1), counter_callback(&fired));
        }

        assert_eq!(timers.retain(|key| key % 2 == 0), 2);
        assert_eq!(timers.len(), 2);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
