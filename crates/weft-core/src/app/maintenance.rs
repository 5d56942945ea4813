//! MaintenanceLoop - 定期的な掃除ループ
//!
//! Task Store と Message Bus はそれぞれ自分の掃除処理（`Maintenance::sweep`）を持ち、
//! このループが `cleanup_interval` ごとに呼び出します。呼び出し元の操作とは独立です。
//!
//! # 停止
//! - `watch` チャネルに true を送ると次の待機点で抜ける
//! - 実行中の sweep は最後まで走らせる

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::debug;

/// A component with a periodic housekeeping pass.
#[async_trait]
pub trait Maintenance: Send + Sync {
    fn name(&self) -> &'static str;

    async fn sweep(&self);
}

/// Handle to a spawned maintenance loop.
pub struct MaintenanceLoop {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl MaintenanceLoop {
    /// Spawn a loop that sweeps `target` every `every`. The first sweep runs
    /// one full interval after spawning.
    pub fn spawn(target: Arc<dyn Maintenance>, every: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let name = target.name();
        let join = tokio::spawn(run(target, every, shutdown_rx));
        debug!(loop_name = name, ?every, "maintenance loop started");
        Self {
            name,
            shutdown_tx,
            join,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn request_shutdown(&self) {
        // ループ側が既に終わっていても構わない
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
        debug!(loop_name = self.name, "maintenance loop stopped");
    }
}

async fn run(target: Arc<dyn Maintenance>, every: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }
        target.sweep().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl Maintenance for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn sweep(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_on_interval_until_shutdown() {
        let target = Arc::new(Counting(AtomicUsize::new(0)));
        let handle = MaintenanceLoop::spawn(target.clone(), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(target.0.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(target.0.load(Ordering::SeqCst), 2);

        handle.shutdown_and_join().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(target.0.load(Ordering::SeqCst), 2);
    }
}
