//! Message Bus - 名前付きキュー / pub-sub チャネル / TTL 付き KV
//!
//! 他のコンポーネントにも外部の呼び出し元にも使われる、疎結合な通知の土台です。
//!
//! # 実装
//! - 状態は `parking_lot::Mutex` 1 つで守る。`dequeue` 以外はすべて同期 API
//! - `dequeue` はキューが空なら `oneshot` の待機者を登録して待つ
//!   （タイムアウト 0 は無期限）。待機を途中で諦めても待機者は必ず外れる
//! - `publish` はハンドラ一覧をコピーしてからロック外で順に呼ぶ。
//!   ハンドラの panic はハンドラ単位で握りつぶしてログに残す
//! - KV の期限切れはキーごとの `TimerService` タイマー。読み出し時にも期限を確認する
//! - `shutdown` は完全リセット（待機者は `None` で解放、タイマー全解除、全データ破棄）

mod kv;
mod metrics;
mod pubsub;
mod queue;

pub use metrics::{BusMetrics, BusSweepReport, NearLimit};
pub use pubsub::{Handler, SubscriptionId};

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::app::maintenance::Maintenance;
use crate::bounded::BoundedMap;
use crate::config::BusConfig;
use crate::error::{CoreError, Result};
use crate::ports::Clock;
use crate::timer::TimerService;

use kv::KvEntry;
use metrics::{BusCounters, Counter, near_limit};
use pubsub::Channel;
use queue::{Delivery, NamedQueue, WaiterId};

struct BusState {
    queues: HashMap<String, NamedQueue>,
    channels: BoundedMap<String, Channel>,
    kv: BoundedMap<String, KvEntry>,
    next_waiter: WaiterId,
    next_subscription: u64,
}

impl BusState {
    fn new(config: &BusConfig) -> Self {
        Self {
            queues: HashMap::new(),
            channels: BoundedMap::new(config.max_channels),
            kv: BoundedMap::new(config.max_kv_entries),
            next_waiter: 0,
            next_subscription: 0,
        }
    }

    fn queue_mut(&mut self, name: &str, capacity: usize) -> &mut NamedQueue {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| NamedQueue::new(capacity))
    }
}

struct Shared {
    state: Mutex<BusState>,
    timers: TimerService<String>,
    counters: BusCounters,
    config: BusConfig,
    clock: Arc<dyn Clock>,
}

/// In-process message bus. Cloning shares the same bus.
#[derive(Clone)]
pub struct MessageBus {
    shared: Arc<Shared>,
}

impl MessageBus {
    pub fn new(config: BusConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BusState::new(&config)),
                timers: TimerService::new(),
                counters: BusCounters::default(),
                config,
                clock,
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    // ---- queues -----------------------------------------------------------

    /// Append to `queue`, or hand the message straight to the longest-waiting
    /// `dequeue` caller. A full queue drops its oldest message first.
    pub fn enqueue(&self, queue: &str, message: Value) {
        let delivery = {
            let mut state = self.shared.state.lock();
            state
                .queue_mut(queue, self.shared.config.max_queue_size)
                .offer(message)
        };

        let counters = &self.shared.counters;
        counters.incr(Counter::Enqueued);
        match delivery {
            Delivery::Handed => {
                counters.incr(Counter::Dequeued);
                debug!(%queue, "message handed to waiting consumer");
            }
            Delivery::Queued { dropped: Some(_) } => {
                counters.incr(Counter::Dropped);
                warn!(%queue, limit = self.shared.config.max_queue_size, "queue full; dropped oldest message");
            }
            Delivery::Queued { dropped: None } => {}
        }
    }

    /// Take the head of `queue`, waiting up to `timeout` for one to arrive.
    /// A zero timeout waits until a message arrives or the bus shuts down.
    ///
    /// Dropping the returned future releases the wait without losing a
    /// message that was already routed to it.
    pub async fn dequeue(&self, queue: &str, timeout: Duration) -> Option<Value> {
        let (id, rx) = {
            let mut state = self.shared.state.lock();
            let id = state.next_waiter;
            state.next_waiter += 1;
            let named = state.queue_mut(queue, self.shared.config.max_queue_size);
            if let Some(message) = named.pop() {
                drop(state);
                self.shared.counters.incr(Counter::Dequeued);
                return Some(message);
            }
            (id, named.wait(id))
        };

        let mut wait = PendingWait {
            shared: Arc::clone(&self.shared),
            queue: queue.to_string(),
            id,
            rx,
            settled: false,
        };

        if timeout.is_zero() {
            return wait.recv().await;
        }
        match tokio::time::timeout(timeout, wait.recv()).await {
            Ok(received) => received,
            Err(_) => {
                let raced = wait.cancel();
                if raced.is_none() {
                    debug!(%queue, ?timeout, "dequeue timed out");
                }
                raced
            }
        }
    }

    /// Messages currently stored in `queue`, head first.
    pub fn queue_snapshot(&self, queue: &str) -> Vec<Value> {
        let state = self.shared.state.lock();
        state
            .queues
            .get(queue)
            .map(NamedQueue::snapshot)
            .unwrap_or_default()
    }

    // ---- pub/sub ----------------------------------------------------------

    /// Deliver `message` to every handler on `channel`, in subscription order.
    /// Returns how many handlers ran to completion.
    pub fn publish(&self, channel: &str, message: Value) -> usize {
        let handlers = {
            let state = self.shared.state.lock();
            state
                .channels
                .get(channel)
                .map(Channel::handlers)
                .unwrap_or_default()
        };

        self.shared.counters.incr(Counter::Published);
        if handlers.is_empty() {
            debug!(%channel, "published to channel without subscribers");
            return 0;
        }
        let (delivered, panicked) = pubsub::deliver(channel, &handlers, &message);
        self.shared.counters.add(Counter::HandlerPanics, panicked);
        delivered
    }

    /// Attach `handler` to `channel`.
    ///
    /// Fails with `CapacityExceeded` when `channel` is new and the bus already
    /// holds `max_channels` channels.
    pub fn subscribe<F>(&self, channel: &str, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut state = self.shared.state.lock();
        if !state.channels.contains_key(channel) {
            let limit = state.channels.capacity();
            if state
                .channels
                .try_insert(channel.to_string(), Channel::default())
                .is_err()
            {
                drop(state);
                warn!(%channel, limit, "subscription rejected; channel limit reached");
                return Err(CoreError::CapacityExceeded {
                    resource: "channels",
                    limit,
                });
            }
        }

        let id = SubscriptionId::new(state.next_subscription);
        state.next_subscription += 1;
        let entry = state
            .channels
            .get_mut(channel)
            .ok_or_else(|| CoreError::Internal(format!("channel {channel} vanished during subscribe")))?;
        entry.add(id, Arc::new(handler));
        debug!(%channel, subscription = %id, "subscribed");
        Ok(id)
    }

    /// Detach one handler, or every handler on `channel` with `None`. A
    /// channel left without handlers is removed. Returns how many went.
    pub fn unsubscribe(&self, channel: &str, subscription: Option<SubscriptionId>) -> usize {
        let mut state = self.shared.state.lock();
        let Some(entry) = state.channels.get_mut(channel) else {
            return 0;
        };
        let removed = entry.remove(subscription);
        if entry.is_empty() {
            state.channels.remove(channel);
        }
        debug!(%channel, removed, "unsubscribed");
        removed
    }

    // ---- key/value --------------------------------------------------------

    /// Store `value` under `key`. A zero or absent TTL means no expiry.
    ///
    /// Re-setting a key replaces its expiry timer and makes it the newest
    /// entry. At capacity the oldest key is evicted first.
    ///
    /// Safe to call from threads outside the runtime: the expiry timer runs on
    /// the runtime the bus was created in. A bus created with no runtime at
    /// all still honors the TTL on `get` and in `sweep`.
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let ttl = ttl.filter(|ttl| !ttl.is_zero());
        let expires_at = ttl.map(|ttl| deadline(self.shared.clock.now(), ttl));

        let evicted = {
            let mut state = self.shared.state.lock();
            let evicted = state.kv.insert(key.to_string(), KvEntry::new(value, expires_at));
            for (evicted_key, _) in &evicted {
                self.shared.timers.disarm(evicted_key.as_str());
            }
            match ttl {
                Some(ttl) => self.arm_expiry(key.to_string(), ttl),
                None => {
                    self.shared.timers.disarm(key);
                }
            }
            evicted
        };

        if !evicted.is_empty() {
            self.shared.counters.add(Counter::Evicted, evicted.len());
            let keys: Vec<&str> = evicted.iter().map(|(k, _)| k.as_str()).collect();
            warn!(?keys, limit = self.shared.config.max_kv_entries, "kv store full; evicted oldest keys");
        }
    }

    fn arm_expiry(&self, key: String, ttl: Duration) {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let fire_key = key.clone();
        let armed = self.shared.timers.arm(key, ttl, move || async move {
            if let Some(shared) = weak.upgrade() {
                MessageBus { shared }.expire(&fire_key);
            }
        });
        if !armed {
            debug!("no tokio runtime for kv expiry timer; entry expires on read or sweep");
        }
    }

    fn expire(&self, key: &str) {
        let removed = {
            let mut state = self.shared.state.lock();
            let has_ttl = state
                .kv
                .get(key)
                .is_some_and(|entry| entry.expires_at.is_some());
            has_ttl && state.kv.remove(key).is_some()
        };
        if removed {
            self.shared.counters.incr(Counter::Expired);
            debug!(%key, "kv entry expired");
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let now = self.shared.clock.now();
        let mut state = self.shared.state.lock();
        match state.kv.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }
        // タイマーより先に期限を過ぎた読み出し
        state.kv.remove(key);
        self.shared.timers.disarm(key);
        drop(state);
        self.shared.counters.incr(Counter::Expired);
        None
    }

    /// Remove `key`. Returns whether it existed.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.shared.state.lock();
        let existed = state.kv.remove(key).is_some();
        self.shared.timers.disarm(key);
        existed
    }

    // ---- housekeeping -----------------------------------------------------

    pub fn metrics(&self) -> BusMetrics {
        let ratio = self.shared.config.near_limit_ratio;
        let counters = &self.shared.counters;
        let state = self.shared.state.lock();

        let mut near_queues: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, queue)| near_limit(queue.len(), queue.capacity(), ratio))
            .map(|(name, _)| name.clone())
            .collect();
        near_queues.sort();

        BusMetrics {
            queues: state.queues.len(),
            queued_messages: state.queues.values().map(NamedQueue::len).sum(),
            waiting_consumers: state.queues.values().map(NamedQueue::waiting).sum(),
            channels: state.channels.len(),
            handlers: state.channels.values().map(Channel::len).sum(),
            kv_entries: state.kv.len(),
            active_timers: self.shared.timers.len(),
            enqueued_total: counters.get(Counter::Enqueued),
            dequeued_total: counters.get(Counter::Dequeued),
            dropped_total: counters.get(Counter::Dropped),
            published_total: counters.get(Counter::Published),
            handler_panics_total: counters.get(Counter::HandlerPanics),
            evicted_total: counters.get(Counter::Evicted),
            expired_total: counters.get(Counter::Expired),
            near_limit: NearLimit {
                queues: near_queues,
                kv: near_limit(state.kv.len(), state.kv.capacity(), ratio),
                channels: near_limit(state.channels.len(), state.channels.capacity(), ratio),
            },
        }
    }

    /// One housekeeping pass:
    /// - drop channels without handlers
    /// - drop waiters whose caller went away, then queues with nothing in them
    /// - expire overdue KV entries and re-enforce the KV bound
    /// - disarm expiry timers whose key no longer exists
    pub fn sweep(&self) -> BusSweepReport {
        let now = self.shared.clock.now();
        let mut report = BusSweepReport::default();

        {
            let mut state = self.shared.state.lock();

            report.empty_channels = state.channels.retain(|_, channel| !channel.is_empty()).len();

            for queue in state.queues.values_mut() {
                report.abandoned_waiters += queue.prune_waiters();
            }
            let before = state.queues.len();
            state.queues.retain(|_, queue| !queue.is_idle());
            report.idle_queues = before - state.queues.len();

            let expired = state.kv.retain(|_, entry| !entry.is_expired(now));
            report.expired_entries = expired.len();
            let evicted = state.kv.enforce_capacity();
            report.evicted_entries = evicted.len();

            let kv = &state.kv;
            report.orphan_timers = self.shared.timers.retain(|key| kv.contains_key(key));
        }

        let counters = &self.shared.counters;
        counters.add(Counter::Expired, report.expired_entries);
        counters.add(Counter::Evicted, report.evicted_entries);

        if report.is_empty() {
            debug!("bus sweep: nothing to do");
        } else {
            info!(?report, "bus sweep");
        }
        report
    }

    /// Full reset: pending waits resolve with `None`, every timer is
    /// disarmed, all queues, channels, handlers and entries are discarded.
    pub fn shutdown(&self) {
        let drained = {
            let mut state = self.shared.state.lock();
            let fresh = BusState {
                next_waiter: state.next_waiter,
                next_subscription: state.next_subscription,
                ..BusState::new(&self.shared.config)
            };
            std::mem::replace(&mut *state, fresh)
        };
        let timers = self.shared.timers.clear();
        self.shared.counters.reset();

        let waiters: usize = drained.queues.values().map(NamedQueue::waiting).sum();
        // 待機者の Sender はここで drop され、dequeue 側は None を受け取る
        drop(drained);
        info!(waiters, timers, "message bus reset");
    }
}

#[async_trait]
impl Maintenance for MessageBus {
    fn name(&self) -> &'static str {
        "message_bus"
    }

    async fn sweep(&self) {
        MessageBus::sweep(self);
    }
}

fn deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A registered `dequeue` wait. Removing it from the queue on drop keeps an
/// abandoned caller from leaking or swallowing a message.
struct PendingWait {
    shared: Arc<Shared>,
    queue: String,
    id: WaiterId,
    rx: oneshot::Receiver<Value>,
    settled: bool,
}

impl PendingWait {
    async fn recv(&mut self) -> Option<Value> {
        let received = (&mut self.rx).await.ok();
        self.settled = true;
        received
    }

    /// Stop waiting. A message routed here before the waiter could be removed
    /// is returned instead of lost.
    fn cancel(&mut self) -> Option<Value> {
        self.settled = true;
        let removed = {
            let mut state = self.shared.state.lock();
            state
                .queues
                .get_mut(&self.queue)
                .is_some_and(|queue| queue.cancel_wait(self.id))
        };
        if removed { None } else { self.rx.try_recv().ok() }
    }
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.shared.state.lock();
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return;
        };
        if queue.cancel_wait(self.id) {
            return;
        }
        // 既に渡されていたメッセージは次の待機者かキュー先頭へ戻す
        if let Ok(message) = self.rx.try_recv() {
            queue.restore(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::SystemClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bus(config: BusConfig) -> MessageBus {
        MessageBus::new(config, Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn dequeue_returns_queued_message_immediately() {
        let bus = bus(BusConfig::default());
        bus.enqueue("jobs", json!("a"));
        bus.enqueue("jobs", json!("b"));
        assert_eq!(bus.dequeue("jobs", Duration::from_secs(1)).await, Some(json!("a")));
        assert_eq!(bus.dequeue("jobs", Duration::from_secs(1)).await, Some(json!("b")));
    }

    #[tokio::test]
    async fn capacity_drops_oldest() {
        let bus = bus(BusConfig {
            max_queue_size: 2,
            ..BusConfig::default()
        });
        bus.enqueue("q", json!("m1"));
        bus.enqueue("q", json!("m2"));
        bus.enqueue("q", json!("m3"));
        assert_eq!(bus.queue_snapshot("q"), vec![json!("m2"), json!("m3")]);
        assert_eq!(bus.metrics().dropped_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_times_out_with_none() {
        let bus = bus(BusConfig::default());
        let started = tokio::time::Instant::now();
        assert_eq!(bus.dequeue("empty", Duration::from_secs(2)).await, None);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(bus.metrics().waiting_consumers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_dequeue_receives_enqueued_message() {
        let bus = bus(BusConfig::default());
        let consumer = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.dequeue("q", Duration::ZERO).await })
        };
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(bus.metrics().waiting_consumers, 1);

        bus.enqueue("q", json!("m"));
        assert_eq!(consumer.await.unwrap(), Some(json!("m")));
        // 待機者に直接渡したのでキューには残らない
        assert!(bus.queue_snapshot("q").is_empty());
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let bus = bus(BusConfig::default());
        let mut consumers = Vec::new();
        for _ in 0..3 {
            let bus_clone = bus.clone();
            consumers.push(tokio::spawn(async move {
                bus_clone.dequeue("q", Duration::ZERO).await
            }));
            // 登録順を確定させる
            while bus.metrics().waiting_consumers < consumers.len() {
                tokio::task::yield_now().await;
            }
        }

        for i in 0..3 {
            bus.enqueue("q", json!(i));
        }
        for (i, consumer) in consumers.into_iter().enumerate() {
            assert_eq!(consumer.await.unwrap(), Some(json!(i)));
        }
    }

    #[tokio::test]
    async fn abandoned_dequeue_leaves_no_waiter() {
        let bus = bus(BusConfig::default());
        let consumer = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.dequeue("q", Duration::ZERO).await })
        };
        while bus.metrics().waiting_consumers == 0 {
            tokio::task::yield_now().await;
        }
        consumer.abort();
        let _ = consumer.await;

        assert_eq!(bus.metrics().waiting_consumers, 0);
        bus.enqueue("q", json!("kept"));
        assert_eq!(bus.queue_snapshot("q"), vec![json!("kept")]);
    }

    #[tokio::test]
    async fn shutdown_releases_waiters() {
        let bus = bus(BusConfig::default());
        let consumer = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.dequeue("q", Duration::ZERO).await })
        };
        while bus.metrics().waiting_consumers == 0 {
            tokio::task::yield_now().await;
        }
        bus.set("k", json!(1), Some(Duration::from_secs(30)));
        bus.subscribe("c", |_| {}).unwrap();

        bus.shutdown();
        assert_eq!(consumer.await.unwrap(), None);
        let metrics = bus.metrics();
        assert_eq!(metrics.queues, 0);
        assert_eq!(metrics.channels, 0);
        assert_eq!(metrics.kv_entries, 0);
        assert_eq!(metrics.active_timers, 0);
    }

    #[test]
    fn publish_reaches_subscribers_in_order() {
        let bus = bus(BusConfig::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second"] {
            let log = Arc::clone(&log);
            bus.subscribe("events", move |message| log.lock().push((name, message.clone())))
                .unwrap();
        }

        assert_eq!(bus.publish("events", json!(1)), 2);
        assert_eq!(bus.publish("other", json!(2)), 0);
        assert_eq!(
            *log.lock(),
            vec![("first", json!(1)), ("second", json!(1))]
        );
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        let bus = bus(BusConfig::default());
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe("c", |_| panic!("bad handler")).unwrap();
        let counter = Arc::clone(&hits);
        bus.subscribe("c", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert_eq!(bus.publish("c", json!(null)), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.metrics().handler_panics_total, 1);
    }

    #[test]
    fn unsubscribe_one_or_all() {
        let bus = bus(BusConfig::default());
        let first = bus.subscribe("c", |_| {}).unwrap();
        bus.subscribe("c", |_| {}).unwrap();

        assert_eq!(bus.unsubscribe("c", Some(first)), 1);
        assert_eq!(bus.metrics().handlers, 1);
        assert_eq!(bus.unsubscribe("c", None), 1);
        assert_eq!(bus.metrics().channels, 0);
        assert_eq!(bus.unsubscribe("missing", None), 0);
    }

    #[test]
    fn channel_limit_rejects_new_channels() {
        let bus = bus(BusConfig {
            max_channels: 2,
            ..BusConfig::default()
        });
        bus.subscribe("a", |_| {}).unwrap();
        bus.subscribe("b", |_| {}).unwrap();
        // 既存チャネルへの追加は上限に関係しない
        bus.subscribe("a", |_| {}).unwrap();

        let err = bus.subscribe("c", |_| {}).unwrap_err();
        assert_eq!(
            err,
            CoreError::CapacityExceeded {
                resource: "channels",
                limit: 2
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn kv_entry_expires_after_ttl() {
        let bus = bus(BusConfig::default());
        bus.set("session", json!("abc"), Some(Duration::from_secs(1)));
        assert_eq!(bus.get("session"), Some(json!("abc")));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(bus.get("session"), None);
        assert_eq!(bus.metrics().expired_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resetting_key_replaces_timer() {
        let bus = bus(BusConfig::default());
        bus.set("k", json!(1), Some(Duration::from_secs(1)));
        tokio::time::sleep(Duration::from_millis(800)).await;
        bus.set("k", json!(2), Some(Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(bus.get("k"), Some(json!(2)));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(bus.get("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn set_with_ttl_from_plain_thread_still_expires() {
        let bus = bus(BusConfig::default());
        std::thread::spawn({
            let bus = bus.clone();
            move || bus.set("k", json!("v"), Some(Duration::from_secs(1)))
        })
        .join()
        .unwrap();
        assert_eq!(bus.metrics().active_timers, 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(bus.get("k"), None);
        assert_eq!(bus.metrics().active_timers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn setting_without_ttl_cancels_expiry() {
        let bus = bus(BusConfig::default());
        bus.set("k", json!(1), Some(Duration::from_secs(1)));
        bus.set("k", json!(2), None);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(bus.get("k"), Some(json!(2)));
        assert_eq!(bus.metrics().active_timers, 0);
    }

    #[tokio::test]
    async fn kv_capacity_evicts_oldest_key() {
        let bus = bus(BusConfig {
            max_kv_entries: 2,
            ..BusConfig::default()
        });
        bus.set("a", json!(1), Some(Duration::from_secs(60)));
        bus.set("b", json!(2), None);
        bus.set("c", json!(3), None);

        assert_eq!(bus.get("a"), None);
        assert_eq!(bus.get("b"), Some(json!(2)));
        assert_eq!(bus.get("c"), Some(json!(3)));
        let metrics = bus.metrics();
        assert_eq!(metrics.evicted_total, 1);
        // 追い出されたキーのタイマーも外れる
        assert_eq!(metrics.active_timers, 0);
        assert!(metrics.near_limit.kv);
    }

    #[tokio::test]
    async fn delete_removes_key_and_timer() {
        let bus = bus(BusConfig::default());
        bus.set("k", json!(1), Some(Duration::from_secs(60)));
        assert!(bus.delete("k"));
        assert!(!bus.delete("k"));
        assert_eq!(bus.get("k"), None);
        assert_eq!(bus.metrics().active_timers, 0);
    }

    #[tokio::test]
    async fn sweep_drops_idle_queues() {
        let bus = bus(BusConfig::default());
        bus.enqueue("busy", json!(1));
        assert_eq!(bus.dequeue("drained", Duration::from_millis(1)).await, None);

        let report = bus.sweep();
        assert_eq!(report.idle_queues, 1);
        assert_eq!(bus.metrics().queues, 1);
        assert!(bus.sweep().is_empty());
    }

    #[tokio::test]
    async fn metrics_flag_queues_near_limit() {
        let bus = bus(BusConfig {
            max_queue_size: 10,
            near_limit_ratio: 0.5,
            ..BusConfig::default()
        });
        for i in 0..5 {
            bus.enqueue("hot", json!(i));
        }
        bus.enqueue("cold", json!(0));

        let metrics = bus.metrics();
        assert_eq!(metrics.near_limit.queues, vec!["hot".to_string()]);
        assert!(metrics.near_limit.any());
        assert_eq!(metrics.queued_messages, 6);
        assert_eq!(metrics.enqueued_total, 6);
    }
}
