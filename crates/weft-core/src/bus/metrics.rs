//! Bus metrics: point-in-time sizes plus cumulative counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Cumulative counters, bumped without taking the bus lock.
#[derive(Debug, Default)]
pub(crate) struct BusCounters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dropped: AtomicU64,
    published: AtomicU64,
    handler_panics: AtomicU64,
    evicted: AtomicU64,
    expired: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Counter {
    Enqueued,
    Dequeued,
    Dropped,
    Published,
    HandlerPanics,
    Evicted,
    Expired,
}

impl BusCounters {
    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Enqueued => &self.enqueued,
            Counter::Dequeued => &self.dequeued,
            Counter::Dropped => &self.dropped,
            Counter::Published => &self.published,
            Counter::HandlerPanics => &self.handler_panics,
            Counter::Evicted => &self.evicted,
            Counter::Expired => &self.expired,
        }
    }

    pub(crate) fn add(&self, counter: Counter, n: usize) {
        if n > 0 {
            self.slot(counter).fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub(crate) fn get(&self, counter: Counter) -> u64 {
        self.slot(counter).load(Ordering::Relaxed)
    }

    pub(crate) fn reset(&self) {
        for counter in [
            Counter::Enqueued,
            Counter::Dequeued,
            Counter::Dropped,
            Counter::Published,
            Counter::HandlerPanics,
            Counter::Evicted,
            Counter::Expired,
        ] {
            self.slot(counter).store(0, Ordering::Relaxed);
        }
    }
}

/// Flags raised when a structure fills past `near_limit_ratio` of its bound.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NearLimit {
    /// Queues at or above the ratio, sorted by name.
    pub queues: Vec<String>,
    pub kv: bool,
    pub channels: bool,
}

impl NearLimit {
    pub fn any(&self) -> bool {
        !self.queues.is_empty() || self.kv || self.channels
    }
}

/// Bus-wide snapshot returned by `MessageBus::metrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusMetrics {
    pub queues: usize,
    pub queued_messages: usize,
    pub waiting_consumers: usize,
    pub channels: usize,
    pub handlers: usize,
    pub kv_entries: usize,
    pub active_timers: usize,
    pub enqueued_total: u64,
    pub dequeued_total: u64,
    pub dropped_total: u64,
    pub published_total: u64,
    pub handler_panics_total: u64,
    pub evicted_total: u64,
    pub expired_total: u64,
    pub near_limit: NearLimit,
}

/// Outcome of one `MessageBus::sweep` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusSweepReport {
    pub empty_channels: usize,
    pub orphan_timers: usize,
    pub abandoned_waiters: usize,
    pub idle_queues: usize,
    pub expired_entries: usize,
    pub evicted_entries: usize,
}

impl BusSweepReport {
    pub fn is_empty(&self) -> bool {
        *self == BusSweepReport::default()
    }
}

pub(crate) fn near_limit(len: usize, capacity: usize, ratio: f64) -> bool {
    capacity > 0 && len as f64 >= capacity as f64 * ratio
}
