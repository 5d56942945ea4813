//! Named queue - FIFO メッセージ列 + 待機中の dequeue 呼び出し
//!
//! # 実装
//! - メッセージは `BoundedDeque`（満杯なら最古を捨てる）
//! - 待機者は `oneshot::Sender` の FIFO。enqueue されたメッセージは
//!   キューに積む前に最も長く待っている待機者へ直接渡す
//! - 受信側が既に諦めた（Receiver drop 済み）待機者は読み飛ばす

use std::collections::VecDeque;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::bounded::BoundedDeque;

pub(crate) type WaiterId = u64;

struct Waiter {
    id: WaiterId,
    tx: oneshot::Sender<Value>,
}

/// Where an offered message ended up.
#[derive(Debug, PartialEq)]
pub(crate) enum Delivery {
    /// Handed straight to a waiting consumer.
    Handed,
    /// Stored; `dropped` is the oldest message pushed out to make room.
    Queued { dropped: Option<Value> },
}

pub(crate) struct NamedQueue {
    messages: BoundedDeque<Value>,
    waiters: VecDeque<Waiter>,
}

impl NamedQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            messages: BoundedDeque::new(capacity),
            waiters: VecDeque::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.messages.capacity()
    }

    pub(crate) fn waiting(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.messages.is_empty() && self.waiters.is_empty()
    }

    /// Route a message to the longest-waiting live consumer, or store it.
    pub(crate) fn offer(&mut self, message: Value) -> Delivery {
        let message = match self.hand_to_waiter(message) {
            Ok(()) => return Delivery::Handed,
            Err(message) => message,
        };
        Delivery::Queued {
            dropped: self.messages.push_back(message),
        }
    }

    /// Put back a message a consumer received but never read. It goes to the
    /// next waiter or to the head of the queue.
    pub(crate) fn restore(&mut self, message: Value) {
        if let Err(message) = self.hand_to_waiter(message) {
            self.messages.push_front(message);
        }
    }

    fn hand_to_waiter(&mut self, mut message: Value) -> Result<(), Value> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(message) {
                Ok(()) => return Ok(()),
                Err(returned) => message = returned,
            }
        }
        Err(message)
    }

    pub(crate) fn pop(&mut self) -> Option<Value> {
        self.messages.pop_front()
    }

    pub(crate) fn wait(&mut self, id: WaiterId) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(Waiter { id, tx });
        rx
    }

    /// Drop the waiter `id`. Returns false when it was already resolved.
    pub(crate) fn cancel_wait(&mut self, id: WaiterId) -> bool {
        match self.waiters.iter().position(|waiter| waiter.id == id) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }

    /// Drop waiters whose consumer has gone away. Returns how many.
    pub(crate) fn prune_waiters(&mut self) -> usize {
        let before = self.waiters.len();
        self.waiters.retain(|waiter| !waiter.tx.is_closed());
        before - self.waiters.len()
    }

    pub(crate) fn snapshot(&self) -> Vec<Value> {
        self.messages.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overflow_drops_oldest() {
        let mut queue = NamedQueue::new(2);
        assert_eq!(queue.offer(json!("m1")), Delivery::Queued { dropped: None });
        queue.offer(json!("m2"));
        assert_eq!(
            queue.offer(json!("m3")),
            Delivery::Queued {
                dropped: Some(json!("m1"))
            }
        );
        assert_eq!(queue.snapshot(), vec![json!("m2"), json!("m3")]);
    }

    #[test]
    fn offer_prefers_longest_waiting_consumer() {
        let mut queue = NamedQueue::new(4);
        let mut first = queue.wait(1);
        let mut second = queue.wait(2);

        assert_eq!(queue.offer(json!(1)), Delivery::Handed);
        assert_eq!(first.try_recv().unwrap(), json!(1));
        assert!(second.try_recv().is_err());
        assert_eq!(queue.waiting(), 1);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn abandoned_waiters_are_skipped() {
        let mut queue = NamedQueue::new(4);
        drop(queue.wait(1));
        let mut live = queue.wait(2);

        assert_eq!(queue.offer(json!("x")), Delivery::Handed);
        assert_eq!(live.try_recv().unwrap(), json!("x"));
    }

    #[test]
    fn restore_goes_to_head() {
        let mut queue = NamedQueue::new(4);
        queue.offer(json!(2));
        queue.restore(json!(1));
        assert_eq!(queue.pop(), Some(json!(1)));
        assert_eq!(queue.pop(), Some(json!(2)));
    }

    #[test]
    fn cancel_and_prune_waiters() {
        let mut queue = NamedQueue::new(4);
        let _kept = queue.wait(1);
        drop(queue.wait(2));
        let _cancelled = queue.wait(3);

        assert!(queue.cancel_wait(3));
        assert!(!queue.cancel_wait(3));
        assert_eq!(queue.prune_waiters(), 1);
        assert_eq!(queue.waiting(), 1);
        assert!(!queue.is_idle());
    }
}
