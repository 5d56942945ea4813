//! Publish/subscribe channels.
//!
//! Delivery is synchronous and in subscription order. Handlers are invoked
//! outside the bus lock, so a handler may itself publish or subscribe.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

/// Callback attached to a channel.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifies one subscription; pass it back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Default)]
pub(crate) struct Channel {
    handlers: Vec<(SubscriptionId, Handler)>,
}

impl Channel {
    pub(crate) fn add(&mut self, id: SubscriptionId, handler: Handler) {
        self.handlers.push((id, handler));
    }

    /// Remove one subscription, or all of them with `None`. Returns how many.
    pub(crate) fn remove(&mut self, id: Option<SubscriptionId>) -> usize {
        let before = self.handlers.len();
        match id {
            Some(id) => self.handlers.retain(|(sub, _)| *sub != id),
            None => self.handlers.clear(),
        }
        before - self.handlers.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Handlers in subscription order, cloned so they can run unlocked.
    pub(crate) fn handlers(&self) -> Vec<(SubscriptionId, Handler)> {
        self.handlers.clone()
    }
}

/// Run every handler, isolating panics. Returns (delivered, panicked).
pub(crate) fn deliver(
    channel: &str,
    handlers: &[(SubscriptionId, Handler)],
    message: &Value,
) -> (usize, usize) {
    let mut delivered = 0;
    let mut panicked = 0;
    for (id, handler) in handlers {
        match catch_unwind(AssertUnwindSafe(|| handler(message))) {
            Ok(()) => delivered += 1,
            Err(_) => {
                panicked += 1;
                error!(%channel, subscription = %id, "subscriber handler panicked");
            }
        }
    }
    (delivered, panicked)
}
