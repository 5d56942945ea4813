//! BusEventSink - ドメインイベントを Message Bus のチャネルへ流す
//!
//! チャネル名はイベントの topic（`task:completed` など）。購読者がいなければ何もしない。

use tracing::warn;

use crate::bus::MessageBus;
use crate::domain::DomainEvent;
use crate::ports::EventSink;

pub struct BusEventSink {
    bus: MessageBus,
}

impl BusEventSink {
    pub fn new(bus: MessageBus) -> Self {
        Self { bus }
    }
}

impl EventSink for BusEventSink {
    fn emit(&self, event: DomainEvent) {
        let topic = event.topic();
        match serde_json::to_value(&event) {
            Ok(message) => {
                self.bus.publish(topic, message);
            }
            Err(err) => warn!(%topic, error = %err, "event could not be serialized"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::domain::AgentId;
    use crate::ports::SystemClock;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use ulid::Ulid;

    #[test]
    fn events_are_published_on_their_topic() {
        let bus = MessageBus::new(BusConfig::default(), Arc::new(SystemClock));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        bus.subscribe("agent:offline", move |message| {
            sink_seen.lock().push(message.clone())
        })
        .unwrap();

        let agent_id = AgentId::from_ulid(Ulid::new());
        let sink = BusEventSink::new(bus.clone());
        sink.emit(DomainEvent::AgentOffline { agent_id });
        sink.emit(DomainEvent::AgentReconnected { agent_id });

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["event"], "agent_offline");
        assert_eq!(seen[0]["agent_id"], serde_json::json!(agent_id));
    }
}
