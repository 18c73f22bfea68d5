//! Notification bus over store pub/sub.
//!
//! Delivery is at-most-once and best-effort: subscribers that are not connected at
//! publish time never see the message. Notifications are hints; the task store and
//! lock manager remain the source of truth.

use crate::error::HiveResult;
use crate::store::{keys, SharedStore, Subscription};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// `messages:{agentId}`
    Direct(String),
    Broadcast,
    /// `events`
    System,
}

impl Channel {
    pub fn name(&self) -> String {
        match self {
            Channel::Direct(agent_id) => keys::direct_channel(agent_id),
            Channel::Broadcast => keys::BROADCAST_CHANNEL.to_string(),
            Channel::System => keys::EVENTS_CHANNEL.to_string(),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// State changes announced on the `events` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated,
    TaskAssigned,
    TaskClaimed,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    TaskReleased,
    LockAcquired,
    LockReleased,
    AgentRegistered,
    AgentDeregistered,
    ArtifactShared,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::TaskCreated => "task_created",
            EventKind::TaskAssigned => "task_assigned",
            EventKind::TaskClaimed => "task_claimed",
            EventKind::TaskStarted => "task_started",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskFailed => "task_failed",
            EventKind::TaskCancelled => "task_cancelled",
            EventKind::TaskReleased => "task_released",
            EventKind::LockAcquired => "lock_acquired",
            EventKind::LockReleased => "lock_released",
            EventKind::AgentRegistered => "agent_registered",
            EventKind::AgentDeregistered => "agent_deregistered",
            EventKind::ArtifactShared => "artifact_shared",
        }
    }
}

/// Wire format of every bus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default)]
    pub broadcast: bool,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, from: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            from: from.into(),
            to: None,
            broadcast: false,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn to(mut self, agent_id: impl Into<String>) -> Self {
        self.to = Some(agent_id.into());
        self.broadcast = false;
        self
    }

    pub fn broadcast(mut self) -> Self {
        self.to = None;
        self.broadcast = true;
        self
    }

    pub fn event_kind(&self) -> Option<EventKind> {
        serde_json::from_value(Value::String(self.kind.clone())).ok()
    }
}

/// Sender id for kernel-originated system events.
pub const SYSTEM_SENDER: &str = "system";

#[derive(Clone)]
pub struct EventBus {
    store: SharedStore,
}

impl EventBus {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Publish raw. Returns how many subscribers received it.
    pub async fn publish(&self, channel: &Channel, envelope: &Envelope) -> HiveResult<usize> {
        let message = serde_json::to_string(envelope)?;
        let receivers = self.store.publish(&channel.name(), &message).await?;
        debug!(channel = %channel, kind = %envelope.kind, receivers, "Published");
        Ok(receivers)
    }

    pub async fn send_direct(
        &self,
        from: &str,
        to: &str,
        kind: &str,
        payload: Value,
    ) -> HiveResult<usize> {
        let envelope = Envelope::new(kind, from, payload).to(to);
        self.publish(&Channel::Direct(to.to_string()), &envelope)
            .await
    }

    pub async fn broadcast(&self, from: &str, kind: &str, payload: Value) -> HiveResult<usize> {
        let envelope = Envelope::new(kind, from, payload).broadcast();
        self.publish(&Channel::Broadcast, &envelope).await
    }

    pub async fn emit_system(&self, kind: EventKind, payload: Value) -> HiveResult<usize> {
        let envelope = Envelope::new(kind.as_str(), SYSTEM_SENDER, payload).broadcast();
        self.publish(&Channel::System, &envelope).await
    }

    pub async fn subscribe(&self, channels: &[Channel]) -> HiveResult<EventStream> {
        let names: Vec<String> = channels.iter().map(Channel::name).collect();
        let subscription = self.store.subscribe(&names).await?;
        debug!(channels = ?names, "Subscribed");
        Ok(EventStream { subscription })
    }
}

/// Decoded subscription. Malformed payloads are logged and skipped.
pub struct EventStream {
    subscription: Subscription,
}

impl EventStream {
    /// Next well-formed `(channel, envelope)`; `None` once the subscription closes.
    pub async fn next(&mut self) -> Option<(String, Envelope)> {
        loop {
            let message = self.subscription.recv().await?;
            match serde_json::from_str::<Envelope>(&message.payload) {
                Ok(envelope) => return Some((message.channel, envelope)),
                Err(e) => {
                    warn!(channel = %message.channel, error = %e, "Skipping malformed message");
                }
            }
        }
    }

    /// Non-blocking variant of [`EventStream::next`].
    pub fn try_next(&mut self) -> Option<(String, Envelope)> {
        while let Some(message) = self.subscription.try_recv() {
            if let Ok(envelope) = serde_json::from_str::<Envelope>(&message.payload) {
                return Some((message.channel, envelope));
            }
            warn!(channel = %message.channel, "Skipping malformed message");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CoordinationStore, MemoryStore};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_channel_names() {
        assert_eq!(Channel::Direct("a1".into()).name(), "messages:a1");
        assert_eq!(Channel::Broadcast.name(), "broadcast");
        assert_eq!(Channel::System.name(), "events");
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope::new("task_assigned", "a1", json!({"taskId": "t1"})).to("a2");
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "task_assigned");
        assert_eq!(json["to"], "a2");
        assert_eq!(json["broadcast"], false);
        assert_eq!(envelope.event_kind(), Some(EventKind::TaskAssigned));
        assert_eq!(Envelope::new("chat", "a1", Value::Null).event_kind(), None);
    }

    #[tokio::test]
    async fn test_direct_message_reaches_only_recipient() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(store.clone());
        let mut a2 = bus
            .subscribe(&[Channel::Direct("a2".into())])
            .await
            .unwrap();
        let mut a3 = bus
            .subscribe(&[Channel::Direct("a3".into())])
            .await
            .unwrap();

        let delivered = bus
            .send_direct("a1", "a2", "hello", json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(delivered, 1);

        let (channel, envelope) = a2.next().await.unwrap();
        assert_eq!(channel, "messages:a2");
        assert_eq!(envelope.from, "a1");
        assert!(a3.try_next().is_none());
    }

    #[tokio::test]
    async fn test_stream_skips_malformed_payloads() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(store.clone());
        let mut events = bus.subscribe(&[Channel::System]).await.unwrap();

        store.publish("events", "not json").await.unwrap();
        bus.emit_system(EventKind::LockAcquired, json!({"path": "a.txt"}))
            .await
            .unwrap();

        let (_, envelope) = events.next().await.unwrap();
        assert_eq!(envelope.event_kind(), Some(EventKind::LockAcquired));
        assert!(envelope.broadcast);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let bus = EventBus::new(Arc::new(MemoryStore::new()));
        let delivered = bus.broadcast("a1", "ping", Value::Null).await.unwrap();
        assert_eq!(delivered, 0);
    }
}
