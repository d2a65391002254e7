//! In-process topic-based broadcaster (spec §4.10) feeding SSE subscribers
//! in the admin API. Subscribers receive events only after the producing
//! action has been persisted (happens-before); there's no durability or
//! replay, and slow subscribers are dropped rather than allowed to block
//! producers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use layer7waf_common::WafEvent;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum BusEvent {
    WafEvent { event: WafEvent },
    BanCreated { ban_id: i64, ip: String, auto_banned: bool, at: DateTime<Utc> },
    BanRemoved { ban_id: i64, ip: String, at: DateTime<Utc> },
    BanUpdated { ban_id: i64, ip: String, at: DateTime<Utc> },
    ProxyEvent { proxy_id: i64, message: String, at: DateTime<Utc> },
}

impl BusEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            BusEvent::WafEvent { .. } => "waf_event",
            BusEvent::BanCreated { .. } => "ban_created",
            BusEvent::BanRemoved { .. } => "ban_removed",
            BusEvent::BanUpdated { .. } => "ban_updated",
            BusEvent::ProxyEvent { .. } => "proxy_event",
        }
    }
}

/// Narrow interface the ban orchestrator and reconciliation loop depend on,
/// so they never need to know about SSE or the broadcast channel directly
/// (construction-time injection, per spec §4.5).
#[async_trait::async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: BusEvent);
}

pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EventPublisher for EventBus {
    /// Fail-slow: if no subscriber is listening, `send` returns an error we
    /// deliberately ignore rather than propagate, since a slow or absent
    /// admin UI must never stall the producing component.
    async fn publish(&self, event: BusEvent) {
        let _ = self.sender.send(event);
    }
}
