use async_trait::async_trait;
use chrono::{DateTime, Utc};

use layer7waf_common::BanSeverity;

/// Port the ban orchestrator and reconciliation loop depend on, implemented
/// by `Dispatcher`. Kept separate from the dispatcher's concrete type so the
/// orchestrator can be constructed with any implementation (including a
/// no-op one in tests) without depending on this crate's internals.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_ban_created(&self, ip: &str, reason: &str, severity: BanSeverity, auto_banned: bool, at: DateTime<Utc>);
    async fn notify_ban_cleared(&self, ip: &str, by: Option<&str>, at: DateTime<Utc>);
    async fn notify_system_error(&self, component: &str, message: &str, at: DateTime<Utc>);
}

/// Discards every notification. Used in tests and in any wiring that wants
/// to run the pipeline with notifications switched off.
pub struct NullSink;

#[async_trait]
impl NotificationSink for NullSink {
    async fn notify_ban_created(&self, _ip: &str, _reason: &str, _severity: BanSeverity, _auto_banned: bool, _at: DateTime<Utc>) {}
    async fn notify_ban_cleared(&self, _ip: &str, _by: Option<&str>, _at: DateTime<Utc>) {}
    async fn notify_system_error(&self, _component: &str, _message: &str, _at: DateTime<Utc>) {}
}
