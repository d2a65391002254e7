//! Config-side persistence (spec §6 `database.db`): bans, whitelist entries,
//! integrations, detection rules and notification records. The immutable WAF
//! event log lives in a separate crate and a separate SQLite file.

pub mod bans;
pub mod crypto;
pub mod integrations;
pub mod matrix;
pub mod notifications;
pub mod pool;
pub mod rules;
pub mod types;
pub mod whitelist;

pub use pool::open;
pub use types::{
    Ban, DetectionRule, Integration, IntegrationNotified, IntegrationProvider, MatrixRule, NewBan,
    NotificationRecord, NotificationStatus,
};
