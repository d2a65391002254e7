pub mod bans;
pub mod events;
pub mod health;
pub mod metrics;
pub mod settings;
pub mod whitelist;
