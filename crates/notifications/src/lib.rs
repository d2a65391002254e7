//! Notification dispatcher (spec §4.9): trigger evaluation, per-key cooldown,
//! optional batching, and delivery through a pluggable outbound command.

pub mod command;
pub mod cooldown;
pub mod dispatcher;
pub mod sink;

pub use cooldown::CooldownCache;
pub use dispatcher::{Dispatcher, DispatcherConfig, Notification};
pub use sink::{NotificationSink, NullSink};
