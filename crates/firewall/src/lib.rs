//! Firewall provider registry (spec §4.3): a uniform ban/unban/list surface
//! over heterogeneous upstream firewalls and CDNs.

pub mod http_provider;
pub mod noop_provider;
pub mod provider;
pub mod registry;

pub use http_provider::HttpFirewallProvider;
pub use noop_provider::NoopProvider;
pub use provider::{BanRequest, BanResult, FirewallProvider, ProviderBan, UnbanResult};
pub use registry::FirewallRegistry;
