//! Whitelist evaluation and IP classification for the ban pipeline (spec §4.2).
//!
//! The whitelist is the one structure every other component must consult
//! before banning: `layer7waf-ban-orchestrator` refuses to create a ban for
//! any IP this crate says is whitelisted, and the detection engine skips
//! tracking whitelisted IPs entirely (§4.8).
//!
//! Matching is priority-ordered rather than trie-based: a plain "is this IP
//! in the set" check isn't enough here, since a whitelist lookup must report
//! *which* rule matched, in ascending-priority order, for logging and for
//! the `admin_auto` vs `manual` vs `system` distinction. The snapshot is
//! swapped behind an `ArcSwap` for lock-free hot-reloading, and internally
//! it's a priority-sorted `Vec` matched with `ipnet::IpNet::contains`.

pub mod classify;
mod whitelist;

pub use classify::is_private;
pub use whitelist::{WhitelistEntry, WhitelistSnapshot, WhitelistStore, WhitelistType};
