use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Why an entry exists, per spec §3 `WhitelistEntry.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhitelistType {
    Manual,
    AdminAuto,
    System,
}

/// One whitelist row. Exactly one of `ip_address`/`ip_range` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub id: i64,
    pub ip_address: Option<IpAddr>,
    pub ip_range: Option<IpNet>,
    pub entry_type: WhitelistType,
    /// 1 = highest priority, evaluated first.
    pub priority: i64,
    pub reason: String,
    pub added_by: Option<String>,
}

impl WhitelistEntry {
    fn matches(&self, addr: IpAddr) -> bool {
        if let Some(exact) = self.ip_address {
            if exact == addr {
                return true;
            }
        }
        if let Some(range) = self.ip_range {
            if range.contains(&addr) {
                return true;
            }
        }
        false
    }

    /// A label suitable for logging which rule matched.
    pub fn label(&self) -> String {
        match (self.ip_address, self.ip_range) {
            (Some(ip), _) => ip.to_string(),
            (_, Some(range)) => range.to_string(),
            (None, None) => format!("entry#{}", self.id),
        }
    }

    /// Warn-worthy per the testable boundary in spec §8: CIDR ranges that
    /// whitelist everything (`0.0.0.0/0`, `::/0`).
    pub fn is_global(&self) -> bool {
        match self.ip_range {
            Some(range) => range.prefix_len() == 0,
            None => false,
        }
    }
}

/// An immutable, priority-sorted snapshot of the whitelist, ready for
/// lock-free concurrent lookups.
#[derive(Debug, Default)]
pub struct WhitelistSnapshot {
    entries: Vec<WhitelistEntry>,
}

impl WhitelistSnapshot {
    pub fn new(mut entries: Vec<WhitelistEntry>) -> Self {
        entries.sort_by_key(|e| e.priority);
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the first (highest-priority) entry matching `addr`, if any.
    pub fn find_match(&self, addr: IpAddr) -> Option<&WhitelistEntry> {
        self.entries.iter().find(|e| e.matches(addr))
    }
}

/// Hot-reloadable whitelist: readers never block on a reload, since lookups
/// only ever touch an `Arc`-cloned snapshot.
pub struct WhitelistStore {
    snapshot: ArcSwap<WhitelistSnapshot>,
}

impl WhitelistStore {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(WhitelistSnapshot::default()),
        }
    }

    pub fn from_entries(entries: Vec<WhitelistEntry>) -> Self {
        let store = Self::new();
        store.reload(entries);
        store
    }

    /// Atomically swap in a new whitelist snapshot. Warns (but does not
    /// reject) entries that whitelist the entire address space.
    pub fn reload(&self, entries: Vec<WhitelistEntry>) {
        for entry in &entries {
            if entry.is_global() {
                warn!(
                    entry_id = entry.id,
                    range = %entry.label(),
                    "whitelist entry matches the entire address space"
                );
            }
        }
        let count = entries.len();
        self.snapshot.store(Arc::new(WhitelistSnapshot::new(entries)));
        debug!(count, "whitelist snapshot reloaded");
    }

    /// Spec §4.2 `IsWhitelisted`: evaluate in ascending priority, returning
    /// whether `addr` is whitelisted. Logs the matched rule.
    ///
    /// Fails open: any internal inconsistency (there is none reachable in
    /// this implementation, but the contract is load-bearing for callers)
    /// returns `false` rather than panicking, so a crash here can never be
    /// mistaken for an implicit ban-admission bypass.
    pub fn is_whitelisted(&self, addr: IpAddr) -> bool {
        self.find_match(addr).is_some()
    }

    pub fn find_match(&self, addr: IpAddr) -> Option<WhitelistEntry> {
        let snapshot = self.snapshot.load();
        let found = snapshot.find_match(addr).cloned();
        if let Some(ref entry) = found {
            debug!(ip = %addr, rule = %entry.label(), "whitelist match");
        }
        found
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }
}

impl Default for WhitelistStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, priority: i64, ip: &str) -> WhitelistEntry {
        WhitelistEntry {
            id,
            ip_address: ip.parse().ok(),
            ip_range: None,
            entry_type: WhitelistType::Manual,
            priority,
            reason: "test".into(),
            added_by: None,
        }
    }

    fn cidr_entry(id: i64, priority: i64, cidr: &str) -> WhitelistEntry {
        WhitelistEntry {
            id,
            ip_address: None,
            ip_range: cidr.parse().ok(),
            entry_type: WhitelistType::Manual,
            priority,
            reason: "test".into(),
            added_by: None,
        }
    }

    #[test]
    fn empty_store_whitelists_nothing() {
        let store = WhitelistStore::new();
        assert!(!store.is_whitelisted("1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn exact_ip_match() {
        let store = WhitelistStore::from_entries(vec![entry(1, 10, "203.0.113.5")]);
        assert!(store.is_whitelisted("203.0.113.5".parse().unwrap()));
        assert!(!store.is_whitelisted("203.0.113.6".parse().unwrap()));
    }

    #[test]
    fn cidr_match() {
        let store = WhitelistStore::from_entries(vec![cidr_entry(1, 10, "203.0.113.0/24")]);
        assert!(store.is_whitelisted("203.0.113.200".parse().unwrap()));
        assert!(!store.is_whitelisted("203.0.114.1".parse().unwrap()));
    }

    #[test]
    fn priority_ordering_returns_first_match() {
        let store = WhitelistStore::from_entries(vec![
            cidr_entry(2, 20, "203.0.113.0/24"),
            entry(1, 5, "203.0.113.5"),
        ]);
        let matched = store.find_match("203.0.113.5".parse().unwrap()).unwrap();
        assert_eq!(matched.id, 1, "higher-priority (lower number) entry should win");
    }

    #[test]
    fn global_cidr_whitelists_everything() {
        let store = WhitelistStore::from_entries(vec![cidr_entry(1, 1, "0.0.0.0/0")]);
        assert!(store.is_whitelisted("1.2.3.4".parse().unwrap()));
        assert!(store.is_whitelisted("255.255.255.255".parse().unwrap()));

        let store_v6 = WhitelistStore::from_entries(vec![cidr_entry(1, 1, "::/0")]);
        assert!(store_v6.is_whitelisted("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn reload_replaces_snapshot_atomically() {
        let store = WhitelistStore::from_entries(vec![entry(1, 10, "1.1.1.1")]);
        assert!(store.is_whitelisted("1.1.1.1".parse().unwrap()));

        store.reload(vec![entry(2, 10, "2.2.2.2")]);
        assert!(!store.is_whitelisted("1.1.1.1".parse().unwrap()));
        assert!(store.is_whitelisted("2.2.2.2".parse().unwrap()));
    }
}
