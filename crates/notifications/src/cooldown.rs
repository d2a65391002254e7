use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Per-key "last sent" cache used to suppress repeat notifications within a
/// cooldown window. Keys are not persisted — a restart clears all cooldowns,
/// which is acceptable since the cost of an extra notification after a
/// restart is far lower than missing one.
#[derive(Default)]
pub struct CooldownCache {
    last_sent: DashMap<String, DateTime<Utc>>,
}

impl CooldownCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically checks whether `key` is past its cooldown and, if so,
    /// records `now` as the new last-sent time. Returns `true` exactly once
    /// per cooldown window.
    pub fn should_fire(&self, key: &str, cooldown: chrono::Duration, now: DateTime<Utc>) -> bool {
        match self.last_sent.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if now - *entry.get() >= cooldown {
                    entry.insert(now);
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.last_sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_sent.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_always_fires() {
        let cache = CooldownCache::new();
        assert!(cache.should_fire("high_severity_1.2.3.4", chrono::Duration::minutes(5), Utc::now()));
    }

    #[test]
    fn repeat_within_cooldown_is_suppressed() {
        let cache = CooldownCache::new();
        let t0 = Utc::now();
        assert!(cache.should_fire("k", chrono::Duration::minutes(5), t0));
        assert!(!cache.should_fire("k", chrono::Duration::minutes(5), t0 + chrono::Duration::minutes(1)));
    }

    #[test]
    fn fires_again_after_cooldown_elapses() {
        let cache = CooldownCache::new();
        let t0 = Utc::now();
        assert!(cache.should_fire("k", chrono::Duration::minutes(5), t0));
        assert!(cache.should_fire("k", chrono::Duration::minutes(5), t0 + chrono::Duration::minutes(6)));
    }

    #[test]
    fn distinct_keys_have_independent_cooldowns() {
        let cache = CooldownCache::new();
        let t0 = Utc::now();
        assert!(cache.should_fire("ip-a", chrono::Duration::minutes(5), t0));
        assert!(cache.should_fire("ip-b", chrono::Duration::minutes(5), t0));
    }
}
