//! Proxy resolution (spec §4.7): `Proxy` rows are owned by the external
//! config collaborator, so the ingestor only ever reaches them through this
//! trait rather than querying a `proxies` table directly.

use async_trait::async_trait;
use layer7waf_common::ProxyRecord;

#[async_trait]
pub trait ProxyResolver: Send + Sync {
    /// Resolve a proxy id from whichever of the three candidates is
    /// available, preferring `X-Proxy-Target`, then `Host`, then the raw
    /// `transaction.host_ip` (spec §4.7 "Proxy resolution").
    async fn resolve(&self, x_proxy_target: Option<&str>, host: Option<&str>, host_ip: &str) -> Option<i64>;
}

/// In-memory resolver over a hot-reloadable snapshot of proxy records,
/// matching the `ArcSwap` pattern `layer7waf-ip-policy`'s whitelist store
/// uses for the same "infrequently updated, read on every event" shape.
pub struct StaticProxyResolver {
    proxies: arc_swap::ArcSwap<Vec<ProxyRecord>>,
}

impl StaticProxyResolver {
    pub fn new(proxies: Vec<ProxyRecord>) -> Self {
        Self { proxies: arc_swap::ArcSwap::from_pointee(proxies) }
    }

    pub fn reload(&self, proxies: Vec<ProxyRecord>) {
        self.proxies.store(std::sync::Arc::new(proxies));
    }
}

#[async_trait]
impl ProxyResolver for StaticProxyResolver {
    async fn resolve(&self, x_proxy_target: Option<&str>, host: Option<&str>, host_ip: &str) -> Option<i64> {
        let candidate = x_proxy_target.or(host).unwrap_or(host_ip);
        if candidate.is_empty() {
            return None;
        }

        let proxies = self.proxies.load();

        if let Some(p) = proxies.iter().find(|p| p.domain_names.iter().any(|d| candidate.contains(d.as_str()))) {
            return Some(p.id);
        }
        proxies.iter().find(|p| p.forward_host == candidate).map(|p| p.id)
    }
}
