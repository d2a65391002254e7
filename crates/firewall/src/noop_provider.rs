use async_trait::async_trait;
use tokio::sync::Mutex;

use layer7waf_common::Layer7Error;

use crate::provider::{BanRequest, BanResult, FirewallProvider, ProviderBan, UnbanResult};

/// In-memory, log-only provider for environments with zero configured
/// integrations and for tests. Never makes network calls.
#[derive(Default)]
pub struct NoopProvider {
    banned: Mutex<Vec<ProviderBan>>,
}

impl NoopProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FirewallProvider for NoopProvider {
    async fn ban(&self, req: BanRequest) -> Result<BanResult, Layer7Error> {
        let mut banned = self.banned.lock().await;
        if let Some(existing) = banned.iter().find(|b| b.ip == req.ip) {
            return Ok(BanResult {
                ok: true,
                provider_ban_id: existing.provider_ban_id.clone(),
                message: "already banned (noop)".into(),
            });
        }
        tracing::info!(ip = %req.ip, reason = %req.reason, "noop provider: ban recorded");
        banned.push(ProviderBan {
            ip: req.ip.clone(),
            provider_ban_id: Some(format!("noop-{}", req.ip)),
            expires_at: None,
        });
        Ok(BanResult {
            ok: true,
            provider_ban_id: Some(format!("noop-{}", req.ip)),
            message: "banned (noop)".into(),
        })
    }

    async fn unban(&self, ip: &str, _provider_ban_id: Option<&str>) -> Result<UnbanResult, Layer7Error> {
        let mut banned = self.banned.lock().await;
        banned.retain(|b| b.ip != ip);
        tracing::info!(ip, "noop provider: unban recorded");
        Ok(UnbanResult {
            ok: true,
            message: "unbanned (noop)".into(),
        })
    }

    async fn list_bans(&self) -> Result<Vec<ProviderBan>, Layer7Error> {
        Ok(self.banned.lock().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(ip: &str) -> BanRequest {
        BanRequest {
            ip: ip.to_string(),
            reason: "test".into(),
            duration_s: Some(3600),
            severity: layer7waf_common::BanSeverity::Medium,
        }
    }

    #[tokio::test]
    async fn ban_is_idempotent() {
        let provider = NoopProvider::new();
        let first = provider.ban(request("1.2.3.4")).await.unwrap();
        let second = provider.ban(request("1.2.3.4")).await.unwrap();
        assert_eq!(first.provider_ban_id, second.provider_ban_id);

        let listed = provider.list_bans().await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn unban_unknown_ip_succeeds() {
        let provider = NoopProvider::new();
        let result = provider.unban("9.9.9.9", None).await.unwrap();
        assert!(result.ok);
    }

    #[tokio::test]
    async fn unban_removes_from_list() {
        let provider = NoopProvider::new();
        provider.ban(request("5.5.5.5")).await.unwrap();
        provider.unban("5.5.5.5", None).await.unwrap();
        assert!(provider.list_bans().await.unwrap().is_empty());
    }
}
