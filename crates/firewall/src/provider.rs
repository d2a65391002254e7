use async_trait::async_trait;

use layer7waf_common::{BanSeverity, Layer7Error};

#[derive(Debug, Clone)]
pub struct BanRequest {
    pub ip: String,
    pub reason: String,
    pub duration_s: Option<i64>,
    pub severity: BanSeverity,
}

#[derive(Debug, Clone)]
pub struct BanResult {
    pub ok: bool,
    pub provider_ban_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct UnbanResult {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ProviderBan {
    pub ip: String,
    pub provider_ban_id: Option<String>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Uniform capability set every upstream firewall/CDN integration must
/// implement. Implementations must be idempotent: re-banning an IP that is
/// already banned returns success with the existing `provider_ban_id`;
/// unbanning an unknown IP returns success rather than an error.
#[async_trait]
pub trait FirewallProvider: Send + Sync {
    async fn ban(&self, req: BanRequest) -> Result<BanResult, Layer7Error>;
    async fn unban(&self, ip: &str, provider_ban_id: Option<&str>) -> Result<UnbanResult, Layer7Error>;
    async fn list_bans(&self) -> Result<Vec<ProviderBan>, Layer7Error>;
}
