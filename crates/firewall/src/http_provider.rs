use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use layer7waf_common::{BanSeverity, Layer7Error};

use crate::provider::{BanRequest, BanResult, FirewallProvider, ProviderBan, UnbanResult};

/// Generic REST-backed provider for edge firewall APIs (firewall-A,
/// firewall-B) and CDN edge-rule APIs (CDN-C): all three expose a
/// ban/unban/list surface over HTTPS with bearer auth, differing only in
/// base URL and response shape, so one client covers all three tags.
pub struct HttpFirewallProvider {
    client: reqwest::Client,
    base_url: String,
    bearer_token: String,
    provider_tag: String,
}

#[derive(Serialize)]
struct BanBody<'a> {
    ip: &'a str,
    reason: &'a str,
    duration_s: Option<i64>,
    severity: &'a str,
}

#[derive(Deserialize)]
struct BanResponse {
    #[serde(default)]
    ban_id: Option<String>,
}

#[derive(Deserialize)]
struct ListResponseEntry {
    ip: String,
    #[serde(default)]
    ban_id: Option<String>,
    #[serde(default)]
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

fn severity_str(s: BanSeverity) -> &'static str {
    match s {
        BanSeverity::Low => "low",
        BanSeverity::Medium => "medium",
        BanSeverity::High => "high",
        BanSeverity::Critical => "critical",
    }
}

impl HttpFirewallProvider {
    pub fn new(provider_tag: impl Into<String>, base_url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builds with static config"),
            base_url: base_url.into(),
            bearer_token: bearer_token.into(),
            provider_tag: provider_tag.into(),
        }
    }

    fn transient(&self, op: &str, e: impl std::fmt::Display) -> Layer7Error {
        Layer7Error::transient(format!("{} provider {} failed: {}", self.provider_tag, op, e))
    }
}

#[async_trait]
impl FirewallProvider for HttpFirewallProvider {
    async fn ban(&self, req: BanRequest) -> Result<BanResult, Layer7Error> {
        let body = BanBody {
            ip: &req.ip,
            reason: &req.reason,
            duration_s: req.duration_s,
            severity: severity_str(req.severity),
        };

        let response = self
            .client
            .post(format!("{}/bans", self.base_url))
            .bearer_auth(&self.bearer_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transient("ban", e))?;

        // A 409 means the provider already has this IP banned: idempotent success.
        // The body still carries the existing ban's id (same shape as the 2xx
        // response); losing it here would make `record_integration_notified`
        // clobber a previously-known id and force `unban` onto the coarser
        // by-IP route instead of the precise one.
        if response.status().as_u16() == 409 {
            let provider_ban_id = response.json::<BanResponse>().await.ok().and_then(|b| b.ban_id);
            return Ok(BanResult {
                ok: true,
                provider_ban_id,
                message: "already banned upstream".into(),
            });
        }

        if !response.status().is_success() {
            return Err(Layer7Error::transient(format!(
                "{} ban returned status {}",
                self.provider_tag,
                response.status()
            )));
        }

        let parsed: BanResponse = response.json().await.map_err(|e| self.transient("ban", e))?;
        Ok(BanResult {
            ok: true,
            provider_ban_id: parsed.ban_id,
            message: "banned".into(),
        })
    }

    async fn unban(&self, ip: &str, provider_ban_id: Option<&str>) -> Result<UnbanResult, Layer7Error> {
        let url = match provider_ban_id {
            Some(id) => format!("{}/bans/{}", self.base_url, id),
            None => format!("{}/bans/by-ip/{}", self.base_url, ip),
        };

        let response = self
            .client
            .delete(url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .map_err(|e| self.transient("unban", e))?;

        // 404 means the provider has no record of this IP: idempotent success.
        if response.status().as_u16() == 404 || response.status().is_success() {
            return Ok(UnbanResult {
                ok: true,
                message: "unbanned".into(),
            });
        }

        Err(Layer7Error::transient(format!(
            "{} unban returned status {}",
            self.provider_tag,
            response.status()
        )))
    }

    async fn list_bans(&self) -> Result<Vec<ProviderBan>, Layer7Error> {
        let response = self
            .client
            .get(format!("{}/bans", self.base_url))
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .map_err(|e| self.transient("list_bans", e))?;

        if !response.status().is_success() {
            return Err(Layer7Error::transient(format!(
                "{} list_bans returned status {}",
                self.provider_tag,
                response.status()
            )));
        }

        let entries: Vec<ListResponseEntry> = response.json().await.map_err(|e| self.transient("list_bans", e))?;
        Ok(entries
            .into_iter()
            .map(|e| ProviderBan {
                ip: e.ip,
                provider_ban_id: e.ban_id,
                expires_at: e.expires_at,
            })
            .collect())
    }
}
