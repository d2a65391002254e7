use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use layer7waf_common::BanSeverity;
use layer7waf_firewall::{BanRequest, FirewallProvider};

use crate::token_bucket::TokenBucket;

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(300);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum OpKind {
    Ban {
        reason: String,
        duration_s: Option<i64>,
        severity: BanSeverity,
    },
    Unban {
        provider_ban_id: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct QueuedOp {
    pub ban_id: i64,
    pub integration_id: i64,
    pub ip: String,
    pub kind: OpKind,
}

/// Callback surface the queue invokes on completion, so it never needs to
/// know about `Ban` rows or the database directly.
#[async_trait]
pub trait QueueSink: Send + Sync {
    async fn on_ban_succeeded(&self, ban_id: i64, integration_id: i64, provider_ban_id: Option<String>);
    async fn on_unban_succeeded(&self, ban_id: i64, integration_id: i64);
    async fn on_op_exhausted(&self, op: &QueuedOp, last_error: String);
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.as_secs().saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
    Duration::from_secs(exp).min(BACKOFF_CAP)
}

async fn run_op(provider: &dyn FirewallProvider, op: &QueuedOp) -> Result<Option<String>, layer7waf_common::Layer7Error> {
    match &op.kind {
        OpKind::Ban { reason, duration_s, severity } => {
            let result = provider
                .ban(BanRequest {
                    ip: op.ip.clone(),
                    reason: reason.clone(),
                    duration_s: *duration_s,
                    severity: *severity,
                })
                .await?;
            Ok(result.provider_ban_id)
        }
        OpKind::Unban { provider_ban_id } => {
            provider.unban(&op.ip, provider_ban_id.as_deref()).await?;
            Ok(None)
        }
    }
}

async fn worker_loop(
    integration_id: i64,
    mut rx: mpsc::Receiver<QueuedOp>,
    provider: Arc<dyn FirewallProvider>,
    bucket: Arc<TokenBucket>,
    sink: Arc<dyn QueueSink>,
    cancel: CancellationToken,
) {
    loop {
        let op = tokio::select! {
            op = rx.recv() => match op {
                Some(op) => op,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        bucket.acquire().await;

        let mut attempt = 0u32;
        loop {
            match run_op(provider.as_ref(), &op).await {
                Ok(provider_ban_id) => {
                    match &op.kind {
                        OpKind::Ban { .. } => sink.on_ban_succeeded(op.ban_id, integration_id, provider_ban_id).await,
                        OpKind::Unban { .. } => sink.on_unban_succeeded(op.ban_id, integration_id).await,
                    }
                    break;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        error!(integration_id, ip = %op.ip, attempts = attempt, error = %e, "ban queue op exhausted retries");
                        sink.on_op_exhausted(&op, e.to_string()).await;
                        break;
                    }
                    let delay = backoff_delay(attempt);
                    warn!(integration_id, ip = %op.ip, attempt, delay_s = delay.as_secs(), error = %e, "ban queue op failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    // Drain-on-shutdown: finish any ops already buffered in the channel,
    // bounded by DRAIN_TIMEOUT, instead of dropping them silently.
    let drain = async {
        while let Some(op) = rx.recv().await {
            bucket.acquire().await;
            if let Err(e) = run_op(provider.as_ref(), &op).await {
                sink.on_op_exhausted(&op, e.to_string()).await;
            }
        }
    };
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
    info!(integration_id, "ban queue worker stopped");
}

/// Per-integration FIFO ban/unban queue. Ops for the same IP within one
/// integration apply in enqueue order; across integrations, no ordering is
/// guaranteed since each runs its own worker task.
pub struct BanQueue {
    senders: HashMap<i64, mpsc::Sender<QueuedOp>>,
    cancel: CancellationToken,
}

impl BanQueue {
    pub fn new() -> Self {
        Self {
            senders: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Registers an integration and spawns its worker task. `capacity` and
    /// `rate_per_sec` configure the token bucket pacing that worker uses.
    pub fn register(
        &mut self,
        integration_id: i64,
        provider: Arc<dyn FirewallProvider>,
        sink: Arc<dyn QueueSink>,
        rate_per_sec: u64,
    ) {
        let (tx, rx) = mpsc::channel(256);
        let bucket = Arc::new(TokenBucket::new(rate_per_sec.max(1), rate_per_sec));
        let cancel = self.cancel.child_token();
        tokio::spawn(worker_loop(integration_id, rx, provider, bucket, sink, cancel));
        self.senders.insert(integration_id, tx);
    }

    /// Spec §4.4 `Enqueue`.
    pub async fn enqueue(&self, op: QueuedOp) -> Result<(), layer7waf_common::Layer7Error> {
        let sender = self
            .senders
            .get(&op.integration_id)
            .ok_or_else(|| layer7waf_common::Layer7Error::validation(format!("no queue registered for integration {}", op.integration_id)))?;
        sender
            .send(op)
            .await
            .map_err(|_| layer7waf_common::Layer7Error::transient("ban queue worker channel closed"))
    }

    pub fn registered_integrations(&self) -> Vec<i64> {
        self.senders.keys().copied().collect()
    }

    /// Signal all workers to stop accepting new work, drop senders so
    /// channels close, and let each worker drain within `DRAIN_TIMEOUT`.
    pub fn shutdown(self) {
        self.cancel.cancel();
        drop(self.senders);
    }

    /// Non-consuming variant of [`shutdown`](Self::shutdown) for callers
    /// that hold the queue behind an `Arc` (the ban orchestrator). Senders
    /// stay open but every worker's `tokio::select!` observes the
    /// cancellation on its next iteration and drains within `DRAIN_TIMEOUT`.
    pub fn begin_shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Default for BanQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layer7waf_firewall::NoopProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        bans: AtomicUsize,
        unbans: AtomicUsize,
        exhausted: AtomicUsize,
    }

    impl CountingSink {
        fn new() -> Self {
            Self {
                bans: AtomicUsize::new(0),
                unbans: AtomicUsize::new(0),
                exhausted: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl QueueSink for CountingSink {
        async fn on_ban_succeeded(&self, _ban_id: i64, _integration_id: i64, _provider_ban_id: Option<String>) {
            self.bans.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_unban_succeeded(&self, _ban_id: i64, _integration_id: i64) {
            self.unbans.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_op_exhausted(&self, _op: &QueuedOp, _last_error: String) {
            self.exhausted.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn enqueued_ban_reaches_sink() {
        let mut queue = BanQueue::new();
        let sink = Arc::new(CountingSink::new());
        queue.register(1, Arc::new(NoopProvider::new()), sink.clone(), 50);

        queue
            .enqueue(QueuedOp {
                ban_id: 1,
                integration_id: 1,
                ip: "1.2.3.4".into(),
                kind: OpKind::Ban {
                    reason: "test".into(),
                    duration_s: Some(60),
                    severity: BanSeverity::Medium,
                },
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.bans.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn enqueue_to_unknown_integration_fails() {
        let queue = BanQueue::new();
        let result = queue
            .enqueue(QueuedOp {
                ban_id: 1,
                integration_id: 99,
                ip: "1.2.3.4".into(),
                kind: OpKind::Unban { provider_ban_id: None },
            })
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn backoff_increases_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(10), BACKOFF_CAP);
    }
}
