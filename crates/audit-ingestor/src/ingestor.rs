//! Batching, backfill scheduling, and the top-level run loop (spec §4.7).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use layer7waf_common::WafEvent;
use layer7waf_event_bus::{BusEvent, EventPublisher};

use crate::parse::{extract, parse_line};
use crate::resolver::ProxyResolver;
use crate::tail::Tailer;

const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(500);
const REOPEN_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct IngestorConfig {
    pub path: std::path::PathBuf,
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    pub backfill_interval_secs: u64,
    /// How far back from now to scan for orphaned events; the nearby-event
    /// match window itself is a fixed ±5 minutes (see `event_store::backfill`).
    pub backfill_window_secs: i64,
}

impl From<&layer7waf_common::config::AuditLogConfig> for IngestorConfig {
    fn from(cfg: &layer7waf_common::config::AuditLogConfig) -> Self {
        Self {
            path: cfg.path.clone(),
            batch_size: cfg.batch_size,
            batch_interval_ms: cfg.batch_interval_ms,
            backfill_interval_secs: cfg.backfill_interval_secs,
            backfill_window_secs: cfg.backfill_window_secs,
        }
    }
}

pub struct AuditIngestor {
    config: IngestorConfig,
    event_store_pool: SqlitePool,
    resolver: Arc<dyn ProxyResolver>,
    event_bus: Arc<dyn EventPublisher>,
}

impl AuditIngestor {
    pub fn new(
        config: IngestorConfig,
        event_store_pool: SqlitePool,
        resolver: Arc<dyn ProxyResolver>,
        event_bus: Arc<dyn EventPublisher>,
    ) -> Self {
        Self { config, event_store_pool, resolver, event_bus }
    }

    async fn parse_and_resolve(&self, line: &str) -> Option<WafEvent> {
        let record = parse_line(line)?;
        extract(&record, line, self.resolver.as_ref()).await
    }

    /// Appends `buffer` to the event store and fans each persisted event out
    /// on the bus, happens-before its SSE visibility (spec §4.10). On
    /// failure the batch is left in `buffer` for the next tick to retry
    /// (spec §4.7 "Backpressure").
    async fn flush(&self, buffer: &mut Vec<WafEvent>) {
        if buffer.is_empty() {
            return;
        }
        match layer7waf_event_store::append(&self.event_store_pool, buffer).await {
            Ok(ids) => {
                for (event, id) in buffer.iter().zip(ids) {
                    let mut stamped = event.clone();
                    stamped.id = Some(id);
                    self.event_bus.publish(BusEvent::WafEvent { event: stamped }).await;
                }
                buffer.clear();
            }
            Err(e) => {
                error!(error = %e, count = buffer.len(), "failed to append audit batch, retrying next tick");
            }
        }
    }

    /// Spec §5: the ingestor is one of the long-running tasks the daemon
    /// supervises, honouring a shared `CancellationToken`. On a tail read
    /// error the loop pauses `REOPEN_BACKOFF` before trying again rather
    /// than exiting.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut tailer = Tailer::new(self.config.path.clone());
        let mut buffer: Vec<WafEvent> = Vec::new();
        let mut poll_ticker = tokio::time::interval(TAIL_POLL_INTERVAL);
        let mut flush_ticker = tokio::time::interval(Duration::from_millis(self.config.batch_interval_ms.max(1)));

        loop {
            tokio::select! {
                _ = poll_ticker.tick() => {
                    match tailer.poll().await {
                        Ok(lines) => {
                            for line in lines {
                                if let Some(event) = self.parse_and_resolve(&line).await {
                                    buffer.push(event);
                                }
                            }
                            if buffer.len() >= self.config.batch_size {
                                self.flush(&mut buffer).await;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "audit log tail read failed, backing off");
                            tokio::time::sleep(REOPEN_BACKOFF).await;
                        }
                    }
                }
                _ = flush_ticker.tick() => {
                    self.flush(&mut buffer).await;
                }
                _ = cancel.cancelled() => break,
            }
        }

        self.flush(&mut buffer).await;
        info!("audit ingestor stopped");
    }

    /// Spec §4.7 "Backfill (HTTP/3)", run every `backfill_interval_secs`.
    pub async fn run_backfill_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.backfill_interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }
            let scan_since = Utc::now() - chrono::Duration::seconds(self.config.backfill_window_secs);
            match layer7waf_event_store::backfill(&self.event_store_pool, scan_since).await {
                Ok(count) if count > 0 => info!(count, "backfilled proxy_id for HTTP/3 events"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "proxy_id backfill pass failed"),
            }
        }
        info!("backfill loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticProxyResolver;
    use layer7waf_event_bus::EventBus;
    use std::io::Write;

    fn config(path: std::path::PathBuf) -> IngestorConfig {
        IngestorConfig { path, batch_size: 100, batch_interval_ms: 50, backfill_interval_secs: 120, backfill_window_secs: 600 }
    }

    #[tokio::test]
    async fn batch_flushes_on_interval_and_is_queryable() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("audit.log");
        std::fs::write(
            &log_path,
            r#"{ "transaction": { "time_stamp": "2024-01-01T00:00:00Z", "client_ip": "203.0.113.1", "host_ip": "10.0.0.1", "request": { "method": "GET", "uri": "/", "headers": {} }, "response": { "http_code": 403 }, "producer": {}, "messages": [ { "message": "m", "details": { "severity": 1, "tags": ["attack-sqli"] } } ] } }
"#,
        )
        .unwrap();

        let event_store_pool = layer7waf_event_store::open(&dir.path().join("waf-events.db")).await.unwrap();
        let resolver = Arc::new(StaticProxyResolver::new(vec![]));
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();

        let ingestor = AuditIngestor::new(config(log_path), event_store_pool.clone(), resolver, bus);
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        let handle = tokio::spawn(async move { ingestor.run(cancel2).await });

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(received.topic(), "waf_event");

        cancel.cancel();
        handle.await.unwrap();

        let events = layer7waf_event_store::query_new(&event_store_pool, 0, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].client_ip, "203.0.113.1");
    }

    #[tokio::test]
    async fn rotation_mid_stream_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("audit.log");
        std::fs::write(&log_path, "not json\n").unwrap();

        let event_store_pool = layer7waf_event_store::open(&dir.path().join("waf-events.db")).await.unwrap();
        let resolver = Arc::new(StaticProxyResolver::new(vec![]));
        let bus = Arc::new(EventBus::new());

        let ingestor = AuditIngestor::new(config(log_path.clone()), event_store_pool.clone(), resolver, bus);
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        let handle = tokio::spawn(async move { ingestor.run(cancel2).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut file = std::fs::OpenOptions::new().append(true).open(&log_path).unwrap();
        writeln!(
            file,
            r#"{{ "transaction": {{ "time_stamp": "2024-01-01T00:00:00Z", "client_ip": "198.51.100.2", "host_ip": "10.0.0.1", "request": {{ "method": "GET", "uri": "/", "headers": {{}} }}, "response": {{ "http_code": 200 }}, "producer": {{}}, "messages": [ {{ "message": "m", "details": {{ "severity": 4, "tags": [] }} }} ] }} }}"#
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        handle.await.unwrap();

        let events = layer7waf_event_store::query_new(&event_store_pool, 0, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].client_ip, "198.51.100.2");
    }
}
