//! Audit-log ingestor (spec §4.7): tails the ModSecurity JSON log with
//! rotation handling, extracts WAF events, resolves their proxy, batches
//! writes into the event store, and periodically backfills HTTP/3 events
//! whose proxy could not be resolved at ingest time.

pub mod ingestor;
pub mod parse;
pub mod resolver;
pub mod tail;

pub use ingestor::{AuditIngestor, IngestorConfig};
pub use resolver::{ProxyResolver, StaticProxyResolver};
pub use tail::Tailer;
