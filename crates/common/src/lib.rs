pub mod config;
pub mod error;
pub mod types;

pub use config::PipelineConfig;
pub use error::{Layer7Error, Layer7Result, Outcome, Refusal};
pub use types::{BanSeverity, ProxyRecord, Severity, SeverityFilter, WafEvent};
