//! Per-integration ban/unban queue with token-bucket pacing (spec §4.4).

pub mod queue;
pub mod token_bucket;

pub use queue::{BanQueue, OpKind, QueueSink, QueuedOp};
pub use token_bucket::TokenBucket;
