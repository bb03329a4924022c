pub mod config;
pub mod dlq;
pub mod ingest;
pub mod lifecycle;
pub mod retry;
pub mod storage;

pub use dlq::{DlqEnvelope, DlqErrorCode};
pub use ingest::IngestionTask;
pub use lifecycle::{EventType, LinkStatus, PoolStatus};
