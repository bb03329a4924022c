pub mod ingest;

pub use ingest::{DeliveryOutcome, IngestConsumer, consume_ingestion_tasks};
