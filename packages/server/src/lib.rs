pub mod cache;
pub mod config;
pub mod consumers;
pub mod database;
pub mod dlq;
pub mod entity;
pub mod error;
pub mod filter;
pub mod ingest;
pub mod lifecycle;
pub mod links;
pub mod pool;
pub mod seed;
pub mod state;
pub mod transcode;
pub mod uploader;
pub mod urls;

pub use error::{DepotError, DepotResult};
pub use state::{AppState, Collaborators};
