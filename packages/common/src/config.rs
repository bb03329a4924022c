use serde::Deserialize;

use crate::ingest::{DLQ_QUEUE_NAME, QUEUE_NAME};

/// Broker configuration shared by the publisher and the ingestion consumer.
#[derive(Debug, Deserialize, Clone)]
pub struct MqAppConfig {
    /// Redis connection URL. Default: "redis://localhost:6379".
    #[serde(default = "default_mq_url")]
    pub url: String,
    /// Connection pool size. Default: 5.
    #[serde(default = "default_mq_pool_size")]
    pub pool_size: u8,
    /// Queue carrying deferred ingestion tasks. Default: "upload.process.queue".
    #[serde(default = "default_mq_queue_name")]
    pub queue_name: String,
    /// Queue receiving dead-lettered ingestion tasks. Default: "upload.process.dlq".
    #[serde(default = "default_mq_dlq_queue_name")]
    pub dlq_queue_name: String,
}

fn default_mq_url() -> String {
    "redis://localhost:6379".into()
}
fn default_mq_pool_size() -> u8 {
    5
}
fn default_mq_queue_name() -> String {
    QUEUE_NAME.into()
}
fn default_mq_dlq_queue_name() -> String {
    DLQ_QUEUE_NAME.into()
}

impl Default for MqAppConfig {
    fn default() -> Self {
        Self {
            url: default_mq_url(),
            pool_size: default_mq_pool_size(),
            queue_name: default_mq_queue_name(),
            dlq_queue_name: default_mq_dlq_queue_name(),
        }
    }
}
