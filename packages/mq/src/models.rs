use broccoli_queue::queue::BroccoliQueueBuilder;
pub use broccoli_queue::{
    brokers::broker::BrokerMessage,
    error::BroccoliError,
    queue::{BroccoliQueue, ConsumeOptions},
};
use common::config::MqAppConfig;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::MqError;

pub type MqQueue = BroccoliQueue;
pub type MqBuilder = BroccoliQueueBuilder;

pub struct MqConfig {
    pub url: String,
    pub pool_size: u8,
}

impl From<&MqAppConfig> for MqConfig {
    fn from(config: &MqAppConfig) -> Self {
        Self {
            url: config.url.clone(),
            pool_size: config.pool_size,
        }
    }
}

/// Connect to the broker. Queues are created on first publish, so this is the
/// whole topology setup and is safe to repeat.
pub async fn init_mq(config: MqConfig) -> Result<MqQueue, MqError> {
    BroccoliQueue::builder(&config.url)
        .pool_connections(config.pool_size)
        .build()
        .await
        .map_err(MqError::from)
}

/// Publish a serializable message to a queue.
pub async fn publish_json<T>(mq: &MqQueue, queue: &str, message: &T) -> Result<(), MqError>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    let published = mq.publish(queue, None, message, None).await?;
    debug!(queue, task_id = %published.task_id, "Published message");
    Ok(())
}
