//! Shared key-value cache used for signed URLs and their fill locks.

mod memory;
mod redis_backend;
mod signed_url;

pub use memory::MemoryCache;
pub use redis_backend::RedisCache;
pub use signed_url::SignedUrlCache;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Expiring string store with an advisory lock primitive.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Take `key` for `ttl` if nobody holds it. `token` identifies the holder.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Release `key` if it is still held with `token`. Returns whether it was released.
    async fn unlock(&self, key: &str, token: &str) -> Result<bool, CacheError>;
}
