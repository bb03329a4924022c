use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use super::CacheBackend;
use crate::config::UrlConfig;
use crate::error::DepotResult;

/// Signed-URL cache that keeps concurrent misses from all presigning at once.
///
/// The lock is advisory: whoever fails to see a cached value after one short wait
/// presigns anyway, so callers always get a URL.
pub struct SignedUrlCache {
    backend: Arc<dyn CacheBackend>,
    lock_ttl: Duration,
    lock_wait: Duration,
}

impl SignedUrlCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &UrlConfig) -> Self {
        Self {
            backend,
            lock_ttl: Duration::from_secs(config.lock_ttl_secs),
            lock_wait: Duration::from_millis(config.lock_wait_ms),
        }
    }

    pub async fn get_or_create<F, Fut>(
        &self,
        cache_key: &str,
        ttl: Duration,
        generate: F,
    ) -> DepotResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DepotResult<String>>,
    {
        if let Some(url) = self.cached(cache_key).await {
            return Ok(url);
        }

        let lock_key = format!("lock:{cache_key}");
        let token = Uuid::new_v4().to_string();

        match self.backend.try_lock(&lock_key, &token, self.lock_ttl).await {
            Ok(true) => {
                // Someone may have filled it between our miss and the lock.
                let result = match self.cached(cache_key).await {
                    Some(url) => Ok(url),
                    None => self.fill(cache_key, ttl, generate).await,
                };
                match self.backend.unlock(&lock_key, &token).await {
                    Ok(true) => {}
                    Ok(false) => debug!(lock_key, "URL lock expired before release"),
                    Err(e) => warn!(lock_key, error = %e, "Failed to release URL lock"),
                }
                result
            }
            Ok(false) => {
                tokio::time::sleep(self.lock_wait).await;
                if let Some(url) = self.cached(cache_key).await {
                    return Ok(url);
                }
                debug!(cache_key, "URL still missing after wait, presigning without lock");
                self.fill(cache_key, ttl, generate).await
            }
            Err(e) => {
                warn!(cache_key, error = %e, "URL lock unavailable, presigning directly");
                self.fill(cache_key, ttl, generate).await
            }
        }
    }

    async fn cached(&self, cache_key: &str) -> Option<String> {
        match self.backend.get(cache_key).await {
            Ok(url) => url,
            Err(e) => {
                warn!(cache_key, error = %e, "URL cache read failed");
                None
            }
        }
    }

    async fn fill<F, Fut>(&self, cache_key: &str, ttl: Duration, generate: F) -> DepotResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DepotResult<String>>,
    {
        let url = generate().await?;
        if let Err(e) = self.backend.set_ex(cache_key, &url, ttl).await {
            warn!(cache_key, error = %e, "URL cache write failed");
        }
        Ok(url)
    }
}
