use std::sync::Arc;

use chrono::Utc;
use common::storage::ObjectStore;
use common::{LinkStatus, PoolStatus};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use tracing::instrument;

use crate::cache::SignedUrlCache;
use crate::config::UrlConfig;
use crate::entity::{content_pool, namespace_link, share_record};
use crate::error::{DepotError, DepotResult};

/// A time-limited download URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrl {
    pub url: String,
    /// Lifetime actually granted, after normalisation.
    pub expires_secs: u64,
}

/// Issues download and share URLs through the signed-URL cache.
pub struct UrlService {
    db: DatabaseConnection,
    store: Arc<dyn ObjectStore>,
    cache: Arc<SignedUrlCache>,
    config: UrlConfig,
}

impl UrlService {
    pub fn new(
        db: DatabaseConnection,
        store: Arc<dyn ObjectStore>,
        cache: Arc<SignedUrlCache>,
        config: UrlConfig,
    ) -> Self {
        Self {
            db,
            store,
            cache,
            config,
        }
    }

    /// URL for content the user holds an active link to.
    #[instrument(skip(self))]
    pub async fn get_download_url(
        &self,
        user_identity: &str,
        content_ref: &str,
        expires_secs: i64,
    ) -> DepotResult<SignedUrl> {
        if content_ref.is_empty() {
            return Err(DepotError::Validation("content reference must not be empty".into()));
        }

        let owned = namespace_link::Entity::find()
            .filter(namespace_link::Column::UserIdentity.eq(user_identity))
            .filter(namespace_link::Column::ContentRef.eq(content_ref))
            .filter(namespace_link::Column::Status.eq(LinkStatus::Active))
            .one(&self.db)
            .await?;
        if owned.is_none() {
            return Err(DepotError::NotFound(format!("content {content_ref}")));
        }

        let ttl = self.config.normalize_expires(expires_secs);
        let cache_key = format!("download_url:{content_ref}:{}", ttl.as_secs());
        self.issue(content_ref, &cache_key, ttl).await
    }

    /// URL for a share link, valid while the share itself is.
    #[instrument(skip(self))]
    pub async fn get_share_url(&self, share_ref: &str, expires_secs: i64) -> DepotResult<SignedUrl> {
        let share = share_record::Entity::find()
            .filter(share_record::Column::Identity.eq(share_ref))
            .one(&self.db)
            .await?
            .ok_or_else(|| DepotError::NotFound(format!("share {share_ref}")))?;

        if share.is_expired(Utc::now()) {
            return Err(DepotError::NotFound(format!("share {share_ref} has expired")));
        }

        let ttl = self.config.normalize_expires(expires_secs);
        let cache_key = format!("share_download_url:{share_ref}:{}", ttl.as_secs());
        self.issue(&share.content_ref, &cache_key, ttl).await
    }

    async fn issue(
        &self,
        content_ref: &str,
        cache_key: &str,
        ttl: std::time::Duration,
    ) -> DepotResult<SignedUrl> {
        let entry = content_pool::Entity::find()
            .filter(content_pool::Column::Identity.eq(content_ref))
            .filter(content_pool::Column::Status.is_in([PoolStatus::Active, PoolStatus::Deleted]))
            .one(&self.db)
            .await?
            .ok_or_else(|| DepotError::NotFound(format!("content {content_ref}")))?;

        let store = Arc::clone(&self.store);
        let url = self
            .cache
            .get_or_create(cache_key, ttl, || async move {
                Ok(store.presign_get(&entry.object_key, ttl).await?)
            })
            .await?;

        Ok(SignedUrl {
            url,
            expires_secs: ttl.as_secs(),
        })
    }
}
