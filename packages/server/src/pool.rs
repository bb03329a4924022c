use chrono::{DateTime, Utc};
use common::PoolStatus;
use common::storage::ContentHash;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set, SqlErr,
};
use tracing::debug;

use crate::entity::content_pool;
use crate::error::{DepotError, DepotResult};
use crate::lifecycle::live_link_count;

/// Fields of a pool entry about to be created.
#[derive(Debug, Clone)]
pub struct NewPoolEntry {
    pub identity: String,
    pub hash: ContentHash,
    pub object_key: String,
    pub size: i64,
}

/// Authoritative hash -> object mapping.
pub struct ContentPool<'a, C: ConnectionTrait> {
    conn: &'a C,
}

impl<'a, C: ConnectionTrait> ContentPool<'a, C> {
    pub fn new(conn: &'a C) -> Self {
        Self { conn }
    }

    /// Exact lookup of the non-purged entry for a hash.
    pub async fn resolve(&self, hash: &ContentHash) -> DepotResult<Option<content_pool::Model>> {
        let entry = content_pool::Entity::find()
            .filter(content_pool::Column::Hash.eq(hash.to_hex()))
            .filter(content_pool::Column::Status.ne(PoolStatus::Purged))
            .one(self.conn)
            .await?;
        Ok(entry)
    }

    pub async fn find_by_identity(
        &self,
        identity: &str,
    ) -> DepotResult<Option<content_pool::Model>> {
        let entry = content_pool::Entity::find()
            .filter(content_pool::Column::Identity.eq(identity))
            .one(self.conn)
            .await?;
        Ok(entry)
    }

    /// Create a new active entry.
    ///
    /// Fails with [`DepotError::DuplicateHash`] when a live entry for the hash
    /// already committed; the caller re-resolves and uses that one instead.
    pub async fn insert(&self, entry: NewPoolEntry) -> DepotResult<content_pool::Model> {
        let hash = entry.hash.to_hex();
        let model = content_pool::ActiveModel {
            identity: Set(entry.identity),
            hash: Set(hash.clone()),
            object_key: Set(entry.object_key),
            size: Set(entry.size),
            status: Set(PoolStatus::Active),
            created_at: Set(Utc::now()),
            expire_at: Set(None),
            deleted_at: Set(None),
            ..Default::default()
        };

        match model.insert(self.conn).await {
            Ok(inserted) => {
                debug!(hash = %hash, identity = %inserted.identity, "Inserted pool entry");
                Ok(inserted)
            }
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                Err(DepotError::DuplicateHash(hash))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Make an entry linkable again: `active` stays, `deleted` returns to `active`.
    ///
    /// This is a single conditional update so it cannot race a sweeper that has
    /// already moved the entry to `purging`; that case reports
    /// [`DepotError::ContentUnavailable`].
    pub async fn activate(&self, identity: &str) -> DepotResult<()> {
        let result = content_pool::Entity::update_many()
            .col_expr(content_pool::Column::Status, Expr::value(PoolStatus::Active))
            .col_expr(
                content_pool::Column::ExpireAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .filter(content_pool::Column::Identity.eq(identity))
            .filter(content_pool::Column::Status.is_in([PoolStatus::Active, PoolStatus::Deleted]))
            .exec(self.conn)
            .await?;

        if result.rows_affected > 0 {
            return Ok(());
        }

        match self.find_by_identity(identity).await? {
            Some(_) => Err(DepotError::ContentUnavailable(identity.to_string())),
            None => Err(DepotError::NotFound(format!("content {identity}"))),
        }
    }

    /// Undo an [`activate`](Self::activate) whose link never materialised: the entry
    /// goes back to `deleted` with its old expiry, unless something links it now.
    pub async fn release(&self, identity: &str, expire_at: DateTime<Utc>) -> DepotResult<bool> {
        if live_link_count(self.conn, identity).await? > 0 {
            return Ok(false);
        }
        let result = content_pool::Entity::update_many()
            .col_expr(content_pool::Column::Status, Expr::value(PoolStatus::Deleted))
            .col_expr(content_pool::Column::ExpireAt, Expr::value(Some(expire_at)))
            .filter(content_pool::Column::Identity.eq(identity))
            .filter(content_pool::Column::Status.eq(PoolStatus::Active))
            .exec(self.conn)
            .await?;
        Ok(result.rows_affected > 0)
    }
}
