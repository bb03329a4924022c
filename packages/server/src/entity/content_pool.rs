use common::PoolStatus;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One row per distinct content hash; owns the backing object.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "content_pool")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Content reference handed to links and callers.
    #[sea_orm(unique)]
    pub identity: String,

    /// Hex SHA-256. Unique among non-purged rows (partial index, see `seed`).
    #[sea_orm(indexed)]
    pub hash: String,

    pub object_key: String,

    pub size: i64,

    #[sea_orm(indexed)]
    pub status: PoolStatus,

    pub created_at: DateTimeUtc,

    /// Set when the entry is soft-deleted along with its last live link.
    pub expire_at: Option<DateTimeUtc>,

    /// Set when the remote object has been deleted.
    pub deleted_at: Option<DateTimeUtc>,
}

impl ActiveModelBehavior for ActiveModel {}
