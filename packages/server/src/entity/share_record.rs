use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A share link. Created and managed elsewhere; read here to issue share URLs.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "share_record")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    #[sea_orm(unique)]
    pub identity: String,

    pub user_identity: String,

    /// Pool entry being shared.
    pub content_ref: String,

    /// Lifetime in seconds from `created_at`; 0 never expires.
    pub expired_time: i64,

    pub created_at: DateTimeUtc,
}

impl Model {
    pub fn is_expired(&self, now: DateTimeUtc) -> bool {
        self.expired_time > 0
            && self.created_at + chrono::Duration::seconds(self.expired_time) <= now
    }
}

impl ActiveModelBehavior for ActiveModel {}
