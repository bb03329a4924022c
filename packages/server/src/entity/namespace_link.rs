use common::LinkStatus;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Id of the virtual root folder every user's tree hangs off.
pub const ROOT_ID: i32 = 0;

/// A user-visible file or folder placement.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "namespace_link")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    #[sea_orm(unique)]
    pub identity: String,

    #[sea_orm(indexed)]
    pub user_identity: String,

    /// Parent folder id, `ROOT_ID` at the top level.
    #[sea_orm(indexed)]
    pub parent_id: i32,

    /// Pool entry identity. NULL for folders.
    #[sea_orm(indexed)]
    pub content_ref: Option<String>,

    pub name: String,

    /// Extension with leading dot, empty for folders.
    pub ext: String,

    pub size: i64,

    #[sea_orm(indexed)]
    pub status: LinkStatus,

    pub expire_at: Option<DateTimeUtc>,

    pub created_at: DateTimeUtc,

    pub updated_at: DateTimeUtc,
}

impl Model {
    pub fn is_folder(&self) -> bool {
        self.content_ref.is_none()
    }
}

impl ActiveModelBehavior for ActiveModel {}
