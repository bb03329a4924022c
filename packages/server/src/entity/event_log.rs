use common::EventType;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Append-only lifecycle audit record.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "event_log")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    #[sea_orm(unique)]
    pub identity: String,

    /// Pool entry the event concerns. NULL for folder links.
    #[sea_orm(indexed)]
    pub content_ref: Option<String>,

    /// Link the event concerns. NULL for purge events, which are per content.
    pub link_identity: Option<String>,

    /// NULL for system-initiated events.
    pub user_identity: Option<String>,

    #[sea_orm(indexed)]
    pub event_type: EventType,

    pub created_at: DateTimeUtc,
}

impl ActiveModelBehavior for ActiveModel {}
