use chrono::Utc;
use common::LinkStatus;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, ModelTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entity::namespace_link;
use crate::error::{DepotError, DepotResult};

/// Placement to register in a user's tree.
#[derive(Debug, Clone)]
pub struct NewLink {
    pub user_identity: String,
    pub parent_id: i32,
    /// `None` registers a folder.
    pub content_ref: Option<String>,
    pub name: String,
    pub ext: String,
    pub size: i64,
}

impl NewLink {
    pub fn folder(user_identity: impl Into<String>, parent_id: i32, name: impl Into<String>) -> Self {
        Self {
            user_identity: user_identity.into(),
            parent_id,
            content_ref: None,
            name: name.into(),
            ext: String::new(),
            size: 0,
        }
    }
}

/// Namespace link registration.
///
/// Names are unique per (user, parent) among active links. The database does not
/// enforce this; the check runs before the insert and again after it.
pub struct LinkRegistry<'a, C: ConnectionTrait> {
    conn: &'a C,
}

impl<'a, C: ConnectionTrait> LinkRegistry<'a, C> {
    pub fn new(conn: &'a C) -> Self {
        Self { conn }
    }

    pub async fn create(&self, link: NewLink) -> DepotResult<namespace_link::Model> {
        let name = link.name.trim().to_string();
        if name.is_empty() {
            return Err(DepotError::Validation("name must not be empty".into()));
        }

        self.ensure_name_free(&link.user_identity, link.parent_id, &name)
            .await?;

        let now = Utc::now();
        let model = namespace_link::ActiveModel {
            identity: Set(Uuid::new_v4().to_string()),
            user_identity: Set(link.user_identity.clone()),
            parent_id: Set(link.parent_id),
            content_ref: Set(link.content_ref),
            name: Set(name.clone()),
            ext: Set(link.ext),
            size: Set(link.size),
            status: Set(LinkStatus::Active),
            expire_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };
        let inserted = model.insert(self.conn).await?;

        // Two writers can both pass the first check. The oldest row wins and the
        // others back out.
        let winner = namespace_link::Entity::find()
            .filter(namespace_link::Column::UserIdentity.eq(&link.user_identity))
            .filter(namespace_link::Column::ParentId.eq(link.parent_id))
            .filter(namespace_link::Column::Name.eq(&name))
            .filter(namespace_link::Column::Status.eq(LinkStatus::Active))
            .order_by_asc(namespace_link::Column::Id)
            .one(self.conn)
            .await?;

        if let Some(winner) = winner
            && winner.id != inserted.id
        {
            warn!(
                name = %name,
                parent_id = link.parent_id,
                "Concurrent link with the same name, backing out"
            );
            inserted.delete(self.conn).await?;
            return Err(DepotError::NameConflict(name));
        }

        debug!(
            identity = %inserted.identity,
            content_ref = ?inserted.content_ref,
            "Created namespace link"
        );
        Ok(inserted)
    }

    pub async fn create_folder(
        &self,
        user_identity: &str,
        parent_id: i32,
        name: &str,
    ) -> DepotResult<namespace_link::Model> {
        self.create(NewLink::folder(user_identity, parent_id, name))
            .await
    }

    /// The user's active link to `content_ref` named `name` under `parent_id`, if any.
    pub async fn find_placed(
        &self,
        user_identity: &str,
        content_ref: &str,
        parent_id: i32,
        name: &str,
    ) -> DepotResult<Option<namespace_link::Model>> {
        let link = namespace_link::Entity::find()
            .filter(namespace_link::Column::UserIdentity.eq(user_identity))
            .filter(namespace_link::Column::ContentRef.eq(content_ref))
            .filter(namespace_link::Column::ParentId.eq(parent_id))
            .filter(namespace_link::Column::Name.eq(name.trim()))
            .filter(namespace_link::Column::Status.eq(LinkStatus::Active))
            .one(self.conn)
            .await?;
        Ok(link)
    }

    /// Fails with [`DepotError::NameConflict`] if an active link already uses `name`.
    pub async fn ensure_name_free(
        &self,
        user_identity: &str,
        parent_id: i32,
        name: &str,
    ) -> DepotResult<()> {
        if self.count_active_named(user_identity, parent_id, name).await? > 0 {
            return Err(DepotError::NameConflict(name.to_string()));
        }
        Ok(())
    }

    async fn count_active_named(
        &self,
        user_identity: &str,
        parent_id: i32,
        name: &str,
    ) -> DepotResult<u64> {
        let count = namespace_link::Entity::find()
            .filter(namespace_link::Column::UserIdentity.eq(user_identity))
            .filter(namespace_link::Column::ParentId.eq(parent_id))
            .filter(namespace_link::Column::Name.eq(name))
            .filter(namespace_link::Column::Status.eq(LinkStatus::Active))
            .count(self.conn)
            .await?;
        Ok(count)
    }
}
