//! Link and pool-entry lifecycle: delete into the recycle bin, restore out of it,
//! and the background sweeper that purges what expired.

pub mod sweeper;

pub use sweeper::{RecycleSweeper, SweepReport};

use std::collections::BTreeSet;

use chrono::{DateTime, SubsecRound, Utc};
use common::{EventType, LinkStatus, PoolStatus};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseBackend, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, Set, Statement, TransactionTrait,
};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::RecycleConfig;
use crate::entity::{content_pool, event_log, namespace_link};
use crate::error::{DepotError, DepotResult};
use crate::pool::ContentPool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// Links moved to `deleted`, the target included.
    pub affected: u64,
    pub expire_at: DateTime<Utc>,
    /// Pool entries soft-deleted because their last live link went away.
    pub released: Vec<String>,
}

pub struct Lifecycle {
    db: DatabaseConnection,
    recycle: RecycleConfig,
}

impl Lifecycle {
    pub fn new(db: DatabaseConnection, recycle: RecycleConfig) -> Self {
        Self { db, recycle }
    }

    /// Move `target` and every active descendant to `deleted` with one shared expiry.
    #[instrument(skip(self))]
    pub async fn delete(&self, user_identity: &str, target: &str) -> DepotResult<DeleteOutcome> {
        let root = find_link(&self.db, user_identity, target, LinkStatus::Active).await?;
        let txn = self.db.begin().await?;

        let ids = subtree_ids(&txn, root.id, user_identity, LinkStatus::Active).await?;
        let links = namespace_link::Entity::find()
            .filter(namespace_link::Column::Id.is_in(ids))
            .filter(namespace_link::Column::Status.eq(LinkStatus::Active))
            .all(&txn)
            .await?;

        // Microsecond precision survives every backend's timestamp column.
        let now = Utc::now().trunc_subsecs(6);
        let expire_at = now + chrono::Duration::seconds(self.recycle.ttl_secs as i64);
        let link_ids: Vec<i32> = links.iter().map(|l| l.id).collect();

        let result = namespace_link::Entity::update_many()
            .col_expr(namespace_link::Column::Status, Expr::value(LinkStatus::Deleted))
            .col_expr(namespace_link::Column::ExpireAt, Expr::value(Some(expire_at)))
            .col_expr(namespace_link::Column::UpdatedAt, Expr::value(now))
            .filter(namespace_link::Column::Id.is_in(link_ids))
            .filter(namespace_link::Column::Status.eq(LinkStatus::Active))
            .exec(&txn)
            .await?;

        append_events(
            &txn,
            links.iter().map(|l| NewEvent {
                event_type: EventType::Delete,
                content_ref: l.content_ref.clone(),
                link_identity: Some(l.identity.clone()),
                user_identity: Some(user_identity.to_string()),
            }),
        )
        .await?;

        let mut released = Vec::new();
        for content_ref in content_refs(&links) {
            if live_link_count(&txn, &content_ref).await? > 0 {
                continue;
            }
            let soft_deleted = content_pool::Entity::update_many()
                .col_expr(content_pool::Column::Status, Expr::value(PoolStatus::Deleted))
                .col_expr(content_pool::Column::ExpireAt, Expr::value(Some(expire_at)))
                .filter(content_pool::Column::Identity.eq(&content_ref))
                .filter(content_pool::Column::Status.eq(PoolStatus::Active))
                .exec(&txn)
                .await?;
            if soft_deleted.rows_affected > 0 {
                released.push(content_ref);
            }
        }

        txn.commit().await?;

        info!(
            target,
            affected = result.rows_affected,
            released = released.len(),
            %expire_at,
            "Moved links to recycle bin"
        );
        Ok(DeleteOutcome {
            affected: result.rows_affected,
            expire_at,
            released,
        })
    }

    /// Bring `target` back, together with the descendants deleted along with it.
    ///
    /// Fails with [`DepotError::ContentUnavailable`] if any referenced content is
    /// already being purged, and with [`DepotError::NameConflict`] if the name was
    /// reused in the meantime. Either way nothing is restored.
    #[instrument(skip(self))]
    pub async fn restore(&self, user_identity: &str, target: &str) -> DepotResult<u64> {
        let root = find_link(&self.db, user_identity, target, LinkStatus::Deleted).await?;
        let txn = self.db.begin().await?;

        let taken = namespace_link::Entity::find()
            .filter(namespace_link::Column::UserIdentity.eq(user_identity))
            .filter(namespace_link::Column::ParentId.eq(root.parent_id))
            .filter(namespace_link::Column::Name.eq(&root.name))
            .filter(namespace_link::Column::Status.eq(LinkStatus::Active))
            .count(&txn)
            .await?;
        if taken > 0 {
            return Err(DepotError::NameConflict(root.name));
        }

        let ids = subtree_ids(&txn, root.id, user_identity, LinkStatus::Deleted).await?;
        let links: Vec<namespace_link::Model> = namespace_link::Entity::find()
            .filter(namespace_link::Column::Id.is_in(ids))
            .filter(namespace_link::Column::Status.eq(LinkStatus::Deleted))
            .all(&txn)
            .await?
            .into_iter()
            // Only what went to the bin in the same operation as the target.
            .filter(|l| l.expire_at == root.expire_at)
            .collect();

        let pool = ContentPool::new(&txn);
        for content_ref in content_refs(&links) {
            pool.activate(&content_ref).await?;
        }

        let now = Utc::now();
        let link_ids: Vec<i32> = links.iter().map(|l| l.id).collect();
        let result = namespace_link::Entity::update_many()
            .col_expr(namespace_link::Column::Status, Expr::value(LinkStatus::Active))
            .col_expr(
                namespace_link::Column::ExpireAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(namespace_link::Column::UpdatedAt, Expr::value(now))
            .filter(namespace_link::Column::Id.is_in(link_ids))
            .filter(namespace_link::Column::Status.eq(LinkStatus::Deleted))
            .exec(&txn)
            .await?;

        append_events(
            &txn,
            links.iter().map(|l| NewEvent {
                event_type: EventType::Restore,
                content_ref: l.content_ref.clone(),
                link_identity: Some(l.identity.clone()),
                user_identity: Some(user_identity.to_string()),
            }),
        )
        .await?;

        txn.commit().await?;

        info!(target, restored = result.rows_affected, "Restored links from recycle bin");
        Ok(result.rows_affected)
    }
}

async fn find_link<C: ConnectionTrait>(
    conn: &C,
    user_identity: &str,
    identity: &str,
    status: LinkStatus,
) -> DepotResult<namespace_link::Model> {
    namespace_link::Entity::find()
        .filter(namespace_link::Column::Identity.eq(identity))
        .filter(namespace_link::Column::UserIdentity.eq(user_identity))
        .filter(namespace_link::Column::Status.eq(status))
        .one(conn)
        .await?
        .ok_or_else(|| DepotError::NotFound(format!("link {identity}")))
}

/// Ids of `root` and every descendant reachable through links in `status`.
async fn subtree_ids<C: ConnectionTrait>(
    conn: &C,
    root: i32,
    user_identity: &str,
    status: LinkStatus,
) -> DepotResult<Vec<i32>> {
    let backend = conn.get_database_backend();
    let p = |n: usize| match backend {
        DatabaseBackend::Postgres => format!("${n}"),
        _ => "?".to_string(),
    };
    let sql = format!(
        "WITH RECURSIVE subtree(id) AS ( \
             SELECT id FROM namespace_link WHERE id = {root} \
             UNION ALL \
             SELECT child.id FROM namespace_link child \
             JOIN subtree ON child.parent_id = subtree.id \
             WHERE child.user_identity = {user} AND child.status = {status} \
         ) SELECT id FROM subtree",
        root = p(1),
        user = p(2),
        status = p(3),
    );
    let stmt = Statement::from_sql_and_values(
        backend,
        sql,
        [root.into(), user_identity.into(), status.as_str().into()],
    );

    let rows = conn.query_all_raw(stmt).await?;
    let mut ids = Vec::with_capacity(rows.len());
    for row in rows {
        ids.push(row.try_get::<i32>("", "id")?);
    }
    debug!(root, count = ids.len(), "Resolved subtree");
    Ok(ids)
}

/// Distinct content references, folders skipped.
fn content_refs(links: &[namespace_link::Model]) -> BTreeSet<String> {
    links.iter().filter_map(|l| l.content_ref.clone()).collect()
}

/// Active links pointing at a pool entry.
pub(crate) async fn live_link_count<C: ConnectionTrait>(
    conn: &C,
    content_ref: &str,
) -> DepotResult<u64> {
    let count = namespace_link::Entity::find()
        .filter(namespace_link::Column::ContentRef.eq(content_ref))
        .filter(namespace_link::Column::Status.eq(LinkStatus::Active))
        .count(conn)
        .await?;
    Ok(count)
}

pub(crate) struct NewEvent {
    pub event_type: EventType,
    pub content_ref: Option<String>,
    pub link_identity: Option<String>,
    pub user_identity: Option<String>,
}

/// Append audit records. Never updates existing ones.
pub(crate) async fn append_events<C: ConnectionTrait>(
    conn: &C,
    events: impl IntoIterator<Item = NewEvent>,
) -> DepotResult<usize> {
    let now = Utc::now();
    let models: Vec<event_log::ActiveModel> = events
        .into_iter()
        .map(|e| event_log::ActiveModel {
            identity: Set(Uuid::new_v4().to_string()),
            content_ref: Set(e.content_ref),
            link_identity: Set(e.link_identity),
            user_identity: Set(e.user_identity),
            event_type: Set(e.event_type),
            created_at: Set(now),
            ..Default::default()
        })
        .collect();

    let count = models.len();
    if count > 0 {
        event_log::Entity::insert_many(models).exec(conn).await?;
    }
    Ok(count)
}
