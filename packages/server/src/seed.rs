use sea_orm::*;
use sea_orm::sea_query::{Index, IndexCreateStatement};
use tracing::{info, warn};

use crate::entity::namespace_link;

/// At most one non-purged pool row per hash. Partial unique indexes are not
/// expressible in the entity definition, so this is plain SQL; the syntax is
/// shared by PostgreSQL and SQLite.
const POOL_HASH_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS uq_content_pool_live_hash \
     ON content_pool (hash) WHERE status <> 'purged'";

/// Ensure required database indexes exist.
///
/// The live-hash index backs the pool's duplicate detection, so failing to
/// create it aborts startup. The composite indexes only speed up queries.
pub async fn ensure_indexes(db: &DatabaseConnection) -> Result<(), DbErr> {
    db.execute_unprepared(POOL_HASH_INDEX).await?;
    info!("Ensured index uq_content_pool_live_hash exists");

    // Name checks and subtree walks:
    // SELECT ... FROM namespace_link WHERE user_identity = ? AND parent_id = ? AND status = ?
    let stmt = Index::create()
        .if_not_exists()
        .name("idx_link_user_parent_status")
        .table(namespace_link::Entity)
        .col(namespace_link::Column::UserIdentity)
        .col(namespace_link::Column::ParentId)
        .col(namespace_link::Column::Status)
        .to_owned();
    create_optional_index(db, &stmt, "idx_link_user_parent_status").await;

    // Sweeper scan: WHERE status = 'deleted' AND expire_at <= now
    let stmt = Index::create()
        .if_not_exists()
        .name("idx_link_status_expire")
        .table(namespace_link::Entity)
        .col(namespace_link::Column::Status)
        .col(namespace_link::Column::ExpireAt)
        .to_owned();
    create_optional_index(db, &stmt, "idx_link_status_expire").await;

    // Reference counting: WHERE content_ref = ? AND status = 'active'
    let stmt = Index::create()
        .if_not_exists()
        .name("idx_link_content_status")
        .table(namespace_link::Entity)
        .col(namespace_link::Column::ContentRef)
        .col(namespace_link::Column::Status)
        .to_owned();
    create_optional_index(db, &stmt, "idx_link_content_status").await;

    Ok(())
}

async fn create_optional_index(db: &DatabaseConnection, stmt: &IndexCreateStatement, name: &str) {
    match db.execute(stmt).await {
        Ok(_) => info!("Ensured index {} exists", name),
        Err(e) => warn!("Failed to create index {}: {}", name, e),
    }
}
