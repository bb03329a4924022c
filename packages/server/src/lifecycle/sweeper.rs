use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::storage::ObjectStore;
use common::{EventType, LinkStatus, PoolStatus};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{NewEvent, append_events, live_link_count};
use crate::config::RecycleConfig;
use crate::entity::{content_pool, namespace_link};
use crate::error::DepotResult;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Pool entries whose object was deleted.
    pub purged_contents: u64,
    pub purged_links: u64,
    /// Content references left alone: still linked, or released later than
    /// these links expired. Their expired links stay `deleted`.
    pub retained: u64,
    /// Remote deletes that failed; retried next sweep.
    pub failed: u64,
}

/// Background job that reclaims expired recycle-bin entries.
pub struct RecycleSweeper {
    db: DatabaseConnection,
    store: Arc<dyn ObjectStore>,
    config: RecycleConfig,
}

impl RecycleSweeper {
    pub fn new(db: DatabaseConnection, store: Arc<dyn ObjectStore>, config: RecycleConfig) -> Self {
        Self { db, store, config }
    }

    /// Sweep on every tick until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let scan_interval = Duration::from_secs(self.config.scan_interval_secs.max(1));
        info!(
            ttl_secs = self.config.ttl_secs,
            scan_interval_secs = scan_interval.as_secs(),
            "Starting recycle sweeper"
        );

        let mut interval = tokio::time::interval(scan_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Recycle sweeper stopped");
                    return;
                }
                _ = interval.tick() => {}
            }

            match self.sweep_once(Utc::now()).await {
                Ok(report) if report == SweepReport::default() => debug!("Nothing to sweep"),
                Ok(report) => info!(?report, "Recycle sweep finished"),
                Err(e) => error!(error = %e, "Recycle sweep failed"),
            }
        }
    }

    /// Purge everything deleted with `expire_at <= now`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> DepotResult<SweepReport> {
        let expired = namespace_link::Entity::find()
            .filter(namespace_link::Column::Status.eq(LinkStatus::Deleted))
            .filter(namespace_link::Column::ExpireAt.lte(now))
            .all(&self.db)
            .await?;

        let mut report = SweepReport::default();
        let mut folders = Vec::new();
        let mut by_content: BTreeMap<String, Vec<i32>> = BTreeMap::new();
        for link in expired {
            match link.content_ref {
                Some(content_ref) => by_content.entry(content_ref).or_default().push(link.id),
                None => folders.push(link.id),
            }
        }

        report.purged_links += self.purge_links(folders).await?;

        for (content_ref, link_ids) in by_content {
            match self.purge_content(&content_ref, now).await? {
                PurgeStep::Purged => {
                    report.purged_contents += 1;
                    report.purged_links += self.purge_links(link_ids).await?;
                    append_events(
                        &self.db,
                        [NewEvent {
                            event_type: EventType::Purge,
                            content_ref: Some(content_ref),
                            link_identity: None,
                            user_identity: None,
                        }],
                    )
                    .await?;
                }
                PurgeStep::Gone => {
                    report.purged_links += self.purge_links(link_ids).await?;
                }
                PurgeStep::Retained | PurgeStep::Revived => report.retained += 1,
                PurgeStep::RemoteFailed => report.failed += 1,
            }
        }

        Ok(report)
    }

    async fn purge_content(&self, content_ref: &str, now: DateTime<Utc>) -> DepotResult<PurgeStep> {
        // Active entries are never claimed: a linker activates before it inserts.
        let claimed = content_pool::Entity::update_many()
            .col_expr(content_pool::Column::Status, Expr::value(PoolStatus::Purging))
            .filter(content_pool::Column::Identity.eq(content_ref))
            .filter(content_pool::Column::Status.is_in([PoolStatus::Deleted, PoolStatus::Purging]))
            .filter(content_pool::Column::ExpireAt.lte(now))
            .exec(&self.db)
            .await?;
        if claimed.rows_affected == 0 {
            let entry = content_pool::Entity::find()
                .filter(content_pool::Column::Identity.eq(content_ref))
                .one(&self.db)
                .await?;
            return Ok(match entry {
                Some(entry) if entry.status != PoolStatus::Purged => {
                    debug!(content_ref, status = ?entry.status, "Content in use or not due, keeping object");
                    PurgeStep::Retained
                }
                _ => PurgeStep::Gone,
            });
        }

        // A deleted entry can still carry a live link if a failed linker released it
        // while another was inserting.
        if live_link_count(&self.db, content_ref).await? > 0 {
            content_pool::Entity::update_many()
                .col_expr(content_pool::Column::Status, Expr::value(PoolStatus::Active))
                .col_expr(
                    content_pool::Column::ExpireAt,
                    Expr::value(Option::<DateTime<Utc>>::None),
                )
                .filter(content_pool::Column::Identity.eq(content_ref))
                .filter(content_pool::Column::Status.eq(PoolStatus::Purging))
                .exec(&self.db)
                .await?;
            warn!(content_ref, "Content re-linked during sweep, purge skipped");
            return Ok(PurgeStep::Revived);
        }

        let Some(entry) = content_pool::Entity::find()
            .filter(content_pool::Column::Identity.eq(content_ref))
            .one(&self.db)
            .await?
        else {
            return Ok(PurgeStep::Gone);
        };

        if let Err(e) = self.store.delete_object(&entry.object_key).await {
            warn!(
                content_ref,
                key = %entry.object_key,
                error = %e,
                "Failed to delete object, will retry next sweep"
            );
            return Ok(PurgeStep::RemoteFailed);
        }

        content_pool::Entity::update_many()
            .col_expr(content_pool::Column::Status, Expr::value(PoolStatus::Purged))
            .col_expr(content_pool::Column::DeletedAt, Expr::value(Some(now)))
            .filter(content_pool::Column::Identity.eq(content_ref))
            .filter(content_pool::Column::Status.eq(PoolStatus::Purging))
            .exec(&self.db)
            .await?;

        info!(content_ref, key = %entry.object_key, "Purged content");
        Ok(PurgeStep::Purged)
    }

    async fn purge_links(&self, ids: Vec<i32>) -> DepotResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = namespace_link::Entity::update_many()
            .col_expr(namespace_link::Column::Status, Expr::value(LinkStatus::Purged))
            .col_expr(namespace_link::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(namespace_link::Column::Id.is_in(ids))
            .filter(namespace_link::Column::Status.eq(LinkStatus::Deleted))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

enum PurgeStep {
    Purged,
    /// Already purged or never existed.
    Gone,
    /// Active, or released after `now`.
    Retained,
    /// A live link appeared after the claim; entry returned to active.
    Revived,
    RemoteFailed,
}
