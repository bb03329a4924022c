//! Upload submission and the ingestion pipeline shared by the foreground path and
//! the queue consumer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use common::{IngestionTask, PoolStatus};
use common::ingest::extension_of;
use common::storage::{ContentHash, hash_file};
use mq::{Mq, publish_json};
use sea_orm::{DatabaseConnection, ModelTrait};
use tempfile::TempPath;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{IngestConfig, TranscodeConfig};
use crate::entity::{content_pool, namespace_link};
use crate::error::{DepotError, DepotResult};
use crate::filter::ExistenceFilter;
use crate::links::{LinkRegistry, NewLink};
use crate::pool::{ContentPool, NewPoolEntry};
use crate::transcode::{CompressOptions, MediaKind, Transcoder};
use crate::uploader::ChunkedUploader;

/// Hands deferred uploads to the queue consumer.
#[async_trait]
pub trait TaskPublisher: Send + Sync {
    async fn publish(&self, task: &IngestionTask) -> DepotResult<()>;
}

pub struct MqTaskPublisher {
    mq: Arc<Mq>,
    queue_name: String,
}

impl MqTaskPublisher {
    pub fn new(mq: Arc<Mq>, queue_name: impl Into<String>) -> Self {
        Self {
            mq,
            queue_name: queue_name.into(),
        }
    }
}

#[async_trait]
impl TaskPublisher for MqTaskPublisher {
    async fn publish(&self, task: &IngestionTask) -> DepotResult<()> {
        publish_json(&self.mq, &self.queue_name, task).await?;
        Ok(())
    }
}

/// Caller-supplied metadata for a new upload.
#[derive(Debug, Clone)]
pub struct UploadMeta {
    pub name: String,
    pub parent_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    /// Content was already pooled; only a link was written.
    Instant,
    /// Content was uploaded and linked before returning.
    Uploaded,
    /// Content was queued; it becomes visible once the consumer finishes.
    Accepted,
}

#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub status: UploadStatus,
    pub content_ref: String,
    /// Set unless the upload was deferred.
    pub link: Option<namespace_link::Model>,
}

/// What one pipeline run produced.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub content_ref: String,
    /// `None` when the link already existed and nothing was written.
    pub link: Option<namespace_link::Model>,
    /// Whether bytes were written to the object store by this run.
    pub uploaded: bool,
}

/// Services the pipeline needs, injected once at startup.
pub struct Ingestor {
    db: DatabaseConnection,
    filter: Arc<ExistenceFilter>,
    uploader: Arc<ChunkedUploader>,
    transcoder: Option<Arc<dyn Transcoder>>,
    publisher: Arc<dyn TaskPublisher>,
    transcode: TranscodeConfig,
    ingest: IngestConfig,
}

impl Ingestor {
    pub fn new(
        db: DatabaseConnection,
        filter: Arc<ExistenceFilter>,
        uploader: Arc<ChunkedUploader>,
        transcoder: Option<Arc<dyn Transcoder>>,
        publisher: Arc<dyn TaskPublisher>,
        transcode: TranscodeConfig,
        ingest: IngestConfig,
    ) -> Self {
        Self {
            db,
            filter,
            uploader,
            transcoder,
            publisher,
            transcode,
            ingest,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.ingest
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    fn staging_dir(&self) -> PathBuf {
        self.uploader.config().staging_dir()
    }

    /// Register the file at `local_path` for `user_identity`.
    ///
    /// Known content is linked without moving bytes. New content up to the defer
    /// threshold is uploaded before returning; anything larger is staged and queued.
    /// `local_path` stays owned by the caller.
    #[instrument(skip(self, meta, local_path, cancel), fields(name = %meta.name, hash))]
    pub async fn submit_upload(
        &self,
        user_identity: &str,
        meta: UploadMeta,
        local_path: &Path,
        cancel: &CancellationToken,
    ) -> DepotResult<UploadReceipt> {
        let name = meta.name.trim().to_string();
        if name.is_empty() {
            return Err(DepotError::Validation("file name must not be empty".into()));
        }

        // Re-checked when the link is written.
        LinkRegistry::new(&self.db)
            .ensure_name_free(user_identity, meta.parent_id, &name)
            .await?;

        let (hash, size) = hash_file(local_path).await?;
        tracing::Span::current().record("hash", hash.to_hex().as_str());
        let ext = extension_of(&name);

        if let Some(entry) = self.lookup(&hash).await? {
            let link = self
                .link_existing(user_identity, meta.parent_id, &name, &ext, &entry)
                .await?;
            info!(content_ref = %entry.identity, "Instant upload");
            return Ok(UploadReceipt {
                status: UploadStatus::Instant,
                content_ref: entry.identity,
                link: Some(link),
            });
        }

        let mut task = IngestionTask {
            user_identity: user_identity.to_string(),
            parent_id: meta.parent_id as i64,
            file_path: local_path.display().to_string(),
            ext,
            name,
            size: size as i64,
            is_existed: false,
            repository_identity: Uuid::new_v4().to_string(),
            hash: hash.to_hex(),
        };

        if size > self.ingest.defer_threshold {
            let staged = self.stage(local_path, &task.ext).await?;
            task.file_path = staged.display().to_string();
            self.publisher.publish(&task).await?;
            // The consumer owns the staged copy from here on.
            staged.keep().map_err(|e| DepotError::Io(e.error))?;

            info!(
                content_ref = %task.repository_identity,
                size,
                "Upload deferred to ingestion queue"
            );
            return Ok(UploadReceipt {
                status: UploadStatus::Accepted,
                content_ref: task.repository_identity,
                link: None,
            });
        }

        let outcome = self.run_pipeline(&task, cancel).await?;
        let status = if outcome.uploaded {
            UploadStatus::Uploaded
        } else {
            UploadStatus::Instant
        };
        Ok(UploadReceipt {
            status,
            content_ref: outcome.content_ref,
            link: outcome.link,
        })
    }

    /// Turn a task into a pooled object plus a link. Safe to run again after a
    /// partial failure: content registered by an earlier attempt is found and reused.
    ///
    /// Never removes `task.file_path`; temporary transcoder output is removed on
    /// every exit path.
    #[instrument(skip(self, task, cancel), fields(content_ref = %task.repository_identity))]
    pub async fn run_pipeline(
        &self,
        task: &IngestionTask,
        cancel: &CancellationToken,
    ) -> DepotResult<PipelineOutcome> {
        let parent_id = i32::try_from(task.parent_id)
            .map_err(|_| DepotError::Validation(format!("parent id {} out of range", task.parent_id)))?;
        let hash = ContentHash::from_hex(&task.hash)?;
        let links = LinkRegistry::new(&self.db);

        let pool = ContentPool::new(&self.db);
        // An earlier delivery, an earlier attempt or a concurrent upload may have
        // pooled it already.
        let existing = if task.is_existed {
            let entry = pool
                .find_by_identity(&task.repository_identity)
                .await?
                .ok_or_else(|| DepotError::NotFound(format!("content {}", task.repository_identity)))?;
            Some(entry)
        } else {
            pool.resolve(&hash).await?
        };

        if let Some(entry) = existing {
            if let Some(link) = links
                .find_placed(&task.user_identity, &entry.identity, parent_id, &task.name)
                .await?
            {
                debug!(content_ref = %entry.identity, "Link already present");
                return Ok(PipelineOutcome {
                    content_ref: entry.identity,
                    link: Some(link),
                    uploaded: false,
                });
            }
            let link = self
                .link_existing(&task.user_identity, parent_id, &task.name, &task.ext, &entry)
                .await?;
            return Ok(PipelineOutcome {
                content_ref: entry.identity,
                link: Some(link),
                uploaded: false,
            });
        }

        let source = Path::new(&task.file_path);
        let compressed = self.maybe_transcode(source, &task.ext, cancel).await?;
        let upload_path = compressed.as_deref().unwrap_or(source);
        let actual_size = tokio::fs::metadata(upload_path).await?.len();

        let object_key = self
            .uploader
            .upload_file(upload_path, &task.name, actual_size, cancel)
            .await?;
        drop(compressed);

        let inserted = pool
            .insert(NewPoolEntry {
                identity: task.repository_identity.clone(),
                hash,
                object_key: object_key.clone(),
                size: actual_size as i64,
            })
            .await;

        let (entry, uploaded) = match inserted {
            Ok(entry) => (entry, true),
            Err(DepotError::DuplicateHash(_)) => {
                let winner = pool
                    .resolve(&hash)
                    .await?
                    .ok_or_else(|| DepotError::NotFound(format!("content {}", hash)))?;
                info!(
                    winner = %winner.identity,
                    orphan = %object_key,
                    "Lost pool insert race, discarding uploaded object"
                );
                if let Err(e) = self.uploader.store().delete_object(&object_key).await {
                    warn!(key = %object_key, error = %e, "Failed to delete orphaned object");
                }
                pool.activate(&winner.identity).await?;
                (winner, false)
            }
            Err(e) => return Err(e),
        };

        self.filter.add(&hash);

        let link = links
            .create(NewLink {
                user_identity: task.user_identity.clone(),
                parent_id,
                content_ref: Some(entry.identity.clone()),
                name: task.name.clone(),
                ext: task.ext.clone(),
                size: entry.size,
            })
            .await?;

        info!(
            content_ref = %entry.identity,
            size = entry.size,
            uploaded,
            "Ingested content"
        );
        Ok(PipelineOutcome {
            content_ref: entry.identity,
            link: Some(link),
            uploaded,
        })
    }

    /// Pool lookup gated by the existence filter.
    async fn lookup(&self, hash: &ContentHash) -> DepotResult<Option<content_pool::Model>> {
        if !self.filter.might_contain(hash) {
            return Ok(None);
        }
        let entry = ContentPool::new(&self.db).resolve(hash).await?;
        if entry.is_none() {
            debug!("Existence filter false positive");
        }
        Ok(entry)
    }

    /// Link a user to content that is already pooled, reviving a soft-deleted entry.
    async fn link_existing(
        &self,
        user_identity: &str,
        parent_id: i32,
        name: &str,
        ext: &str,
        entry: &content_pool::Model,
    ) -> DepotResult<namespace_link::Model> {
        let pool = ContentPool::new(&self.db);
        pool.activate(&entry.identity).await?;
        let created = LinkRegistry::new(&self.db)
            .create(NewLink {
                user_identity: user_identity.to_string(),
                parent_id,
                content_ref: Some(entry.identity.clone()),
                name: name.to_string(),
                ext: ext.to_string(),
                size: entry.size,
            })
            .await;

        let link = match created {
            Ok(link) => link,
            Err(e) => {
                if entry.status == PoolStatus::Deleted
                    && let Some(expire_at) = entry.expire_at
                {
                    pool.release(&entry.identity, expire_at).await?;
                }
                return Err(e);
            }
        };

        // The entry must still be linkable now that the link exists.
        if let Err(e) = pool.activate(&entry.identity).await {
            warn!(content_ref = %entry.identity, "Content claimed while linking, backing out");
            link.delete(&self.db).await?;
            return Err(e);
        }
        Ok(link)
    }

    /// Compress media into a temp file that is removed when the returned guard drops.
    async fn maybe_transcode(
        &self,
        source: &Path,
        ext: &str,
        cancel: &CancellationToken,
    ) -> DepotResult<Option<TempPath>> {
        let Some(transcoder) = self.transcoder.as_ref().filter(|_| self.transcode.enabled) else {
            return Ok(None);
        };
        let Some(kind) = MediaKind::from_ext(ext) else {
            return Ok(None);
        };

        let output = TempPath::from_path(
            self.staging_dir()
                .join(format!("compressed-{}{}", Uuid::new_v4(), kind.output_ext(ext))),
        );
        let options = CompressOptions::from_config(kind, &self.transcode);
        tokio::select! {
            result = transcoder.compress(source, &output, &options) => result?,
            _ = cancel.cancelled() => return Err(DepotError::Cancelled),
        }
        Ok(Some(output))
    }

    /// Give the consumer its own copy of the upload. A hard link when the staging
    /// dir shares a filesystem with the source, a full copy otherwise.
    async fn stage(&self, source: &Path, ext: &str) -> DepotResult<TempPath> {
        let dir = self.staging_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let staged = TempPath::from_path(dir.join(format!("upload-{}{}", Uuid::new_v4(), ext)));
        if tokio::fs::hard_link(source, &staged).await.is_err() {
            tokio::fs::copy(source, &staged).await?;
        }
        Ok(staged)
    }
}
