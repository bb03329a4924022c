//! Chunked, parallel object uploads.
//!
//! Small payloads go up in one request. Large ones are split into fixed-size parts
//! that are uploaded concurrently (bounded by a semaphore), each with its own
//! retry budget and deadline. A session is either completed with every part or
//! aborted; it is never left half-finished on purpose.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::retry::{RetryDecision, RetryPolicy, RetryTracker};
use common::storage::{BoxReader, CompletedPart, ObjectStore, new_object_key};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::UploadConfig;
use crate::error::{DepotError, DepotResult};

/// How long a best-effort abort may take before it is given up on.
const ABORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Byte range of one part. 1-based `part_number`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSpec {
    pub part_number: u32,
    pub offset: u64,
    pub len: u64,
}

/// Split `size` bytes into parts of `part_size`; the last part carries the remainder.
///
/// An empty payload still gets one (empty) part, since a multipart session cannot
/// be completed without any.
pub fn plan_parts(size: u64, part_size: u64) -> Vec<PartSpec> {
    let part_size = part_size.max(1);
    let count = size.div_ceil(part_size).max(1);
    (0..count)
        .map(|i| {
            let offset = i * part_size;
            PartSpec {
                part_number: (i + 1) as u32,
                offset,
                len: part_size.min(size - offset.min(size)),
            }
        })
        .collect()
}

pub fn content_type_for(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Everything a part worker needs. Shared read-only across workers.
struct PartContext {
    store: Arc<dyn ObjectStore>,
    key: String,
    upload_id: String,
    path: PathBuf,
    policy: RetryPolicy,
    part_timeout: Duration,
    cancel: CancellationToken,
}

pub struct ChunkedUploader {
    store: Arc<dyn ObjectStore>,
    config: UploadConfig,
}

impl ChunkedUploader {
    pub fn new(store: Arc<dyn ObjectStore>, config: UploadConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Upload a local file, picking single-shot or multipart by size.
    /// Returns the new object key.
    pub async fn upload_file(
        &self,
        path: &Path,
        name: &str,
        size: u64,
        cancel: &CancellationToken,
    ) -> DepotResult<String> {
        if size > self.config.multipart_threshold {
            info!(
                size_mib = size as f64 / (1024.0 * 1024.0),
                "Payload above multipart threshold"
            );
            self.upload_multipart(path, name, size, cancel).await
        } else {
            let file = tokio::fs::File::open(path).await?;
            tokio::select! {
                result = self.upload(Box::new(file), name) => result,
                _ = cancel.cancelled() => Err(DepotError::Cancelled),
            }
        }
    }

    /// Single-request upload of a small payload. Returns the new object key.
    pub async fn upload(&self, reader: BoxReader, name: &str) -> DepotResult<String> {
        let key = new_object_key(name);
        let written = self
            .store
            .put_stream(&key, reader, &content_type_for(name))
            .await?;
        debug!(key = %key, bytes = written, "Uploaded object");
        Ok(key)
    }

    /// Multipart upload of `size` bytes read from `path`. Returns the new object key.
    ///
    /// The whole session is bounded by a deadline derived from `size`. Any failure,
    /// caller cancellation or deadline expiry aborts the remote session before the
    /// error is returned.
    #[instrument(skip(self, cancel), fields(key))]
    pub async fn upload_multipart(
        &self,
        path: &Path,
        name: &str,
        size: u64,
        cancel: &CancellationToken,
    ) -> DepotResult<String> {
        let key = new_object_key(name);
        tracing::Span::current().record("key", key.as_str());

        let upload_id = self
            .store
            .initiate_multipart(&key, &content_type_for(name))
            .await?;
        let deadline = self.config.session_timeout(size);
        let session = cancel.child_token();

        let outcome = tokio::time::timeout(deadline, async {
            let parts = self.upload_parts(path, &key, &upload_id, size, &session).await?;
            let count = parts.len();
            self.store
                .complete_multipart(&key, &upload_id, parts)
                .await?;
            Ok::<usize, DepotError>(count)
        })
        .await;

        // Whatever happened, stop any part still in flight.
        session.cancel();

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(DepotError::Timeout(deadline)),
        };

        match result {
            Ok(parts) => {
                info!(upload_id = %upload_id, parts, size, "Multipart upload completed");
                Ok(key)
            }
            Err(e) => {
                error!(upload_id = %upload_id, error = %e, "Multipart upload failed, aborting");
                self.abort(&key, &upload_id).await;
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        path: &Path,
        key: &str,
        upload_id: &str,
        size: u64,
        cancel: &CancellationToken,
    ) -> DepotResult<Vec<CompletedPart>> {
        let plan = plan_parts(size, self.config.part_size);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_parts.max(1)));
        let ctx = Arc::new(PartContext {
            store: Arc::clone(&self.store),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            path: path.to_path_buf(),
            policy: RetryPolicy::linear(
                self.config.part_attempts,
                Duration::from_millis(self.config.part_backoff_ms),
            ),
            part_timeout: Duration::from_secs(self.config.part_timeout_secs),
            cancel: cancel.clone(),
        });

        debug!(parts = plan.len(), "Starting part uploads");

        let mut tasks = JoinSet::new();
        for spec in plan.iter().copied() {
            tasks.spawn(upload_part(Arc::clone(&ctx), Arc::clone(&semaphore), spec));
        }

        let mut parts = Vec::with_capacity(plan.len());
        let mut first_error: Option<DepotError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(DepotError::Io(std::io::Error::other(e))));
            match result {
                Ok(part) => parts.push(part),
                Err(e) if first_error.is_none() => {
                    // Siblings see the cancellation and exit early.
                    cancel.cancel();
                    first_error = Some(e);
                }
                Err(_) => {}
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    /// Best effort: failures are logged and never replace the original error.
    async fn abort(&self, key: &str, upload_id: &str) {
        match tokio::time::timeout(ABORT_TIMEOUT, self.store.abort_multipart(key, upload_id)).await
        {
            Ok(Ok(())) => info!(upload_id, "Aborted multipart session"),
            Ok(Err(e)) => warn!(upload_id, error = %e, "Failed to abort multipart session"),
            Err(_) => warn!(upload_id, "Timed out aborting multipart session"),
        }
    }
}

/// Upload one part with its own retry budget and per-attempt deadline.
async fn upload_part(
    ctx: Arc<PartContext>,
    semaphore: Arc<Semaphore>,
    spec: PartSpec,
) -> DepotResult<CompletedPart> {
    let _permit = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Err(DepotError::Cancelled),
        permit = semaphore.acquire_owned() => permit.map_err(|_| DepotError::Cancelled)?,
    };

    let data = read_range(&ctx.path, spec.offset, spec.len).await?;
    let mut tracker = RetryTracker::new(ctx.policy);

    loop {
        let attempt = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(DepotError::Cancelled),
            result = tokio::time::timeout(
                ctx.part_timeout,
                ctx.store.upload_part(&ctx.key, &ctx.upload_id, spec.part_number, data.clone()),
            ) => result,
        };

        let err = match attempt {
            Ok(Ok(part)) => {
                debug!(part = spec.part_number, bytes = spec.len, "Uploaded part");
                return Ok(part);
            }
            Ok(Err(e)) => DepotError::from(e),
            Err(_) => DepotError::Timeout(ctx.part_timeout),
        };

        match tracker.record_failure(err.to_string()) {
            RetryDecision::Retry { attempt, delay } => {
                warn!(
                    part = spec.part_number,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying part upload"
                );
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(DepotError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            RetryDecision::Exhausted { history } => {
                error!(
                    part = spec.part_number,
                    attempts = history.len(),
                    error = %err,
                    "Part upload failed permanently"
                );
                return Err(err);
            }
        }
    }
}

/// Positional read of `len` bytes at `offset`. Each part opens its own handle so
/// workers never share a cursor.
async fn read_range(path: &Path, offset: u64, len: u64) -> DepotResult<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}
