use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use common::storage::ContentHash;
use common::{DlqErrorCode, IngestionTask, LinkStatus, PoolStatus};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use depot_server::consumers::{DeliveryOutcome, IngestConsumer};
use depot_server::entity::namespace_link::ROOT_ID;
use depot_server::entity::{dead_letter_message, namespace_link};
use depot_server::ingest::{UploadMeta, UploadStatus};
use depot_server::transcode::{CompressOptions, MediaKind, Transcoder};
use depot_server::{DepotError, DepotResult};

use crate::common::{KIB, MIB, RecordingStore, TestEngine, payload};

fn consumer(engine: &TestEngine) -> IngestConsumer {
    IngestConsumer::new(Arc::clone(&engine.state.ingestor), None, "upload.process.dlq")
}

/// Stage `bytes` the way the foreground path would and describe it as a new upload.
async fn staged_task(engine: &TestEngine, user: &str, name: &str, bytes: &[u8]) -> IngestionTask {
    let staged = engine
        .dir
        .path()
        .join("staging")
        .join(format!("upload-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&staged, bytes).await.unwrap();
    IngestionTask {
        user_identity: user.to_string(),
        parent_id: ROOT_ID as i64,
        file_path: staged.display().to_string(),
        ext: common::ingest::extension_of(name),
        name: name.to_string(),
        size: bytes.len() as i64,
        is_existed: false,
        repository_identity: uuid::Uuid::new_v4().to_string(),
        hash: ContentHash::compute(bytes).to_hex(),
    }
}

async fn dead_letter_rows(engine: &TestEngine) -> Vec<dead_letter_message::Model> {
    dead_letter_message::Entity::find()
        .all(&engine.db)
        .await
        .unwrap()
}

mod deferred_upload {
    use super::*;

    #[tokio::test]
    async fn large_upload_is_queued_then_ingested_in_parts() {
        let engine = TestEngine::spawn_with(
            |config| {
                config.upload.part_size = 10 * MIB;
                config.upload.multipart_threshold = 100 * MIB;
                config.ingest.defer_threshold = 100 * MIB;
            },
            None,
        )
        .await;
        let size = 250 * MIB;
        let original = engine.sparse_input("movie.raw", size).await;

        let receipt = engine
            .state
            .ingestor
            .submit_upload(
                "alice",
                UploadMeta {
                    name: "movie.raw".into(),
                    parent_id: ROOT_ID,
                },
                &original,
                &engine.cancel,
            )
            .await
            .unwrap();

        assert_eq!(receipt.status, UploadStatus::Accepted);
        assert!(receipt.link.is_none());
        assert!(engine.pool_entries().await.is_empty());
        assert_eq!(RecordingStore::count(&engine.store.initiates), 0);

        let mut tasks = engine.publisher.take();
        assert_eq!(tasks.len(), 1);
        let task = tasks.remove(0);
        assert_eq!(task.repository_identity, receipt.content_ref);
        assert_eq!(task.size, size as i64);
        let staged = PathBuf::from(&task.file_path);
        assert_ne!(staged, original);
        assert!(staged.exists());

        let outcome = consumer(&engine)
            .handle("msg-1", serde_json::to_value(&task).unwrap(), &engine.cancel)
            .await;
        assert_eq!(outcome, DeliveryOutcome::Completed);

        let parts = engine.store.uploaded_parts();
        assert_eq!(parts.len(), 25);
        assert!(parts.iter().all(|&(_, len)| len as u64 == 10 * MIB));
        assert_eq!(RecordingStore::count(&engine.store.completes), 1);

        let pool = engine.pool_entries().await;
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].identity, receipt.content_ref);
        assert_eq!(pool[0].size, size as i64);
        assert_eq!(pool[0].status, PoolStatus::Active);

        let links = engine.links_with_status(LinkStatus::Active).await;
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].name, "movie.raw");

        assert!(!staged.exists(), "consumer removes the staged copy");
        assert!(original.exists(), "caller's file is left alone");
    }

    #[tokio::test]
    async fn known_content_task_only_writes_link_once() {
        let engine = TestEngine::spawn().await;
        let first = engine.upload_to_root("alice", "a.bin", &payload(1, 900)).await;

        let task = IngestionTask {
            user_identity: "bob".into(),
            parent_id: ROOT_ID as i64,
            file_path: engine.dir.path().join("staging/gone").display().to_string(),
            ext: ".bin".into(),
            name: "shared.bin".into(),
            size: 900,
            is_existed: true,
            repository_identity: first.content_ref.clone(),
            hash: ContentHash::compute(&payload(1, 900)).to_hex(),
        };
        let value = serde_json::to_value(&task).unwrap();
        let consumer = consumer(&engine);

        assert_eq!(
            consumer.handle("msg-2", value.clone(), &engine.cancel).await,
            DeliveryOutcome::Completed
        );
        assert_eq!(
            consumer.handle("msg-2", value, &engine.cancel).await,
            DeliveryOutcome::Completed
        );

        let bob_links = namespace_link::Entity::find()
            .filter(namespace_link::Column::UserIdentity.eq("bob"))
            .all(&engine.db)
            .await
            .unwrap();
        assert_eq!(bob_links.len(), 1);
        assert_eq!(bob_links[0].content_ref.as_deref(), Some(first.content_ref.as_str()));
        assert_eq!(RecordingStore::count(&engine.store.puts), 1);
    }

    #[tokio::test]
    async fn rerun_after_pool_insert_reuses_entry() {
        let engine = TestEngine::spawn().await;
        let task = staged_task(&engine, "alice", "a.bin", &payload(2, 700)).await;

        let first = engine
            .state
            .ingestor
            .run_pipeline(&task, &engine.cancel)
            .await
            .unwrap();
        assert!(first.uploaded);

        // Same task under another name, as if the link step had to be repeated.
        let mut again = task.clone();
        again.name = "b.bin".into();
        let second = engine
            .state
            .ingestor
            .run_pipeline(&again, &engine.cancel)
            .await
            .unwrap();

        assert!(!second.uploaded);
        assert_eq!(second.content_ref, first.content_ref);
        assert_eq!(engine.pool_entries().await.len(), 1);
        assert_eq!(RecordingStore::count(&engine.store.puts), 1);
    }

    #[tokio::test]
    async fn redelivered_task_completes_without_new_link() {
        let engine = TestEngine::spawn().await;
        let task = staged_task(&engine, "alice", "a.bin", &payload(5, 800)).await;
        let value = serde_json::to_value(&task).unwrap();
        let consumer = consumer(&engine);

        assert_eq!(
            consumer.handle("msg-3", value.clone(), &engine.cancel).await,
            DeliveryOutcome::Completed
        );
        assert_eq!(
            consumer.handle("msg-3", value, &engine.cancel).await,
            DeliveryOutcome::Completed
        );

        let links = engine.links_with_status(LinkStatus::Active).await;
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].content_ref.as_deref(), Some(task.repository_identity.as_str()));
        assert_eq!(engine.pool_entries().await.len(), 1);
        assert_eq!(RecordingStore::count(&engine.store.puts), 1);
        assert!(dead_letter_rows(&engine).await.is_empty());
    }

    #[tokio::test]
    async fn rerun_returns_the_existing_link() {
        let engine = TestEngine::spawn().await;
        let task = staged_task(&engine, "alice", "a.bin", &payload(6, 500)).await;
        let ingestor = &engine.state.ingestor;

        let first = ingestor.run_pipeline(&task, &engine.cancel).await.unwrap();
        let second = ingestor.run_pipeline(&task, &engine.cancel).await.unwrap();

        assert!(!second.uploaded);
        assert_eq!(
            second.link.map(|l| l.identity),
            first.link.map(|l| l.identity)
        );
    }

    #[tokio::test]
    async fn failed_relink_returns_content_to_the_bin() {
        let engine = TestEngine::spawn().await;
        let bytes = payload(7, 400);
        let receipt = engine.upload_to_root("alice", "a.bin", &bytes).await;
        engine.upload_to_root("bob", "taken.bin", &payload(8, 400)).await;
        let deleted = engine
            .state
            .lifecycle
            .delete("alice", &receipt.link.unwrap().identity)
            .await
            .unwrap();

        let task = IngestionTask {
            user_identity: "bob".into(),
            parent_id: ROOT_ID as i64,
            file_path: engine.dir.path().join("staging/gone").display().to_string(),
            ext: ".bin".into(),
            name: "taken.bin".into(),
            size: 400,
            is_existed: true,
            repository_identity: receipt.content_ref.clone(),
            hash: ContentHash::compute(&bytes).to_hex(),
        };
        let err = engine
            .state
            .ingestor
            .run_pipeline(&task, &engine.cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DepotError::NameConflict(_)));

        let entry = engine.pool_entry(&receipt.content_ref).await;
        assert_eq!(entry.status, PoolStatus::Deleted);
        assert_eq!(entry.expire_at, Some(deleted.expire_at));
    }
}

mod dead_letters {
    use super::*;

    #[tokio::test]
    async fn undecodable_payload_is_dead_lettered() {
        let engine = TestEngine::spawn().await;
        let staged = engine.dir.path().join("staging").join("poison");
        tokio::fs::write(&staged, b"junk").await.unwrap();

        let outcome = consumer(&engine)
            .handle(
                "msg-poison",
                json!({
                    "user_identity": "alice",
                    "file_path": staged.display().to_string(),
                    "size": "not a number",
                }),
                &engine.cancel,
            )
            .await;

        assert_eq!(
            outcome,
            DeliveryOutcome::DeadLettered(DlqErrorCode::DeserializationError)
        );
        let rows = dead_letter_rows(&engine).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message_id, "msg-poison");
        assert_eq!(rows[0].message_type, IngestionTask::MESSAGE_TYPE);
        assert_eq!(rows[0].error_code, "DESERIALIZATION_ERROR");
        assert_eq!(rows[0].user_identity.as_deref(), Some("alice"));
        assert_eq!(rows[0].retry_count, 0);
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn exhausted_retries_are_dead_lettered() {
        let engine = TestEngine::spawn().await;
        engine.store.fail_puts(true);
        let task = staged_task(&engine, "alice", "a.bin", &payload(3, 600)).await;
        let staged = PathBuf::from(&task.file_path);

        let outcome = consumer(&engine)
            .handle("msg-fail", serde_json::to_value(&task).unwrap(), &engine.cancel)
            .await;

        assert_eq!(
            outcome,
            DeliveryOutcome::DeadLettered(DlqErrorCode::MaxRetriesExceeded)
        );
        assert_eq!(RecordingStore::count(&engine.store.puts), 3);

        let rows = dead_letter_rows(&engine).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].error_code, "MAX_RETRIES_EXCEEDED");
        assert_eq!(rows[0].retry_count, 3);
        assert_eq!(rows[0].retry_history.as_array().map(Vec::len), Some(3));
        assert_eq!(rows[0].payload["repository_identity"], json!(task.repository_identity));

        assert!(engine.pool_entries().await.is_empty());
        assert!(engine.links_with_status(LinkStatus::Active).await.is_empty());
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn shutdown_leaves_task_for_redelivery() {
        let engine = TestEngine::spawn().await;
        let task = staged_task(&engine, "alice", "big.bin", &payload(4, (20 * KIB) as usize)).await;
        let staged = PathBuf::from(&task.file_path);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = consumer(&engine)
            .handle("msg-stop", serde_json::to_value(&task).unwrap(), &cancel)
            .await;

        assert_eq!(outcome, DeliveryOutcome::Interrupted);
        assert!(staged.exists());
        assert!(dead_letter_rows(&engine).await.is_empty());
        assert_eq!(RecordingStore::count(&engine.store.aborts), 1);
    }
}

/// Writes the first half of the input, standing in for a real encoder.
struct HalvingTranscoder;

#[async_trait]
impl Transcoder for HalvingTranscoder {
    async fn compress(
        &self,
        input: &Path,
        output: &Path,
        options: &CompressOptions,
    ) -> DepotResult<()> {
        assert_eq!(options.kind, MediaKind::Video);
        let data = tokio::fs::read(input).await?;
        tokio::fs::write(output, &data[..data.len() / 2]).await?;
        Ok(())
    }
}

struct BrokenTranscoder;

#[async_trait]
impl Transcoder for BrokenTranscoder {
    async fn compress(&self, _: &Path, _: &Path, _: &CompressOptions) -> DepotResult<()> {
        Err(DepotError::Transcode("encoder exited with status 1".into()))
    }
}

fn staging_leftovers(engine: &TestEngine) -> usize {
    std::fs::read_dir(engine.dir.path().join("staging"))
        .unwrap()
        .count()
}

mod transcoding {
    use super::*;

    async fn engine_with(transcoder: Arc<dyn Transcoder>) -> TestEngine {
        TestEngine::spawn_with(|config| config.transcode.enabled = true, Some(transcoder)).await
    }

    #[tokio::test]
    async fn video_is_compressed_but_keyed_by_original_hash() {
        let engine = engine_with(Arc::new(HalvingTranscoder)).await;
        let bytes = payload(5, 8000);

        let receipt = engine.upload_to_root("alice", "clip.mp4", &bytes).await;

        let entry = engine.pool_entry(&receipt.content_ref).await;
        assert_eq!(entry.size, 4000);
        assert_eq!(entry.hash, ContentHash::compute(&bytes).to_hex());
        assert_eq!(receipt.link.unwrap().size, 4000);
        assert_eq!(staging_leftovers(&engine), 0);

        // Same original bytes dedupe against the compressed entry.
        let again = engine.upload_to_root("bob", "clip.mp4", &bytes).await;
        assert_eq!(again.status, UploadStatus::Instant);
        assert_eq!(again.content_ref, receipt.content_ref);
    }

    #[tokio::test]
    async fn other_files_skip_the_transcoder() {
        let engine = engine_with(Arc::new(BrokenTranscoder)).await;
        let receipt = engine.upload_to_root("alice", "notes.txt", &payload(6, 100)).await;
        assert_eq!(receipt.status, UploadStatus::Uploaded);
    }

    #[tokio::test]
    async fn transcode_failure_uploads_nothing() {
        let engine = engine_with(Arc::new(BrokenTranscoder)).await;
        let err = engine
            .upload("alice", "photo.png", ROOT_ID, &payload(7, 100))
            .await
            .unwrap_err();

        assert!(matches!(err, DepotError::Transcode(_)));
        assert_eq!(RecordingStore::count(&engine.store.puts), 0);
        assert!(engine.pool_entries().await.is_empty());
        assert_eq!(staging_leftovers(&engine), 0);
    }
}
