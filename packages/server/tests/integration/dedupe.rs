use common::storage::ContentHash;
use common::{LinkStatus, PoolStatus};

use depot_server::DepotError;
use depot_server::entity::namespace_link::ROOT_ID;
use depot_server::filter::ExistenceFilter;
use depot_server::ingest::UploadStatus;

use crate::common::{RecordingStore, TestEngine, payload};

mod instant_upload {
    use super::*;

    #[tokio::test]
    async fn identical_content_is_stored_once() {
        let engine = TestEngine::spawn().await;
        let bytes = payload(1, 3000);

        let first = engine.upload_to_root("alice", "notes.txt", &bytes).await;
        let second = engine.upload_to_root("bob", "copy.txt", &bytes).await;

        assert_eq!(first.status, UploadStatus::Uploaded);
        assert_eq!(second.status, UploadStatus::Instant);
        assert_eq!(first.content_ref, second.content_ref);

        let pool = engine.pool_entries().await;
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].size, 3000);
        assert_eq!(pool[0].hash, ContentHash::compute(&bytes).to_hex());

        assert_eq!(RecordingStore::count(&engine.store.puts), 1);
        assert_eq!(engine.object_count(), 1);

        let links = engine.links_with_status(LinkStatus::Active).await;
        assert_eq!(links.len(), 2);
        assert!(
            links
                .iter()
                .all(|l| l.content_ref.as_deref() == Some(first.content_ref.as_str()))
        );
    }

    #[tokio::test]
    async fn link_records_name_extension_and_size() {
        let engine = TestEngine::spawn().await;
        let receipt = engine
            .upload_to_root("alice", "  Report.PDF ", &payload(2, 512))
            .await;

        let link = receipt.link.expect("Link should be created");
        assert_eq!(link.name, "Report.PDF");
        assert_eq!(link.ext, ".pdf");
        assert_eq!(link.size, 512);
        assert_eq!(link.parent_id, ROOT_ID);
        assert_eq!(link.status, LinkStatus::Active);
    }

    #[tokio::test]
    async fn reuse_revives_soft_deleted_content() {
        let engine = TestEngine::spawn().await;
        let bytes = payload(3, 800);

        let receipt = engine.upload_to_root("alice", "a.bin", &bytes).await;
        let link = receipt.link.unwrap();
        engine.state.lifecycle.delete("alice", &link.identity).await.unwrap();
        assert_eq!(
            engine.pool_entry(&receipt.content_ref).await.status,
            PoolStatus::Deleted
        );

        let again = engine.upload_to_root("bob", "b.bin", &bytes).await;
        assert_eq!(again.status, UploadStatus::Instant);
        assert_eq!(again.content_ref, receipt.content_ref);

        let entry = engine.pool_entry(&receipt.content_ref).await;
        assert_eq!(entry.status, PoolStatus::Active);
        assert!(entry.expire_at.is_none());
        assert_eq!(RecordingStore::count(&engine.store.puts), 1);
    }

    #[tokio::test]
    async fn concurrent_uploads_of_same_content_share_one_entry() {
        let engine = TestEngine::spawn().await;
        let bytes = payload(4, 5000);

        let (a, b) = tokio::join!(
            engine.upload("alice", "same.dat", ROOT_ID, &bytes),
            engine.upload("bob", "same.dat", ROOT_ID, &bytes),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.content_ref, b.content_ref);
        assert_eq!(engine.pool_entries().await.len(), 1);
        // A losing writer removes the object it uploaded.
        assert_eq!(engine.object_count(), 1);
        assert_eq!(engine.links_with_status(LinkStatus::Active).await.len(), 2);
    }
}

mod naming {
    use super::*;

    #[tokio::test]
    async fn duplicate_name_in_folder_is_rejected_before_upload() {
        let engine = TestEngine::spawn().await;
        engine.upload_to_root("alice", "a.txt", &payload(5, 100)).await;

        let err = engine
            .upload("alice", "a.txt", ROOT_ID, &payload(6, 100))
            .await
            .unwrap_err();
        assert!(matches!(err, DepotError::NameConflict(ref n) if n == "a.txt"));

        assert_eq!(RecordingStore::count(&engine.store.puts), 1);
        assert_eq!(engine.pool_entries().await.len(), 1);
    }

    #[tokio::test]
    async fn same_name_in_other_folder_or_for_other_user_is_fine() {
        let engine = TestEngine::spawn().await;
        let folder = depot_server::links::LinkRegistry::new(&engine.db)
            .create_folder("alice", ROOT_ID, "docs")
            .await
            .unwrap();

        engine.upload_to_root("alice", "a.txt", &payload(7, 10)).await;
        engine
            .upload("alice", "a.txt", folder.id, &payload(7, 10))
            .await
            .unwrap();
        engine.upload_to_root("bob", "a.txt", &payload(7, 10)).await;

        assert_eq!(engine.links_with_status(LinkStatus::Active).await.len(), 4);
    }

    #[tokio::test]
    async fn deleted_name_can_be_reused() {
        let engine = TestEngine::spawn().await;
        let first = engine.upload_to_root("alice", "a.txt", &payload(8, 10)).await;
        engine
            .state
            .lifecycle
            .delete("alice", &first.link.unwrap().identity)
            .await
            .unwrap();

        let second = engine.upload("alice", "a.txt", ROOT_ID, &payload(9, 10)).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn blank_name_is_rejected() {
        let engine = TestEngine::spawn().await;
        let err = engine
            .upload("alice", "   ", ROOT_ID, &payload(10, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, DepotError::Validation(_)));
    }
}

mod existence_filter {
    use super::*;

    #[tokio::test]
    async fn uploaded_hashes_are_always_reported() {
        let engine = TestEngine::spawn().await;
        let mut hashes = Vec::new();
        for seed in 0..5u8 {
            let bytes = payload(seed + 20, 200 + seed as usize);
            engine
                .upload_to_root("alice", &format!("f{seed}.bin"), &bytes)
                .await;
            hashes.push(ContentHash::compute(&bytes));
        }

        for hash in &hashes {
            assert!(engine.state.filter.might_contain(hash));
        }
    }

    #[tokio::test]
    async fn snapshot_survives_restart() {
        let engine = TestEngine::spawn().await;
        let bytes = payload(30, 1234);
        engine.upload_to_root("alice", "keep.bin", &bytes).await;

        assert!(engine.state.filter.persist().await.unwrap());
        // Nothing changed since.
        assert!(!engine.state.filter.persist().await.unwrap());

        let reloaded = ExistenceFilter::load_or_rebuild(&engine.state.config.filter, &engine.db)
            .await
            .unwrap();
        assert!(reloaded.might_contain(&ContentHash::compute(&bytes)));
    }

    #[tokio::test]
    async fn missing_snapshot_is_rebuilt_from_pool() {
        let engine = TestEngine::spawn().await;
        let bytes = payload(31, 4321);
        engine.upload_to_root("alice", "a.bin", &bytes).await;

        let mut config = engine.state.config.filter.clone();
        config.snapshot_path = engine.dir.path().join("fresh.data");
        let rebuilt = ExistenceFilter::load_or_rebuild(&config, &engine.db)
            .await
            .unwrap();

        assert!(rebuilt.might_contain(&ContentHash::compute(&bytes)));
        assert!(config.snapshot_path.exists());
    }
}
