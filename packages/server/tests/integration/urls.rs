use std::sync::Arc;

use chrono::{Duration, Utc};
use sea_orm::{ActiveModelTrait, Set};
use tokio::task::JoinSet;

use depot_server::DepotError;
use depot_server::entity::share_record;

use crate::common::{RecordingStore, TestEngine, payload};

async fn create_share(
    engine: &TestEngine,
    content_ref: &str,
    expired_time: i64,
    age: Duration,
) -> String {
    let identity = uuid::Uuid::new_v4().to_string();
    share_record::ActiveModel {
        identity: Set(identity.clone()),
        user_identity: Set("alice".into()),
        content_ref: Set(content_ref.to_string()),
        expired_time: Set(expired_time),
        created_at: Set(Utc::now() - age),
        ..Default::default()
    }
    .insert(&engine.db)
    .await
    .expect("Failed to create share");
    identity
}

mod download {
    use super::*;

    #[tokio::test]
    async fn owner_gets_a_signed_url() {
        let engine = TestEngine::spawn().await;
        let receipt = engine.upload_to_root("alice", "a.pdf", &payload(1, 100)).await;
        let object_key = engine.pool_entry(&receipt.content_ref).await.object_key;

        let url = engine
            .state
            .urls
            .get_download_url("alice", &receipt.content_ref, 0)
            .await
            .unwrap();

        assert_eq!(url.expires_secs, 3600);
        assert!(url.url.starts_with(&format!("http://files.test/{object_key}?expires=")));
    }

    #[tokio::test]
    async fn other_users_and_deleted_links_are_refused() {
        let engine = TestEngine::spawn().await;
        let receipt = engine.upload_to_root("alice", "a.pdf", &payload(2, 100)).await;
        let urls = &engine.state.urls;

        let err = urls
            .get_download_url("bob", &receipt.content_ref, 60)
            .await
            .unwrap_err();
        assert!(matches!(err, DepotError::NotFound(_)));

        engine
            .state
            .lifecycle
            .delete("alice", &receipt.link.unwrap().identity)
            .await
            .unwrap();
        let err = urls
            .get_download_url("alice", &receipt.content_ref, 60)
            .await
            .unwrap_err();
        assert!(matches!(err, DepotError::NotFound(_)));
        assert_eq!(RecordingStore::count(&engine.store.presigns), 0);
    }

    #[tokio::test]
    async fn repeated_requests_reuse_cached_url() {
        let engine = TestEngine::spawn().await;
        let receipt = engine.upload_to_root("alice", "a.pdf", &payload(3, 100)).await;
        let urls = &engine.state.urls;

        let first = urls.get_download_url("alice", &receipt.content_ref, 600).await.unwrap();
        let second = urls.get_download_url("alice", &receipt.content_ref, 600).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(RecordingStore::count(&engine.store.presigns), 1);

        // A different lifetime is a different cache entry.
        let capped = urls
            .get_download_url("alice", &receipt.content_ref, 30 * 24 * 3600)
            .await
            .unwrap();
        assert_eq!(capped.expires_secs, 7 * 24 * 3600);
        assert_eq!(RecordingStore::count(&engine.store.presigns), 2);
    }

    #[tokio::test]
    async fn concurrent_requests_presign_once() {
        let engine = TestEngine::spawn().await;
        let receipt = engine.upload_to_root("alice", "a.pdf", &payload(4, 100)).await;

        let mut tasks = JoinSet::new();
        for _ in 0..10 {
            let urls = Arc::clone(&engine.state.urls);
            let content_ref = receipt.content_ref.clone();
            tasks.spawn(async move { urls.get_download_url("alice", &content_ref, 300).await });
        }

        let mut seen = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            seen.push(joined.unwrap().unwrap().url);
        }
        seen.dedup();
        assert_eq!(seen.len(), 1);
        assert_eq!(RecordingStore::count(&engine.store.presigns), 1);
    }
}

mod share {
    use super::*;

    #[tokio::test]
    async fn live_share_resolves() {
        let engine = TestEngine::spawn().await;
        let receipt = engine.upload_to_root("alice", "a.pdf", &payload(5, 100)).await;
        let share = create_share(&engine, &receipt.content_ref, 3600, Duration::zero()).await;

        let url = engine.state.urls.get_share_url(&share, 120).await.unwrap();
        assert_eq!(url.expires_secs, 120);
    }

    #[tokio::test]
    async fn share_without_lifetime_never_expires() {
        let engine = TestEngine::spawn().await;
        let receipt = engine.upload_to_root("alice", "a.pdf", &payload(6, 100)).await;
        let share = create_share(&engine, &receipt.content_ref, 0, Duration::days(400)).await;

        assert!(engine.state.urls.get_share_url(&share, 0).await.is_ok());
    }

    #[tokio::test]
    async fn expired_or_unknown_share_is_refused() {
        let engine = TestEngine::spawn().await;
        let receipt = engine.upload_to_root("alice", "a.pdf", &payload(7, 100)).await;
        let share = create_share(&engine, &receipt.content_ref, 60, Duration::seconds(120)).await;

        let err = engine.state.urls.get_share_url(&share, 60).await.unwrap_err();
        assert!(matches!(err, DepotError::NotFound(_)));

        let err = engine.state.urls.get_share_url("no-such-share", 60).await.unwrap_err();
        assert!(matches!(err, DepotError::NotFound(_)));
    }

    #[tokio::test]
    async fn share_outlives_owner_deleting_the_file() {
        let engine = TestEngine::spawn().await;
        let receipt = engine.upload_to_root("alice", "a.pdf", &payload(8, 100)).await;
        let share = create_share(&engine, &receipt.content_ref, 3600, Duration::zero()).await;
        engine
            .state
            .lifecycle
            .delete("alice", &receipt.link.unwrap().identity)
            .await
            .unwrap();

        assert!(engine.state.urls.get_share_url(&share, 60).await.is_ok());
    }
}
