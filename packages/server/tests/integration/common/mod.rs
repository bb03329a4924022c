use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::storage::filesystem::FilesystemObjectStore;
use common::storage::{CompletedPart, ObjectStore, StorageError};
use common::{IngestionTask, LinkStatus};
use sea_orm::{
    ColumnTrait, ConnectOptions, Database, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use depot_server::cache::MemoryCache;
use depot_server::config::{
    AppConfig, CacheBackendKind, CacheConfig, DatabaseConfig, FilterConfig, IngestConfig,
    LogConfig, MqAppConfig, RecycleConfig, StorageBackendKind, StorageConfig, TranscodeConfig,
    UploadConfig, UrlConfig,
};
use depot_server::entity::namespace_link::ROOT_ID;
use depot_server::entity::{content_pool, event_log, namespace_link};
use depot_server::filter::ExistenceFilter;
use depot_server::ingest::{TaskPublisher, UploadMeta, UploadReceipt};
use depot_server::transcode::Transcoder;
use depot_server::{AppState, Collaborators, DepotResult};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;

/// Object store wrapper that counts calls and injects failures.
pub struct RecordingStore {
    inner: FilesystemObjectStore,
    pub puts: AtomicUsize,
    pub initiates: AtomicUsize,
    pub completes: AtomicUsize,
    pub aborts: AtomicUsize,
    pub deletes: AtomicUsize,
    pub presigns: AtomicUsize,
    /// Successful part uploads as `(part_number, bytes)`.
    pub parts: Mutex<Vec<(u32, usize)>>,
    /// Remaining injected failures per part number.
    part_failures: Mutex<HashMap<u32, u32>>,
    fail_puts: AtomicBool,
    fail_deletes: AtomicBool,
}

impl RecordingStore {
    async fn new(base_path: PathBuf) -> Self {
        Self {
            inner: FilesystemObjectStore::new(base_path, "http://files.test")
                .await
                .expect("Failed to create object store"),
            puts: AtomicUsize::new(0),
            initiates: AtomicUsize::new(0),
            completes: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            presigns: AtomicUsize::new(0),
            parts: Mutex::new(Vec::new()),
            part_failures: Mutex::new(HashMap::new()),
            fail_puts: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    /// Make the next `times` attempts of `part_number` fail.
    pub fn fail_part(&self, part_number: u32, times: u32) {
        self.part_failures
            .lock()
            .unwrap()
            .insert(part_number, times);
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn uploaded_parts(&self) -> Vec<(u32, usize)> {
        let mut parts = self.parts.lock().unwrap().clone();
        parts.sort();
        parts
    }
}

#[async_trait]
impl ObjectStore for RecordingStore {
    async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected put failure".into()));
        }
        self.inner.put_object(key, data, content_type).await
    }

    async fn initiate_multipart(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<String, StorageError> {
        self.initiates.fetch_add(1, Ordering::SeqCst);
        self.inner.initiate_multipart(key, content_type).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<CompletedPart, StorageError> {
        {
            let mut failures = self.part_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&part_number)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(StorageError::Backend(format!(
                    "injected failure for part {part_number}"
                )));
            }
        }
        let len = data.len();
        let part = self
            .inner
            .upload_part(key, upload_id, part_number, data)
            .await?;
        self.parts.lock().unwrap().push((part_number, len));
        Ok(part)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError> {
        self.completes.fetch_add(1, Ordering::SeqCst);
        self.inner.complete_multipart(key, upload_id, parts).await
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StorageError> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.inner.abort_multipart(key, upload_id).await
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected delete failure".into()));
        }
        self.inner.delete_object(key).await
    }

    async fn presign_get(&self, key: &str, expires: Duration) -> Result<String, StorageError> {
        self.presigns.fetch_add(1, Ordering::SeqCst);
        self.inner.presign_get(key, expires).await
    }
}

/// Keeps published tasks in memory instead of sending them to a broker.
#[derive(Default)]
pub struct CapturingPublisher {
    tasks: Mutex<Vec<IngestionTask>>,
}

impl CapturingPublisher {
    pub fn take(&self) -> Vec<IngestionTask> {
        std::mem::take(&mut *self.tasks.lock().unwrap())
    }
}

#[async_trait]
impl TaskPublisher for CapturingPublisher {
    async fn publish(&self, task: &IngestionTask) -> DepotResult<()> {
        self.tasks.lock().unwrap().push(task.clone());
        Ok(())
    }
}

/// Test configuration: small parts, short delays, everything under `root`.
pub fn test_config(root: &Path) -> AppConfig {
    AppConfig {
        database: DatabaseConfig {
            url: "sqlite::memory:".into(),
            max_connections: 1,
        },
        log: LogConfig::default(),
        mq: MqAppConfig::default(),
        cache: CacheConfig {
            backend: CacheBackendKind::Memory,
            ..Default::default()
        },
        storage: StorageConfig {
            backend: StorageBackendKind::Filesystem,
            base_path: Some(root.join("objects")),
            public_base_url: "http://files.test".into(),
            ..Default::default()
        },
        upload: UploadConfig {
            part_size: 4 * KIB,
            multipart_threshold: 16 * KIB,
            part_backoff_ms: 5,
            part_timeout_secs: 10,
            staging_dir: Some(root.join("staging")),
            ..Default::default()
        },
        ingest: IngestConfig {
            defer_threshold: 64 * KIB,
            max_attempts: 3,
            retry_delay_ms: 5,
        },
        transcode: TranscodeConfig {
            enabled: false,
            ..Default::default()
        },
        recycle: RecycleConfig::default(),
        filter: FilterConfig {
            snapshot_path: root.join("bloom_filter.data"),
            ..Default::default()
        },
        urls: UrlConfig::default(),
    }
}

/// A fully wired engine over an in-memory SQLite database and a temp directory.
pub struct TestEngine {
    pub state: AppState,
    pub db: DatabaseConnection,
    pub store: Arc<RecordingStore>,
    pub publisher: Arc<CapturingPublisher>,
    pub cancel: CancellationToken,
    pub dir: TempDir,
}

impl TestEngine {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}, None).await
    }

    pub async fn spawn_with(
        tweak: impl FnOnce(&mut AppConfig),
        transcoder: Option<Arc<dyn Transcoder>>,
    ) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut config = test_config(dir.path());
        tweak(&mut config);
        config.validate().expect("Invalid test config");

        if let Some(staging) = &config.upload.staging_dir {
            tokio::fs::create_dir_all(staging).await.unwrap();
        }
        tokio::fs::create_dir_all(dir.path().join("input")).await.unwrap();

        let db = connect_db().await;
        let store = Arc::new(RecordingStore::new(dir.path().join("objects")).await);
        let publisher = Arc::new(CapturingPublisher::default());
        let filter = Arc::new(ExistenceFilter::new(&config.filter));

        let state = AppState::new(
            config,
            Collaborators {
                db: db.clone(),
                store: Arc::clone(&store) as Arc<dyn ObjectStore>,
                filter,
                cache: Arc::new(MemoryCache::new()),
                publisher: Arc::clone(&publisher) as Arc<dyn TaskPublisher>,
                transcoder,
            },
        );

        Self {
            state,
            db,
            store,
            publisher,
            cancel: CancellationToken::new(),
            dir,
        }
    }

    /// Write `bytes` to a fresh file under the input directory.
    pub async fn write_input(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self
            .dir
            .path()
            .join("input")
            .join(format!("{}-{name}", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, bytes).await.unwrap();
        path
    }

    /// A zero-filled sparse file of `size` bytes.
    pub async fn sparse_input(&self, name: &str, size: u64) -> PathBuf {
        let path = self.dir.path().join("input").join(name);
        let file = tokio::fs::File::create(&path).await.unwrap();
        file.set_len(size).await.unwrap();
        path
    }

    pub async fn upload(
        &self,
        user: &str,
        name: &str,
        parent_id: i32,
        bytes: &[u8],
    ) -> DepotResult<UploadReceipt> {
        let path = self.write_input(name, bytes).await;
        self.state
            .ingestor
            .submit_upload(
                user,
                UploadMeta {
                    name: name.to_string(),
                    parent_id,
                },
                &path,
                &self.cancel,
            )
            .await
    }

    pub async fn upload_to_root(&self, user: &str, name: &str, bytes: &[u8]) -> UploadReceipt {
        self.upload(user, name, ROOT_ID, bytes)
            .await
            .expect("Upload failed")
    }

    pub async fn pool_entries(&self) -> Vec<content_pool::Model> {
        content_pool::Entity::find()
            .order_by_asc(content_pool::Column::Id)
            .all(&self.db)
            .await
            .unwrap()
    }

    pub async fn pool_entry(&self, identity: &str) -> content_pool::Model {
        content_pool::Entity::find()
            .filter(content_pool::Column::Identity.eq(identity))
            .one(&self.db)
            .await
            .unwrap()
            .expect("Pool entry missing")
    }

    pub async fn link(&self, identity: &str) -> namespace_link::Model {
        namespace_link::Entity::find()
            .filter(namespace_link::Column::Identity.eq(identity))
            .one(&self.db)
            .await
            .unwrap()
            .expect("Link missing")
    }

    pub async fn links_with_status(&self, status: LinkStatus) -> Vec<namespace_link::Model> {
        namespace_link::Entity::find()
            .filter(namespace_link::Column::Status.eq(status))
            .order_by_asc(namespace_link::Column::Id)
            .all(&self.db)
            .await
            .unwrap()
    }

    pub async fn events(&self) -> Vec<event_log::Model> {
        event_log::Entity::find()
            .order_by_asc(event_log::Column::Id)
            .all(&self.db)
            .await
            .unwrap()
    }

    /// Whether the object behind `key` is present in the store directory.
    pub fn object_exists(&self, key: &str) -> bool {
        let shard: String = key.chars().take(2).collect();
        self.dir
            .path()
            .join("objects")
            .join(shard)
            .join(key)
            .exists()
    }

    /// Number of committed objects, ignoring temp and session directories.
    pub fn object_count(&self) -> usize {
        let root = self.dir.path().join("objects");
        let mut count = 0;
        for shard in std::fs::read_dir(&root).unwrap().flatten() {
            let name = shard.file_name();
            if name.to_string_lossy().starts_with('.') || !shard.path().is_dir() {
                continue;
            }
            count += std::fs::read_dir(shard.path()).unwrap().count();
        }
        count
    }
}

async fn connect_db() -> DatabaseConnection {
    // A single connection keeps every query on the same in-memory database.
    let mut opt = ConnectOptions::new("sqlite::memory:");
    opt.max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);
    let db = Database::connect(opt)
        .await
        .expect("Failed to open SQLite database");
    depot_server::database::sync_schema(&db)
        .await
        .expect("Failed to create schema");
    depot_server::seed::ensure_indexes(&db)
        .await
        .expect("Failed to create indexes");
    db
}

/// Deterministic pseudo-random bytes, distinct per `seed`.
pub fn payload(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32 * 7919) as u8)
        .collect()
}
