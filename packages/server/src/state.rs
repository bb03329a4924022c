use std::sync::Arc;

use common::storage::ObjectStore;
use sea_orm::DatabaseConnection;

use crate::cache::{CacheBackend, SignedUrlCache};
use crate::config::AppConfig;
use crate::filter::ExistenceFilter;
use crate::ingest::{Ingestor, TaskPublisher};
use crate::lifecycle::{Lifecycle, RecycleSweeper};
use crate::transcode::Transcoder;
use crate::uploader::ChunkedUploader;
use crate::urls::UrlService;

/// Infrastructure handles the engine is assembled from.
pub struct Collaborators {
    pub db: DatabaseConnection,
    pub store: Arc<dyn ObjectStore>,
    pub filter: Arc<ExistenceFilter>,
    pub cache: Arc<dyn CacheBackend>,
    pub publisher: Arc<dyn TaskPublisher>,
    pub transcoder: Option<Arc<dyn Transcoder>>,
}

/// The engine's services, wired once and shared by reference.
#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn ObjectStore>,
    pub filter: Arc<ExistenceFilter>,
    pub uploader: Arc<ChunkedUploader>,
    pub ingestor: Arc<Ingestor>,
    pub lifecycle: Arc<Lifecycle>,
    pub sweeper: Arc<RecycleSweeper>,
    pub urls: Arc<UrlService>,
}

impl AppState {
    pub fn new(config: AppConfig, parts: Collaborators) -> Self {
        let Collaborators {
            db,
            store,
            filter,
            cache,
            publisher,
            transcoder,
        } = parts;

        let uploader = Arc::new(ChunkedUploader::new(
            Arc::clone(&store),
            config.upload.clone(),
        ));
        let ingestor = Arc::new(Ingestor::new(
            db.clone(),
            Arc::clone(&filter),
            Arc::clone(&uploader),
            transcoder,
            publisher,
            config.transcode.clone(),
            config.ingest.clone(),
        ));
        let lifecycle = Arc::new(Lifecycle::new(db.clone(), config.recycle.clone()));
        let sweeper = Arc::new(RecycleSweeper::new(
            db.clone(),
            Arc::clone(&store),
            config.recycle.clone(),
        ));
        let url_cache = Arc::new(SignedUrlCache::new(cache, &config.urls));
        let urls = Arc::new(UrlService::new(
            db.clone(),
            Arc::clone(&store),
            url_cache,
            config.urls.clone(),
        ));

        Self {
            db,
            config: Arc::new(config),
            store,
            filter,
            uploader,
            ingestor,
            lifecycle,
            sweeper,
            urls,
        }
    }
}
