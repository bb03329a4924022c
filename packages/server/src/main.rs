use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use common::storage::ObjectStore;
use common::storage::filesystem::FilesystemObjectStore;
use common::storage::s3::{S3ObjectStore, S3Settings};
use depot_server::cache::{CacheBackend, MemoryCache, RedisCache};
use depot_server::config::{AppConfig, CacheBackendKind, StorageBackendKind, StorageConfig};
use depot_server::consumers::{IngestConsumer, consume_ingestion_tasks};
use depot_server::database::init_db;
use depot_server::filter::ExistenceFilter;
use depot_server::ingest::MqTaskPublisher;
use depot_server::seed::ensure_indexes;
use depot_server::transcode::{FfmpegTranscoder, Transcoder};
use depot_server::{AppState, Collaborators};
use mq::{MqConfig, init_mq};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load config")?;

    let level = LevelFilter::from_str(&config.log.level).unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .init();

    let db = init_db(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to database")?;
    ensure_indexes(&db)
        .await
        .context("Failed to create required indexes")?;
    info!("Database ready");

    let store = build_store(&config.storage).await?;

    let filter = Arc::new(
        ExistenceFilter::load_or_rebuild(&config.filter, &db)
            .await
            .context("Failed to initialize existence filter")?,
    );

    let cache: Arc<dyn CacheBackend> = match config.cache.backend {
        CacheBackendKind::Redis => Arc::new(
            RedisCache::connect(&config.cache.redis_url)
                .await
                .context("Failed to connect to redis cache")?,
        ),
        CacheBackendKind::Memory => Arc::new(MemoryCache::new()),
    };

    let mq = Arc::new(
        init_mq(MqConfig::from(&config.mq))
            .await
            .context("Failed to initialize MQ")?,
    );
    info!(
        queue_name = %config.mq.queue_name,
        dlq_queue_name = %config.mq.dlq_queue_name,
        "MQ connected"
    );

    let transcoder: Option<Arc<dyn Transcoder>> = config
        .transcode
        .enabled
        .then(|| Arc::new(FfmpegTranscoder::new(&config.transcode.ffmpeg_bin)) as Arc<dyn Transcoder>);

    let queue_name = config.mq.queue_name.clone();
    let dlq_queue_name = config.mq.dlq_queue_name.clone();
    let persist_every = Duration::from_secs(config.filter.persist_interval_secs.max(1));

    let state = AppState::new(
        config,
        Collaborators {
            db,
            store,
            filter: Arc::clone(&filter),
            cache,
            publisher: Arc::new(MqTaskPublisher::new(Arc::clone(&mq), queue_name.clone())),
            transcoder,
        },
    );

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    tasks.spawn(Arc::clone(&state.sweeper).run(shutdown.child_token()));
    tasks.spawn(Arc::clone(&filter).run_persister(persist_every, shutdown.child_token()));

    let consumer = Arc::new(IngestConsumer::new(
        Arc::clone(&state.ingestor),
        Some(Arc::clone(&mq)),
        dlq_queue_name,
    ));
    let consumer_cancel = shutdown.child_token();
    tasks.spawn(async move {
        let stop = consumer_cancel.clone();
        tokio::select! {
            _ = consume_ingestion_tasks(consumer, mq, queue_name, consumer_cancel) => {}
            _ = stop.cancelled() => info!("Ingestion consumer stopped"),
        }
    });

    info!("depot running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    shutdown.cancel();

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Background task panicked");
        }
    }

    info!("depot stopped");
    Ok(())
}

async fn build_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config.backend {
        StorageBackendKind::S3 => {
            let settings = S3Settings {
                bucket: config.bucket.clone(),
                region: config.region.clone(),
                endpoint: config.endpoint.clone(),
                access_key: config.access_key.clone(),
                secret_key: config.secret_key.clone(),
                path_style: config.path_style,
            };
            info!(bucket = %settings.bucket, "Using S3 object storage");
            Arc::new(S3ObjectStore::new(&settings).context("Failed to configure S3 storage")?)
        }
        StorageBackendKind::Filesystem => {
            let base = config
                .base_path
                .clone()
                .context("storage.base_path is required for the filesystem backend")?;
            info!(path = %base.display(), "Using filesystem object storage");
            Arc::new(
                FilesystemObjectStore::new(base, config.public_base_url.clone())
                    .await
                    .context("Failed to prepare storage directory")?,
            )
        }
    };
    Ok(store)
}
