use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

pub use common::config::MqAppConfig;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// `tracing` level filter. Default: "info".
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackendKind,
    /// Redis URL for the URL cache and its locks. Default: "redis://localhost:6379".
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".into()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::default(),
            redis_url: default_redis_url(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    #[default]
    S3,
    Filesystem,
}

/// Object storage settings. S3 fields are ignored by the filesystem backend and vice versa.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub path_style: bool,
    #[serde(default)]
    pub base_path: Option<PathBuf>,
    #[serde(default)]
    pub public_base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    /// Multipart part size in bytes. Default: 10 MiB.
    #[serde(default = "default_part_size")]
    pub part_size: u64,
    /// Files larger than this use multipart upload. Default: 100 MiB.
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: u64,
    /// Maximum parts in flight per upload. Default: 3.
    #[serde(default = "default_max_concurrent_parts")]
    pub max_concurrent_parts: usize,
    /// Attempts per part, including the first. Default: 3.
    #[serde(default = "default_part_attempts")]
    pub part_attempts: u32,
    /// Linear backoff base between part attempts. Default: 1000 ms.
    #[serde(default = "default_part_backoff_ms")]
    pub part_backoff_ms: u64,
    /// Deadline for one part attempt. Default: 180 s.
    #[serde(default = "default_part_timeout_secs")]
    pub part_timeout_secs: u64,
    #[serde(default = "default_min_session_timeout_secs")]
    pub min_session_timeout_secs: u64,
    #[serde(default = "default_max_session_timeout_secs")]
    pub max_session_timeout_secs: u64,
    /// Session deadline budget per MiB of payload. Default: 2 s.
    #[serde(default = "default_session_secs_per_mib")]
    pub session_secs_per_mib: u64,
    /// Where uploads and transcoder output are staged. Default: system temp dir.
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
}

fn default_part_size() -> u64 {
    10 * MIB
}
fn default_multipart_threshold() -> u64 {
    100 * MIB
}
fn default_max_concurrent_parts() -> usize {
    3
}
fn default_part_attempts() -> u32 {
    3
}
fn default_part_backoff_ms() -> u64 {
    1000
}
fn default_part_timeout_secs() -> u64 {
    180
}
fn default_min_session_timeout_secs() -> u64 {
    300
}
fn default_max_session_timeout_secs() -> u64 {
    1800
}
fn default_session_secs_per_mib() -> u64 {
    2
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: default_part_size(),
            multipart_threshold: default_multipart_threshold(),
            max_concurrent_parts: default_max_concurrent_parts(),
            part_attempts: default_part_attempts(),
            part_backoff_ms: default_part_backoff_ms(),
            part_timeout_secs: default_part_timeout_secs(),
            min_session_timeout_secs: default_min_session_timeout_secs(),
            max_session_timeout_secs: default_max_session_timeout_secs(),
            session_secs_per_mib: default_session_secs_per_mib(),
            staging_dir: None,
        }
    }
}

impl UploadConfig {
    /// Overall multipart deadline: `secs_per_mib * size`, clamped to the configured bounds.
    pub fn session_timeout(&self, size: u64) -> Duration {
        let mib = size.div_ceil(MIB);
        let secs = mib
            .saturating_mul(self.session_secs_per_mib)
            .clamp(self.min_session_timeout_secs, self.max_session_timeout_secs);
        Duration::from_secs(secs)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Uploads larger than this are handed to the queue. Default: 100 MiB.
    #[serde(default = "default_defer_threshold")]
    pub defer_threshold: u64,
    /// Pipeline attempts per queued task. Default: 3.
    #[serde(default = "default_ingest_max_attempts")]
    pub max_attempts: u32,
    /// Fixed delay between attempts. Default: 2000 ms.
    #[serde(default = "default_ingest_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_defer_threshold() -> u64 {
    100 * MIB
}
fn default_ingest_max_attempts() -> u32 {
    3
}
fn default_ingest_retry_delay_ms() -> u64 {
    2000
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            defer_threshold: default_defer_threshold(),
            max_attempts: default_ingest_max_attempts(),
            retry_delay_ms: default_ingest_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TranscodeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: String,
    #[serde(default = "default_video_crf")]
    pub video_crf: u8,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
    #[serde(default = "default_image_max_width")]
    pub image_max_width: u32,
    #[serde(default = "default_image_max_height")]
    pub image_max_height: u32,
    /// JPEG-style quality, 1-100. Default: 85.
    #[serde(default = "default_image_quality")]
    pub image_quality: u8,
}

fn default_true() -> bool {
    true
}
fn default_ffmpeg_bin() -> String {
    "ffmpeg".into()
}
fn default_video_crf() -> u8 {
    23
}
fn default_audio_bitrate() -> String {
    "128k".into()
}
fn default_image_max_width() -> u32 {
    1920
}
fn default_image_max_height() -> u32 {
    1080
}
fn default_image_quality() -> u8 {
    85
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            ffmpeg_bin: default_ffmpeg_bin(),
            video_crf: default_video_crf(),
            audio_bitrate: default_audio_bitrate(),
            image_max_width: default_image_max_width(),
            image_max_height: default_image_max_height(),
            image_quality: default_image_quality(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecycleConfig {
    /// How long deleted entries stay restorable. Default: 30 days.
    #[serde(default = "default_recycle_ttl_secs")]
    pub ttl_secs: u64,
    /// Sweeper tick. Default: 1 hour.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
}

fn default_recycle_ttl_secs() -> u64 {
    30 * 24 * 3600
}
fn default_scan_interval_secs() -> u64 {
    3600
}

impl Default for RecycleConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_recycle_ttl_secs(),
            scan_interval_secs: default_scan_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    #[serde(default = "default_expected_items")]
    pub expected_items: u64,
    #[serde(default = "default_false_positive_rate")]
    pub false_positive_rate: f64,
    #[serde(default = "default_persist_interval_secs")]
    pub persist_interval_secs: u64,
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("./bloom_filter.data")
}
fn default_expected_items() -> u64 {
    10_000
}
fn default_false_positive_rate() -> f64 {
    0.01
}
fn default_persist_interval_secs() -> u64 {
    300
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            expected_items: default_expected_items(),
            false_positive_rate: default_false_positive_rate(),
            persist_interval_secs: default_persist_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UrlConfig {
    #[serde(default = "default_expires_secs")]
    pub default_expires_secs: u64,
    #[serde(default = "default_max_expires_secs")]
    pub max_expires_secs: u64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
}

fn default_expires_secs() -> u64 {
    3600
}
fn default_max_expires_secs() -> u64 {
    7 * 24 * 3600
}
fn default_lock_ttl_secs() -> u64 {
    10
}
fn default_lock_wait_ms() -> u64 {
    120
}

impl Default for UrlConfig {
    fn default() -> Self {
        Self {
            default_expires_secs: default_expires_secs(),
            max_expires_secs: default_max_expires_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            lock_wait_ms: default_lock_wait_ms(),
        }
    }
}

impl UrlConfig {
    /// Requested TTL in seconds; zero or negative selects the default, anything
    /// beyond the maximum is capped.
    pub fn normalize_expires(&self, requested_secs: i64) -> Duration {
        let secs = if requested_secs <= 0 {
            self.default_expires_secs
        } else {
            (requested_secs as u64).min(self.max_expires_secs)
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub mq: MqAppConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub transcode: TranscodeConfig,
    #[serde(default)]
    pub recycle: RecycleConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub urls: UrlConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("DEPOT_CONFIG").unwrap_or_else(|_| "config/config".to_string());

        let s = Config::builder()
            .set_default("database.max_connections", 20_i64)?
            .set_default("log.level", "info")?
            .set_default("mq.url", "redis://localhost:6379")?
            .set_default("mq.pool_size", 5_i64)?
            // Load from config/config.toml
            .add_source(File::with_name(&config_path).required(false))
            // Override from environment (e.g., DEPOT__STORAGE__BUCKET)
            .add_source(Environment::with_prefix("DEPOT").separator("__"))
            .build()?;

        let config: Self = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Message(msg.to_string()));

        if self.upload.part_size == 0 {
            return fail("upload.part_size must be greater than 0");
        }
        if self.upload.max_concurrent_parts == 0 {
            return fail("upload.max_concurrent_parts must be at least 1");
        }
        if self.upload.min_session_timeout_secs > self.upload.max_session_timeout_secs {
            return fail("upload.min_session_timeout_secs exceeds max_session_timeout_secs");
        }
        let p = self.filter.false_positive_rate;
        if !(p > 0.0 && p < 1.0) {
            return fail("filter.false_positive_rate must be in (0, 1)");
        }
        if self.filter.expected_items == 0 {
            return fail("filter.expected_items must be greater than 0");
        }
        if self.storage.backend == StorageBackendKind::S3 && self.storage.bucket.is_empty() {
            return fail("storage.bucket is required for the s3 backend");
        }
        if self.storage.backend == StorageBackendKind::Filesystem
            && self.storage.base_path.is_none()
        {
            return fail("storage.base_path is required for the filesystem backend");
        }
        Ok(())
    }
}
