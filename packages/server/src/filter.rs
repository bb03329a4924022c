//! Probabilistic existence filter over content hashes.
//!
//! A Bloom filter answering "definitely not uploaded" or "maybe uploaded" before the
//! pool is consulted. It only ever gains bits, so a stale snapshot can cost a few
//! extra database lookups but never hides real content.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use common::PoolStatus;
use common::storage::ContentHash;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QuerySelect};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::FilterConfig;
use crate::entity::content_pool;
use crate::error::{DepotError, DepotResult};

const SNAPSHOT_VERSION: u32 = 1;

/// Bit array plus the parameters needed to interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Bloom {
    num_bits: u64,
    num_hashes: u32,
    words: Vec<u64>,
}

/// On-disk form: a header and the raw words, bincode-encoded.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    bloom: Bloom,
}

impl Bloom {
    /// Size the filter for `expected_items` at false-positive rate `fp_rate`.
    fn with_rate(expected_items: u64, fp_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-(n * fp_rate.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().max(1.0) as u32;
        Self {
            num_bits,
            num_hashes,
            words: vec![0; num_bits.div_ceil(64) as usize],
        }
    }

    /// Kirsch-Mitzenmacher double hashing. The key is already a SHA-256 digest,
    /// so its first two 64-bit words serve as independent base hashes.
    fn positions(&self, hash: &ContentHash) -> impl Iterator<Item = u64> + '_ {
        let bytes = hash.as_bytes();
        let h1 = u64::from_le_bytes(bytes[0..8].try_into().unwrap_or_default());
        let h2 = u64::from_le_bytes(bytes[8..16].try_into().unwrap_or_default()) | 1;
        (0..self.num_hashes as u64)
            .map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits)
    }

    fn insert(&mut self, hash: &ContentHash) -> bool {
        let positions: Vec<u64> = self.positions(hash).collect();
        let mut changed = false;
        for bit in positions {
            let (word, mask) = ((bit / 64) as usize, 1u64 << (bit % 64));
            if self.words[word] & mask == 0 {
                self.words[word] |= mask;
                changed = true;
            }
        }
        changed
    }

    fn contains(&self, hash: &ContentHash) -> bool {
        self.positions(hash)
            .all(|bit| self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0)
    }

    fn is_consistent(&self) -> bool {
        self.num_bits > 0
            && self.num_hashes > 0
            && self.words.len() as u64 == self.num_bits.div_ceil(64)
    }
}

/// Shared, injectable existence filter. Many concurrent readers, one writer at a time.
pub struct ExistenceFilter {
    bloom: RwLock<Bloom>,
    snapshot_path: PathBuf,
    /// Bits changed since the last successful persist.
    dirty: AtomicBool,
}

impl ExistenceFilter {
    /// An empty filter sized from the configuration.
    pub fn new(config: &FilterConfig) -> Self {
        Self::from_bloom(
            Bloom::with_rate(config.expected_items, config.false_positive_rate),
            config.snapshot_path.clone(),
        )
    }

    fn from_bloom(bloom: Bloom, snapshot_path: PathBuf) -> Self {
        Self {
            bloom: RwLock::new(bloom),
            snapshot_path,
            dirty: AtomicBool::new(false),
        }
    }

    /// Load the snapshot if there is a readable one, otherwise rebuild from every
    /// non-purged pool hash and save the result.
    pub async fn load_or_rebuild(
        config: &FilterConfig,
        db: &DatabaseConnection,
    ) -> DepotResult<Self> {
        match read_snapshot(&config.snapshot_path).await {
            Ok(Some(bloom)) => {
                info!(
                    path = %config.snapshot_path.display(),
                    num_bits = bloom.num_bits,
                    num_hashes = bloom.num_hashes,
                    "Loaded existence filter snapshot"
                );
                return Ok(Self::from_bloom(bloom, config.snapshot_path.clone()));
            }
            Ok(None) => {}
            Err(e) => warn!(
                path = %config.snapshot_path.display(),
                error = %e,
                "Unreadable existence filter snapshot, rebuilding"
            ),
        }

        let filter = Self::new(config);
        let count = filter.rebuild_from_pool(db).await?;
        info!(count, "Rebuilt existence filter from content pool");
        if let Err(e) = filter.persist().await {
            warn!(error = %e, "Failed to save rebuilt existence filter");
        }
        Ok(filter)
    }

    /// Add every live pool hash. Returns the number of hashes scanned.
    pub async fn rebuild_from_pool(&self, db: &DatabaseConnection) -> DepotResult<u64> {
        let hashes: Vec<String> = content_pool::Entity::find()
            .select_only()
            .column(content_pool::Column::Hash)
            .filter(content_pool::Column::Status.ne(PoolStatus::Purged))
            .into_tuple()
            .all(db)
            .await?;

        let mut count = 0;
        for hex in hashes {
            match ContentHash::from_hex(&hex) {
                Ok(hash) => {
                    self.add(&hash);
                    count += 1;
                }
                Err(e) => warn!(hash = %hex, error = %e, "Skipping malformed pool hash"),
            }
        }
        Ok(count)
    }

    /// False means the content was never added. True means it may have been.
    pub fn might_contain(&self, hash: &ContentHash) -> bool {
        self.read().contains(hash)
    }

    /// Record a hash. Idempotent.
    pub fn add(&self, hash: &ContentHash) {
        if self.write().insert(hash) {
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Write the snapshot if anything changed since the last save.
    ///
    /// Serializes under the read lock, then writes a temp file and renames it over
    /// the snapshot so a crash mid-write leaves the previous snapshot intact.
    pub async fn persist(&self) -> DepotResult<bool> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let bytes = {
            let bloom = self.read();
            bincode::serialize(&Snapshot {
                version: SNAPSHOT_VERSION,
                bloom: bloom.clone(),
            })
        };
        let result = match bytes {
            Ok(bytes) => write_atomically(&self.snapshot_path, &bytes).await,
            Err(e) => Err(DepotError::Io(std::io::Error::other(e))),
        };

        if result.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        result.map(|()| true)
    }

    /// Persist on every tick and once more on cancellation. Both go through
    /// [`ExistenceFilter::persist`].
    pub async fn run_persister(
        self: Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            let shutting_down = tokio::select! {
                _ = interval.tick() => false,
                _ = cancel.cancelled() => true,
            };

            match self.persist().await {
                Ok(true) => debug!(path = %self.snapshot_path.display(), "Saved existence filter"),
                Ok(false) => {}
                Err(e) => error!(error = %e, "Failed to save existence filter"),
            }

            if shutting_down {
                info!("Existence filter persister stopped");
                return;
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Bloom> {
        // A panic while holding the lock cannot leave the bit array half-updated
        // in a way that loses members, so a poisoned lock is still usable.
        self.bloom.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Bloom> {
        self.bloom.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn read_snapshot(path: &Path) -> DepotResult<Option<Bloom>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let snapshot: Snapshot = bincode::deserialize(&bytes)
        .map_err(|e| DepotError::Validation(format!("corrupt filter snapshot: {e}")))?;
    if snapshot.version != SNAPSHOT_VERSION || !snapshot.bloom.is_consistent() {
        return Err(DepotError::Validation(format!(
            "unsupported filter snapshot (version {})",
            snapshot.version
        )));
    }
    Ok(Some(snapshot.bloom))
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> DepotResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
