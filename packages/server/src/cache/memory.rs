use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{CacheBackend, CacheError};

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Instant,
}

impl Slot {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Process-local cache for single-node deployments and tests.
#[derive(Default)]
pub struct MemoryCache {
    slots: DashMap<String, Slot>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let live = self
            .slots
            .get(key)
            .filter(|slot| slot.is_live())
            .map(|slot| slot.value.clone());
        if live.is_none() {
            self.slots.remove_if(key, |_, slot| !slot.is_live());
        }
        Ok(live)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.slots.insert(key.to_string(), Slot::new(value, ttl));
        Ok(())
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CacheError> {
        // The entry guard holds the shard lock, so check-and-set is atomic.
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().is_live() {
                    return Ok(false);
                }
                held.insert(Slot::new(token, ttl));
                Ok(true)
            }
            Entry::Vacant(free) => {
                free.insert(Slot::new(token, ttl));
                Ok(true)
            }
        }
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, CacheError> {
        Ok(self
            .slots
            .remove_if(key, |_, slot| slot.value == token)
            .is_some())
    }
}
