use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::core::storage::{CacheStorage, FileStorage, PersistedFlags};
use crate::error::Result;
use crate::types::FlagSet;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CACHE_STALE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Age up to which the cached set is fresh.
    pub ttl: Duration,
    /// Age up to which the cached set may still be served as stale.
    pub stale_ttl: Duration,
    pub enabled: bool,
    /// Optional file the cache is persisted to.
    pub persist_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_CACHE_TTL,
            stale_ttl: DEFAULT_CACHE_STALE_TTL,
            enabled: true,
            persist_path: None,
        }
    }
}

/// A cache read. `stale` is set once the entry is past its TTL.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResult {
    pub flags: FlagSet,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
}

impl CacheStats {
    /// Share of reads served from cache, stale or not.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.stale_hits;
        if total == 0 {
            return 0.0;
        }
        (self.hits + self.stale_hits) as f64 / total as f64
    }
}

struct CacheEntry {
    flags: FlagSet,
    timestamp: DateTime<Utc>,
}

struct CacheInner {
    entry: Option<CacheEntry>,
    stats: CacheStats,
}

enum Freshness {
    Fresh,
    Stale,
    Expired,
}

/// Last-known flag set with freshness classification.
///
/// The whole set is one entry. Reads past `stale_ttl` drop it.
pub struct FlagCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
    storage: Option<Arc<dyn CacheStorage>>,
}

impl FlagCache {
    /// Create a cache, persisting to `config.persist_path` when set.
    pub fn new(config: CacheConfig) -> Self {
        let storage = config
            .persist_path
            .clone()
            .map(|path| Arc::new(FileStorage::new(path)) as Arc<dyn CacheStorage>);
        Self::build(config, storage)
    }

    /// Create a cache backed by a caller-supplied storage slot.
    pub fn with_storage(config: CacheConfig, storage: Arc<dyn CacheStorage>) -> Self {
        Self::build(config, Some(storage))
    }

    fn build(config: CacheConfig, storage: Option<Arc<dyn CacheStorage>>) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner {
                entry: None,
                stats: CacheStats::default(),
            }),
            storage,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn classify(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> Freshness {
        // A clock that moved backwards reads as age zero.
        let age = (now - timestamp).to_std().unwrap_or(Duration::ZERO);
        if age <= self.config.ttl {
            Freshness::Fresh
        } else if age <= self.config.stale_ttl {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// Read the cached set, counting a hit, stale hit or miss.
    pub fn get(&self) -> Option<CacheResult> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let freshness = match inner.entry.as_ref() {
            Some(entry) => self.classify(entry.timestamp, now),
            None => {
                inner.stats.misses += 1;
                return None;
            }
        };

        match freshness {
            Freshness::Expired => {
                inner.entry = None;
                inner.stats.misses += 1;
                None
            }
            Freshness::Stale => {
                inner.stats.stale_hits += 1;
                inner.entry.as_ref().map(|entry| CacheResult {
                    flags: entry.flags.clone(),
                    stale: true,
                })
            }
            Freshness::Fresh => {
                inner.stats.hits += 1;
                inner.entry.as_ref().map(|entry| CacheResult {
                    flags: entry.flags.clone(),
                    stale: false,
                })
            }
        }
    }

    /// Store a set stamped with the current time.
    pub fn set(&self, flags: FlagSet) {
        self.set_at(flags, Utc::now());
    }

    /// Store a set with an explicit timestamp. Timestamps never move backwards.
    pub fn set_at(&self, flags: FlagSet, timestamp: DateTime<Utc>) {
        let snapshot = {
            let mut inner = self.inner.lock();
            let timestamp = match inner.entry.as_ref() {
                Some(prev) if prev.timestamp > timestamp => prev.timestamp,
                _ => timestamp,
            };
            inner.entry = Some(CacheEntry {
                flags: flags.clone(),
                timestamp,
            });
            PersistedFlags { flags, timestamp }
        };

        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save(&snapshot) {
                tracing::warn!("Failed to persist flag cache: {}", e);
            }
        }
    }

    /// Install the persisted set if it is not older than `stale_ttl`.
    /// Returns whether anything was loaded.
    pub fn load(&self) -> Result<bool> {
        let Some(storage) = &self.storage else {
            return Ok(false);
        };
        let Some(snapshot) = storage.load()? else {
            return Ok(false);
        };

        if let Freshness::Expired = self.classify(snapshot.timestamp, Utc::now()) {
            tracing::debug!("Ignoring persisted flags older than the stale TTL");
            return Ok(false);
        }

        let count = snapshot.flags.len();
        self.set_entry(snapshot);
        tracing::debug!("Loaded {} flags from persistent cache", count);
        Ok(true)
    }

    fn set_entry(&self, snapshot: PersistedFlags) {
        let mut inner = self.inner.lock();
        let newer = inner
            .entry
            .as_ref()
            .map_or(true, |prev| snapshot.timestamp >= prev.timestamp);
        if newer {
            inner.entry = Some(CacheEntry {
                flags: snapshot.flags,
                timestamp: snapshot.timestamp,
            });
        }
    }

    /// Whether a fresh entry exists. Does not touch the stats.
    pub fn has_fresh(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .entry
            .as_ref()
            .is_some_and(|entry| matches!(self.classify(entry.timestamp, Utc::now()), Freshness::Fresh))
    }

    /// Whether a fresh or stale entry exists. Does not touch the stats.
    pub fn has_any(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .entry
            .as_ref()
            .is_some_and(|entry| !matches!(self.classify(entry.timestamp, Utc::now()), Freshness::Expired))
    }

    /// Timestamp of the current entry.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().entry.as_ref().map(|entry| entry.timestamp)
    }

    /// Remove the entry and any persisted copy.
    pub fn clear(&self) {
        self.inner.lock().entry = None;
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.clear() {
                tracing::warn!("Failed to clear persisted flag cache: {}", e);
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    pub fn hit_rate(&self) -> f64 {
        self.stats().hit_rate()
    }
}
