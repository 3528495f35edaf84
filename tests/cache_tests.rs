use chrono::{Duration as ChronoDuration, Utc};
use rollgate::core::{CacheConfig, FileStorage, FlagCache};
use rollgate::FlagSet;
use std::sync::Arc;
use std::time::Duration;

fn flags(pairs: &[(&str, bool)]) -> FlagSet {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn minutes_config(ttl: u64, stale_ttl: u64) -> CacheConfig {
    CacheConfig {
        ttl: Duration::from_secs(ttl * 60),
        stale_ttl: Duration::from_secs(stale_ttl * 60),
        ..Default::default()
    }
}

#[test]
fn test_default_config() {
    let config = CacheConfig::default();

    assert_eq!(config.ttl, Duration::from_secs(300));
    assert_eq!(config.stale_ttl, Duration::from_secs(3600));
    assert!(config.enabled);
    assert!(config.persist_path.is_none());
}

#[test]
fn test_empty_cache_misses() {
    let cache = FlagCache::new(CacheConfig::default());

    assert!(cache.get().is_none());
    assert!(!cache.has_any());
    assert_eq!(cache.stats().misses, 1);
}

#[test]
fn test_ten_minute_old_entry_is_stale() {
    let cache = FlagCache::new(minutes_config(5, 60));
    cache.set_at(flags(&[("a", true)]), Utc::now() - ChronoDuration::minutes(10));

    let result = cache.get().unwrap();
    assert!(result.stale);
    assert_eq!(result.flags, flags(&[("a", true)]));
    assert_eq!(cache.stats().stale_hits, 1);
    assert!(!cache.has_fresh());
    assert!(cache.has_any());
}

#[test]
fn test_expired_entry_is_dropped() {
    let cache = FlagCache::new(minutes_config(5, 60));
    cache.set_at(flags(&[("a", true)]), Utc::now() - ChronoDuration::minutes(61));

    assert!(cache.get().is_none());
    assert!(cache.timestamp().is_none());
    assert_eq!(cache.stats().misses, 1);
}

#[test]
fn test_each_read_counts_once() {
    let cache = FlagCache::new(CacheConfig::default());
    cache.get();
    cache.set(flags(&[("a", true)]));
    cache.get();
    cache.get();

    let stats = cache.stats();
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.stale_hits, 0);
    assert!((cache.hit_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
}

#[test]
fn test_freshness_checks_do_not_touch_stats() {
    let cache = FlagCache::new(CacheConfig::default());
    cache.set(flags(&[("a", true)]));

    assert!(cache.has_fresh());
    assert!(cache.has_any());
    assert_eq!(cache.stats().hits + cache.stats().misses, 0);
}

#[test]
fn test_set_overwrites_whole_set() {
    let cache = FlagCache::new(CacheConfig::default());
    cache.set(flags(&[("a", true), ("b", true)]));
    cache.set(flags(&[("c", false)]));

    assert_eq!(cache.get().unwrap().flags, flags(&[("c", false)]));
}

#[test]
fn test_persisted_flags_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flags.json");
    let config = CacheConfig {
        persist_path: Some(path.clone()),
        ..Default::default()
    };

    let first = FlagCache::new(config.clone());
    first.set(flags(&[("dark-mode", true)]));
    assert!(path.exists());

    let second = FlagCache::new(config);
    assert!(second.load().unwrap());
    assert_eq!(second.get().unwrap().flags, flags(&[("dark-mode", true)]));
}

#[test]
fn test_clear_removes_persisted_copy() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flags.json");
    let cache = FlagCache::with_storage(CacheConfig::default(), Arc::new(FileStorage::new(&path)));

    cache.set(flags(&[("a", true)]));
    cache.clear();

    assert!(cache.get().is_none());
    let reloaded = FlagCache::with_storage(CacheConfig::default(), Arc::new(FileStorage::new(&path)));
    assert!(!reloaded.load().unwrap());
}
