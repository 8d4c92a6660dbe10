//! Bounded TTL cache.
//!
//! Entries expire a fixed duration after they were last touched (sliding
//! expiry). When full, inserting a new key evicts the entry touched longest
//! ago. A background sweeper purges expired entries independently of reads.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Configuration for a single cache instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Time after the last touch before an entry expires.
    pub max_age_secs: u64,
    /// Maximum number of entries.
    pub max_size: usize,
    /// Interval between background sweeps.
    pub sweep_interval_secs: u64,
}

impl CacheConfig {
    pub fn new(max_age_secs: u64, max_size: usize) -> Self {
        Self {
            max_age_secs,
            max_size,
            sweep_interval_secs: 300,
        }
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new(3600, 1000)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    touched_at: Instant,
}

impl<V> CacheEntry<V> {
    fn new(value: V) -> Self {
        Self {
            value,
            touched_at: Instant::now(),
        }
    }

    fn is_expired(&self, max_age: Duration, now: Instant) -> bool {
        now.duration_since(self.touched_at) > max_age
    }
}

/// Statistics about a cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub name: String,
    pub entries: usize,
    pub max_size: usize,
    pub max_age: Duration,
}

/// Bounded key-value cache with sliding TTL.
///
/// All access goes through one mutex, since the sweeper mutates the map
/// concurrently with callers.
#[derive(Debug)]
pub struct Cache<K, V> {
    name: String,
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
    max_age: Duration,
    max_size: usize,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: impl Into<String>, max_age: Duration, max_size: usize) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
            max_age,
            max_size: max_size.max(1),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &CacheConfig) -> Self {
        Self::new(name, config.max_age(), config.max_size)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a value, refreshing its expiry. Expired entries are removed.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if entries.get(key)?.is_expired(self.max_age, now) {
            entries.remove(key);
            return None;
        }

        let entry = entries.get_mut(key)?;
        entry.touched_at = now;
        Some(entry.value.clone())
    }

    /// Insert or overwrite a value.
    ///
    /// Inserting a new key into a full cache evicts the least recently touched
    /// entry first.
    pub fn set(&self, key: K, value: V) {
        let mut entries = self.entries.lock();

        if !entries.contains_key(&key) && entries.len() >= self.max_size {
            if let Some(oldest) = oldest_key(&entries) {
                entries.remove(&oldest);
                debug!(cache = %self.name, "Evicted oldest entry to make room");
            }
        }

        entries.insert(key, CacheEntry::new(value));
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.lock().remove(key).map(|e| e.value)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove all expired entries, returning how many were purged.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(self.max_age, now));
        before - entries.len()
    }

    /// Evict up to `count` of the least recently touched entries.
    pub fn evict_oldest(&self, count: usize) -> usize {
        let mut entries = self.entries.lock();
        if count >= entries.len() {
            let removed = entries.len();
            entries.clear();
            return removed;
        }

        let mut by_age: Vec<(K, Instant)> = entries
            .iter()
            .map(|(k, e)| (k.clone(), e.touched_at))
            .collect();
        by_age.sort_by_key(|(_, touched_at)| *touched_at);

        for (key, _) in by_age.into_iter().take(count) {
            entries.remove(&key);
        }
        count
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            name: self.name.clone(),
            entries: self.len(),
            max_size: self.max_size,
            max_age: self.max_age,
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Spawn the background sweep task.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!(cache = %cache.name, "Cache sweeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            info!(cache = %cache.name, purged, "Purged expired cache entries");
                        }
                    }
                }
            }
        })
    }
}

fn oldest_key<K: Clone, V>(entries: &HashMap<K, CacheEntry<V>>) -> Option<K> {
    entries
        .iter()
        .min_by_key(|(_, e)| e.touched_at)
        .map(|(k, _)| k.clone())
}

/// Type-erased view of a cache used for memory reclamation.
pub trait EvictableCache: Send + Sync {
    fn cache_name(&self) -> &str;

    fn entry_count(&self) -> usize;

    fn evict_oldest_entries(&self, count: usize) -> usize;
}

impl<K, V> EvictableCache for Cache<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + Send,
{
    fn cache_name(&self) -> &str {
        self.name()
    }

    fn entry_count(&self) -> usize {
        self.len()
    }

    fn evict_oldest_entries(&self, count: usize) -> usize {
        self.evict_oldest(count)
    }
}

/// Configuration for the download caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadCachesConfig {
    pub urls: CacheConfig,
    pub paths: CacheConfig,
    pub options: CacheConfig,
}

impl Default for DownloadCachesConfig {
    fn default() -> Self {
        Self {
            urls: CacheConfig::new(3600, 1000),
            paths: CacheConfig::new(86400, 500),
            options: CacheConfig::new(3600, 200),
        }
    }
}

/// The independent caches consulted around downloads.
#[derive(Debug, Clone)]
pub struct DownloadCaches {
    /// URL to extracted media info.
    pub urls: Arc<Cache<String, Value>>,
    /// URL to a previously downloaded file.
    pub paths: Arc<Cache<String, PathBuf>>,
    /// Named option presets.
    pub options: Arc<Cache<String, Map<String, Value>>>,
    config: DownloadCachesConfig,
}

impl DownloadCaches {
    pub fn new(config: DownloadCachesConfig) -> Self {
        Self {
            urls: Arc::new(Cache::from_config("url", &config.urls)),
            paths: Arc::new(Cache::from_config("download_path", &config.paths)),
            options: Arc::new(Cache::from_config("options", &config.options)),
            config,
        }
    }

    /// All caches as evictable handles.
    pub fn evictables(&self) -> Vec<Arc<dyn EvictableCache>> {
        vec![
            self.urls.clone() as Arc<dyn EvictableCache>,
            self.paths.clone() as Arc<dyn EvictableCache>,
            self.options.clone() as Arc<dyn EvictableCache>,
        ]
    }

    /// Start one sweeper per cache.
    pub fn spawn_sweepers(&self, cancel_token: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            self.urls
                .spawn_sweeper(self.config.urls.sweep_interval(), cancel_token.clone()),
            self.paths
                .spawn_sweeper(self.config.paths.sweep_interval(), cancel_token.clone()),
            self.options
                .spawn_sweeper(self.config.options.sweep_interval(), cancel_token.clone()),
        ]
    }

    pub fn clear_all(&self) {
        self.urls.clear();
        self.paths.clear();
        self.options.clear();
    }
}

impl Default for DownloadCaches {
    fn default() -> Self {
        Self::new(DownloadCachesConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_age: Duration, max_size: usize) -> Cache<String, u32> {
        Cache::new("test", max_age, max_size)
    }

    #[test]
    fn test_set_then_get() {
        let cache = cache(Duration::from_secs(60), 10);
        cache.set("a".to_string(), 1);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn test_entry_expires_without_access() {
        let cache = cache(Duration::from_millis(20), 10);
        cache.set("a".to_string(), 1);

        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty(), "expired entry is removed on read");
    }

    #[test]
    fn test_read_refreshes_expiry() {
        let cache = cache(Duration::from_millis(60), 10);
        cache.set("a".to_string(), 1);

        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(25));
            assert_eq!(cache.get("a"), Some(1));
        }
    }

    #[test]
    fn test_overwrite_resets_value() {
        let cache = cache(Duration::from_secs(60), 2);
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);
        cache.set("a".to_string(), 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(3));
        assert_eq!(cache.get("b"), Some(2));
    }

    #[test]
    fn test_bound_evicts_least_recently_touched() {
        let cache = cache(Duration::from_secs(60), 3);
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            cache.set(key.to_string(), i as u32);
            std::thread::sleep(Duration::from_millis(2));
        }

        // Touch "a" so "b" becomes the oldest.
        assert_eq!(cache.get("a"), Some(0));
        std::thread::sleep(Duration::from_millis(2));
        cache.set("d".to_string(), 3);

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(0));
        assert_eq!(cache.get("c"), Some(2));
        assert_eq!(cache.get("d"), Some(3));
    }

    #[test]
    fn test_purge_expired() {
        let cache = cache(Duration::from_millis(10), 10);
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);

        std::thread::sleep(Duration::from_millis(25));
        cache.set("c".to_string(), 3);

        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evict_oldest() {
        let cache = cache(Duration::from_secs(60), 100);
        for i in 0..5u32 {
            cache.set(format!("k{i}"), i);
            std::thread::sleep(Duration::from_millis(2));
        }

        assert_eq!(cache.evict_oldest(2), 2);
        assert_eq!(cache.get("k0"), None);
        assert_eq!(cache.get("k1"), None);
        assert_eq!(cache.len(), 3);

        assert_eq!(cache.evict_oldest(10), 3);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear() {
        let cache = cache(Duration::from_secs(60), 10);
        cache.set("a".to_string(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_purges_in_background() {
        let cache = Arc::new(cache(Duration::from_millis(10), 10));
        cache.set("a".to_string(), 1);

        let token = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_millis(15), token.clone());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.is_empty());

        token.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_download_caches_are_independent() {
        let caches = DownloadCaches::default();
        caches
            .paths
            .set("https://a".to_string(), PathBuf::from("/tmp/a.mp4"));

        assert_eq!(caches.paths.len(), 1);
        assert!(caches.urls.is_empty());
        assert!(caches.options.is_empty());

        let names: Vec<String> = caches
            .evictables()
            .iter()
            .map(|c| c.cache_name().to_string())
            .collect();
        assert_eq!(names, vec!["url", "download_path", "options"]);
    }
}
