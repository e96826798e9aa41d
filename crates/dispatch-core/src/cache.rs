//! Two-tier content-addressed cache: in-memory LRU (hot) + on-disk blobs (cold) (§4.5).
//!
//! Grounded on `original_source/src/utils/cache_manager.py::CacheManager` for the key
//! derivation, LRU eviction policy, and sharded on-disk layout; ported from Python's
//! `asyncio.Lock` + `dict` to a `tokio::sync::Mutex`-guarded `HashMap` plus `tokio::fs`
//! for the cold tier, matching how the teacher's `sqlite.rs` mixes `tokio` I/O with
//! in-process locking.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::DispatchError;
use crate::model::Mode;

/// `H(content[:1000] || H(content) || mode || model)` truncated to a 128-bit hex key (§4.5).
pub fn cache_key(content: &[u8], mode: Mode, model: &str) -> String {
    let prefix_len = content.len().min(1000);
    let mut hasher = Sha256::new();
    hasher.update(&content[..prefix_len]);
    let full_hash = Sha256::digest(content);
    hasher.update(full_hash);
    hasher.update(format!("{mode:?}").as_bytes());
    hasher.update(model.as_bytes());
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

/// A single cached value plus its bookkeeping (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_accessed_at: chrono::DateTime<chrono::Utc>,
    pub access_count: u64,
    pub size_bytes: u64,
}

impl CacheEntry {
    fn new(key: String, value: String) -> Self {
        let now = chrono::Utc::now();
        let size_bytes = value.len() as u64;
        Self {
            key,
            value,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            size_bytes,
        }
    }

    fn touch(&mut self) {
        self.last_accessed_at = chrono::Utc::now();
        self.access_count += 1;
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        let age = chrono::Utc::now().signed_duration_since(self.created_at);
        age.to_std().unwrap_or_default() > ttl
    }
}

/// Cache-wide counters, returned by `stats()` (§4.5).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub errors: u64,
    pub hot_items: usize,
    pub cold_bytes: u64,
}

struct Inner {
    hot: HashMap<String, CacheEntry>,
    stats: CacheStats,
}

/// Two-tier cache. Readers and writers are serialized per key via a single mutex over the
/// hot-tier map (§4.5 "Concurrency"); distinct keys still execute sequentially against this
/// mutex, matching the teacher's single-lock-per-component discipline (§5) rather than
/// introducing per-key sharding the original doesn't have either.
pub struct Cache {
    inner: Mutex<Inner>,
    hot_capacity: usize,
    ttl: Duration,
    dir: Option<PathBuf>,
}

impl Cache {
    pub fn new(hot_capacity: usize, ttl: Duration, dir: Option<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                hot: HashMap::new(),
                stats: CacheStats::default(),
            }),
            hot_capacity,
            ttl,
            dir,
        }
    }

    fn cold_path(&self, key: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| shard_for(dir, key).join(format!("{key}.blob")))
    }

    /// `get(k) -> value?` (§4.5). TTL-expired entries are treated as a miss and removed;
    /// a hot-tier miss that hits cold promotes the entry back into hot.
    pub async fn get(&self, key: &str) -> Result<Option<String>, DispatchError> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.hot.get_mut(key) {
            if entry.is_expired(self.ttl) {
                inner.hot.remove(key);
            } else {
                entry.touch();
                inner.stats.hits += 1;
                return Ok(Some(inner.hot[key].value.clone()));
            }
        }
        drop(inner);

        match self.read_cold(key).await {
            Ok(Some(mut entry)) => {
                if entry.is_expired(self.ttl) {
                    let _ = self.remove_cold(key).await;
                    let mut inner = self.inner.lock().await;
                    inner.stats.misses += 1;
                    return Ok(None);
                }
                entry.touch();
                let value = entry.value.clone();
                let mut inner = self.inner.lock().await;
                self.insert_hot_locked(&mut inner, entry);
                inner.stats.hits += 1;
                Ok(Some(value))
            }
            Ok(None) => {
                let mut inner = self.inner.lock().await;
                inner.stats.misses += 1;
                Ok(None)
            }
            Err(err) => {
                // CacheError is never fatal (§7): logged, treated as a miss.
                tracing::warn!(error = %err, key, "cache read failed, treating as miss");
                let mut inner = self.inner.lock().await;
                inner.stats.errors += 1;
                inner.stats.misses += 1;
                Ok(None)
            }
        }
    }

    /// `put(k, v)` (§4.5): writes through to both tiers.
    pub async fn put(&self, key: &str, value: String) -> Result<(), DispatchError> {
        let entry = CacheEntry::new(key.to_string(), value);
        if let Err(err) = self.write_cold(&entry).await {
            tracing::warn!(error = %err, key, "cache write-through failed");
            let mut inner = self.inner.lock().await;
            inner.stats.errors += 1;
        }
        let mut inner = self.inner.lock().await;
        self.insert_hot_locked(&mut inner, entry);
        Ok(())
    }

    fn insert_hot_locked(&self, inner: &mut Inner, entry: CacheEntry) {
        if inner.hot.len() >= self.hot_capacity && !inner.hot.contains_key(&entry.key) {
            if let Some(victim) = inner
                .hot
                .values()
                .min_by_key(|e| (e.access_count, e.last_accessed_at))
                .map(|e| e.key.clone())
            {
                inner.hot.remove(&victim);
                inner.stats.evictions += 1;
            }
        }
        inner.hot.insert(entry.key.clone(), entry);
        inner.stats.hot_items = inner.hot.len();
    }

    pub async fn invalidate(&self, key: &str) -> Result<(), DispatchError> {
        let mut inner = self.inner.lock().await;
        inner.hot.remove(key);
        drop(inner);
        let _ = self.remove_cold(key).await;
        Ok(())
    }

    /// Removes every cold-tier entry older than `ttl` and any hot-tier mirror of it (§4.5).
    pub async fn purge_expired(&self) -> Result<usize, DispatchError> {
        let mut removed = 0;
        {
            let mut inner = self.inner.lock().await;
            let stale: Vec<String> = inner
                .hot
                .iter()
                .filter(|(_, e)| e.is_expired(self.ttl))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &stale {
                inner.hot.remove(key);
                removed += 1;
            }
        }
        if let Some(dir) = &self.dir {
            if let Ok(mut shards) = tokio::fs::read_dir(dir).await {
                while let Ok(Some(shard)) = shards.next_entry().await {
                    if let Ok(mut files) = tokio::fs::read_dir(shard.path()).await {
                        while let Ok(Some(file)) = files.next_entry().await {
                            if let Ok(bytes) = tokio::fs::read(file.path()).await {
                                if let Ok(entry) = serde_json::from_slice::<CacheEntry>(&bytes) {
                                    if entry.is_expired(self.ttl) {
                                        let _ = tokio::fs::remove_file(file.path()).await;
                                        removed += 1;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Scans the cold tier for entries newer than `max_age` and promotes up to
    /// `hot_capacity` of them into hot at startup (SPEC_FULL §11, `cache_manager.py::warmup`).
    pub async fn warmup(&self, max_age: Duration) -> usize {
        let Some(dir) = &self.dir else { return 0 };
        let mut candidates = Vec::new();
        if let Ok(mut shards) = tokio::fs::read_dir(dir).await {
            while let Ok(Some(shard)) = shards.next_entry().await {
                if let Ok(mut files) = tokio::fs::read_dir(shard.path()).await {
                    while let Ok(Some(file)) = files.next_entry().await {
                        if let Ok(bytes) = tokio::fs::read(file.path()).await {
                            if let Ok(entry) = serde_json::from_slice::<CacheEntry>(&bytes) {
                                let age = chrono::Utc::now().signed_duration_since(entry.created_at);
                                if age.to_std().unwrap_or_default() <= max_age {
                                    candidates.push(entry);
                                }
                            }
                        }
                    }
                }
            }
        }
        candidates.sort_by(|a, b| b.last_accessed_at.cmp(&a.last_accessed_at));
        let mut promoted = 0;
        let mut inner = self.inner.lock().await;
        for entry in candidates.into_iter().take(self.hot_capacity) {
            self.insert_hot_locked(&mut inner, entry);
            promoted += 1;
        }
        promoted
    }

    pub async fn stats(&self) -> CacheStats {
        let mut stats = self.inner.lock().await.stats;
        stats.cold_bytes = self.cold_bytes().await;
        stats
    }

    async fn cold_bytes(&self) -> u64 {
        let Some(dir) = &self.dir else { return 0 };
        let mut total = 0;
        if let Ok(mut shards) = tokio::fs::read_dir(dir).await {
            while let Ok(Some(shard)) = shards.next_entry().await {
                if let Ok(mut files) = tokio::fs::read_dir(shard.path()).await {
                    while let Ok(Some(file)) = files.next_entry().await {
                        if let Ok(meta) = file.metadata().await {
                            total += meta.len();
                        }
                    }
                }
            }
        }
        total
    }

    async fn read_cold(&self, key: &str) -> Result<Option<CacheEntry>, DispatchError> {
        let Some(path) = self.cold_path(key) else { return Ok(None) };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(DispatchError::from(err)),
        }
    }

    async fn write_cold(&self, entry: &CacheEntry) -> Result<(), DispatchError> {
        let Some(path) = self.cold_path(&entry.key) else { return Ok(()) };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec(entry)?;
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn remove_cold(&self, key: &str) -> Result<(), DispatchError> {
        let Some(path) = self.cold_path(key) else { return Ok(()) };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(DispatchError::from(err)),
        }
    }
}

/// Two-character shard directory for `key` under `dir`, keeping any single cold-tier
/// directory from accumulating every blob in one flat listing.
pub fn shard_for(dir: &Path, key: &str) -> PathBuf {
    dir.join(&key[..2.min(key.len())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn put_then_get_within_ttl_returns_value() {
        let dir = tempdir().unwrap();
        let cache = Cache::new(10, Duration::from_secs(3600), Some(dir.path().to_path_buf()));
        cache.put("k1", "value".to_string()).await.unwrap();
        assert_eq!(cache.get("k1").await.unwrap().as_deref(), Some("value"));
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let dir = tempdir().unwrap();
        let cache = Cache::new(10, Duration::from_millis(1), Some(dir.path().to_path_buf()));
        cache.put("k1", "value".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn hot_tier_evicts_least_recently_used() {
        let dir = tempdir().unwrap();
        let cache = Cache::new(2, Duration::from_secs(3600), Some(dir.path().to_path_buf()));
        cache.put("a", "a".to_string()).await.unwrap();
        cache.put("b", "b".to_string()).await.unwrap();
        cache.get("a").await.unwrap();
        cache.put("c", "c".to_string()).await.unwrap();
        let stats = cache.stats().await;
        assert!(stats.evictions >= 1);
        assert!(stats.hot_items <= 2);
    }

    #[tokio::test]
    async fn cold_hit_promotes_into_hot() {
        let dir = tempdir().unwrap();
        let cache = Cache::new(10, Duration::from_secs(3600), Some(dir.path().to_path_buf()));
        cache.put("k1", "value".to_string()).await.unwrap();
        // Simulate a fresh process: drop a new Cache sharing only the cold dir.
        let restarted = Cache::new(10, Duration::from_secs(3600), Some(dir.path().to_path_buf()));
        assert_eq!(restarted.get("k1").await.unwrap().as_deref(), Some("value"));
        assert_eq!(restarted.stats().await.hot_items, 1);
    }

    #[test]
    fn cache_key_is_deterministic() {
        let k1 = cache_key(b"hello world", Mode::Quick, "claude-3-5-sonnet");
        let k2 = cache_key(b"hello world", Mode::Quick, "claude-3-5-sonnet");
        assert_eq!(k1, k2);
        let k3 = cache_key(b"hello world", Mode::Intelligent, "claude-3-5-sonnet");
        assert_ne!(k1, k3);
    }

    #[test]
    fn shard_for_uses_first_two_key_chars() {
        let dir = Path::new("/tmp/cold");
        assert_eq!(shard_for(dir, "abcdef"), dir.join("ab"));
        assert_eq!(shard_for(dir, "a"), dir.join("a"));
    }
}
