//! Content-addressed embedding cache.
//!
//! Two stores implement [`EmbeddingCache`]:
//!
//! - [`MemoryEmbeddingCache`]: a bounded process-local map with LRU
//!   eviction, shareable through `Arc`.
//! - [`SqliteEmbeddingCache`]: a persistent SQLite table. Each handle owns
//!   its own connection; open one handle per thread with
//!   [`SqliteEmbeddingCache::try_clone_handle`]. Writes are single-statement
//!   upserts keyed by `(model_id, text_hash)`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::CacheKey;
use crate::error::{Error, Result};

/// Storage for `(model_id, text_hash) -> vector`.
pub trait EmbeddingCache: Send {
    /// Look up a vector. Corrupt entries are reported as misses.
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<f32>>>;

    /// Store a vector, replacing any previous value for the key.
    fn put(&self, key: &CacheKey, vector: &[f32]) -> Result<()>;
}

impl<C: EmbeddingCache + Sync> EmbeddingCache for Arc<C> {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<f32>>> {
        (**self).get(key)
    }

    fn put(&self, key: &CacheKey, vector: &[f32]) -> Result<()> {
        (**self).put(key, vector)
    }
}

/// Entries kept by [`MemoryEmbeddingCache::new`].
pub const DEFAULT_MEMORY_CAPACITY: usize = 10_000;

#[derive(Debug)]
struct MemoryEntry {
    vector: Vec<f32>,
    last_access: AtomicU64,
}

/// In-process cache with least-recently-used eviction.
///
/// When a new key arrives at capacity, the least recently read or written
/// tenth of the entries (at least one) is dropped.
#[derive(Debug)]
pub struct MemoryEmbeddingCache {
    entries: RwLock<HashMap<CacheKey, MemoryEntry>>,
    capacity: usize,
    clock: AtomicU64,
    evictions: AtomicU64,
}

impl Default for MemoryEmbeddingCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }
}

impl MemoryEmbeddingCache {
    /// Create an empty cache holding up to [`DEFAULT_MEMORY_CAPACITY`] vectors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty cache holding up to `capacity` vectors (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Maximum number of cached vectors.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries dropped to make room so far.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Number of cached vectors.
    pub fn len(&self) -> usize {
        self.entries.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn evict_oldest(&self, entries: &mut HashMap<CacheKey, MemoryEntry>) {
        let count = (self.capacity / 10).max(1);
        let mut by_age: Vec<(u64, CacheKey)> = entries
            .iter()
            .map(|(key, entry)| (entry.last_access.load(Ordering::Relaxed), key.clone()))
            .collect();
        by_age.sort_unstable();
        for (_, key) in by_age.into_iter().take(count) {
            let _ = entries.remove(&key);
        }
        let _ = self.evictions.fetch_add(count as u64, Ordering::Relaxed);
        debug!(evicted = count, capacity = self.capacity, "memory cache full");
    }

    fn poisoned() -> Error {
        Error::InvariantViolation("embedding cache lock poisoned".into())
    }
}

impl EmbeddingCache for MemoryEmbeddingCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<f32>>> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries.get(key).map(|entry| {
            entry.last_access.store(self.tick(), Ordering::Relaxed);
            entry.vector.clone()
        }))
    }

    fn put(&self, key: &CacheKey, vector: &[f32]) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        if !entries.contains_key(key) && entries.len() >= self.capacity {
            self.evict_oldest(&mut entries);
        }
        let entry = MemoryEntry {
            vector: vector.to_vec(),
            last_access: AtomicU64::new(self.tick()),
        };
        let _ = entries.insert(key.clone(), entry);
        Ok(())
    }
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS embedding_cache (
    model_id   TEXT    NOT NULL,
    text_hash  TEXT    NOT NULL,
    dim        INTEGER NOT NULL,
    vector     BLOB    NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (model_id, text_hash)
);
";

/// Persistent cache backed by SQLite.
///
/// One handle per thread; handles to the same file coordinate through
/// SQLite's WAL journal and busy timeout.
pub struct SqliteEmbeddingCache {
    conn: Connection,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteEmbeddingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteEmbeddingCache")
            .field("path", &self.path)
            .finish()
    }
}

impl SqliteEmbeddingCache {
    /// Open or create the cache at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory database (not shareable across handles).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn, path: None })
    }

    /// Open another handle to the same file, for use on another thread.
    pub fn try_clone_handle(&self) -> Result<Self> {
        match &self.path {
            Some(path) => Self::open(path),
            None => Err(Error::invalid(
                "path",
                "in-memory caches cannot be opened from another handle",
            )),
        }
    }

    /// Number of stored vectors.
    pub fn len(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM embedding_cache", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop every entry.
    pub fn clear(&self) -> Result<()> {
        let _ = self.conn.execute("DELETE FROM embedding_cache", [])?;
        Ok(())
    }

    #[cfg(test)]
    fn put_raw(&self, key: &CacheKey, dim: i64, blob: &[u8]) -> Result<()> {
        let _ = self.conn.execute(
            "INSERT INTO embedding_cache (model_id, text_hash, dim, vector, created_at)
             VALUES (?1, ?2, ?3, ?4, 0)
             ON CONFLICT(model_id, text_hash) DO UPDATE SET
                dim = excluded.dim,
                vector = excluded.vector",
            params![key.model_id, key.text_hash, dim, blob],
        )?;
        Ok(())
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn decode_vector(dim: usize, blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() != dim.checked_mul(4)? {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

fn now_epoch_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl EmbeddingCache for SqliteEmbeddingCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<f32>>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT dim, vector FROM embedding_cache WHERE model_id = ?1 AND text_hash = ?2",
        )?;
        let row: Option<(i64, Vec<u8>)> = stmt
            .query_row(params![key.model_id, key.text_hash], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;

        let Some((dim, blob)) = row else {
            return Ok(None);
        };
        let decoded = usize::try_from(dim)
            .ok()
            .and_then(|dim| decode_vector(dim, &blob));
        if decoded.is_none() {
            debug!(
                model_id = %key.model_id,
                text_hash = %key.text_hash,
                dim,
                bytes = blob.len(),
                "corrupt cache entry, treating as miss"
            );
        }
        Ok(decoded)
    }

    fn put(&self, key: &CacheKey, vector: &[f32]) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO embedding_cache (model_id, text_hash, dim, vector, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(model_id, text_hash) DO UPDATE SET
                dim = excluded.dim,
                vector = excluded.vector",
        )?;
        let _ = stmt.execute(params![
            key.model_id,
            key.text_hash,
            vector.len() as i64,
            encode_vector(vector),
            now_epoch_seconds(),
        ])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(text: &str) -> CacheKey {
        CacheKey::new("test-model", text)
    }

    #[test]
    fn test_memory_cache_roundtrip() {
        let cache = MemoryEmbeddingCache::new();
        assert!(cache.get(&key("a")).unwrap().is_none());
        cache.put(&key("a"), &[1.0, 2.0]).unwrap();
        assert_eq!(cache.get(&key("a")).unwrap(), Some(vec![1.0, 2.0]));
        cache.put(&key("a"), &[1.0, 2.0]).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.capacity(), DEFAULT_MEMORY_CAPACITY);
    }

    #[test]
    fn test_memory_cache_evicts_least_recently_used() {
        let cache = MemoryEmbeddingCache::with_capacity(3);
        for text in ["a", "b", "c"] {
            cache.put(&key(text), &[1.0]).unwrap();
        }
        // Reading "a" makes "b" the oldest entry.
        assert!(cache.get(&key("a")).unwrap().is_some());
        cache.put(&key("d"), &[4.0]).unwrap();

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.evictions(), 1);
        assert!(cache.get(&key("b")).unwrap().is_none());
        for text in ["a", "c", "d"] {
            assert!(cache.get(&key(text)).unwrap().is_some(), "{text} evicted");
        }

        // Overwriting a present key never evicts.
        cache.put(&key("c"), &[9.0]).unwrap();
        assert_eq!(cache.evictions(), 1);
        assert_eq!(cache.get(&key("c")).unwrap(), Some(vec![9.0]));
    }

    #[test]
    fn test_memory_cache_stays_within_capacity() {
        let cache = MemoryEmbeddingCache::with_capacity(20);
        for i in 0..100 {
            cache.put(&key(&format!("text {i}")), &[i as f32]).unwrap();
            assert!(cache.len() <= 20);
        }
        // Each full insert drops two entries (a tenth of 20).
        assert!(cache.evictions() > 0);
        assert!(cache.get(&key("text 99")).unwrap().is_some());
        assert!(cache.get(&key("text 0")).unwrap().is_none());
    }

    #[test]
    fn test_sqlite_roundtrip_and_upsert() {
        let cache = SqliteEmbeddingCache::open_in_memory().unwrap();
        cache.put(&key("a"), &[0.5, -1.25, 3.0]).unwrap();
        cache.put(&key("a"), &[0.5, -1.25, 3.0]).unwrap();
        assert_eq!(cache.len().unwrap(), 1);
        assert_eq!(cache.get(&key("a")).unwrap(), Some(vec![0.5, -1.25, 3.0]));
        assert!(cache.get(&key("b")).unwrap().is_none());

        let other_model = CacheKey::new("other-model", "a");
        assert!(cache.get(&other_model).unwrap().is_none());

        cache.clear().unwrap();
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn test_sqlite_dimension_mismatch_is_a_miss() {
        let cache = SqliteEmbeddingCache::open_in_memory().unwrap();
        // Declares 3 floats but stores 2.
        cache.put_raw(&key("bad"), 3, &encode_vector(&[1.0, 2.0])).unwrap();
        assert!(cache.get(&key("bad")).unwrap().is_none());

        cache.put_raw(&key("neg"), -1, &[]).unwrap();
        assert!(cache.get(&key("neg")).unwrap().is_none());
    }

    #[test]
    fn test_sqlite_handles_per_thread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("embeddings.sqlite");
        let primary = SqliteEmbeddingCache::open(&path).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let handle = primary.try_clone_handle().unwrap();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let k = key(&format!("text {}", i % 10));
                        handle.put(&k, &[i as f32 % 10.0, t as f32 * 0.0]).unwrap();
                        let _ = handle.get(&k).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(primary.len().unwrap(), 10);
        assert_eq!(primary.get(&key("text 3")).unwrap(), Some(vec![3.0, 0.0]));
    }

    #[test]
    fn test_in_memory_handle_cannot_be_cloned() {
        let cache = SqliteEmbeddingCache::open_in_memory().unwrap();
        assert!(cache.try_clone_handle().is_err());
    }

    #[test]
    fn test_shared_memory_cache_through_arc() {
        let cache = Arc::new(MemoryEmbeddingCache::new());
        let shared: Arc<MemoryEmbeddingCache> = Arc::clone(&cache);
        shared.put(&key("x"), &[9.0]).unwrap();
        assert_eq!(EmbeddingCache::get(&cache, &key("x")).unwrap(), Some(vec![9.0]));
    }
}
