//! Decompressed chunk cache.
//!
//! Chunk-aware readers decompress whole chunks; the cache keeps recently
//! used chunks so that small reads inside one chunk don't decompress it
//! again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Key for a decompressed chunk: its position in the compressed file.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Debug)]
pub struct ChunkKey {
    /// Absolute offset of the chunk's compressed bytes.
    pub compressed_offset: u64,
    /// Uncompressed size of the chunk.
    pub uncompressed_size: usize,
}

impl ChunkKey {
    pub fn new(compressed_offset: u64, uncompressed_size: usize) -> Self {
        Self { compressed_offset, uncompressed_size }
    }
}

/// Thread-safe, size-bounded cache of decompressed chunks.
///
/// Uses `parking_lot::RwLock` for non-poisoning locks and `AtomicUsize`
/// for lock-free size tracking.
pub struct ChunkCache {
    cache: RwLock<HashMap<ChunkKey, Arc<Vec<u8>>>>,
    max_size: usize,
    current_size: AtomicUsize,
}

impl ChunkCache {
    /// Create a new cache with the given maximum size in bytes.
    pub fn new(max_size: usize) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            max_size,
            current_size: AtomicUsize::new(0),
        }
    }

    /// Create a cache with default size (8 MB).
    pub fn default_size() -> Self {
        Self::new(8 * 1024 * 1024)
    }

    #[inline]
    pub fn get(&self, key: &ChunkKey) -> Option<Arc<Vec<u8>>> {
        self.cache.read().get(key).cloned()
    }

    /// Insert a chunk and return the shared handle to it.
    pub fn insert(&self, key: ChunkKey, data: Vec<u8>) -> Arc<Vec<u8>> {
        let size = data.len();
        let data = Arc::new(data);
        if size > self.max_size {
            return data;
        }

        if self.current_size.load(Ordering::Relaxed) + size > self.max_size {
            self.evict_some();
        }

        let mut cache = self.cache.write();
        if let Some(existing) = cache.get(&key) {
            return Arc::clone(existing);
        }
        cache.insert(key, Arc::clone(&data));
        self.current_size.fetch_add(size, Ordering::Relaxed);
        data
    }

    /// Evict approximately half of the cache.
    fn evict_some(&self) {
        let mut cache = self.cache.write();
        let keys: Vec<_> = cache.keys().copied().collect();
        let evict_count = (keys.len() / 2).max(1);

        let mut evicted_size = 0;
        for key in keys.into_iter().take(evict_count) {
            if let Some(data) = cache.remove(&key) {
                evicted_size += data.len();
            }
        }

        let _ = self.current_size.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
            Some(x.saturating_sub(evicted_size))
        });
    }

    pub fn clear(&self) {
        self.cache.write().clear();
        self.current_size.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current cache size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.current_size.load(Ordering::Relaxed)
    }
}

impl Default for ChunkCache {
    fn default() -> Self {
        Self::default_size()
    }
}
