//! Content cache for verified chunks
//!
//! Only bytes that passed digest verification are ever stored, keyed by
//! their digest string. The backends are interchangeable behind
//! [`BlobCache`]; [`ChunkFetcher`] adds the per-key in-flight guard.

mod disk;
mod fetch;
mod lru;
mod memory;

pub use disk::DiskCache;
pub use fetch::{ChunkFetcher, FetchStats};
pub use lru::LruCache;
pub use memory::MemoryCache;

use crate::config::{CacheBackend, CacheConfig};
use crate::error::Result;
use bytes::Bytes;
use std::sync::Arc;

/// Key-value store for verified content
pub trait BlobCache: Send + Sync {
    /// Look up cached bytes
    fn get(&self, key: &str) -> Option<Bytes>;

    /// Store bytes under `key`, replacing any previous value
    fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Number of cached entries
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry
    fn clear(&self) -> Result<()>;
}

/// Build the backend selected by `config`
pub fn open_cache(config: &CacheConfig) -> Result<Arc<dyn BlobCache>> {
    match config.backend {
        CacheBackend::Memory => Ok(Arc::new(MemoryCache::new(config.max_size))),
        CacheBackend::Disk => Ok(Arc::new(DiskCache::open(&config.cache_dir)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_cache_backends() {
        let dir = tempdir().unwrap();
        let mut config = CacheConfig {
            backend: CacheBackend::Memory,
            max_size: 1024,
            cache_dir: dir.path().join("cache"),
        };

        let mem = open_cache(&config).unwrap();
        mem.put("k", Bytes::from_static(b"v")).unwrap();
        assert_eq!(mem.get("k").unwrap(), Bytes::from_static(b"v"));

        config.backend = CacheBackend::Disk;
        let disk = open_cache(&config).unwrap();
        assert!(disk.is_empty());
        disk.put("k", Bytes::from_static(b"v")).unwrap();
        assert_eq!(disk.len(), 1);
        assert!(dir.path().join("cache").is_dir());
    }
}
