//! In-memory cache backend

use crate::error::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

use super::{BlobCache, LruCache};

/// Byte-bounded LRU cache held in process memory
pub struct MemoryCache {
    inner: Mutex<Inner>,
    max_size: u64,
}

struct Inner {
    entries: HashMap<String, Bytes>,
    lru: LruCache<String>,
    current_size: u64,
}

impl MemoryCache {
    /// Create a cache holding at most `max_size` bytes
    pub fn new(max_size: u64) -> Self {
        MemoryCache {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                lru: LruCache::new(),
                current_size: 0,
            }),
            max_size,
        }
    }

    /// Bytes currently held
    pub fn current_size(&self) -> u64 {
        self.inner.lock().current_size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }
}

impl BlobCache for MemoryCache {
    fn get(&self, key: &str) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        let data = inner.entries.get(key).cloned()?;
        inner.lru.touch(&key.to_string());
        Some(data)
    }

    fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let size = data.len() as u64;
        if size > self.max_size {
            debug!("Not caching {}: {} bytes exceeds cache size", key, size);
            return Ok(());
        }

        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.remove(key) {
            inner.current_size -= old.len() as u64;
            inner.lru.remove(&key.to_string());
        }

        while inner.current_size + size > self.max_size {
            let Some(victim) = inner.lru.pop_oldest() else {
                break;
            };
            if let Some(evicted) = inner.entries.remove(&victim) {
                inner.current_size -= evicted.len() as u64;
                debug!("Evicted {} ({} bytes)", victim, evicted.len());
            }
        }

        inner.entries.insert(key.to_string(), data);
        inner.lru.insert(key.to_string());
        inner.current_size += size;
        Ok(())
    }

    fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.lru.clear();
        inner.current_size = 0;
        Ok(())
    }
}
