//! Cache-backed, verified fetching with a per-key in-flight guard

use crate::crypto::Digest;
use crate::error::Result;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::BlobCache;

/// Counters reported by [`ChunkFetcher::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub hits: u64,
    pub misses: u64,
    /// Remote fetches actually performed
    pub fetches: u64,
    /// Fetches that failed or did not verify
    pub failures: u64,
}

/// Per-key slot shared by every caller waiting on one digest
type Slot = Arc<Mutex<Option<Bytes>>>;

/// Deduplicates concurrent fetches of the same content
///
/// Concurrent callers asking for one digest serialize on that digest's
/// slot. The first performs the fetch and leaves the verified bytes in the
/// slot, so the rest are served even if the cache declined or evicted the
/// entry. The slot goes away with its last caller. Different digests never
/// wait on each other.
pub struct ChunkFetcher {
    cache: Arc<dyn BlobCache>,
    in_flight: DashMap<String, Slot>,
    verify_hits: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    failures: AtomicU64,
}

impl ChunkFetcher {
    pub fn new(cache: Arc<dyn BlobCache>) -> Self {
        ChunkFetcher {
            cache,
            in_flight: DashMap::new(),
            verify_hits: false,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Re-verify cached bytes on every hit (for caches outside our process)
    pub fn verify_hits(mut self, verify: bool) -> Self {
        self.verify_hits = verify;
        self
    }

    pub fn cache(&self) -> &Arc<dyn BlobCache> {
        &self.cache
    }

    /// Return the content for `digest`, fetching and verifying on a miss
    ///
    /// Bytes returned have always matched `digest`. Nothing is cached when
    /// `fetch` fails or its output does not verify.
    pub fn get_or_fetch<F>(&self, digest: &Digest, fetch: F) -> Result<Bytes>
    where
        F: FnOnce() -> Result<Bytes>,
    {
        let key = digest.to_string();

        if let Some(data) = self.cached(&key, digest) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(data);
        }

        let slot = self
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();

        let result = {
            let mut done = slot.lock();
            self.fetch_locked(&key, digest, &mut done, fetch)
        };

        drop(slot);
        self.in_flight
            .remove_if(&key, |_, slot| Arc::strong_count(slot) == 1);

        result
    }

    fn fetch_locked<F>(
        &self,
        key: &str,
        digest: &Digest,
        done: &mut Option<Bytes>,
        fetch: F,
    ) -> Result<Bytes>
    where
        F: FnOnce() -> Result<Bytes>,
    {
        // Another caller may have finished while we waited
        if let Some(data) = done.as_ref() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(data.clone());
        }
        if let Some(data) = self.cached(key, digest) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(data);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.fetches.fetch_add(1, Ordering::Relaxed);
        debug!("Fetching {}", key);

        let data = match fetch().and_then(|data| digest.verify(&data).map(|_| data)) {
            Ok(data) => data,
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                if e.is_verification_failure() {
                    error!("Verification failed for {}: {}", key, e);
                } else {
                    warn!("Fetch failed for {}: {}", key, e);
                }
                return Err(e);
            }
        };

        if let Err(e) = self.cache.put(key, data.clone()) {
            warn!("Failed to cache {}: {}", key, e);
        }
        *done = Some(data.clone());
        Ok(data)
    }

    fn cached(&self, key: &str, digest: &Digest) -> Option<Bytes> {
        let data = self.cache.get(key)?;
        if self.verify_hits && digest.verify(&data).is_err() {
            warn!("Discarding corrupt cache entry {}", key);
            return None;
        }
        Some(data)
    }

    pub fn stats(&self) -> FetchStats {
        FetchStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
