//! Directory-backed cache
//!
//! Layout: `<root>/<algorithm>/<hex>` for digest keys and
//! `<root>/raw/<hex of key>` for anything else. Writes land in
//! `<root>/tmp/` first and are renamed into place.

use crate::crypto::Digest;
use crate::error::Result;
use bytes::Bytes;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use super::BlobCache;

const TMP_DIR: &str = "tmp";
const RAW_DIR: &str = "raw";

/// One file per cached entry
pub struct DiskCache {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl DiskCache {
    /// Open (creating if needed) a cache rooted at `root`
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join(TMP_DIR))?;
        debug!("Disk cache at {}", root.display());
        Ok(DiskCache {
            root,
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        match key.parse::<Digest>() {
            Ok(digest) => self.root.join(digest.algorithm()).join(digest.hex()),
            Err(_) => self.root.join(RAW_DIR).join(hex::encode(key)),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(TMP_DIR)
            .join(format!("{}-{}", std::process::id(), n))
    }

    fn entry_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_name() != TMP_DIR && entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }
}

impl BlobCache for DiskCache {
    fn get(&self, key: &str) -> Option<Bytes> {
        let path = self.path_for(key);
        match std::fs::read(&path) {
            Ok(data) => Some(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Failed to read cache entry {}: {}", path.display(), e);
                None
            }
        }
    }

    fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = self.tmp_path();
        let written = std::fs::File::create(&tmp)
            .and_then(|mut f| f.write_all(&data).and_then(|_| f.sync_data()))
            .and_then(|_| std::fs::rename(&tmp, &path));

        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn len(&self) -> usize {
        let dirs = match self.entry_dirs() {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!("Failed to list cache {}: {}", self.root.display(), e);
                return 0;
            }
        };
        dirs.iter()
            .filter_map(|d| std::fs::read_dir(d).ok())
            .map(|entries| entries.filter_map(|e| e.ok()).count())
            .sum()
    }

    fn clear(&self) -> Result<()> {
        for dir in self.entry_dirs()? {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_digest_key_layout() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).unwrap();

        let digest = Digest::sha256(b"test");
        cache
            .put(&digest.to_string(), Bytes::from_static(b"test"))
            .unwrap();

        let expected = dir.path().join("sha256").join(digest.hex());
        assert_eq!(std::fs::read(expected).unwrap(), b"test");
        assert_eq!(
            cache.get(&digest.to_string()).unwrap(),
            Bytes::from_static(b"test")
        );
    }

    #[test]
    fn test_raw_key_layout() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).unwrap();

        cache.put("some/key", Bytes::from_static(b"x")).unwrap();
        assert!(dir.path().join("raw").join(hex::encode("some/key")).exists());
        assert_eq!(cache.get("some/key").unwrap(), Bytes::from_static(b"x"));
    }

    #[test]
    fn test_miss_and_len() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).unwrap();

        assert!(cache.get("absent").is_none());
        assert!(cache.is_empty());

        cache.put("a", Bytes::from_static(b"1")).unwrap();
        cache.put("b", Bytes::from_static(b"2")).unwrap();
        cache.put("a", Bytes::from_static(b"3")).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").unwrap(), Bytes::from_static(b"3"));
    }

    #[test]
    fn test_no_temp_files_left() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).unwrap();
        cache.put("a", Bytes::from_static(b"1")).unwrap();

        let leftovers = std::fs::read_dir(dir.path().join("tmp")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_clear_and_reopen() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).unwrap();
        cache.put("a", Bytes::from_static(b"1")).unwrap();

        let reopened = DiskCache::open(dir.path()).unwrap();
        assert_eq!(reopened.get("a").unwrap(), Bytes::from_static(b"1"));

        reopened.clear().unwrap();
        assert!(reopened.is_empty());
        assert!(cache.get("a").is_none());
    }
}
