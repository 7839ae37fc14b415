//! Configuration management for stargzfs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default in-memory cache size: 256MB
pub const DEFAULT_CACHE_SIZE: u64 = 256 * 1024 * 1024;

/// Default attribute / entry TTL handed to the kernel
pub const DEFAULT_TTL_SECS: u64 = 1;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cache configuration
    pub cache: CacheConfig,

    /// Remote fetch configuration
    pub fetch: FetchConfig,

    /// Mount configuration
    pub mount: MountConfig,

    /// Layer interpretation
    pub layer: LayerConfig,

    /// Path to the data directory
    pub data_dir: PathBuf,
}

/// Which cache backend holds verified chunks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// Byte-bounded LRU in process memory
    Memory,
    /// One file per chunk under `cache_dir`
    Disk,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Backend selection
    pub backend: CacheBackend,

    /// Maximum size in bytes (memory backend)
    pub max_size: u64,

    /// Cache directory path (disk backend)
    pub cache_dir: PathBuf,
}

/// Remote fetch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Retry attempts for failed range reads
    pub retry_attempts: u32,

    /// Base delay for exponential backoff (ms)
    pub retry_base_delay_ms: u64,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Mount point path
    pub mount_point: PathBuf,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Attribute TTL in seconds
    pub attr_timeout_secs: u64,

    /// Entry TTL in seconds
    pub entry_timeout_secs: u64,

    /// Filesystem name shown in the mount table
    pub fs_name: String,
}

/// Name of the extended attribute marking opaque directories
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OpaqueXattr {
    /// `trusted.overlay.opaque`, read by a privileged overlayfs
    #[default]
    Trusted,
    /// `user.overlay.opaque`, read by overlayfs mounted with `userxattr`
    User,
}

impl OpaqueXattr {
    pub fn name(&self) -> &'static str {
        match self {
            OpaqueXattr::Trusted => "trusted.overlay.opaque",
            OpaqueXattr::User => "user.overlay.opaque",
        }
    }
}

/// Layer interpretation configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Opaque xattr flavour
    pub opaque_xattr: OpaqueXattr,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stargzfs");

        Config {
            cache: CacheConfig {
                backend: CacheBackend::Memory,
                max_size: DEFAULT_CACHE_SIZE,
                cache_dir: data_dir.join("cache"),
            },
            fetch: FetchConfig::default(),
            mount: MountConfig::default(),
            layer: LayerConfig::default(),
            data_dir,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            retry_attempts: 3,
            retry_base_delay_ms: 200,
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::from("/mnt/stargz"),
            allow_other: false,
            attr_timeout_secs: DEFAULT_TTL_SECS,
            entry_timeout_secs: DEFAULT_TTL_SECS,
            fs_name: "stargzfs".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(cache_size) = std::env::var("STARGZFS_CACHE_SIZE") {
            if let Ok(size) = cache_size.trim().parse::<u64>() {
                self.cache.max_size = size;
            }
        }

        if let Ok(cache_dir) = std::env::var("STARGZFS_CACHE_DIR") {
            let dir = cache_dir.trim();
            if !dir.is_empty() {
                self.cache.cache_dir = PathBuf::from(dir);
            }
        }

        if let Ok(backend) = std::env::var("STARGZFS_CACHE_BACKEND") {
            match backend.trim() {
                "memory" => self.cache.backend = CacheBackend::Memory,
                "disk" => self.cache.backend = CacheBackend::Disk,
                _ => {}
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.cache.backend == CacheBackend::Memory && self.cache.max_size == 0 {
            return Err(Error::InvalidConfig(
                "Memory cache size must be greater than 0".to_string(),
            ));
        }

        if self.cache.backend == CacheBackend::Disk && self.cache.cache_dir.as_os_str().is_empty()
        {
            return Err(Error::InvalidConfig(
                "Disk cache requires a cache directory".to_string(),
            ));
        }

        if self.mount.fs_name.is_empty() {
            return Err(Error::InvalidConfig(
                "Filesystem name must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        if self.cache.backend == CacheBackend::Disk {
            std::fs::create_dir_all(&self.cache.cache_dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.layer.opaque_xattr.name(), "trusted.overlay.opaque");
    }

    #[test]
    fn test_zero_memory_cache_rejected() {
        let mut config = Config::default();
        config.cache.max_size = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        // Size is irrelevant for the disk backend
        config.cache.backend = CacheBackend::Disk;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.cache.backend = CacheBackend::Disk;
        config.cache.cache_dir = dir.path().join("cache");
        config.layer.opaque_xattr = OpaqueXattr::User;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.layer.opaque_xattr, OpaqueXattr::User);
        assert_eq!(loaded.cache.cache_dir, dir.path().join("cache"));
    }

    #[test]
    fn test_enum_wire_names() {
        let json = serde_json::to_string(&CacheBackend::Disk).unwrap();
        assert_eq!(json, "\"disk\"");
        let parsed: OpaqueXattr = serde_json::from_str("\"user\"").unwrap();
        assert_eq!(parsed.name(), "user.overlay.opaque");
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempdir().unwrap();
        let result = Config::load(dir.path().join("nope.json"));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
