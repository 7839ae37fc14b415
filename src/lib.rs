//! stargzfs - Lazily-pulled container image layers over FUSE
//!
//! Mounts a seekable tar.gz ("stargz") layer read-only without downloading
//! it first. File contents are fetched on demand, chunk by chunk, verified
//! against the digests in the layer's table of contents, and cached.
//! Overlay whiteouts and opaque directories are presented the way
//! overlayfs expects from an upper layer.

pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod remote;
pub mod stargz;
pub mod tree;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{BlobCache, ChunkFetcher};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::fs::{Layer, LayerFs, Node};
    pub use crate::remote::BlobSource;
}
