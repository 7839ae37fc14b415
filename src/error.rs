//! Error types for stargzfs

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while opening, resolving or reading a layer
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The blob does not end with a recognizable stargz footer
    #[error("Invalid footer: {0}")]
    InvalidFooter(String),

    #[error("Unsupported TOC version {0}")]
    UnsupportedVersion(i64),

    #[error("Malformed index: {0}")]
    MalformedIndex(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Not a regular file: {0}")]
    NotAFile(String),

    #[error("Not a symlink: {0}")]
    NotASymlink(String),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    /// A non-empty regular file without a digest can never be verified
    #[error("Missing digest for {0}")]
    MissingDigest(String),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Failure reported by the remote blob source
    #[error("Fetch failed: {0}")]
    Fetch(String),

    /// A range read past the end of the blob
    #[error("Range {offset}+{len} outside blob of {size} bytes")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map to the errno reported at the FUSE boundary
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::NotAFile(_) => libc::EISDIR,
            Error::NotASymlink(_) => libc::EINVAL,
            _ => libc::EIO,
        }
    }

    /// Whether the error is a content verification failure
    pub fn is_verification_failure(&self) -> bool {
        matches!(self, Error::DigestMismatch { .. } | Error::MissingDigest(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::NotFound("a".into()).errno(), libc::ENOENT);
        assert_eq!(Error::NotADirectory("a".into()).errno(), libc::ENOTDIR);
        assert_eq!(Error::Fetch("timeout".into()).errno(), libc::EIO);

        let mismatch = Error::DigestMismatch {
            expected: "sha256:00".into(),
            actual: "sha256:11".into(),
        };
        assert_eq!(mismatch.errno(), libc::EIO);
        assert!(mismatch.is_verification_failure());
        assert!(!Error::Fetch("x".into()).is_verification_failure());

        let range = Error::OutOfRange {
            offset: 8,
            len: 4,
            size: 10,
        };
        assert_eq!(range.errno(), libc::EIO);
        assert_eq!(range.to_string(), "Range 8+4 outside blob of 10 bytes");
    }
}
