//! Remote blob access
//!
//! The layer blob is only ever read through [`BlobSource`]: random-access
//! reads of the compressed bytes. Registry HTTP clients plug in here; this
//! crate ships a local file source and an in-memory one.

mod file;
mod retry;

pub use file::FileBlob;
pub use retry::RetryingBlob;

use crate::error::{Error, Result};
use bytes::Bytes;

/// Random-access reader over a compressed layer blob
///
/// Implementations must be safe to call from many threads at once; reads
/// are blocking.
pub trait BlobSource: Send + Sync {
    /// Total blob size in bytes
    fn size(&self) -> u64;

    /// Read exactly `len` bytes at `offset`
    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes>;
}

/// Check a requested range against the blob size
pub(crate) fn check_range(size: u64, offset: u64, len: usize) -> Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(Error::OutOfRange {
            offset,
            len: len as u64,
            size,
        }),
    }
}

impl BlobSource for Bytes {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        check_range(self.len() as u64, offset, len)?;
        let start = offset as usize;
        Ok(self.slice(start..start + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_source() {
        let blob = Bytes::from_static(b"hello world");
        assert_eq!(blob.size(), 11);
        assert_eq!(&blob.read_at(6, 5).unwrap()[..], b"world");
        assert_eq!(blob.read_at(11, 0).unwrap().len(), 0);
    }

    #[test]
    fn test_out_of_range() {
        let blob = Bytes::from_static(b"hello");
        assert!(matches!(blob.read_at(3, 5), Err(Error::OutOfRange { .. })));
        assert!(matches!(
            blob.read_at(u64::MAX, 2),
            Err(Error::OutOfRange { offset: u64::MAX, .. })
        ));
    }
}
