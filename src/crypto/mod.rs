//! Content verification
//!
//! Every byte served from a lazily-fetched layer is checked against the
//! SHA-256 recorded in the table of contents.

mod digest;

pub use digest::{Digest, DigestWriter, SHA256_PREFIX};
