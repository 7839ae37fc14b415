//! Content digests in `algorithm:hex` form
//!
//! Only `sha256` is accepted. Digests are compared against the SHA-256 of
//! uncompressed file or chunk bytes before anything is handed to a reader.

use crate::error::{Error, Result};
use ring::digest::{Context, SHA256, SHA256_OUTPUT_LEN};
use std::fmt;
use std::str::FromStr;

/// Algorithm prefix for SHA-256 digests
pub const SHA256_PREFIX: &str = "sha256";

/// A parsed content digest
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    bytes: [u8; SHA256_OUTPUT_LEN],
}

impl Digest {
    /// Compute the SHA-256 digest of `data`
    pub fn sha256(data: &[u8]) -> Self {
        let mut ctx = Context::new(&SHA256);
        ctx.update(data);
        Self::from_ring(ctx.finish())
    }

    fn from_ring(d: ring::digest::Digest) -> Self {
        let mut bytes = [0u8; SHA256_OUTPUT_LEN];
        bytes.copy_from_slice(d.as_ref());
        Digest { bytes }
    }

    /// Algorithm name
    pub fn algorithm(&self) -> &'static str {
        SHA256_PREFIX
    }

    /// Lowercase hex of the digest value
    pub fn hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Check `data` against this digest
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let actual = Digest::sha256(data);
        if actual != *self {
            return Err(Error::DigestMismatch {
                expected: self.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", SHA256_PREFIX, self.hex())
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, value) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidDigest(format!("missing algorithm in {:?}", s)))?;

        if algorithm != SHA256_PREFIX {
            return Err(Error::InvalidDigest(format!(
                "unsupported algorithm {:?}",
                algorithm
            )));
        }

        let decoded =
            hex::decode(value).map_err(|e| Error::InvalidDigest(format!("{}: {}", s, e)))?;
        if decoded.len() != SHA256_OUTPUT_LEN {
            return Err(Error::InvalidDigest(format!(
                "{}: expected {} bytes, got {}",
                s,
                SHA256_OUTPUT_LEN,
                decoded.len()
            )));
        }

        let mut bytes = [0u8; SHA256_OUTPUT_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Digest { bytes })
    }
}

/// Incremental SHA-256 over several buffers
pub struct DigestWriter {
    ctx: Context,
}

impl DigestWriter {
    pub fn new() -> Self {
        DigestWriter {
            ctx: Context::new(&SHA256),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.ctx.update(data);
    }

    pub fn finish(self) -> Digest {
        Digest::from_ring(self.ctx.finish())
    }
}

impl Default for DigestWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("test")
    const TEST_DIGEST: &str =
        "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn test_parse_and_display() {
        let d: Digest = TEST_DIGEST.parse().unwrap();
        assert_eq!(d.to_string(), TEST_DIGEST);
        assert_eq!(d.algorithm(), "sha256");
        assert_eq!(d, Digest::sha256(b"test"));
    }

    #[test]
    fn test_verify() {
        let d: Digest = TEST_DIGEST.parse().unwrap();
        assert!(d.verify(b"test").is_ok());

        match d.verify(b"tset") {
            Err(Error::DigestMismatch { expected, actual }) => {
                assert_eq!(expected, TEST_DIGEST);
                assert_eq!(actual, Digest::sha256(b"tset").to_string());
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_reject_bad_digests() {
        assert!("9f86d081".parse::<Digest>().is_err());
        assert!("md5:9f86d081884c7d659a2feaa0c55ad015".parse::<Digest>().is_err());
        assert!("sha256:zz".parse::<Digest>().is_err());
        assert!("sha256:9f86".parse::<Digest>().is_err());
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut w = DigestWriter::new();
        w.update(b"te");
        w.update(b"st");
        assert_eq!(w.finish(), Digest::sha256(b"test"));
    }
}
