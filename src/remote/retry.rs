//! Retry policy for remote range reads
//!
//! Transient fetch failures are retried with exponential backoff. The
//! filesystem core never retries on its own; wrapping a source in
//! [`RetryingBlob`] is the only place retries happen.

use crate::config::FetchConfig;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::time::Duration;
use tracing::{error, warn};

use super::BlobSource;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Wraps a source and retries failed reads
pub struct RetryingBlob<B> {
    inner: B,
    base_delay: Duration,
    max_retries: u32,
}

impl<B: BlobSource> RetryingBlob<B> {
    pub fn new(inner: B, config: &FetchConfig) -> Self {
        RetryingBlob {
            inner,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_retries: config.retry_attempts,
        }
    }

    pub fn into_inner(self) -> B {
        self.inner
    }

    /// Sleep before retry number `retry` (zero-based), doubling each time
    fn delay(&self, retry: u32) -> Duration {
        (self.base_delay * 2u32.saturating_pow(retry)).min(MAX_RETRY_DELAY)
    }
}

/// Transport failures; everything else is deterministic
fn is_retryable(e: &Error) -> bool {
    matches!(e, Error::Io(_) | Error::Fetch(_))
}

impl<B: BlobSource> BlobSource for RetryingBlob<B> {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let mut retry = 0;
        loop {
            match self.inner.read_at(offset, len) {
                Ok(data) => return Ok(data),
                Err(e) if is_retryable(&e) && retry < self.max_retries => {
                    let delay = self.delay(retry);
                    warn!("Range read {}+{} failed, retrying in {:?}: {}", offset, len, delay, e);
                    std::thread::sleep(delay);
                    retry += 1;
                }
                Err(e) => {
                    if retry > 0 {
                        error!("Range read {}+{} failed after {} retries: {}", offset, len, retry, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FlakyBlob;

    fn config(retry_attempts: u32, retry_base_delay_ms: u64) -> FetchConfig {
        FetchConfig {
            retry_attempts,
            retry_base_delay_ms,
        }
    }

    #[test]
    fn test_retry_recovers_from_transient_failures() {
        let flaky = FlakyBlob::new(Bytes::from_static(b"payload"), 2);
        let blob = RetryingBlob::new(flaky, &config(3, 1));

        assert_eq!(&blob.read_at(0, 7).unwrap()[..], b"payload");
        assert_eq!(blob.into_inner().attempts(), 3);
    }

    #[test]
    fn test_retry_gives_up() {
        let flaky = FlakyBlob::new(Bytes::from_static(b"payload"), 10);
        let blob = RetryingBlob::new(flaky, &config(2, 1));

        assert!(matches!(blob.read_at(0, 7), Err(Error::Fetch(_))));
        assert_eq!(blob.into_inner().attempts(), 3);
    }

    #[test]
    fn test_out_of_range_not_retried() {
        // Would sleep for seconds if the bad range were retried
        let flaky = FlakyBlob::new(Bytes::from_static(b"abc"), 0);
        let blob = RetryingBlob::new(flaky, &config(5, 1_000));

        assert!(matches!(blob.read_at(2, 5), Err(Error::OutOfRange { .. })));
        assert_eq!(blob.into_inner().attempts(), 1);
    }

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let blob = RetryingBlob::new(Bytes::new(), &config(3, 100));
        assert_eq!(blob.delay(0), Duration::from_millis(100));
        assert_eq!(blob.delay(2), Duration::from_millis(400));
        assert_eq!(blob.delay(40), MAX_RETRY_DELAY);
    }
}
