//! Physical I/O with bounded retry and the process-wide shutdown flag
//!
//! A write that still fails after the configured retries leaves data that
//! cannot be made durable. Rather than carry on, the failure raises a flag the
//! host process polls through [`shutdown_requested`] and is returned as a hard
//! error.

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Has any store hit a condition the process must not continue past?
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

pub(crate) fn request_shutdown(reason: &str) {
    if !SHUTDOWN_REQUESTED.swap(true, Ordering::SeqCst) {
        error!(reason, "Storage engine requested shutdown");
    }
}

/// Run `op` until it succeeds or the retry budget is spent
pub(crate) fn with_retry<T>(
    policy: &RetryConfig,
    what: &str,
    mut op: impl FnMut() -> std::io::Result<T>,
) -> Result<T> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "{} failed, retrying", what
                );
                std::thread::sleep(delay);
            }
            Err(e) => {
                error!(attempts = attempt, error = %e, "{} failed permanently", what);
                request_shutdown(what);
                return Err(Error::io(what, e));
            }
        }
    }
}

pub(crate) fn read_at(file: &mut File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

pub(crate) fn write_at(file: &mut File, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    fn fast_policy(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_retry_recovers_from_transient_errors() {
        let mut calls = 0;
        let value = with_retry(&fast_policy(3), "flaky write", || {
            calls += 1;
            if calls < 3 {
                Err(IoError::new(ErrorKind::Interrupted, "transient"))
            } else {
                Ok(42)
            }
        })
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_exhaustion_requests_shutdown() {
        let mut calls = 0;
        let result: Result<()> = with_retry(&fast_policy(2), "doomed write", || {
            calls += 1;
            Err(IoError::new(ErrorKind::Other, "disk on fire"))
        });
        assert_eq!(calls, 2);
        assert!(matches!(result, Err(Error::Io { .. })));
        assert!(shutdown_requested());
    }

    #[test]
    fn test_positioned_io() {
        let mut file = tempfile::tempfile().unwrap();
        write_at(&mut file, 8, b"abcd").unwrap();
        let mut buf = [0u8; 4];
        read_at(&mut file, 8, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
        let mut head = [1u8; 8];
        read_at(&mut file, 0, &mut head).unwrap();
        assert_eq!(head, [0u8; 8]);
    }
}
