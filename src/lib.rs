// hashstore - paged extendible-hashing record store
// Variable-length records keyed by 32-bit hashes, on disk or in memory

#![warn(rust_2018_idioms)]

pub mod config;
pub mod storage;

// Re-exports for convenience
pub use config::{RetryConfig, StoreConfig, TableConfig};
pub use storage::{hash_key, Cursor, HashFile, HashTable, OpenOutcome};

/// hashstore error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Hash {hash:#010x} does not belong to page (depth {depth}, group {group:#010x})")]
        Illegal { hash: u32, depth: u32, group: u32 },

        #[error("Page for hash {hash:#010x} is full at maximum depth")]
        PageFull { hash: u32 },

        #[error("Record of {len} bytes exceeds the {max} byte limit")]
        RecordTooLarge { len: usize, max: usize },

        #[error("Update length {actual} does not match stored length {expected}")]
        LengthMismatch { expected: usize, actual: usize },

        #[error("Cursor no longer refers to a loaded page")]
        StaleCursor,

        #[error("Corrupt store: {0}")]
        Corrupt(String),

        #[error("I/O error while {context}: {source}")]
        Io {
            context: String,
            #[source]
            source: std::io::Error,
        },

        #[error("Store is poisoned by an earlier fatal error")]
        Poisoned,

        #[error("Configuration error: {0}")]
        Config(String),
    }

    impl Error {
        pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
            Self::Io {
                context: context.into(),
                source,
            }
        }

        /// Errors after which the engine must not continue.
        pub fn is_fatal(&self) -> bool {
            matches!(
                self,
                Self::Illegal { .. } | Self::Corrupt(_) | Self::Io { .. } | Self::Poisoned
            )
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        let _version: &str = VERSION;
    }

    #[test]
    fn test_fatal_classification() {
        assert!(error::Error::Poisoned.is_fatal());
        assert!(error::Error::Corrupt("bad".into()).is_fatal());
        assert!(!error::Error::StaleCursor.is_fatal());
        assert!(!error::Error::RecordTooLarge { len: 10, max: 5 }.is_fatal());
    }
}
