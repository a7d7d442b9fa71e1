//! Storage layer
//!
//! # Architecture
//!
//! A paged extendible hash: a directory indexed by the top bits of a 32-bit
//! hash points at fixed-size pages, and each page is a small open-addressed
//! hash table over its own heap.
//!
//! ```text
//! Directory (depth 2)          Pages
//!   00 ─┐
//!   01 ─┴─→ Page A (depth 1, group 0x00000000)
//!   10 ───→ Page B (depth 2, group 0x80000000)
//!   11 ───→ Page C (depth 2, group 0xC0000000)
//!
//! Page
//!   ├─→ header        (depth, group, counts, free list, probe steps)
//!   ├─→ local slots   (EMPTY | DELETED | heap offset)
//!   ├─→ heap          (first-fit blocks, free list)
//!   └─→ CRC-32 trailer
//! ```
//!
//! When a page fills it splits on the next hash bit; when it is already as
//! deep as the directory, the directory doubles first.
//!
//! ## Stores
//!
//! - [`HashFile`]: directory file + page file, LRU page cache, write-back
//!   with retry, directory rebuild on open
//! - [`HashTable`]: pages in memory with probe statistics

pub mod cache;
pub mod cursor;
pub mod dir_file;
pub mod directory;
mod extendible;
pub mod hash_file;
pub mod hash_table;
pub mod io;
pub mod keyed;
pub mod page;
pub mod probe;

pub use cache::SlotState;
pub use cursor::Cursor;
pub use directory::Directory;
pub use hash_file::{FileStats, HashFile, OpenOutcome, VerifyReport};
pub use hash_table::{HashTable, TableStats};
pub use io::shutdown_requested;
pub use page::{InsertOutcome, Page, PageUsage};

/// CRC-32 of `bytes`, for callers that key records by byte strings
pub fn hash_key(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_key_is_crc32() {
        assert_eq!(hash_key(b""), 0);
        assert_eq!(hash_key(b"123456789"), 0xCBF4_3926);
    }
}
