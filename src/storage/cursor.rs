//! Cursor returned by lookups

use std::fmt;

/// Handle to one record found by a `find_*` call
///
/// A cursor names a page, a slot inside it and the generation of the page
/// when the cursor was issued. Any later eviction, split or defragmentation
/// of that page changes its generation, as does an insert that takes over a
/// slot freed by a removal. After that every call taking this cursor fails
/// with [`Error::StaleCursor`](crate::error::Error::StaleCursor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cursor {
    pub(crate) page: u64,
    pub(crate) slot: u32,
    pub(crate) generation: u64,
    pub(crate) hash: u32,
}

impl Cursor {
    /// Hash stored with the record
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Page reference (file offset, or table page index)
    pub fn page(&self) -> u64 {
        self.page
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cursor(page={}, slot={}, hash={:#010x})",
            self.page, self.slot, self.hash
        )
    }
}
