//! Outer directory of an extendible hash
//!
//! A power-of-two array indexed by the top `depth` bits of a hash. A page of
//! local depth `d` owns an aligned run of `2^(depth - d)` consecutive entries;
//! those buddies all reference the same page until it splits.

use super::page::group_mask;
use crate::error::{Error, Result};

/// Directory entries referencing pages of type `R`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory<R> {
    depth: u32,
    entries: Vec<R>,
}

impl<R: Copy + Eq> Directory<R> {
    /// A depth-1 directory whose two entries share one page
    pub fn new(page: R) -> Self {
        Self {
            depth: 1,
            entries: vec![page; 2],
        }
    }

    /// Adopt existing entries; their count must be `2^depth`
    pub fn from_entries(depth: u32, entries: Vec<R>) -> Result<Self> {
        if depth > 32 || entries.len() as u64 != 1u64 << depth {
            return Err(Error::Corrupt(format!(
                "directory of {} entries cannot have depth {}",
                entries.len(),
                depth
            )));
        }
        Ok(Self { depth, entries })
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[R] {
        &self.entries
    }

    /// Directory index for `hash`
    pub fn index_of(&self, hash: u32) -> usize {
        if self.depth == 0 {
            0
        } else {
            (hash >> (32 - self.depth)) as usize
        }
    }

    pub fn get(&self, index: usize) -> Option<R> {
        self.entries.get(index).copied()
    }

    pub fn resolve(&self, hash: u32) -> R {
        self.entries[self.index_of(hash)]
    }

    /// Duplicate every entry into two adjacent entries
    ///
    /// Every hash resolves to the same page before and after.
    pub fn double(&mut self) {
        let mut doubled = Vec::with_capacity(self.entries.len() * 2);
        for &entry in &self.entries {
            doubled.push(entry);
            doubled.push(entry);
        }
        self.entries = doubled;
        self.depth += 1;
    }

    /// Entry range owned by a page of local depth `page_depth` serving `group`
    pub fn range_of(&self, page_depth: u32, group: u32) -> std::ops::Range<usize> {
        let span = 1usize << (self.depth - page_depth.min(self.depth));
        let start = self.index_of(group & group_mask(page_depth));
        start..start + span
    }

    /// Point the range of a page that split from `page_depth` at its children
    ///
    /// The directory must already be deeper than `page_depth`.
    pub fn retarget(&mut self, page_depth: u32, group: u32, low: R, high: R) {
        debug_assert!(self.depth > page_depth);
        let range = self.range_of(page_depth, group);
        let half = range.len() / 2;
        let mid = range.start + half;
        for entry in &mut self.entries[range.start..mid] {
            *entry = low;
        }
        for entry in &mut self.entries[mid..range.end] {
            *entry = high;
        }
    }

    /// Index of the next entry after `index` referencing a different page
    pub fn next_distinct(&self, index: usize) -> Option<usize> {
        let current = self.entries.get(index)?;
        (index + 1..self.entries.len()).find(|&i| self.entries[i] != *current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_directory() {
        let dir = Directory::new(7u64);
        assert_eq!(dir.depth(), 1);
        assert_eq!(dir.entries(), &[7, 7]);
        assert_eq!(dir.index_of(0x7FFF_FFFF), 0);
        assert_eq!(dir.index_of(0x8000_0000), 1);
    }

    #[test]
    fn test_doubling_is_transparent() {
        let mut dir = Directory::from_entries(2, vec![10u64, 10, 20, 30]).unwrap();
        let probes: Vec<u32> = (0..64u32).map(|i| i.wrapping_mul(0x0400_0001) ^ (i << 26)).collect();
        let before: Vec<u64> = probes.iter().map(|&h| dir.resolve(h)).collect();

        dir.double();
        assert_eq!(dir.depth(), 3);
        assert_eq!(dir.len(), 8);
        let after: Vec<u64> = probes.iter().map(|&h| dir.resolve(h)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_retarget_split_range() {
        // Page 1 at depth 1 owns the upper half of a depth-3 directory
        let mut dir = Directory::from_entries(3, vec![0u64, 0, 0, 0, 1, 1, 1, 1]).unwrap();
        assert_eq!(dir.range_of(1, 0x8000_0000), 4..8);

        dir.retarget(1, 0x8000_0000, 2, 3);
        assert_eq!(dir.entries(), &[0, 0, 0, 0, 2, 2, 3, 3]);
        assert_eq!(dir.resolve(0xA000_0000), 2);
        assert_eq!(dir.resolve(0xC000_0000), 3);
    }

    #[test]
    fn test_next_distinct_skips_buddies() {
        let dir = Directory::from_entries(2, vec![5u64, 5, 6, 7]).unwrap();
        assert_eq!(dir.next_distinct(0), Some(2));
        assert_eq!(dir.next_distinct(2), Some(3));
        assert_eq!(dir.next_distinct(3), None);
    }

    #[test]
    fn test_rejects_mismatched_depth() {
        assert!(Directory::from_entries(2, vec![1u64, 2, 3]).is_err());
    }
}
