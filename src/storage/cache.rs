//! LRU page cache for file-backed stores
//!
//! Holds a fixed number of pages keyed by file offset. Recency is tracked by
//! the `lru` crate's queue rather than a wrapping age counter. The cache is
//! passive: loading, flushing and eviction I/O are driven by the owning
//! [`HashFile`](super::HashFile).

use super::page::Page;
use lru::LruCache;
use std::num::NonZeroUsize;

/// Write-back state of a cached page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Matches the page file
    Clean,
    /// Checksum attached, physical write still pending
    Unwritten,
    /// Modified since the last checksum
    Unprotected,
}

impl SlotState {
    pub fn is_dirty(self) -> bool {
        self != SlotState::Clean
    }
}

pub(crate) struct CachedPage {
    pub page: Page,
    pub state: SlotState,
    pub generation: u64,
}

pub(crate) struct PageCache {
    slots: LruCache<u64, CachedPage>,
    next_generation: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            slots: LruCache::new(capacity),
            next_generation: 1,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.cap().get()
    }

    /// Probe for a page, counting the hit or miss
    pub fn lookup(&mut self, offset: u64) -> bool {
        if self.slots.contains(&offset) {
            self.hits += 1;
            true
        } else {
            self.misses += 1;
            false
        }
    }

    /// Borrow a page and mark it most recently used
    pub fn get_mut(&mut self, offset: u64) -> Option<&mut CachedPage> {
        self.slots.get_mut(&offset)
    }

    /// Borrow without touching recency
    pub fn peek(&self, offset: u64) -> Option<&CachedPage> {
        self.slots.peek(&offset)
    }

    pub fn peek_mut(&mut self, offset: u64) -> Option<&mut CachedPage> {
        self.slots.peek_mut(&offset)
    }

    /// Least recently used page, once the cache is full
    pub fn victim(&self) -> Option<u64> {
        if self.slots.len() < self.capacity() {
            return None;
        }
        self.slots.peek_lru().map(|(&offset, _)| offset)
    }

    /// Add a page under a fresh generation. The caller makes room first.
    pub fn insert(&mut self, offset: u64, page: Page, state: SlotState) -> u64 {
        let generation = self.bump();
        self.slots.put(
            offset,
            CachedPage {
                page,
                state,
                generation,
            },
        );
        generation
    }

    pub fn evict(&mut self, offset: u64) -> Option<CachedPage> {
        let evicted = self.slots.pop(&offset);
        if evicted.is_some() {
            self.evictions += 1;
        }
        evicted
    }

    /// Drop a page that is being replaced, without counting an eviction
    pub fn discard(&mut self, offset: u64) -> Option<CachedPage> {
        self.slots.pop(&offset)
    }

    /// Mark a page modified; `renumbered` issues a new generation
    pub fn mark_dirty(&mut self, offset: u64, renumbered: bool) -> bool {
        let generation = if renumbered { Some(self.bump()) } else { None };
        match self.slots.peek_mut(&offset) {
            Some(slot) => {
                slot.state = SlotState::Unprotected;
                if let Some(generation) = generation {
                    slot.generation = generation;
                }
                true
            }
            None => false,
        }
    }

    /// Offsets of dirty pages, least recently used first
    pub fn dirty_offsets(&self) -> Vec<u64> {
        self.slots
            .iter()
            .rev()
            .filter(|(_, slot)| slot.state.is_dirty())
            .map(|(&offset, _)| offset)
            .collect()
    }

    pub fn counters(&self) -> (u64, u64, u64) {
        (self.hits, self.misses, self.evictions)
    }

    fn bump(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::probe::PROBE_STEPS;

    fn page() -> Page {
        Page::empty(4096, 0, 0, PROBE_STEPS)
    }

    #[test]
    fn test_victim_only_when_full() {
        let mut cache = PageCache::new(2);
        cache.insert(0, page(), SlotState::Clean);
        assert_eq!(cache.victim(), None);
        cache.insert(4096, page(), SlotState::Clean);
        assert_eq!(cache.victim(), Some(0));

        // Touching page 0 makes page 4096 the oldest
        assert!(cache.get_mut(0).is_some());
        assert_eq!(cache.victim(), Some(4096));
    }

    #[test]
    fn test_generations_are_unique() {
        let mut cache = PageCache::new(4);
        let a = cache.insert(0, page(), SlotState::Clean);
        let b = cache.insert(4096, page(), SlotState::Clean);
        assert_ne!(a, b);

        assert!(cache.mark_dirty(0, false));
        assert_eq!(cache.peek(0).map(|s| s.generation), Some(a));
        assert!(cache.mark_dirty(0, true));
        let moved = cache.peek(0).map(|s| s.generation).unwrap();
        assert!(moved > b);

        cache.evict(0);
        let reloaded = cache.insert(0, page(), SlotState::Clean);
        assert!(reloaded > moved);
    }

    #[test]
    fn test_dirty_offsets_lru_first() {
        let mut cache = PageCache::new(4);
        cache.insert(0, page(), SlotState::Unprotected);
        cache.insert(4096, page(), SlotState::Clean);
        cache.insert(8192, page(), SlotState::Unwritten);
        assert_eq!(cache.dirty_offsets(), vec![0, 8192]);

        cache.get_mut(0);
        assert_eq!(cache.dirty_offsets(), vec![8192, 0]);
    }

    #[test]
    fn test_counters() {
        let mut cache = PageCache::new(1);
        assert!(!cache.lookup(0));
        cache.insert(0, page(), SlotState::Clean);
        assert!(cache.lookup(0));
        cache.evict(0);
        cache.discard(0);
        assert_eq!(cache.counters(), (1, 1, 1));
        assert_eq!(cache.len(), 0);
    }
}
