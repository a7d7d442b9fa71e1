//! Hash page: local open-addressed directory plus heap allocator
//!
//! A page is a fixed-size byte buffer. All access goes through typed accessors
//! that compute and bounds-check offsets, so nothing outside this module ever
//! holds a pointer into the buffer.
//!
//! # Layout
//!
//! ```text
//! Offset          Size        Field
//! ------          ----        -----------------------------------------
//! 0               4           depth          committed high hash bits (0-32)
//! 4               4           dir_size       local directory slots (prime)
//! 8               4           hash_group     hash prefix served by this page
//! 12              4           record_count   live records
//! 16              4           empty_slots    slots never used since build
//! 20              4           free_list      offset of first free block (0 = none)
//! 24              4           flags          bit 0: trailer holds a checksum
//! 28              32          probe steps    16 x u16, shuffled per page
//! 60              4*dir_size  directory      0 = EMPTY, 1 = DELETED, else block offset
//! heap_start      ...         heap           allocated and free blocks
//! size-4          4           trailer        CRC-32 of bytes [0, size-4) when sealed, else 0
//! ```
//!
//! The sealed flag is itself covered by the checksum, so a sealed page whose
//! trailer was lost to a torn write is rejected instead of read as unsealed.
//!
//! Heap blocks are 4-byte aligned and at least [`MIN_BLOCK_SIZE`] bytes:
//!
//! ```text
//! allocated: [block_size u32][hash u32][record_len u32][record bytes ...]
//! free:      [block_size u32][next_free u32][zeroes ...]
//! ```
//!
//! Allocated and free blocks exactly tile the heap. Free blocks are never
//! coalesced; defragmentation rebuilds the page instead.

use super::probe::{is_prime, next_prime, prev_prime};
use crate::error::{Error, Result};
use std::collections::HashSet;

/// Bytes of page header before the local directory
pub const HEADER_SIZE: usize = 60;

/// Bytes of checksum trailer at the end of the page
pub const TRAILER_SIZE: usize = 4;

/// Smallest heap block, allocated or free
pub const MIN_BLOCK_SIZE: usize = 16;

const SLOT_SIZE: usize = 4;
const NODE_HEADER: usize = 12;
const MIN_DIR_SIZE: u32 = 17;

/// Record size assumed when sizing the directory of an empty page
const DEFAULT_RECORD_LEN: usize = 64;

const SLOT_EMPTY: u32 = 0;
const SLOT_DELETED: u32 = 1;
const NIL: u32 = 0;

const OFF_DEPTH: usize = 0;
const OFF_DIR_SIZE: usize = 4;
const OFF_HASH_GROUP: usize = 8;
const OFF_RECORD_COUNT: usize = 12;
const OFF_EMPTY_SLOTS: usize = 16;
const OFF_FREE_LIST: usize = 20;
const OFF_FLAGS: usize = 24;
const OFF_PROBES: usize = 28;

const FLAG_SEALED: u32 = 1;

/// Mask selecting the `depth` high bits of a hash
pub fn group_mask(depth: u32) -> u32 {
    if depth == 0 {
        0
    } else {
        u32::MAX << (32 - depth.min(32))
    }
}

/// Heap bytes consumed by a record of `len` bytes
pub fn block_size_for(len: usize) -> usize {
    align4(NODE_HEADER + len).max(MIN_BLOCK_SIZE)
}

/// Longest record a page of `page_size` bytes can hold on its own
pub fn max_record_len(page_size: usize) -> usize {
    page_size
        .saturating_sub(HEADER_SIZE + TRAILER_SIZE + MIN_DIR_SIZE as usize * SLOT_SIZE)
        .saturating_sub(NODE_HEADER)
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Directory size for a page holding `live` records totalling `live_bytes`
/// heap bytes.
///
/// Aims for a 3/4 directory fill once the heap is exhausted at the current
/// average block size, keeps at least 1/6 headroom over `live`, and shrinks
/// the directory when the heap would not otherwise fit. `None` when the
/// records cannot fit in a page of this size at all.
pub fn target_dir_size(page_size: usize, live: usize, live_bytes: usize) -> Option<u32> {
    let usable = page_size.checked_sub(HEADER_SIZE + TRAILER_SIZE)?;
    let heap_needed = live_bytes.max(MIN_BLOCK_SIZE);
    if heap_needed > usable {
        return None;
    }

    let avg = if live == 0 {
        block_size_for(DEFAULT_RECORD_LEN)
    } else {
        (live_bytes / live).max(MIN_BLOCK_SIZE)
    };
    let ideal = usable * 4 / (avg * 3 + 16);
    let floor = (live + live / 6 + 2).max(MIN_DIR_SIZE as usize);
    let max_dir = u32::try_from((usable - heap_needed) / SLOT_SIZE).ok()?;

    let want = next_prime(u32::try_from(ideal.max(floor)).ok()?);
    let dir = if want <= max_dir {
        want
    } else {
        prev_prime(max_dir)?
    };
    if (dir as usize) < live.max(1) {
        return None;
    }
    Some(dir)
}

/// Result of a page-local insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// `reused` when the slot last held a removed record
    Inserted { slot: u32, reused: bool },
    /// Inserted after rebuilding the page; every earlier slot number is void
    Defragmented { slot: u32 },
    /// No directory slot or heap block available
    Full,
    /// The hash is outside this page's group
    Illegal,
}

/// Result of a probe walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookup {
    pub slot: Option<u32>,
    /// Directory slots inspected
    pub probes: u32,
}

/// Space accounting for one page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageUsage {
    pub records: u32,
    pub dir_size: u32,
    pub empty_slots: u32,
    pub live_bytes: usize,
    pub free_bytes: usize,
}

/// One fixed-size hash page
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    buf: Vec<u8>,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("size", &self.buf.len())
            .field("depth", &self.depth())
            .field("hash_group", &format_args!("{:#010x}", self.hash_group()))
            .field("dir_size", &self.dir_size())
            .field("records", &self.record_count())
            .finish()
    }
}

impl Page {
    /// Create an empty page with an explicit directory size
    ///
    /// The heap starts out as a single free block.
    pub fn new(page_size: usize, depth: u32, hash_group: u32, dir_size: u32, steps: [u16; 16]) -> Self {
        let mut page = Self {
            buf: vec![0u8; page_size],
        };
        page.set_u32(OFF_DEPTH, depth);
        page.set_u32(OFF_DIR_SIZE, dir_size);
        page.set_u32(OFF_HASH_GROUP, hash_group & group_mask(depth));
        page.set_u32(OFF_RECORD_COUNT, 0);
        page.set_u32(OFF_EMPTY_SLOTS, dir_size);
        for (i, step) in steps.iter().enumerate() {
            let off = OFF_PROBES + i * 2;
            page.buf[off..off + 2].copy_from_slice(&step.to_le_bytes());
        }

        let start = page.heap_start();
        let size = page.heap_end() - start;
        page.set_u32(start, size as u32);
        page.set_u32(start + 4, NIL);
        page.set_u32(OFF_FREE_LIST, start as u32);
        page
    }

    /// Create an empty page sized for records of typical length
    pub fn empty(page_size: usize, depth: u32, hash_group: u32, steps: [u16; 16]) -> Self {
        let dir_size = target_dir_size(page_size, 0, 0).unwrap_or(MIN_DIR_SIZE);
        Self::new(page_size, depth, hash_group, dir_size, steps)
    }

    /// Adopt a buffer read from disk, verifying checksum and structure
    pub fn from_bytes(buf: Vec<u8>, verify_checksum: bool) -> Result<Self> {
        if buf.len() < HEADER_SIZE + TRAILER_SIZE + MIN_BLOCK_SIZE || buf.len() % 4 != 0 {
            return Err(Error::Corrupt(format!("page buffer of {} bytes", buf.len())));
        }
        let page = Self { buf };
        if verify_checksum && !page.checksum_matches() {
            return Err(Error::Corrupt(format!(
                "checksum mismatch on page (depth {}, group {:#010x})",
                page.depth(),
                page.hash_group()
            )));
        }
        page.check_integrity()?;
        Ok(page)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn page_size(&self) -> usize {
        self.buf.len()
    }

    pub fn depth(&self) -> u32 {
        self.u32_at(OFF_DEPTH)
    }

    pub fn dir_size(&self) -> u32 {
        self.u32_at(OFF_DIR_SIZE)
    }

    pub fn hash_group(&self) -> u32 {
        self.u32_at(OFF_HASH_GROUP)
    }

    pub fn record_count(&self) -> u32 {
        self.u32_at(OFF_RECORD_COUNT)
    }

    pub fn empty_slots(&self) -> u32 {
        self.u32_at(OFF_EMPTY_SLOTS)
    }

    pub fn steps(&self) -> [u16; 16] {
        let mut steps = [0u16; 16];
        for (i, step) in steps.iter_mut().enumerate() {
            let off = OFF_PROBES + i * 2;
            *step = u16::from_le_bytes([self.buf[off], self.buf[off + 1]]);
        }
        steps
    }

    /// Does `hash` fall in the group this page serves?
    pub fn belongs(&self, hash: u32) -> bool {
        hash & group_mask(self.depth()) == self.hash_group()
    }

    /// Insert a record, defragmenting first when tombstones crowd the directory
    pub fn insert(&mut self, hash: u32, record: &[u8]) -> InsertOutcome {
        if !self.belongs(hash) {
            return InsertOutcome::Illegal;
        }
        let need = block_size_for(record.len());

        let mut defragmented = false;
        if u64::from(self.empty_slots()) * 7 < u64::from(self.dir_size()) {
            defragmented = self.defragment(need, false);
        }

        loop {
            match self.place(hash, record, need) {
                Some((slot, _)) if defragmented => return InsertOutcome::Defragmented { slot },
                Some((slot, reused)) => return InsertOutcome::Inserted { slot, reused },
                None if !defragmented && self.defragment(need, true) => defragmented = true,
                None => return InsertOutcome::Full,
            }
        }
    }

    /// Release the record in `slot`. Returns `false` if the slot was not live.
    pub fn remove(&mut self, slot: u32) -> bool {
        let Some(off) = self.live_offset(slot) else {
            return false;
        };
        let size = self.u32_at(off) as usize;
        self.buf[off + 4..off + size].fill(0);
        let head = self.u32_at(OFF_FREE_LIST);
        self.set_u32(off + 4, head);
        self.set_u32(OFF_FREE_LIST, off as u32);
        self.set_slot(slot, SLOT_DELETED);
        let count = self.record_count();
        self.set_u32(OFF_RECORD_COUNT, count.saturating_sub(1));
        true
    }

    /// First slot holding `hash`
    pub fn find_first(&self, hash: u32) -> Lookup {
        let (home, step) = self.probe_params(hash);
        self.walk(home, home, step, hash)
    }

    /// Next slot after `prev_slot` in the probe sequence holding `hash`
    pub fn find_next(&self, prev_slot: u32, hash: u32) -> Lookup {
        let dir = self.dir_size();
        if prev_slot >= dir {
            return Lookup {
                slot: None,
                probes: 0,
            };
        }
        let (home, step) = self.probe_params(hash);
        let next = (prev_slot + step) % dir;
        if next == home {
            return Lookup {
                slot: None,
                probes: 0,
            };
        }
        self.walk(next, home, step, hash)
    }

    /// Record bytes stored in `slot`
    pub fn record(&self, slot: u32) -> Option<&[u8]> {
        let off = self.live_offset(slot)?;
        let len = self.u32_at(off + 8) as usize;
        Some(&self.buf[off + NODE_HEADER..off + NODE_HEADER + len])
    }

    /// Hash stored with the record in `slot`
    pub fn record_hash(&self, slot: u32) -> Option<u32> {
        self.live_offset(slot).map(|off| self.u32_at(off + 4))
    }

    /// Overwrite the record in `slot` with bytes of the same length
    pub fn update(&mut self, slot: u32, bytes: &[u8]) -> Result<()> {
        let off = self.live_offset(slot).ok_or(Error::StaleCursor)?;
        let len = self.u32_at(off + 8) as usize;
        if len != bytes.len() {
            return Err(Error::LengthMismatch {
                expected: len,
                actual: bytes.len(),
            });
        }
        self.buf[off + NODE_HEADER..off + NODE_HEADER + len].copy_from_slice(bytes);
        Ok(())
    }

    /// First live slot at or after `from`
    pub fn next_live_slot(&self, from: u32) -> Option<u32> {
        (from..self.dir_size()).find(|&slot| self.live_offset(slot).is_some())
    }

    /// Iterate `(slot, hash, record)` over every live record
    pub fn records(&self) -> impl Iterator<Item = (u32, u32, &[u8])> + '_ {
        (0..self.dir_size()).filter_map(move |slot| {
            let hash = self.record_hash(slot)?;
            let record = self.record(slot)?;
            Some((slot, hash, record))
        })
    }

    /// Partition the live records into two children one bit deeper
    ///
    /// The low child keeps this page's group, the high child sets the new bit.
    /// A record that belongs to neither child means the page is corrupt.
    pub fn split(&self, new_depth: u32, low_steps: [u16; 16], high_steps: [u16; 16]) -> Result<(Page, Page)> {
        if new_depth != self.depth() + 1 || new_depth > 32 {
            return Err(Error::Corrupt(format!(
                "cannot split page at depth {} to depth {}",
                self.depth(),
                new_depth
            )));
        }
        let bit = 1u32 << (32 - new_depth);
        let low_group = self.hash_group();
        let high_group = self.hash_group() | bit;

        let usage = self.usage();
        let dir_size = target_dir_size(self.page_size(), usage.records as usize, usage.live_bytes)
            .unwrap_or_else(|| self.dir_size());
        let mut low = Page::new(self.page_size(), new_depth, low_group, dir_size, low_steps);
        let mut high = Page::new(self.page_size(), new_depth, high_group, dir_size, high_steps);

        for (_, hash, record) in self.records() {
            let child = if low.belongs(hash) {
                &mut low
            } else if high.belongs(hash) {
                &mut high
            } else {
                return Err(Error::Corrupt(format!(
                    "record hash {:#010x} outside page group {:#010x} at depth {}",
                    hash,
                    self.hash_group(),
                    self.depth()
                )));
            };
            if child.place(hash, record, block_size_for(record.len())).is_none() {
                return Err(Error::Corrupt(format!(
                    "split child of group {:#010x} overflowed",
                    child.hash_group()
                )));
            }
        }
        Ok((low, high))
    }

    pub fn usage(&self) -> PageUsage {
        let live_bytes = (0..self.dir_size())
            .filter_map(|slot| self.live_offset(slot))
            .map(|off| self.u32_at(off) as usize)
            .sum();
        let mut free_bytes = 0;
        let mut cur = self.u32_at(OFF_FREE_LIST);
        while cur != NIL {
            free_bytes += self.u32_at(cur as usize) as usize;
            cur = self.u32_at(cur as usize + 4);
        }
        PageUsage {
            records: self.record_count(),
            dir_size: self.dir_size(),
            empty_slots: self.empty_slots(),
            live_bytes,
            free_bytes,
        }
    }

    /// Set the sealed flag and attach the CRC-32 trailer
    pub fn seal(&mut self) {
        let flags = self.u32_at(OFF_FLAGS);
        self.set_u32(OFF_FLAGS, flags | FLAG_SEALED);
        let end = self.buf.len() - TRAILER_SIZE;
        let crc = crc32fast::hash(&self.buf[..end]);
        self.set_u32(end, crc);
    }

    /// Clear the sealed flag and zero the trailer
    pub fn unseal(&mut self) {
        let flags = self.u32_at(OFF_FLAGS);
        self.set_u32(OFF_FLAGS, flags & !FLAG_SEALED);
        let end = self.buf.len() - TRAILER_SIZE;
        self.set_u32(end, 0);
    }

    pub fn is_sealed(&self) -> bool {
        self.u32_at(OFF_FLAGS) & FLAG_SEALED != 0
    }

    /// Sealed pages must carry their CRC; unsealed pages a zero trailer
    pub fn checksum_matches(&self) -> bool {
        let end = self.buf.len() - TRAILER_SIZE;
        let stored = self.u32_at(end);
        if self.is_sealed() {
            stored == crc32fast::hash(&self.buf[..end])
        } else {
            stored == 0
        }
    }

    /// Validate every structural invariant of the page
    pub fn check_integrity(&self) -> Result<()> {
        let corrupt = |msg: String| Err(Error::Corrupt(msg));

        let depth = self.depth();
        if depth > 32 {
            return corrupt(format!("depth {} exceeds 32", depth));
        }
        if self.hash_group() & !group_mask(depth) != 0 {
            return corrupt(format!(
                "group {:#010x} has bits below depth {}",
                self.hash_group(),
                depth
            ));
        }
        let flags = self.u32_at(OFF_FLAGS);
        if flags & !FLAG_SEALED != 0 {
            return corrupt(format!("unknown page flags {:#x}", flags));
        }
        let dir = self.dir_size();
        if !is_prime(dir) {
            return corrupt(format!("directory size {} is not prime", dir));
        }
        let heap_start = HEADER_SIZE + dir as usize * SLOT_SIZE;
        let heap_end = self.buf.len() - TRAILER_SIZE;
        if heap_start + MIN_BLOCK_SIZE > heap_end {
            return corrupt(format!("directory of {} slots leaves no heap", dir));
        }

        // Blocks must tile the heap exactly
        let mut blocks = HashSet::new();
        let mut off = heap_start;
        while off < heap_end {
            let size = self.u32_at(off) as usize;
            if size < MIN_BLOCK_SIZE || size % 4 != 0 || off + size > heap_end {
                return corrupt(format!("bad block size {} at offset {}", size, off));
            }
            blocks.insert(off);
            off += size;
        }

        let mut free = HashSet::new();
        let mut cur = self.u32_at(OFF_FREE_LIST);
        while cur != NIL {
            let off = cur as usize;
            if !blocks.contains(&off) || !free.insert(off) {
                return corrupt(format!("free list entry {} is not a distinct block", off));
            }
            cur = self.u32_at(off + 4);
        }

        let mut used = HashSet::new();
        let mut empty = 0u32;
        let mut live = 0u32;
        for slot in 0..dir {
            match self.slot(slot) {
                SLOT_EMPTY => empty += 1,
                SLOT_DELETED => {}
                value => {
                    let off = value as usize;
                    if !blocks.contains(&off) || free.contains(&off) || !used.insert(off) {
                        return corrupt(format!("slot {} points at invalid block {}", slot, off));
                    }
                    let len = self.u32_at(off + 8) as usize;
                    if NODE_HEADER + len > self.u32_at(off) as usize {
                        return corrupt(format!("record of {} bytes overruns block {}", len, off));
                    }
                    if !self.belongs(self.u32_at(off + 4)) {
                        return corrupt(format!(
                            "record hash {:#010x} outside group {:#010x}",
                            self.u32_at(off + 4),
                            self.hash_group()
                        ));
                    }
                    live += 1;
                }
            }
        }
        if used.len() + free.len() != blocks.len() {
            return corrupt(format!(
                "{} heap blocks are neither free nor referenced",
                blocks.len() - used.len() - free.len()
            ));
        }
        if empty != self.empty_slots() || live != self.record_count() {
            return corrupt(format!(
                "header counts (empty {}, records {}) disagree with directory (empty {}, records {})",
                self.empty_slots(),
                self.record_count(),
                empty,
                live
            ));
        }
        Ok(())
    }

    /// Rebuild the page with a freshly sized directory and compacted heap.
    ///
    /// `extra` heap bytes are reserved for a pending insert. Without `force`,
    /// the rebuild is skipped when it would reproduce the same directory and
    /// there are no tombstones to reclaim.
    fn defragment(&mut self, extra: usize, force: bool) -> bool {
        let usage = self.usage();
        let live = usage.records as usize;
        let Some(dir_size) = target_dir_size(self.page_size(), live + 1, usage.live_bytes + extra) else {
            return false;
        };
        let tombstones = usage.dir_size - usage.empty_slots - usage.records;
        if !force && dir_size == usage.dir_size && tombstones == 0 {
            return false;
        }

        let mut fresh = Page::new(self.page_size(), self.depth(), self.hash_group(), dir_size, self.steps());
        for (_, hash, record) in self.records() {
            if fresh.place(hash, record, block_size_for(record.len())).is_none() {
                return false;
            }
        }
        *self = fresh;
        true
    }

    /// Claim a directory slot and a heap block without any housekeeping
    ///
    /// Returns the slot and whether it last held a removed record.
    fn place(&mut self, hash: u32, record: &[u8], need: usize) -> Option<(u32, bool)> {
        let slot = self.probe_free_slot(hash)?;
        let off = self.allocate(need)?;

        self.set_u32(off + 4, hash);
        self.set_u32(off + 8, record.len() as u32);
        self.buf[off + NODE_HEADER..off + NODE_HEADER + record.len()].copy_from_slice(record);

        let reused = self.slot(slot) == SLOT_DELETED;
        if !reused {
            let empty = self.empty_slots();
            self.set_u32(OFF_EMPTY_SLOTS, empty - 1);
        }
        self.set_slot(slot, off as u32);
        let count = self.record_count();
        self.set_u32(OFF_RECORD_COUNT, count + 1);
        Some((slot, reused))
    }

    fn probe_free_slot(&self, hash: u32) -> Option<u32> {
        let dir = self.dir_size();
        let (mut index, step) = self.probe_params(hash);
        for _ in 0..dir {
            let value = self.slot(index);
            if value == SLOT_EMPTY || value == SLOT_DELETED {
                return Some(index);
            }
            index = (index + step) % dir;
        }
        None
    }

    /// First-fit allocation; large blocks are carved from their tail so the
    /// remainder keeps its place in the free list
    fn allocate(&mut self, need: usize) -> Option<usize> {
        let mut prev: Option<usize> = None;
        let mut cur = self.u32_at(OFF_FREE_LIST);
        while cur != NIL {
            let off = cur as usize;
            let size = self.u32_at(off) as usize;
            let next = self.u32_at(off + 4);
            if size >= need {
                let leftover = size - need;
                if leftover >= MIN_BLOCK_SIZE {
                    self.set_u32(off, leftover as u32);
                    let block = off + leftover;
                    self.set_u32(block, need as u32);
                    return Some(block);
                }
                match prev {
                    None => self.set_u32(OFF_FREE_LIST, next),
                    Some(p) => self.set_u32(p + 4, next),
                }
                self.set_u32(off + 4, 0);
                return Some(off);
            }
            prev = Some(off);
            cur = next;
        }
        None
    }

    fn walk(&self, start: u32, home: u32, step: u32, hash: u32) -> Lookup {
        let dir = self.dir_size();
        let mut index = start;
        let mut probes = 0;
        loop {
            probes += 1;
            match self.slot(index) {
                SLOT_EMPTY => return Lookup { slot: None, probes },
                SLOT_DELETED => {}
                off => {
                    if self.u32_at(off as usize + 4) == hash {
                        return Lookup {
                            slot: Some(index),
                            probes,
                        };
                    }
                }
            }
            index = (index + step) % dir;
            if index == home || probes >= dir {
                return Lookup { slot: None, probes };
            }
        }
    }

    fn probe_params(&self, hash: u32) -> (u32, u32) {
        let dir = self.dir_size();
        let home = (hash >> 4) % dir;
        let step = u32::from(self.steps()[(hash & 15) as usize]) % dir;
        (home, step.max(1))
    }

    fn live_offset(&self, slot: u32) -> Option<usize> {
        if slot >= self.dir_size() {
            return None;
        }
        match self.slot(slot) {
            SLOT_EMPTY | SLOT_DELETED => None,
            off => Some(off as usize),
        }
    }

    fn heap_start(&self) -> usize {
        HEADER_SIZE + self.dir_size() as usize * SLOT_SIZE
    }

    fn heap_end(&self) -> usize {
        self.buf.len() - TRAILER_SIZE
    }

    fn slot(&self, index: u32) -> u32 {
        self.u32_at(HEADER_SIZE + index as usize * SLOT_SIZE)
    }

    fn set_slot(&mut self, index: u32, value: u32) {
        self.set_u32(HEADER_SIZE + index as usize * SLOT_SIZE, value);
    }

    fn u32_at(&self, off: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[off..off + 4]);
        u32::from_le_bytes(bytes)
    }

    fn set_u32(&mut self, off: usize, value: u32) {
        self.buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::probe::PROBE_STEPS;

    const SIZE: usize = 8192;

    fn record(i: u32, len: usize) -> Vec<u8> {
        (0..len).map(|j| (i as usize * 31 + j) as u8).collect()
    }

    fn collect(page: &Page, hash: u32) -> Vec<Vec<u8>> {
        let mut found = Vec::new();
        let mut lookup = page.find_first(hash);
        while let Some(slot) = lookup.slot {
            found.push(page.record(slot).unwrap().to_vec());
            lookup = page.find_next(slot, hash);
        }
        found
    }

    #[test]
    fn test_empty_page_is_consistent() {
        let page = Page::empty(SIZE, 0, 0, PROBE_STEPS);
        page.check_integrity().unwrap();
        assert_eq!(page.record_count(), 0);
        assert_eq!(page.empty_slots(), page.dir_size());
        assert!(is_prime(page.dir_size()));

        let usage = page.usage();
        assert_eq!(usage.live_bytes, 0);
        assert_eq!(usage.free_bytes, SIZE - HEADER_SIZE - TRAILER_SIZE - page.dir_size() as usize * 4);
    }

    #[test]
    fn test_insert_and_find() {
        let mut page = Page::empty(SIZE, 0, 0, PROBE_STEPS);
        for i in 0..20u32 {
            let hash = i.wrapping_mul(0x9E37_79B9);
            assert!(matches!(page.insert(hash, &record(i, 40)), InsertOutcome::Inserted { .. }));
        }
        page.check_integrity().unwrap();
        for i in 0..20u32 {
            let hash = i.wrapping_mul(0x9E37_79B9);
            assert_eq!(collect(&page, hash), vec![record(i, 40)]);
        }
        assert_eq!(page.find_first(0xDEAD_BEEF).slot, None);
    }

    #[test]
    fn test_duplicate_hashes() {
        let mut page = Page::empty(SIZE, 0, 0, PROBE_STEPS);
        for i in 0..10 {
            page.insert(77, &record(i, 8));
        }
        let mut found = collect(&page, 77);
        found.sort();
        let mut expected: Vec<_> = (0..10).map(|i| record(i, 8)).collect();
        expected.sort();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_illegal_hash() {
        let mut page = Page::empty(SIZE, 1, 0x8000_0000, PROBE_STEPS);
        assert_eq!(page.insert(0x1234_5678, b"x"), InsertOutcome::Illegal);
        assert!(matches!(page.insert(0x9234_5678, b"x"), InsertOutcome::Inserted { .. }));
    }

    #[test]
    fn test_remove_reuses_space() {
        let mut page = Page::empty(SIZE, 0, 0, PROBE_STEPS);
        let InsertOutcome::Inserted { slot, .. } = page.insert(5, &record(1, 100)) else {
            panic!("insert failed");
        };
        let before = page.usage();
        assert!(page.remove(slot));
        assert!(!page.remove(slot));
        assert_eq!(page.find_first(5).slot, None);
        page.check_integrity().unwrap();

        let after = page.usage();
        assert_eq!(after.records, 0);
        assert_eq!(after.free_bytes, before.free_bytes + before.live_bytes);

        // Same-size insert takes the freed block from the list head
        assert!(matches!(page.insert(6, &record(2, 100)), InsertOutcome::Inserted { .. }));
        assert_eq!(page.usage().free_bytes, before.free_bytes);
        page.check_integrity().unwrap();
    }

    #[test]
    fn test_update_same_length_only() {
        let mut page = Page::empty(SIZE, 0, 0, PROBE_STEPS);
        let InsertOutcome::Inserted { slot, .. } = page.insert(9, b"hello") else {
            panic!("insert failed");
        };
        page.update(slot, b"world").unwrap();
        assert_eq!(page.record(slot), Some(&b"world"[..]));
        assert!(matches!(
            page.update(slot, b"too long"),
            Err(Error::LengthMismatch { expected: 5, actual: 8 })
        ));
    }

    #[test]
    fn test_fills_then_reports_full() {
        let mut page = Page::empty(SIZE, 0, 0, PROBE_STEPS);
        let mut inserted = 0u32;
        loop {
            match page.insert(inserted.wrapping_mul(2_654_435_761), &record(inserted, 64)) {
                InsertOutcome::Inserted { .. } | InsertOutcome::Defragmented { .. } => inserted += 1,
                InsertOutcome::Full => break,
                InsertOutcome::Illegal => panic!("depth 0 page accepts every hash"),
            }
        }
        assert!(inserted > 50);
        page.check_integrity().unwrap();
        for i in 0..inserted {
            assert_eq!(collect(&page, i.wrapping_mul(2_654_435_761)), vec![record(i, 64)]);
        }
    }

    #[test]
    fn test_tombstones_trigger_defragment() {
        let mut page = Page::empty(SIZE, 0, 0, PROBE_STEPS);
        let mut defragmented = false;
        for i in 0..1000u32 {
            let hash = i.wrapping_mul(0x85EB_CA6B);
            let slot = match page.insert(hash, &record(i, 24)) {
                InsertOutcome::Inserted { slot, .. } => slot,
                InsertOutcome::Defragmented { slot } => {
                    defragmented = true;
                    slot
                }
                other => panic!("unexpected {:?}", other),
            };
            // Keep only every tenth record alive
            if i % 10 != 0 {
                assert!(page.remove(slot));
            }
        }
        assert!(defragmented);
        page.check_integrity().unwrap();
        for i in (0..1000u32).step_by(10) {
            assert_eq!(collect(&page, i.wrapping_mul(0x85EB_CA6B)), vec![record(i, 24)]);
        }
    }

    #[test]
    fn test_large_record_resizes_directory() {
        let max = max_record_len(SIZE);
        let mut page = Page::empty(SIZE, 0, 0, PROBE_STEPS);
        let big = record(3, max);
        assert!(matches!(page.insert(1, &big), InsertOutcome::Defragmented { .. }));
        assert_eq!(collect(&page, 1), vec![big]);
        page.check_integrity().unwrap();
    }

    #[test]
    fn test_split_partitions_by_bit() {
        let mut page = Page::empty(SIZE, 0, 0, PROBE_STEPS);
        let hashes: Vec<u32> = (0..60u32).map(|i| i.wrapping_mul(0xC2B2_AE35)).collect();
        for (i, &hash) in hashes.iter().enumerate() {
            page.insert(hash, &record(i as u32, 32));
        }

        let (low, high) = page.split(1, PROBE_STEPS, PROBE_STEPS).unwrap();
        low.check_integrity().unwrap();
        high.check_integrity().unwrap();
        assert_eq!(low.hash_group(), 0);
        assert_eq!(high.hash_group(), 0x8000_0000);
        assert_eq!(low.record_count() + high.record_count(), 60);

        for (i, &hash) in hashes.iter().enumerate() {
            let child = if hash & 0x8000_0000 == 0 { &low } else { &high };
            assert_eq!(collect(child, hash), vec![record(i as u32, 32)]);
            for (_, h, _) in child.records() {
                assert_eq!(h & group_mask(1), child.hash_group());
            }
        }
    }

    #[test]
    fn test_split_detects_foreign_record() {
        let mut page = Page::empty(SIZE, 1, 0, PROBE_STEPS);
        let InsertOutcome::Inserted { slot, .. } = page.insert(0x1000_0000, b"abc") else {
            panic!("insert failed");
        };
        // Rewrite the stored hash so it no longer belongs to either child
        let off = page.live_offset(slot).unwrap();
        page.set_u32(off + 4, 0x8000_0000);

        assert!(page.check_integrity().is_err());
        assert!(matches!(page.split(2, PROBE_STEPS, PROBE_STEPS), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_checksum_round_trip() {
        let mut page = Page::empty(SIZE, 0, 0, PROBE_STEPS);
        page.insert(42, b"payload");
        page.seal();
        let restored = Page::from_bytes(page.as_bytes().to_vec(), true).unwrap();
        assert_eq!(restored, page);

        let mut damaged = page.as_bytes().to_vec();
        damaged[SIZE / 2] ^= 0xFF;
        assert!(matches!(Page::from_bytes(damaged, true), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_sealed_page_with_zeroed_trailer_is_rejected() {
        let mut page = Page::empty(SIZE, 0, 0, PROBE_STEPS);
        page.insert(42, b"payload");
        page.seal();
        assert!(page.is_sealed());

        let mut torn = page.as_bytes().to_vec();
        torn[SIZE - TRAILER_SIZE..].fill(0);
        assert!(matches!(Page::from_bytes(torn.clone(), true), Err(Error::Corrupt(_))));
        // Checksums off: structure alone is checked
        assert!(Page::from_bytes(torn, false).is_ok());

        // Pages written without checksums stay readable
        page.unseal();
        assert!(!page.is_sealed());
        let restored = Page::from_bytes(page.as_bytes().to_vec(), true).unwrap();
        assert_eq!(collect(&restored, 42), vec![b"payload".to_vec()]);

        let mut bogus = page.as_bytes().to_vec();
        bogus[SIZE - TRAILER_SIZE] = 1;
        assert!(matches!(Page::from_bytes(bogus, true), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_insert_reports_reused_slot() {
        let mut page = Page::empty(SIZE, 0, 0, PROBE_STEPS);
        let InsertOutcome::Inserted { slot, reused } = page.insert(42, b"first") else {
            panic!("insert failed");
        };
        assert!(!reused);
        assert!(page.remove(slot));

        // Same hash, same probe sequence: the tombstone is the first free slot
        assert_eq!(
            page.insert(42, b"other"),
            InsertOutcome::Inserted { slot, reused: true }
        );
        assert_eq!(page.record(slot), Some(&b"other"[..]));
    }

    #[test]
    fn test_target_dir_size() {
        let dir = target_dir_size(SIZE, 0, 0).unwrap();
        assert!(is_prime(dir));
        // Dense small records want a bigger directory than sparse big ones
        let small = target_dir_size(SIZE, 100, 100 * 16).unwrap();
        let large = target_dir_size(SIZE, 10, 10 * 512).unwrap();
        assert!(small > large);
        assert!(small as usize >= 100 + 100 / 6);
        assert_eq!(target_dir_size(SIZE, 1, SIZE), None);
    }

    #[test]
    fn test_group_mask() {
        assert_eq!(group_mask(0), 0);
        assert_eq!(group_mask(1), 0x8000_0000);
        assert_eq!(group_mask(4), 0xF000_0000);
        assert_eq!(group_mask(32), u32::MAX);
    }
}
