//! File-backed extendible hash
//!
//! ```text
//! HashFile
//!   ├─→ Directory<u64>      (page file offsets, mirrored to the directory file)
//!   ├─→ PageCache           (LRU, write-back, generation per resident page)
//!   └─→ page file           (fixed-size pages, appended on split, never compacted)
//! ```
//!
//! # Durability
//!
//! Mutations stay in the cache until `tick`, `sync`, eviction or a split
//! writes them back. A split writes the appended high child, then the low
//! child over the retired page, syncs the page file and only then replaces the
//! directory file. A crash anywhere in that sequence leaves either the old
//! directory with an unchanged page count, or a page file that has outgrown
//! its directory image; the latter is detected on open and repaired by
//! rebuilding the directory from page headers.
//!
//! A crash between the two page writes leaves the retired page at full range
//! next to its new high child. Rebuild narrows such a page to the half the
//! child does not cover and rewrites it before deriving the directory.

use super::cache::{PageCache, SlotState};
use super::cursor::Cursor;
use super::dir_file;
use super::directory::Directory;
use super::extendible::{self, Change, PageStore};
use super::io::{read_at, request_shutdown, with_retry, write_at};
use super::page::{group_mask, Page, PageUsage};
use super::probe::{probe_rng, shuffled_steps};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use rand::rngs::StdRng;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, trace, warn};

/// How `open` found the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenOutcome {
    /// Empty or missing page file; a fresh store was written
    Created,
    /// Directory file was present and consistent
    Opened,
    /// Directory was rebuilt from the page file
    Recovered,
}

/// Storage statistics with cache metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FileStats {
    pub pages: u64,
    pub directory_depth: u32,
    pub cached_pages: usize,
    pub cache_capacity: usize,
    pub dirty_pages: usize,
    pub page_reads: u64,
    pub page_writes: u64,
    pub directory_writes: u64,
    pub splits: u64,
    pub defragmentations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub cache_hit_rate: f64,
}

/// Result of a full structural check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub pages: u64,
    pub directory_depth: u32,
    pub records: u64,
    pub live_bytes: u64,
    pub free_bytes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    page_reads: u64,
    page_writes: u64,
    directory_writes: u64,
    splits: u64,
    defragmentations: u64,
}

/// Persistent hash-keyed record store over a directory file and a page file
pub struct HashFile {
    dir_path: PathBuf,
    page_path: PathBuf,
    page_file: File,
    config: StoreConfig,
    directory: Directory<u64>,
    directory_dirty: bool,
    page_count: u64,
    cache: PageCache,
    rng: StdRng,
    counters: Counters,
    poisoned: bool,
    closed: bool,
}

impl HashFile {
    /// Open or create a store with default configuration
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(dir_path: P, page_path: Q) -> Result<(Self, OpenOutcome)> {
        Self::open_with_config(dir_path, page_path, &StoreConfig::default())
    }

    /// Open or create a store
    ///
    /// # Arguments
    /// * `dir_path` - Directory file (rebuilt from the page file when unusable)
    /// * `page_path` - Page file
    /// * `config` - Page size, cache capacity and write-back policy
    pub fn open_with_config<P: AsRef<Path>, Q: AsRef<Path>>(
        dir_path: P,
        page_path: Q,
        config: &StoreConfig,
    ) -> Result<(Self, OpenOutcome)> {
        config.validate()?;
        let dir_path = dir_path.as_ref().to_path_buf();
        let page_path = page_path.as_ref().to_path_buf();

        let page_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&page_path)
            .map_err(|e| Error::io(format!("opening page file {}", page_path.display()), e))?;
        let file_len = page_file
            .metadata()
            .map_err(|e| Error::io("reading page file metadata", e))?
            .len();
        let page_size = config.page_size as u64;
        if file_len % page_size != 0 {
            return Err(Error::Corrupt(format!(
                "page file is {} bytes, not a multiple of the {} byte page size",
                file_len, page_size
            )));
        }

        let mut store = Self {
            dir_path,
            page_path,
            page_file,
            config: config.clone(),
            directory: Directory::new(0),
            directory_dirty: false,
            page_count: file_len / page_size,
            cache: PageCache::new(config.cache_pages),
            rng: probe_rng(config.probe_seed),
            counters: Counters::default(),
            poisoned: false,
            // Nothing to write back until open succeeds
            closed: true,
        };

        let outcome = if store.page_count == 0 {
            store.create()?;
            OpenOutcome::Created
        } else {
            match store.load_directory() {
                Ok(directory) => {
                    store.directory = directory;
                    OpenOutcome::Opened
                }
                Err(reason) => {
                    warn!(
                        path = %store.dir_path.display(),
                        reason = %reason,
                        "Directory file unusable, rebuilding from page file"
                    );
                    store.rebuild()?;
                    OpenOutcome::Recovered
                }
            }
        };
        store.closed = false;

        info!(
            pages = store.page_count,
            depth = store.directory.depth(),
            page_size,
            outcome = ?outcome,
            path = %store.page_path.display(),
            "Opened hash file"
        );
        Ok((store, outcome))
    }

    /// Insert a record under `hash`; duplicates are kept
    pub fn insert(&mut self, hash: u32, record: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        let result = extendible::insert(self, hash, record).map(|_| ());
        self.guard(result)
    }

    /// First record stored under `hash`
    pub fn find_first(&mut self, hash: u32) -> Result<Option<Cursor>> {
        self.ensure_usable()?;
        let result = extendible::find_first(self, hash).map(|found| found.cursor);
        self.guard(result)
    }

    /// Next record under `hash` after `cursor`
    pub fn find_next(&mut self, cursor: &Cursor, hash: u32) -> Result<Option<Cursor>> {
        self.ensure_usable()?;
        let result = extendible::find_next(self, cursor, hash).map(|found| found.cursor);
        self.guard(result)
    }

    pub fn copy(&mut self, cursor: &Cursor) -> Result<Vec<u8>> {
        self.ensure_usable()?;
        let result = extendible::copy(self, cursor);
        self.guard(result)
    }

    /// Overwrite a record in place; the length must not change
    pub fn update(&mut self, cursor: &Cursor, bytes: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        let result = extendible::update(self, cursor, bytes);
        self.guard(result)
    }

    pub fn remove(&mut self, cursor: &Cursor) -> Result<()> {
        self.ensure_usable()?;
        let result = extendible::remove(self, cursor);
        self.guard(result)
    }

    /// Start a full scan in directory order
    pub fn find_first_all(&mut self) -> Result<Option<(Cursor, Vec<u8>)>> {
        self.ensure_usable()?;
        let result = extendible::find_first_all(self);
        self.guard(result)
    }

    pub fn find_next_all(&mut self, cursor: &Cursor) -> Result<Option<(Cursor, Vec<u8>)>> {
        self.ensure_usable()?;
        let result = extendible::find_next_all(self, cursor);
        self.guard(result)
    }

    /// Write back every dirty page and the directory, then fsync
    pub fn sync(&mut self) -> Result<()> {
        self.ensure_usable()?;
        let result = self.flush_everything();
        self.guard(result)
    }

    /// Write back at most `tick_flush_pages` dirty pages, oldest first
    ///
    /// Returns the number of pages written.
    pub fn tick(&mut self) -> Result<usize> {
        self.ensure_usable()?;
        let result = self.flush_oldest(self.config.tick_flush_pages);
        self.guard(result)
    }

    /// Sync and release the files
    pub fn close(mut self) -> Result<()> {
        let result = self.sync();
        self.closed = true;
        if result.is_ok() {
            debug!(path = %self.page_path.display(), "Closed hash file");
        }
        result
    }

    /// Replace the directory with one derived from page headers
    pub fn rebuild_directory(&mut self) -> Result<()> {
        self.ensure_usable()?;
        let result = self.rebuild();
        self.guard(result)
    }

    /// Check every page and cross-check the directory against them
    pub fn verify(&mut self) -> Result<VerifyReport> {
        self.ensure_usable()?;
        let result = self.verify_pages();
        self.guard(result)
    }

    pub fn stats(&self) -> FileStats {
        let (cache_hits, cache_misses, evictions) = self.cache.counters();
        let lookups = cache_hits + cache_misses;
        FileStats {
            pages: self.page_count,
            directory_depth: self.directory.depth(),
            cached_pages: self.cache.len(),
            cache_capacity: self.cache.capacity(),
            dirty_pages: self.cache.dirty_offsets().len(),
            page_reads: self.counters.page_reads,
            page_writes: self.counters.page_writes,
            directory_writes: self.counters.directory_writes,
            splits: self.counters.splits,
            defragmentations: self.counters.defragmentations,
            cache_hits,
            cache_misses,
            evictions,
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                cache_hits as f64 / lookups as f64
            },
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn directory_depth(&self) -> u32 {
        self.directory.depth()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.poisoned {
            Err(Error::Poisoned)
        } else {
            Ok(())
        }
    }

    /// Poison the store on fatal errors
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() && !self.poisoned {
                self.poisoned = true;
                error!(error = %e, path = %self.page_path.display(), "Hash file poisoned");
                request_shutdown("hash file hit a fatal error");
            }
        }
        result
    }

    fn page_bytes(&self) -> u64 {
        self.config.page_size as u64
    }

    fn create(&mut self) -> Result<()> {
        let steps = shuffled_steps(&mut self.rng);
        let root = Page::empty(self.config.page_size, 0, 0, steps);
        self.cache.insert(0, root, SlotState::Unprotected);
        self.page_count = 1;
        self.directory = Directory::new(0);
        self.flush_page(0)?;
        self.sync_page_file()?;
        self.write_directory()
    }

    fn load_directory(&self) -> Result<Directory<u64>> {
        let bytes = dir_file::read(&self.dir_path)
            .map_err(|e| Error::io("reading directory file", e))?
            .ok_or_else(|| Error::Corrupt("directory file is missing".to_string()))?;
        dir_file::decode(&bytes, self.page_bytes(), self.page_count)
    }

    fn rebuild(&mut self) -> Result<()> {
        // Cached pages may be newer than their on-disk image
        self.flush_oldest(usize::MAX)?;

        let mut shapes = Vec::with_capacity(self.page_count as usize);
        for index in 0..self.page_count {
            let offset = index * self.page_bytes();
            let page = self.read_page(offset)?;
            shapes.push(PageShape {
                depth: page.depth(),
                group: page.hash_group(),
                offset,
            });
        }

        let (directory, narrowed) = derive_directory(&shapes)?;
        for shape in &narrowed {
            self.rewrite_narrowed(*shape)?;
        }
        if !narrowed.is_empty() {
            self.sync_page_file()?;
        }

        self.directory = directory;
        self.directory_dirty = true;
        self.write_directory()?;
        info!(
            pages = self.page_count,
            depth = self.directory.depth(),
            "Rebuilt directory from page file"
        );
        Ok(())
    }

    /// Cut a page left over from an interrupted split down to `shape`
    fn rewrite_narrowed(&mut self, shape: PageShape) -> Result<()> {
        let mut page = self.read_page(shape.offset)?;
        let before = page.record_count();
        while page.depth() < shape.depth {
            let steps = page.steps();
            let (low, high) = page.split(page.depth() + 1, steps, steps)?;
            page = if high.belongs(shape.group) { high } else { low };
        }
        warn!(
            offset = shape.offset,
            depth = shape.depth,
            group = format_args!("{:#010x}", shape.group),
            kept = page.record_count(),
            dropped = before - page.record_count(),
            "Completing interrupted split"
        );

        self.cache.discard(shape.offset);
        self.make_room()?;
        self.cache.insert(shape.offset, page, SlotState::Unprotected);
        self.flush_page(shape.offset)?;
        Ok(())
    }

    fn verify_pages(&mut self) -> Result<VerifyReport> {
        let mut report = VerifyReport {
            pages: self.page_count,
            directory_depth: self.directory.depth(),
            ..Default::default()
        };

        let mut shapes = Vec::with_capacity(self.page_count as usize);
        for index in 0..self.page_count {
            let offset = index * self.page_bytes();
            let (shape, usage) = if let Some(slot) = self.cache.peek(offset) {
                slot.page.check_integrity()?;
                (PageShape::of(&slot.page, offset), slot.page.usage())
            } else {
                let page = self.read_page(offset)?;
                (PageShape::of(&page, offset), page.usage())
            };
            add_usage(&mut report, &usage);
            shapes.push(shape);
        }

        let mut referenced = vec![false; shapes.len()];
        for (index, &offset) in self.directory.entries().iter().enumerate() {
            let page_index = (offset / self.page_bytes()) as usize;
            let shape = shapes
                .get(page_index)
                .ok_or_else(|| Error::Corrupt(format!("directory entry {} points past the page file", index)))?;
            if shape.depth > self.directory.depth() || !self.directory.range_of(shape.depth, shape.group).contains(&index) {
                return Err(Error::Corrupt(format!(
                    "directory entry {} points at page {} (depth {}, group {:#010x}) outside its range",
                    index, offset, shape.depth, shape.group
                )));
            }
            referenced[page_index] = true;
        }
        if let Some(orphan) = referenced.iter().position(|seen| !seen) {
            return Err(Error::Corrupt(format!(
                "page at offset {} is not referenced by the directory",
                orphan as u64 * self.page_bytes()
            )));
        }

        debug!(pages = report.pages, records = report.records, "Verified hash file");
        Ok(report)
    }

    fn read_page(&mut self, offset: u64) -> Result<Page> {
        let mut buf = vec![0u8; self.config.page_size];
        with_retry(&self.config.retry, "reading page", || {
            read_at(&mut self.page_file, offset, &mut buf)
        })?;
        self.counters.page_reads += 1;
        Page::from_bytes(buf, self.config.checksums).map_err(|e| {
            error!(offset, error = %e, "Page failed verification");
            e
        })
    }

    /// Write one cached page back if it is dirty
    fn flush_page(&mut self, offset: u64) -> Result<bool> {
        let checksums = self.config.checksums;
        let Some(slot) = self.cache.peek_mut(offset) else {
            return Ok(false);
        };
        match slot.state {
            SlotState::Clean => return Ok(false),
            SlotState::Unprotected => {
                if checksums {
                    slot.page.seal();
                } else {
                    slot.page.unseal();
                }
                slot.state = SlotState::Unwritten;
            }
            SlotState::Unwritten => {}
        }

        let bytes = slot.page.as_bytes();
        with_retry(&self.config.retry, "writing page", || {
            write_at(&mut self.page_file, offset, bytes)
        })?;
        slot.state = SlotState::Clean;
        self.counters.page_writes += 1;
        trace!(offset, "Wrote page");
        Ok(true)
    }

    fn flush_oldest(&mut self, limit: usize) -> Result<usize> {
        let mut written = 0;
        for offset in self.cache.dirty_offsets().into_iter().take(limit) {
            if self.flush_page(offset)? {
                written += 1;
            }
        }
        Ok(written)
    }

    fn flush_everything(&mut self) -> Result<()> {
        self.flush_oldest(usize::MAX)?;
        self.sync_page_file()?;
        if self.directory_dirty {
            self.write_directory()?;
        }
        Ok(())
    }

    /// Evict the least recently used page once the cache is full
    fn make_room(&mut self) -> Result<()> {
        while let Some(victim) = self.cache.victim() {
            self.flush_page(victim)?;
            self.cache.evict(victim);
            debug!(offset = victim, "Evicted page");
        }
        Ok(())
    }

    fn sync_page_file(&mut self) -> Result<()> {
        with_retry(&self.config.retry, "syncing page file", || self.page_file.sync_all())
    }

    fn write_directory(&mut self) -> Result<()> {
        let bytes = dir_file::encode(&self.directory, self.page_count);
        with_retry(&self.config.retry, "writing directory file", || {
            dir_file::write(&self.dir_path, &bytes)
        })?;
        self.directory_dirty = false;
        self.counters.directory_writes += 1;
        debug!(depth = self.directory.depth(), pages = self.page_count, "Wrote directory file");
        Ok(())
    }
}

impl PageStore for HashFile {
    fn page_size(&self) -> usize {
        self.config.page_size
    }

    fn directory(&self) -> &Directory<u64> {
        &self.directory
    }

    fn directory_mut(&mut self) -> &mut Directory<u64> {
        &mut self.directory
    }

    fn page_mut(&mut self, page: u64) -> Result<&mut Page> {
        if !self.cache.lookup(page) {
            let loaded = self.read_page(page)?;
            self.make_room()?;
            self.cache.insert(page, loaded, SlotState::Clean);
            trace!(offset = page, "Loaded page");
        }
        self.cache
            .get_mut(page)
            .map(|slot| &mut slot.page)
            .ok_or_else(|| Error::Corrupt(format!("page {} missing from cache after load", page)))
    }

    fn generation(&self, page: u64) -> Option<u64> {
        self.cache.peek(page).map(|slot| slot.generation)
    }

    fn touched(&mut self, page: u64, change: Change) -> Result<()> {
        if change == Change::Moved {
            self.counters.defragmentations += 1;
        }
        if self.cache.mark_dirty(page, change.invalidates_cursors()) {
            Ok(())
        } else {
            Err(Error::Corrupt(format!("modified page {} is not cached", page)))
        }
    }

    fn next_steps(&mut self) -> [u16; 16] {
        shuffled_steps(&mut self.rng)
    }

    fn replace_split(&mut self, old: u64, low: Page, high: Page) -> Result<(u64, u64)> {
        let high_ref = self.page_count * self.page_bytes();
        self.cache.discard(old);

        self.make_room()?;
        self.cache.insert(high_ref, high, SlotState::Unprotected);
        self.page_count += 1;
        self.flush_page(high_ref)?;

        self.make_room()?;
        self.cache.insert(old, low, SlotState::Unprotected);
        self.flush_page(old)?;

        self.counters.splits += 1;
        Ok((old, high_ref))
    }

    fn directory_changed(&mut self) -> Result<()> {
        self.directory_dirty = true;
        self.sync_page_file()?;
        self.write_directory()
    }
}

impl Drop for HashFile {
    fn drop(&mut self) {
        if self.closed || self.poisoned {
            return;
        }
        if let Err(e) = self.flush_everything() {
            warn!(error = %e, path = %self.page_path.display(), "Failed to sync hash file on drop");
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PageShape {
    depth: u32,
    group: u32,
    offset: u64,
}

impl PageShape {
    fn of(page: &Page, offset: u64) -> Self {
        Self {
            depth: page.depth(),
            group: page.hash_group(),
            offset,
        }
    }
}

fn add_usage(report: &mut VerifyReport, usage: &PageUsage) {
    report.records += usage.records as u64;
    report.live_bytes += usage.live_bytes as u64;
    report.free_bytes += usage.free_bytes as u64;
}

/// Directory implied by page headers
///
/// Deeper pages claim their entries first. A shallower page that finds part
/// of its range already claimed is narrowed to the unclaimed part; those
/// narrowed shapes are returned so the pages can be rewritten to match.
fn derive_directory(shapes: &[PageShape]) -> Result<(Directory<u64>, Vec<PageShape>)> {
    let depth = shapes.iter().map(|s| s.depth).max().unwrap_or(0).max(1);
    if depth > 32 {
        return Err(Error::Corrupt(format!("page depth {} exceeds 32", depth)));
    }
    let mut entries: Vec<Option<u64>> = vec![None; 1usize << depth];
    let mut narrowed = Vec::new();

    let mut ordered = shapes.to_vec();
    ordered.sort_by_key(|s| (std::cmp::Reverse(s.depth), s.offset));
    for shape in ordered {
        let claimed = narrow(&entries, shape, depth)?;
        for entry in &mut entries[entry_range(claimed, depth)] {
            *entry = Some(shape.offset);
        }
        if claimed.depth != shape.depth {
            narrowed.push(claimed);
        }
    }

    let holes = entries.iter().filter(|e| e.is_none()).count();
    if holes > 0 {
        return Err(Error::Corrupt(format!(
            "{} of {} directory entries have no page after rebuild",
            holes,
            entries.len()
        )));
    }
    let directory = Directory::from_entries(depth, entries.into_iter().flatten().collect())?;
    Ok((directory, narrowed))
}

/// Directory entries a page covers in a directory of `depth`
fn entry_range(shape: PageShape, depth: u32) -> std::ops::Range<usize> {
    let span = 1usize << (depth - shape.depth);
    let start = ((shape.group & group_mask(shape.depth)) >> (32 - depth)) as usize;
    start..start + span
}

/// Shrink `shape` to the half-ranges no deeper page has claimed
///
/// Only the shape an interrupted split leaves behind is accepted: at each
/// level one half is fully claimed and the page moves into the other.
fn narrow(entries: &[Option<u64>], mut shape: PageShape, depth: u32) -> Result<PageShape> {
    loop {
        let range = entry_range(shape, depth);
        let claimed = entries[range.clone()].iter().filter(|e| e.is_some()).count();
        if claimed == 0 {
            return Ok(shape);
        }
        if claimed == range.len() {
            return Err(Error::Corrupt(format!(
                "page at offset {} (depth {}, group {:#010x}) is covered entirely by deeper pages",
                shape.offset, shape.depth, shape.group
            )));
        }

        let mid = range.start + range.len() / 2;
        let low_full = entries[range.start..mid].iter().all(Option::is_some);
        let high_full = entries[mid..range.end].iter().all(Option::is_some);
        let bit = 1u32 << (32 - (shape.depth + 1));
        shape = match (low_full, high_full) {
            (false, true) => PageShape {
                depth: shape.depth + 1,
                ..shape
            },
            (true, false) => PageShape {
                depth: shape.depth + 1,
                group: shape.group | bit,
                ..shape
            },
            _ => {
                return Err(Error::Corrupt(format!(
                    "page at offset {} (depth {}, group {:#010x}) overlaps deeper pages unevenly",
                    shape.offset, shape.depth, shape.group
                )))
            }
        };
    }
}
