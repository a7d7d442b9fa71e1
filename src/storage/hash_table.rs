//! In-memory extendible hash
//!
//! Same directory, split and cursor contract as [`HashFile`](super::HashFile)
//! with pages held in an arena and addressed by index. There is no disk I/O;
//! instead the table keeps probe statistics for tuning page and record sizes.

use super::cursor::Cursor;
use super::directory::Directory;
use super::extendible::{self, Change, PageStore};
use super::io::request_shutdown;
use super::page::Page;
use super::probe::{probe_rng, shuffled_steps};
use crate::config::TableConfig;
use crate::error::{Error, Result};
use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{debug, error};

const NO_FREE: u32 = u32::MAX;

struct ArenaPage {
    page: Page,
    generation: u64,
}

/// Page slots with an intrusive free list threaded through vacant entries
struct PageArena {
    head: u32,
    entries: Vec<std::result::Result<ArenaPage, u32>>,
    next_generation: u64,
}

impl PageArena {
    fn new() -> Self {
        Self {
            head: NO_FREE,
            entries: Vec::new(),
            next_generation: 1,
        }
    }

    fn insert(&mut self, page: Page) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        let value = ArenaPage { page, generation };

        let index = self.head as usize;
        if let Some(&Err(next)) = self.entries.get(index) {
            self.entries[index] = Ok(value);
            self.head = next;
            return index as u64;
        }
        self.entries.push(Ok(value));
        (self.entries.len() - 1) as u64
    }

    fn release(&mut self, index: u64) -> Option<Page> {
        let entry = self.entries.get_mut(index as usize)?;
        if entry.is_err() {
            return None;
        }
        match std::mem::replace(entry, Err(self.head)) {
            Ok(freed) => {
                self.head = index as u32;
                Some(freed.page)
            }
            Err(_) => None,
        }
    }

    fn get(&self, index: u64) -> Option<&ArenaPage> {
        self.entries.get(index as usize).and_then(|e| e.as_ref().ok())
    }

    fn get_mut(&mut self, index: u64) -> Option<&mut ArenaPage> {
        self.entries.get_mut(index as usize).and_then(|e| e.as_mut().ok())
    }

    fn bump(&mut self, index: u64) {
        let generation = self.next_generation;
        if let Some(entry) = self.get_mut(index) {
            entry.generation = generation;
            self.next_generation += 1;
        }
    }

    fn live(&self) -> usize {
        self.entries.iter().filter(|e| e.is_ok()).count()
    }
}

/// Probe and mutation counters
///
/// `scans`, `hits`, `checks` and `max_scan` are reset whenever an insert
/// defragments a page, since the directory it was measured against is gone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableStats {
    /// Live records
    pub entries: u64,
    /// Records removed since creation
    pub deletions: u64,
    /// `find_first`/`find_next` calls
    pub scans: u64,
    /// Lookups that returned a record
    pub hits: u64,
    /// Directory slots inspected by lookups
    pub checks: u64,
    /// Longest single probe sequence
    pub max_scan: u32,
    pub pages: usize,
    pub directory_depth: u32,
    pub splits: u64,
    pub defragmentations: u64,
}

/// Memory-only hash-keyed record store
pub struct HashTable {
    config: TableConfig,
    directory: Directory<u64>,
    arena: PageArena,
    rng: StdRng,
    stats: TableStats,
    poisoned: bool,
}

impl Default for HashTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HashTable {
    pub fn new() -> Self {
        let config = TableConfig::default();
        let mut rng = probe_rng(config.probe_seed);
        let root = Page::empty(config.page_size, 0, 0, shuffled_steps(&mut rng));
        Self::from_parts(config, rng, root)
    }

    pub fn with_config(config: &TableConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = probe_rng(config.probe_seed);
        let root = Page::empty(config.page_size, 0, 0, shuffled_steps(&mut rng));
        Ok(Self::from_parts(config.clone(), rng, root))
    }

    fn from_parts(config: TableConfig, rng: StdRng, root: Page) -> Self {
        let mut arena = PageArena::new();
        let root_ref = arena.insert(root);
        Self {
            config,
            directory: Directory::new(root_ref),
            arena,
            rng,
            stats: TableStats::default(),
            poisoned: false,
        }
    }

    /// Insert a record under `hash`; duplicates are kept
    pub fn insert(&mut self, hash: u32, record: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        let result = extendible::insert(self, hash, record);
        if self.guard(result)?.defragmented {
            debug!(hash = format_args!("{:#010x}", hash), "Defragmented page, resetting scan statistics");
            self.reset_scan_stats();
        }
        self.stats.entries += 1;
        Ok(())
    }

    pub fn find_first(&mut self, hash: u32) -> Result<Option<Cursor>> {
        self.ensure_usable()?;
        let result = extendible::find_first(self, hash);
        let found = self.guard(result)?;
        self.record_scan(found.cursor.is_some(), found.probes);
        Ok(found.cursor)
    }

    pub fn find_next(&mut self, cursor: &Cursor, hash: u32) -> Result<Option<Cursor>> {
        self.ensure_usable()?;
        let result = extendible::find_next(self, cursor, hash);
        let found = self.guard(result)?;
        self.record_scan(found.cursor.is_some(), found.probes);
        Ok(found.cursor)
    }

    pub fn copy(&mut self, cursor: &Cursor) -> Result<Vec<u8>> {
        self.ensure_usable()?;
        let result = extendible::copy(self, cursor);
        self.guard(result)
    }

    pub fn update(&mut self, cursor: &Cursor, bytes: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        let result = extendible::update(self, cursor, bytes);
        self.guard(result)
    }

    pub fn remove(&mut self, cursor: &Cursor) -> Result<()> {
        self.ensure_usable()?;
        let result = extendible::remove(self, cursor);
        self.guard(result)?;
        self.stats.entries = self.stats.entries.saturating_sub(1);
        self.stats.deletions += 1;
        Ok(())
    }

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

    pub fn len(&self) -> usize {
        self.stats.entries as usize
    }

    pub fn is_empty(&self) -> bool {
        self.stats.entries == 0
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            pages: self.arena.live(),
            directory_depth: self.directory.depth(),
            ..self.stats.clone()
        }
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub fn reset_scan_stats(&mut self) {
        self.stats.scans = 0;
        self.stats.hits = 0;
        self.stats.checks = 0;
        self.stats.max_scan = 0;
    }

    fn record_scan(&mut self, hit: bool, probes: u32) {
        self.stats.scans += 1;
        if hit {
            self.stats.hits += 1;
        }
        self.stats.checks += u64::from(probes);
        self.stats.max_scan = self.stats.max_scan.max(probes);
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.poisoned {
            Err(Error::Poisoned)
        } else {
            Ok(())
        }
    }

    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() && !self.poisoned {
                self.poisoned = true;
                error!(error = %e, "Hash table poisoned");
                request_shutdown("hash table hit a fatal error");
            }
        }
        result
    }
}

impl PageStore for HashTable {
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
        self.arena
            .get_mut(page)
            .map(|entry| &mut entry.page)
            .ok_or_else(|| Error::Corrupt(format!("directory references released page {}", page)))
    }

    fn generation(&self, page: u64) -> Option<u64> {
        self.arena.get(page).map(|entry| entry.generation)
    }

    fn touched(&mut self, page: u64, change: Change) -> Result<()> {
        if change == Change::Moved {
            self.stats.defragmentations += 1;
        }
        if change.invalidates_cursors() {
            self.arena.bump(page);
        }
        Ok(())
    }

    fn next_steps(&mut self) -> [u16; 16] {
        shuffled_steps(&mut self.rng)
    }

    fn replace_split(&mut self, old: u64, low: Page, high: Page) -> Result<(u64, u64)> {
        if self.arena.release(old).is_none() {
            return Err(Error::Corrupt(format!("split of released page {}", old)));
        }
        let low_ref = self.arena.insert(low);
        let high_ref = self.arena.insert(high);
        self.stats.splits += 1;
        Ok((low_ref, high_ref))
    }

    fn directory_changed(&mut self) -> Result<()> {
        Ok(())
    }
}
