//! Grow/split orchestration shared by the file-backed and in-memory stores
//!
//! Both stores keep a [`Directory`] of `u64` page references and hand out
//! mutable pages on request; everything that depends only on that contract
//! (the insert state machine, cursor lookups and full scans) lives here.
//!
//! ```text
//! insert(hash, record)
//!   ├─→ resolve directory entry → page
//!   ├─→ page.insert
//!   │     ├─ Inserted / Defragmented → mark dirty, done
//!   │     ├─ Full → double directory if page depth == global depth,
//!   │     │         split page, retarget entries, retry
//!   │     └─ Illegal → fatal
//! ```
//!
//! Each split raises the depth of the page being split, so the loop ends
//! after at most 32 splits for any one hash. A full page holding nothing but
//! copies of the incoming hash is reported as `PageFull` straight away.

use super::cursor::Cursor;
use super::directory::Directory;
use super::page::{max_record_len, InsertOutcome, Page};
use crate::error::{Error, Result};
use tracing::{debug, error, trace};

/// Storage side of an extendible hash
pub(crate) trait PageStore {
    fn page_size(&self) -> usize;

    fn directory(&self) -> &Directory<u64>;

    fn directory_mut(&mut self) -> &mut Directory<u64>;

    /// Borrow a page for reading or mutation, loading it if necessary
    fn page_mut(&mut self, page: u64) -> Result<&mut Page>;

    /// Current generation of a resident page
    fn generation(&self, page: u64) -> Option<u64>;

    /// Record a mutation of a resident page
    fn touched(&mut self, page: u64, change: Change) -> Result<()>;

    /// Probe steps for a page about to be created
    fn next_steps(&mut self) -> [u16; 16];

    /// Store the two children of a split and retire `old`
    fn replace_split(&mut self, old: u64, low: Page, high: Page) -> Result<(u64, u64)>;

    /// Called after the directory changed shape or contents
    fn directory_changed(&mut self) -> Result<()>;
}

/// How a mutation affected the slots cursors may name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Change {
    /// Slots keep their records; only bytes or tombstones changed
    InPlace,
    /// A slot vacated by a removal now holds a different record
    SlotReused,
    /// The page was rebuilt and its slots renumbered
    Moved,
}

impl Change {
    /// Does this change void cursors issued for the page?
    pub(crate) fn invalidates_cursors(self) -> bool {
        self != Change::InPlace
    }
}

/// What an insert had to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct InsertReport {
    pub defragmented: bool,
    pub splits: u32,
}

pub(crate) fn insert<S: PageStore>(store: &mut S, hash: u32, record: &[u8]) -> Result<InsertReport> {
    let max = max_record_len(store.page_size());
    if record.len() > max {
        return Err(Error::RecordTooLarge {
            len: record.len(),
            max,
        });
    }

    let mut report = InsertReport::default();
    loop {
        let page_ref = store.directory().resolve(hash);
        let global_depth = store.directory().depth();
        let page = store.page_mut(page_ref)?;

        match page.insert(hash, record) {
            InsertOutcome::Inserted { reused, .. } => {
                let change = if reused { Change::SlotReused } else { Change::InPlace };
                store.touched(page_ref, change)?;
                return Ok(report);
            }
            InsertOutcome::Defragmented { .. } => {
                store.touched(page_ref, Change::Moved)?;
                report.defragmented = true;
                return Ok(report);
            }
            InsertOutcome::Illegal => {
                let (depth, group) = (page.depth(), page.hash_group());
                error!(
                    hash = format_args!("{:#010x}", hash),
                    page = page_ref,
                    depth,
                    group = format_args!("{:#010x}", group),
                    "Directory resolved hash to a page outside its group"
                );
                return Err(Error::Illegal { hash, depth, group });
            }
            InsertOutcome::Full => {
                let depth = page.depth();
                let group = page.hash_group();
                // No split can separate records that share every hash bit
                if depth >= 32 || page.records().all(|(_, stored, _)| stored == hash) {
                    return Err(Error::PageFull { hash });
                }
                if depth > global_depth {
                    return Err(Error::Corrupt(format!(
                        "page {} has depth {} beyond directory depth {}",
                        page_ref, depth, global_depth
                    )));
                }
                let parent = page.clone();

                let low_steps = store.next_steps();
                let high_steps = store.next_steps();
                let (low, high) = parent.split(depth + 1, low_steps, high_steps)?;
                trace!(
                    page = page_ref,
                    depth,
                    low = low.record_count(),
                    high = high.record_count(),
                    "Split page"
                );

                if depth == global_depth {
                    store.directory_mut().double();
                    debug!(depth = store.directory().depth(), "Doubled directory");
                }
                let (low_ref, high_ref) = store.replace_split(page_ref, low, high)?;
                store.directory_mut().retarget(depth, group, low_ref, high_ref);
                store.directory_changed()?;
                report.splits += 1;
            }
        }
    }
}

/// Lookup result together with the probe length it took
pub(crate) struct Found {
    pub cursor: Option<Cursor>,
    pub probes: u32,
}

pub(crate) fn find_first<S: PageStore>(store: &mut S, hash: u32) -> Result<Found> {
    let page_ref = store.directory().resolve(hash);
    let lookup = store.page_mut(page_ref)?.find_first(hash);
    Ok(Found {
        cursor: lookup.slot.map(|slot| cursor_for(&*store, page_ref, slot, hash)),
        probes: lookup.probes,
    })
}

pub(crate) fn find_next<S: PageStore>(store: &mut S, cursor: &Cursor, hash: u32) -> Result<Found> {
    let lookup = checked_page(store, cursor)?.find_next(cursor.slot, hash);
    Ok(Found {
        cursor: lookup.slot.map(|slot| cursor_for(&*store, cursor.page, slot, hash)),
        probes: lookup.probes,
    })
}

pub(crate) fn copy<S: PageStore>(store: &mut S, cursor: &Cursor) -> Result<Vec<u8>> {
    checked_page(store, cursor)?
        .record(cursor.slot)
        .map(<[u8]>::to_vec)
        .ok_or(Error::StaleCursor)
}

pub(crate) fn update<S: PageStore>(store: &mut S, cursor: &Cursor, bytes: &[u8]) -> Result<()> {
    checked_page(store, cursor)?.update(cursor.slot, bytes)?;
    store.touched(cursor.page, Change::InPlace)
}

pub(crate) fn remove<S: PageStore>(store: &mut S, cursor: &Cursor) -> Result<()> {
    if !checked_page(store, cursor)?.remove(cursor.slot) {
        return Err(Error::StaleCursor);
    }
    store.touched(cursor.page, Change::InPlace)
}

pub(crate) fn find_first_all<S: PageStore>(store: &mut S) -> Result<Option<(Cursor, Vec<u8>)>> {
    scan_from(store, 0, 0)
}

pub(crate) fn find_next_all<S: PageStore>(store: &mut S, cursor: &Cursor) -> Result<Option<(Cursor, Vec<u8>)>> {
    let page = checked_page(store, cursor)?;
    let (depth, group) = (page.depth(), page.hash_group());
    let index = store.directory().range_of(depth, group).start;
    scan_from(store, index, cursor.slot + 1)
}

/// Walk directory entries from `index`, visiting each page once
fn scan_from<S: PageStore>(store: &mut S, mut index: usize, mut from_slot: u32) -> Result<Option<(Cursor, Vec<u8>)>> {
    loop {
        let Some(page_ref) = store.directory().get(index) else {
            return Ok(None);
        };
        let page = store.page_mut(page_ref)?;
        if let Some(slot) = page.next_live_slot(from_slot) {
            let hash = page.record_hash(slot).ok_or(Error::StaleCursor)?;
            let record = page.record(slot).map(<[u8]>::to_vec).ok_or(Error::StaleCursor)?;
            return Ok(Some((cursor_for(&*store, page_ref, slot, hash), record)));
        }
        match store.directory().next_distinct(index) {
            Some(next) => index = next,
            None => return Ok(None),
        }
        from_slot = 0;
    }
}

fn checked_page<'a, S: PageStore>(store: &'a mut S, cursor: &Cursor) -> Result<&'a mut Page> {
    if store.generation(cursor.page) != Some(cursor.generation) {
        return Err(Error::StaleCursor);
    }
    store.page_mut(cursor.page)
}

fn cursor_for<S: PageStore>(store: &S, page: u64, slot: u32, hash: u32) -> Cursor {
    Cursor {
        page,
        slot,
        generation: store.generation(page).unwrap_or_default(),
        hash,
    }
}
