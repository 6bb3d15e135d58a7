//! The page-cache manager: dirty-state bookkeeping over the pluggable
//! cache.
//!
//! The manager owns the per-pager dirty list (a doubly linked intrusive
//! list threaded through cache entries, newest at the head), the
//! `synced` bookmark that accelerates spill-victim selection, reference
//! counting, and the flag discipline:
//!
//! * an entry is in the dirty list exactly when its DIRTY flag is set;
//! * only clean entries are ever handed back to the pluggable cache's
//!   LRU, so everything recyclable is clean;
//! * a NEED_SYNC entry must not reach the database file until the
//!   journal is synced — victim selection prefers entries without it.
//!
//! Memory pressure surfaces as [`FetchOutcome::NeedsSpill`]: the pager
//! writes the victim back, calls [`PageCache::make_clean`], and retries
//! with [`PageCache::fetch_force`]. This is the stress protocol with the
//! callback turned into a return value.

use tracing::debug;

use quarry_error::{QuarryError, Result};
use quarry_types::flags::PageFlags;
use quarry_types::{PageNumber, PageSize};

use crate::cache::{CacheFetch, CacheHandle, CreateFlag, EntryIdx, GroupMode, GroupState};
use crate::page_buf::SlabSpec;

/// Result of a fetch through the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The page is resident and pinned. `is_new` means the content is
    /// uninitialised and must be filled by the caller.
    Found {
        /// Freshly allocated (stale content) vs. cache hit.
        is_new: bool,
    },
    /// Not resident and allocation was not requested or not possible.
    Missing,
    /// Allocation requires cleaning this dirty page first. The caller
    /// must write it back, call `make_clean`, and retry with
    /// `fetch_force`.
    NeedsSpill(PageNumber),
}

/// Dirty-state manager over one pluggable cache.
#[derive(Debug)]
pub struct PageCache {
    cache: CacheHandle,
    /// Newest dirty entry.
    dirty_head: Option<EntryIdx>,
    /// Oldest dirty entry.
    dirty_tail: Option<EntryIdx>,
    /// Spill-victim bookmark: at or older than the oldest dirty entry
    /// whose NEED_SYNC is clear. May lag; consumers re-verify.
    synced: Option<EntryIdx>,
    n_dirty: usize,
    n_ref_sum: i64,
    purgeable: bool,
    /// Resident-page threshold below which pressure never spills
    /// (0 disables the threshold).
    spill_size: u32,
}

impl PageCache {
    /// Open a manager over a fresh pluggable cache.
    #[must_use]
    pub fn open(
        page_size: PageSize,
        extra_size: usize,
        purgeable: bool,
        mode: GroupMode,
        slab: SlabSpec,
    ) -> Self {
        Self {
            cache: CacheHandle::create(page_size, extra_size, purgeable, mode, slab),
            dirty_head: None,
            dirty_tail: None,
            synced: None,
            n_dirty: 0,
            n_ref_sum: 0,
            purgeable,
            spill_size: 0,
        }
    }

    /// Soft maximum number of cached pages.
    pub fn set_cache_size(&mut self, n_max: u32) {
        self.cache.set_cache_size(n_max);
    }

    /// Minimum resident-page count before memory pressure may force
    /// dirty write-back.
    pub fn set_spill_size(&mut self, spill_size: u32) {
        self.spill_size = spill_size;
    }

    /// Pages currently resident.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.cache.page_count()
    }

    /// Sum of reference counts over all pages.
    #[must_use]
    pub fn ref_count_sum(&self) -> i64 {
        self.n_ref_sum
    }

    /// Number of dirty pages.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.n_dirty
    }

    /// Whether `pgno` is resident.
    #[must_use]
    pub fn contains(&self, pgno: PageNumber) -> bool {
        self.cache.lock().hash_lookup(self.cache.id, pgno.get()).is_some()
    }

    fn lookup(state: &GroupState, cache: &CacheHandle, pgno: PageNumber) -> Result<EntryIdx> {
        state
            .hash_lookup(cache.id, pgno.get())
            .ok_or_else(|| QuarryError::internal(format!("page {pgno} not in cache")))
    }

    // -----------------------------------------------------------------
    // Fetch / release
    // -----------------------------------------------------------------

    /// Fetch `pgno`, pinning it. With `create` unset this is a pure
    /// lookup.
    pub fn fetch(&mut self, pgno: PageNumber, create: bool) -> FetchOutcome {
        // Under pressure, a purgeable cache with dirty pages first asks
        // for an easy allocation; the spill protocol supplies the hard
        // ones.
        let flag = if !create {
            CreateFlag::DontCreate
        } else if self.purgeable && self.n_dirty > 0 {
            CreateFlag::SoftCreate
        } else {
            CreateFlag::ForceCreate
        };

        match self.cache.fetch(pgno.get(), flag) {
            CacheFetch::Hit(idx) => {
                self.pin(idx);
                FetchOutcome::Found { is_new: false }
            }
            CacheFetch::New(idx) => {
                self.pin(idx);
                FetchOutcome::Found { is_new: true }
            }
            CacheFetch::Miss if !create => FetchOutcome::Missing,
            CacheFetch::Miss => {
                if self.spill_size > 0 && (self.page_count() as u64) < u64::from(self.spill_size) {
                    // Below the spill floor: grow instead of writing back.
                    return self.fetch_force(pgno);
                }
                match self.pick_spill_victim() {
                    Some(victim) => {
                        debug!(page = victim.get(), "cache pressure: spill requested");
                        FetchOutcome::NeedsSpill(victim)
                    }
                    // Nothing spillable (all pinned or journal-bound):
                    // allocate past the soft limit.
                    None => self.fetch_force(pgno),
                }
            }
        }
    }

    /// Allocate `pgno` unconditionally (post-spill retry).
    pub fn fetch_force(&mut self, pgno: PageNumber) -> FetchOutcome {
        match self.cache.fetch(pgno.get(), CreateFlag::ForceCreate) {
            CacheFetch::Hit(idx) => {
                self.pin(idx);
                FetchOutcome::Found { is_new: false }
            }
            CacheFetch::New(idx) => {
                self.pin(idx);
                FetchOutcome::Found { is_new: true }
            }
            CacheFetch::Miss => unreachable!("ForceCreate cannot miss"),
        }
    }

    fn pin(&mut self, idx: EntryIdx) {
        let mut state = self.cache.lock();
        state.entry_mut(idx).n_ref += 1;
        drop(state);
        self.n_ref_sum += 1;
    }

    /// Add a reference to an already pinned page.
    pub fn page_ref(&mut self, pgno: PageNumber) -> Result<()> {
        let mut state = self.cache.lock();
        let idx = Self::lookup(&state, &self.cache, pgno)?;
        debug_assert!(state.entry(idx).n_ref > 0, "ref of unpinned page");
        state.entry_mut(idx).n_ref += 1;
        drop(state);
        self.n_ref_sum += 1;
        Ok(())
    }

    /// Drop one reference. A clean entry whose count reaches zero is
    /// offered back to the LRU for reuse.
    pub fn release(&mut self, pgno: PageNumber) -> Result<()> {
        let mut state = self.cache.lock();
        let idx = Self::lookup(&state, &self.cache, pgno)?;
        let entry = state.entry_mut(idx);
        debug_assert!(entry.n_ref > 0, "release of unpinned page");
        entry.n_ref -= 1;
        let now_free = entry.n_ref == 0;
        let clean = !entry.flags.contains(PageFlags::DIRTY);
        let reuse_unlikely = entry.flags.contains(PageFlags::REUSE_UNLIKELY);
        drop(state);

        self.n_ref_sum -= 1;
        if now_free && clean {
            self.cache.unpin(idx, reuse_unlikely);
        }
        Ok(())
    }

    /// Remove a page from the cache entirely. The caller must hold the
    /// only reference.
    pub fn drop_page(&mut self, pgno: PageNumber) -> Result<()> {
        let mut state = self.cache.lock();
        let idx = Self::lookup(&state, &self.cache, pgno)?;
        debug_assert_eq!(state.entry(idx).n_ref, 1, "drop with outstanding refs");
        if state.entry(idx).flags.contains(PageFlags::DIRTY) {
            Self::dirty_remove(
                &mut self.dirty_head,
                &mut self.dirty_tail,
                &mut self.synced,
                &mut self.n_dirty,
                &mut state,
                idx,
            );
        }
        let n_ref = state.entry(idx).n_ref;
        state.drop_entry(idx);
        drop(state);
        self.n_ref_sum -= n_ref;
        Ok(())
    }

    /// Move a page to a new page number.
    pub fn rekey(&mut self, old: PageNumber, new: PageNumber) -> Result<()> {
        let state = self.cache.lock();
        let idx = Self::lookup(&state, &self.cache, old)?;
        drop(state);
        self.cache.rekey(idx, new.get());
        Ok(())
    }

    // -----------------------------------------------------------------
    // Flags and content
    // -----------------------------------------------------------------

    /// The flag set of a resident page.
    pub fn flags(&self, pgno: PageNumber) -> Result<PageFlags> {
        let state = self.cache.lock();
        let idx = Self::lookup(&state, &self.cache, pgno)?;
        Ok(state.entry(idx).flags)
    }

    /// Set flag bits on a resident page.
    pub fn set_flags(&mut self, pgno: PageNumber, flags: PageFlags) -> Result<()> {
        let mut state = self.cache.lock();
        let idx = Self::lookup(&state, &self.cache, pgno)?;
        state.entry_mut(idx).flags |= flags;
        Ok(())
    }

    /// Clear flag bits on a resident page.
    pub fn clear_flags(&mut self, pgno: PageNumber, flags: PageFlags) -> Result<()> {
        let mut state = self.cache.lock();
        let idx = Self::lookup(&state, &self.cache, pgno)?;
        state.entry_mut(idx).flags &= !flags;
        Ok(())
    }

    /// Read access to page content.
    pub fn with_data<R>(&self, pgno: PageNumber, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let state = self.cache.lock();
        let idx = Self::lookup(&state, &self.cache, pgno)?;
        Ok(f(state.entry(idx).data.as_slice()))
    }

    /// Write access to page content. Does not change flags; callers mark
    /// dirtiness explicitly.
    pub fn with_data_mut<R>(&mut self, pgno: PageNumber, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut state = self.cache.lock();
        let idx = Self::lookup(&state, &self.cache, pgno)?;
        Ok(f(state.entry_mut(idx).data.as_mut_slice()))
    }

    /// Read access to the per-page extra region.
    pub fn with_extra<R>(&self, pgno: PageNumber, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let state = self.cache.lock();
        let idx = Self::lookup(&state, &self.cache, pgno)?;
        Ok(f(state.entry(idx).extra.as_slice()))
    }

    /// Write access to the per-page extra region.
    pub fn with_extra_mut<R>(
        &mut self,
        pgno: PageNumber,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let mut state = self.cache.lock();
        let idx = Self::lookup(&state, &self.cache, pgno)?;
        Ok(f(state.entry_mut(idx).extra.as_mut_slice()))
    }

    // -----------------------------------------------------------------
    // Dirty list
    // -----------------------------------------------------------------

    fn dirty_add_head(
        dirty_head: &mut Option<EntryIdx>,
        dirty_tail: &mut Option<EntryIdx>,
        synced: &mut Option<EntryIdx>,
        n_dirty: &mut usize,
        state: &mut GroupState,
        idx: EntryIdx,
    ) {
        let old_head = *dirty_head;
        {
            let entry = state.entry_mut(idx);
            entry.dirty_next = old_head;
            entry.dirty_prev = None;
        }
        if let Some(h) = old_head {
            state.entry_mut(h).dirty_prev = Some(idx);
        } else {
            *dirty_tail = Some(idx);
        }
        *dirty_head = Some(idx);
        *n_dirty += 1;

        if synced.is_none() && !state.entry(idx).flags.contains(PageFlags::NEED_SYNC) {
            *synced = Some(idx);
        }
    }

    fn dirty_remove(
        dirty_head: &mut Option<EntryIdx>,
        dirty_tail: &mut Option<EntryIdx>,
        synced: &mut Option<EntryIdx>,
        n_dirty: &mut usize,
        state: &mut GroupState,
        idx: EntryIdx,
    ) {
        if *synced == Some(idx) {
            *synced = state.entry(idx).dirty_prev;
        }
        let (prev, next) = {
            let entry = state.entry(idx);
            (entry.dirty_prev, entry.dirty_next)
        };
        match prev {
            Some(p) => state.entry_mut(p).dirty_next = next,
            None => *dirty_head = next,
        }
        match next {
            Some(n) => state.entry_mut(n).dirty_prev = prev,
            None => *dirty_tail = prev,
        }
        let entry = state.entry_mut(idx);
        entry.dirty_prev = None;
        entry.dirty_next = None;
        *n_dirty -= 1;
    }

    /// Mark a page dirty, inserting at the MRU end of the dirty list.
    /// Idempotent; also clears DONT_WRITE (the page is live again).
    pub fn make_dirty(&mut self, pgno: PageNumber) -> Result<()> {
        let mut state = self.cache.lock();
        let idx = Self::lookup(&state, &self.cache, pgno)?;
        let entry = state.entry_mut(idx);
        entry.flags.remove(PageFlags::DONT_WRITE);
        if entry.flags.contains(PageFlags::DIRTY) {
            return Ok(());
        }
        entry.flags.insert(PageFlags::DIRTY);
        Self::dirty_add_head(
            &mut self.dirty_head,
            &mut self.dirty_tail,
            &mut self.synced,
            &mut self.n_dirty,
            &mut state,
            idx,
        );
        Ok(())
    }

    /// Mark a page clean: clear DIRTY, NEED_SYNC, and WRITEABLE, leave
    /// the dirty list, and become reusable if unreferenced.
    pub fn make_clean(&mut self, pgno: PageNumber) -> Result<()> {
        let mut state = self.cache.lock();
        let idx = Self::lookup(&state, &self.cache, pgno)?;
        if !state.entry(idx).flags.contains(PageFlags::DIRTY) {
            return Ok(());
        }
        Self::dirty_remove(
            &mut self.dirty_head,
            &mut self.dirty_tail,
            &mut self.synced,
            &mut self.n_dirty,
            &mut state,
            idx,
        );
        let entry = state.entry_mut(idx);
        entry
            .flags
            .remove(PageFlags::DIRTY | PageFlags::NEED_SYNC | PageFlags::WRITEABLE);
        let now_free = entry.n_ref == 0;
        let reuse_unlikely = entry.flags.contains(PageFlags::REUSE_UNLIKELY);
        drop(state);
        if now_free {
            self.cache.unpin(idx, reuse_unlikely);
        }
        Ok(())
    }

    /// Make every dirty page clean.
    pub fn clean_all(&mut self) {
        while let Some(idx) = self.dirty_head {
            let pgno = {
                let state = self.cache.lock();
                PageNumber::new(state.entry(idx).pgno).expect("cached page 0")
            };
            self.make_clean(pgno).expect("dirty page vanished");
        }
    }

    /// Clear the WRITEABLE and NEED_SYNC flags on every dirty page
    /// (end of transaction).
    pub fn clear_writable(&mut self) {
        let mut state = self.cache.lock();
        let mut cursor = self.dirty_head;
        while let Some(idx) = cursor {
            let entry = state.entry_mut(idx);
            entry
                .flags
                .remove(PageFlags::WRITEABLE | PageFlags::NEED_SYNC);
            cursor = entry.dirty_next;
        }
        drop(state);
        self.synced = self.dirty_tail;
    }

    /// Clear NEED_SYNC on every dirty page (the journal was synced) and
    /// reset the bookmark to the oldest entry.
    pub fn clear_need_sync(&mut self) {
        let mut state = self.cache.lock();
        let mut cursor = self.dirty_head;
        while let Some(idx) = cursor {
            let entry = state.entry_mut(idx);
            entry.flags.remove(PageFlags::NEED_SYNC);
            cursor = entry.dirty_next;
        }
        drop(state);
        self.synced = self.dirty_tail;
    }

    /// The dirty pages sorted by page number (write-out order).
    #[must_use]
    pub fn dirty_pages_sorted(&self) -> Vec<PageNumber> {
        let mut pages = self.dirty_pages_oldest_first();
        pages.sort_unstable();
        pages
    }

    /// The dirty pages oldest-first (list order from the tail).
    #[must_use]
    pub fn dirty_pages_oldest_first(&self) -> Vec<PageNumber> {
        let state = self.cache.lock();
        let mut out = Vec::with_capacity(self.n_dirty);
        let mut cursor = self.dirty_tail;
        while let Some(idx) = cursor {
            let entry = state.entry(idx);
            out.push(PageNumber::new(entry.pgno).expect("cached page 0"));
            cursor = entry.dirty_prev;
        }
        out
    }

    // -----------------------------------------------------------------
    // Spill victim selection
    // -----------------------------------------------------------------

    /// The best dirty page to write back under pressure: the oldest
    /// unreferenced entry that does not require a journal sync, located
    /// via the `synced` bookmark; otherwise the oldest unreferenced
    /// dirty entry.
    pub fn pick_spill_victim(&mut self) -> Option<PageNumber> {
        let state = self.cache.lock();

        // Walk newer-ward from the bookmark to the first usable entry.
        let mut cursor = self.synced;
        while let Some(idx) = cursor {
            let entry = state.entry(idx);
            if entry.n_ref == 0 && !entry.flags.contains(PageFlags::NEED_SYNC) {
                break;
            }
            cursor = entry.dirty_prev;
        }
        let found = cursor;

        let victim = found.or_else(|| {
            // Everything needs a sync: take the oldest unreferenced
            // dirty page instead.
            let mut cursor = self.dirty_tail;
            while let Some(idx) = cursor {
                let entry = state.entry(idx);
                if entry.n_ref == 0 {
                    return Some(idx);
                }
                cursor = entry.dirty_prev;
            }
            None
        });

        let pgno = victim.map(|idx| PageNumber::new(state.entry(idx).pgno).expect("cached page 0"));
        drop(state);

        if found.is_some() {
            self.synced = found;
        }
        pgno
    }

    // -----------------------------------------------------------------
    // Truncation and teardown
    // -----------------------------------------------------------------

    /// Discard every entry with `pgno > limit`.
    pub fn truncate(&mut self, limit: u32) {
        let mut state = self.cache.lock();
        let mut cursor = self.dirty_head;
        let mut victims = Vec::new();
        while let Some(idx) = cursor {
            let entry = state.entry(idx);
            cursor = entry.dirty_next;
            if entry.pgno > limit {
                victims.push(idx);
            }
        }
        for idx in victims {
            debug_assert_eq!(state.entry(idx).n_ref, 0, "truncating a referenced page");
            Self::dirty_remove(
                &mut self.dirty_head,
                &mut self.dirty_tail,
                &mut self.synced,
                &mut self.n_dirty,
                &mut state,
                idx,
            );
            state
                .entry_mut(idx)
                .flags
                .remove(PageFlags::DIRTY | PageFlags::NEED_SYNC | PageFlags::WRITEABLE);
        }
        drop(state);
        self.cache.truncate(limit + 1);
    }

    /// Discard every dirty entry without writing it (rollback in WAL
    /// mode, or error-state reset).
    pub fn drop_all_dirty(&mut self) {
        let mut state = self.cache.lock();
        let mut victims = Vec::with_capacity(self.n_dirty);
        let mut cursor = self.dirty_head;
        while let Some(idx) = cursor {
            victims.push(idx);
            cursor = state.entry(idx).dirty_next;
        }
        for idx in victims {
            Self::dirty_remove(
                &mut self.dirty_head,
                &mut self.dirty_tail,
                &mut self.synced,
                &mut self.n_dirty,
                &mut state,
                idx,
            );
            let entry = state.entry_mut(idx);
            entry
                .flags
                .remove(PageFlags::DIRTY | PageFlags::NEED_SYNC | PageFlags::WRITEABLE);
            debug_assert_eq!(entry.n_ref, 0, "dropping a referenced dirty page");
            state.drop_entry(idx);
        }
    }

    /// Discard every entry, dirty or clean. Outstanding references must
    /// be gone.
    pub fn clear(&mut self) {
        let mut state = self.cache.lock();
        let mut cursor = self.dirty_head;
        while let Some(idx) = cursor {
            let next = state.entry(idx).dirty_next;
            Self::dirty_remove(
                &mut self.dirty_head,
                &mut self.dirty_tail,
                &mut self.synced,
                &mut self.n_dirty,
                &mut state,
                idx,
            );
            state
                .entry_mut(idx)
                .flags
                .remove(PageFlags::DIRTY | PageFlags::NEED_SYNC | PageFlags::WRITEABLE);
            cursor = next;
        }
        let members = self.cache.members(&state);
        for idx in members {
            state.drop_entry(idx);
        }
        drop(state);
        self.n_ref_sum = 0;
    }

    // -----------------------------------------------------------------
    // Integrity (test support)
    // -----------------------------------------------------------------

    /// Verify the dirty-list and bookmark invariants.
    #[doc(hidden)]
    pub fn check_integrity(&self) {
        let state = self.cache.lock();

        // Dirty flag iff dirty-list membership.
        let mut on_list = std::collections::HashSet::new();
        let mut cursor = self.dirty_tail;
        while let Some(idx) = cursor {
            let entry = state.entry(idx);
            assert!(
                entry.flags.contains(PageFlags::DIRTY),
                "page {} in dirty list without DIRTY",
                entry.pgno
            );
            on_list.insert(idx.0);
            cursor = entry.dirty_prev;
        }
        assert_eq!(on_list.len(), self.n_dirty, "dirty count drift");
        for idx in self.cache.members(&state) {
            let entry = state.entry(idx);
            assert_eq!(
                entry.flags.contains(PageFlags::DIRTY),
                on_list.contains(&idx.0),
                "page {} DIRTY flag disagrees with list membership",
                entry.pgno
            );
        }

        // Bookmark: everything strictly older than `synced` needs sync.
        if let Some(s) = self.synced {
            let mut cursor = state.entry(s).dirty_next;
            while let Some(idx) = cursor {
                let entry = state.entry(idx);
                assert!(
                    entry.flags.contains(PageFlags::NEED_SYNC),
                    "page {} older than bookmark lacks NEED_SYNC",
                    entry.pgno
                );
                cursor = entry.dirty_next;
            }
        }
    }
}
