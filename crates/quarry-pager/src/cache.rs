//! The pluggable page cache: a keyed store of page buffers with an LRU
//! over unpinned entries.
//!
//! Entries for every cache in a [`CacheGroup`] live in one slab owned by
//! the group, so caches in the same group can recycle each other's
//! unpinned buffers under memory pressure. Two modes exist:
//!
//! * **private group** — the cache is the sole member of its own group;
//!   the group mutex is uncontended;
//! * **global group** — all caches share one process-wide group and one
//!   mutex, trading throughput for better memory utilisation.
//!
//! Per-cache lookup is a chained hash table on the page number, sized to
//! a power of two and grown when occupancy reaches the bucket count. An
//! entry is pinned exactly when its LRU link is vacant; only unpinned
//! (always clean) entries are eligible for recycling.
//!
//! This module is called only by the page-cache manager in
//! [`crate::page_cache`]; the manager layers dirty tracking and spill
//! policy on top.

use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use quarry_types::PageSize;
use quarry_types::flags::PageFlags;

use crate::page_buf::{PageBuf, PageBufPool, SlabSpec};

/// Default minimum page reservation per cache.
const DEFAULT_MIN_PAGES: u32 = 10;

/// Initial hash bucket count.
const INITIAL_BUCKETS: usize = 16;

// ---------------------------------------------------------------------------
// Entry storage
// ---------------------------------------------------------------------------

/// Index of an entry in the group slab.
///
/// Stable while the entry is pinned or dirty; recycled entries hand
/// their slot to a new page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryIdx(pub(crate) u32);

/// LRU linkage. Present exactly when the entry is unpinned.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LruLinks {
    pub(crate) prev: Option<EntryIdx>,
    pub(crate) next: Option<EntryIdx>,
}

/// One cached page and its bookkeeping.
///
/// The first block of fields belongs to this module; the manager section
/// below is owned by [`crate::page_cache`] and is never touched here
/// except to initialise it.
#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) cache_id: u32,
    pub(crate) pgno: u32,
    pub(crate) data: PageBuf,
    /// Opaque scratch for upper layers; always a separate allocation
    /// from the page data.
    pub(crate) extra: Vec<u8>,
    pub(crate) hash_next: Option<EntryIdx>,
    /// `Some` while unpinned (on the group LRU).
    pub(crate) lru: Option<LruLinks>,

    // --- manager section ---
    pub(crate) flags: PageFlags,
    pub(crate) n_ref: i64,
    pub(crate) dirty_next: Option<EntryIdx>,
    pub(crate) dirty_prev: Option<EntryIdx>,
}

/// Size of the per-page bookkeeping footprint, excluding the page data
/// itself. This answers the header-size configuration query.
#[must_use]
pub fn entry_header_size() -> usize {
    std::mem::size_of::<Entry>()
}

// ---------------------------------------------------------------------------
// Shard (per-cache state)
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct Shard {
    pub(crate) page_size: usize,
    pub(crate) extra_size: usize,
    pub(crate) purgeable: bool,
    pub(crate) n_min: u32,
    pub(crate) n_max: u32,
    pub(crate) n_90pct: u32,
    /// Largest key seen since the last truncate.
    pub(crate) max_key: u32,
    pub(crate) n_page: u32,
    hash: Vec<Option<EntryIdx>>,
    pub(crate) pool: PageBufPool,
}

impl Shard {
    fn bucket(&self, pgno: u32) -> usize {
        (pgno as usize) & (self.hash.len() - 1)
    }
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// Shared state of every cache in a group.
#[derive(Debug, Default)]
pub(crate) struct GroupState {
    entries: Vec<Option<Entry>>,
    free_slots: Vec<u32>,
    pub(crate) shards: Vec<Option<Shard>>,
    /// Most recently unpinned end of the LRU.
    lru_head: Option<EntryIdx>,
    /// Oldest end; recycled first.
    lru_tail: Option<EntryIdx>,
    /// Entries currently on the LRU.
    pub(crate) n_recyclable: u32,
    /// Sum of `n_max` over purgeable member caches.
    pub(crate) n_max_page: u32,
    /// Sum of `n_min` over purgeable member caches.
    pub(crate) n_min_page: u32,
    /// Pinned-page budget: `n_max_page + 10 - n_min_page`.
    pub(crate) mx_pinned: u32,
    /// Pages currently allocated by purgeable member caches.
    pub(crate) n_purgeable: u32,
}

impl GroupState {
    pub(crate) fn entry(&self, idx: EntryIdx) -> &Entry {
        self.entries[idx.0 as usize].as_ref().expect("dangling EntryIdx")
    }

    pub(crate) fn entry_mut(&mut self, idx: EntryIdx) -> &mut Entry {
        self.entries[idx.0 as usize].as_mut().expect("dangling EntryIdx")
    }

    pub(crate) fn shard(&self, id: u32) -> &Shard {
        self.shards[id as usize].as_ref().expect("destroyed cache")
    }

    pub(crate) fn shard_mut(&mut self, id: u32) -> &mut Shard {
        self.shards[id as usize].as_mut().expect("destroyed cache")
    }

    // --- slab ---

    fn alloc_slot(&mut self, entry: Entry) -> EntryIdx {
        if let Some(free) = self.free_slots.pop() {
            self.entries[free as usize] = Some(entry);
            EntryIdx(free)
        } else {
            let raw = u32::try_from(self.entries.len()).expect("entry slab overflow");
            self.entries.push(Some(entry));
            EntryIdx(raw)
        }
    }

    fn free_slot(&mut self, idx: EntryIdx) -> Entry {
        let entry = self.entries[idx.0 as usize]
            .take()
            .expect("free of vacant slot");
        self.free_slots.push(idx.0);
        entry
    }

    // --- hash ---

    pub(crate) fn hash_lookup(&self, cache_id: u32, pgno: u32) -> Option<EntryIdx> {
        let shard = self.shard(cache_id);
        let mut cursor = shard.hash[shard.bucket(pgno)];
        while let Some(idx) = cursor {
            let entry = self.entry(idx);
            if entry.pgno == pgno {
                return Some(idx);
            }
            cursor = entry.hash_next;
        }
        None
    }

    fn hash_insert(&mut self, cache_id: u32, idx: EntryIdx) {
        let pgno = self.entry(idx).pgno;
        let shard = self.shard(cache_id);
        let bucket = shard.bucket(pgno);
        let head = shard.hash[bucket];
        self.entry_mut(idx).hash_next = head;
        self.shard_mut(cache_id).hash[bucket] = Some(idx);
    }

    fn hash_remove(&mut self, cache_id: u32, idx: EntryIdx) {
        let pgno = self.entry(idx).pgno;
        let shard = self.shard(cache_id);
        let bucket = shard.bucket(pgno);
        let mut cursor = shard.hash[bucket];
        let mut prev: Option<EntryIdx> = None;
        while let Some(cur) = cursor {
            if cur == idx {
                let next = self.entry(cur).hash_next;
                match prev {
                    Some(p) => self.entry_mut(p).hash_next = next,
                    None => self.shard_mut(cache_id).hash[bucket] = next,
                }
                self.entry_mut(idx).hash_next = None;
                return;
            }
            prev = Some(cur);
            cursor = self.entry(cur).hash_next;
        }
        unreachable!("entry missing from its hash chain");
    }

    /// Double the bucket count once occupancy reaches it.
    fn maybe_grow_hash(&mut self, cache_id: u32) {
        let shard = self.shard(cache_id);
        if (shard.n_page as usize) < shard.hash.len() {
            return;
        }
        let new_len = (shard.hash.len() * 2).max(INITIAL_BUCKETS);

        // Collect this shard's entries, then redistribute.
        let mut members = Vec::with_capacity(shard.n_page as usize);
        for bucket in &shard.hash {
            let mut cursor = *bucket;
            while let Some(idx) = cursor {
                members.push(idx);
                cursor = self.entry(idx).hash_next;
            }
        }
        let shard = self.shard_mut(cache_id);
        shard.hash = vec![None; new_len];
        for idx in members {
            self.entry_mut(idx).hash_next = None;
            self.hash_insert(cache_id, idx);
        }
    }

    // --- LRU ---

    pub(crate) fn lru_remove(&mut self, idx: EntryIdx) {
        let links = self.entry_mut(idx).lru.take().expect("not on LRU");
        match links.prev {
            Some(p) => {
                self.entry_mut(p)
                    .lru
                    .as_mut()
                    .expect("LRU neighbour off-list")
                    .next = links.next;
            }
            None => self.lru_head = links.next,
        }
        match links.next {
            Some(n) => {
                self.entry_mut(n)
                    .lru
                    .as_mut()
                    .expect("LRU neighbour off-list")
                    .prev = links.prev;
            }
            None => self.lru_tail = links.prev,
        }
        self.n_recyclable -= 1;
    }

    fn lru_push_head(&mut self, idx: EntryIdx) {
        debug_assert!(self.entry(idx).lru.is_none(), "already on LRU");
        let old_head = self.lru_head;
        self.entry_mut(idx).lru = Some(LruLinks {
            prev: None,
            next: old_head,
        });
        if let Some(h) = old_head {
            self.entry_mut(h)
                .lru
                .as_mut()
                .expect("LRU head off-list")
                .prev = Some(idx);
        }
        self.lru_head = Some(idx);
        if self.lru_tail.is_none() {
            self.lru_tail = Some(idx);
        }
        self.n_recyclable += 1;
    }

    fn lru_tail_entry(&self) -> Option<EntryIdx> {
        self.lru_tail
    }

    // --- entry removal ---

    /// Detach an entry from its hash chain and the LRU, release its
    /// buffer, and free the slot.
    pub(crate) fn drop_entry(&mut self, idx: EntryIdx) {
        let cache_id = self.entry(idx).cache_id;
        if self.entry(idx).lru.is_some() {
            self.lru_remove(idx);
        }
        self.hash_remove(cache_id, idx);
        let entry = self.free_slot(idx);
        let shard = self.shard_mut(cache_id);
        shard.n_page -= 1;
        if shard.purgeable {
            self.n_purgeable -= 1;
        }
        drop(entry);
    }

    fn recompute_budget(&mut self) {
        self.mx_pinned = (self.n_max_page + 10).saturating_sub(self.n_min_page);
    }

    /// Drop unpinned entries until the group is back under its page
    /// budget.
    fn enforce_max(&mut self) {
        while self.n_purgeable > self.n_max_page {
            let Some(tail) = self.lru_tail_entry() else {
                break;
            };
            self.drop_entry(tail);
        }
    }
}

/// A set of caches that may recycle each other's unpinned entries.
#[derive(Debug, Default)]
pub struct CacheGroup {
    pub(crate) state: Mutex<GroupState>,
}

impl CacheGroup {
    /// Create an empty group.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// The process-wide group used by [`GroupMode::Global`].
#[must_use]
pub fn global_group() -> Arc<CacheGroup> {
    static GLOBAL: OnceLock<Arc<CacheGroup>> = OnceLock::new();
    Arc::clone(GLOBAL.get_or_init(CacheGroup::new))
}

/// Which group a new cache joins.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum GroupMode {
    /// A fresh single-member group; no cross-cache recycling, no mutex
    /// contention.
    #[default]
    Private,
    /// The process-global group; better memory utilisation under one
    /// shared mutex.
    Global,
}

// ---------------------------------------------------------------------------
// Fetch contract
// ---------------------------------------------------------------------------

/// Allocation strategy for [`CacheHandle::fetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateFlag {
    /// Lookup only; never allocate.
    DontCreate,
    /// Allocate only if spare capacity exists without pressuring the
    /// group.
    SoftCreate,
    /// Allocate unconditionally, recycling if necessary.
    ForceCreate,
}

/// Outcome of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheFetch {
    /// Existing entry, now pinned.
    Hit(EntryIdx),
    /// Freshly allocated entry with stale content, pinned.
    New(EntryIdx),
    /// Nothing found and allocation declined or impossible.
    Miss,
}

// ---------------------------------------------------------------------------
// CacheHandle
// ---------------------------------------------------------------------------

/// A cache registered in a group.
#[derive(Debug)]
pub struct CacheHandle {
    pub(crate) group: Arc<CacheGroup>,
    pub(crate) id: u32,
}

impl CacheHandle {
    /// Create a cache in a fresh private group or the global group.
    #[must_use]
    pub fn create(
        page_size: PageSize,
        extra_size: usize,
        purgeable: bool,
        mode: GroupMode,
        slab: SlabSpec,
    ) -> Self {
        let group = match mode {
            GroupMode::Private => CacheGroup::new(),
            GroupMode::Global => global_group(),
        };
        Self::create_in(group, page_size, extra_size, purgeable, slab)
    }

    /// Create a cache in an explicit group.
    #[must_use]
    pub fn create_in(
        group: Arc<CacheGroup>,
        page_size: PageSize,
        extra_size: usize,
        purgeable: bool,
        slab: SlabSpec,
    ) -> Self {
        let pool = PageBufPool::new(page_size, slab);
        let n_max = u32::try_from(quarry_types::limits::DEFAULT_CACHE_SIZE).unwrap_or(2000);
        let shard = Shard {
            page_size: page_size.as_usize(),
            extra_size,
            purgeable,
            n_min: if purgeable { DEFAULT_MIN_PAGES } else { 0 },
            n_max,
            n_90pct: n_max * 9 / 10,
            max_key: 0,
            n_page: 0,
            hash: vec![None; INITIAL_BUCKETS],
            pool,
        };

        let id = {
            let mut state = group.state.lock();
            if shard.purgeable {
                state.n_max_page += shard.n_max;
                state.n_min_page += shard.n_min;
                state.recompute_budget();
            }
            let id = u32::try_from(state.shards.len()).expect("shard id overflow");
            state.shards.push(Some(shard));
            id
        };

        debug!(cache_id = id, page_size = page_size.get(), purgeable, "cache created");
        Self { group, id }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.group.state.lock()
    }

    /// Set the soft maximum page count.
    pub fn set_cache_size(&self, n_max: u32) {
        let mut state = self.lock();
        let shard = state.shard(self.id);
        let purgeable = shard.purgeable;
        let old_max = shard.n_max;
        {
            let shard = state.shard_mut(self.id);
            shard.n_max = n_max;
            shard.n_90pct = n_max * 9 / 10;
        }
        if purgeable {
            state.n_max_page = state.n_max_page - old_max + n_max;
            state.recompute_budget();
            state.enforce_max();
        }
    }

    /// Number of pages currently held.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.lock().shard(self.id).n_page as usize
    }

    /// Look up `pgno`, optionally allocating. Hits and new entries come
    /// back pinned.
    pub(crate) fn fetch(&self, pgno: u32, how: CreateFlag) -> CacheFetch {
        let mut state = self.lock();

        if let Some(idx) = state.hash_lookup(self.id, pgno) {
            if state.entry(idx).lru.is_some() {
                state.lru_remove(idx);
            }
            return CacheFetch::Hit(idx);
        }

        match how {
            CreateFlag::DontCreate => return CacheFetch::Miss,
            CreateFlag::SoftCreate => {
                let shard = state.shard(self.id);
                if shard.purgeable {
                    let pinned = state.n_purgeable - state.n_recyclable;
                    if shard.n_page >= shard.n_90pct || pinned >= state.mx_pinned {
                        return CacheFetch::Miss;
                    }
                }
            }
            CreateFlag::ForceCreate => {}
        }

        let idx = self.allocate_entry(&mut state, pgno);
        CacheFetch::New(idx)
    }

    /// Allocate an entry for `pgno`, recycling the group LRU tail when
    /// over budget.
    fn allocate_entry(&self, state: &mut GroupState, pgno: u32) -> EntryIdx {
        let (page_size, extra_size, purgeable, over_budget) = {
            let shard = state.shard(self.id);
            (
                shard.page_size,
                shard.extra_size,
                shard.purgeable,
                shard.n_page >= shard.n_max || state.n_purgeable >= state.n_max_page,
            )
        };

        // Recycle the oldest unpinned entry in the group when either this
        // cache or the group as a whole is over budget. Unpinned entries
        // are always clean, so stealing is safe even across caches.
        let mut recycled: Option<(PageBuf, Vec<u8>)> = None;
        if purgeable && over_budget {
            if let Some(victim_idx) = state.lru_tail_entry() {
                let victim_cache = state.entry(victim_idx).cache_id;
                let victim_size = state.shard(victim_cache).page_size;
                state.lru_remove(victim_idx);
                state.hash_remove(victim_cache, victim_idx);
                let victim = state.free_slot(victim_idx);
                {
                    let shard = state.shard_mut(victim_cache);
                    shard.n_page -= 1;
                }
                state.n_purgeable -= 1;
                debug!(
                    victim_cache,
                    victim_page = victim.pgno,
                    for_page = pgno,
                    "recycled LRU tail"
                );
                if victim_size == page_size {
                    recycled = Some((victim.data, victim.extra));
                }
            }
        }

        let (data, mut extra) = recycled.unwrap_or_else(|| {
            let pool = state.shard(self.id).pool.clone();
            (pool.acquire(), Vec::new())
        });
        extra.clear();
        extra.resize(extra_size, 0);

        let entry = Entry {
            cache_id: self.id,
            pgno,
            data,
            extra,
            hash_next: None,
            lru: None,
            flags: PageFlags::empty(),
            n_ref: 0,
            dirty_next: None,
            dirty_prev: None,
        };
        let idx = state.alloc_slot(entry);

        state.maybe_grow_hash(self.id);
        state.hash_insert(self.id, idx);
        {
            let shard = state.shard_mut(self.id);
            shard.n_page += 1;
            shard.max_key = shard.max_key.max(pgno);
        }
        if purgeable {
            state.n_purgeable += 1;
        }
        idx
    }

    /// Return a pinned entry to the recyclable pool, or drop it when
    /// `discard` is set or the group is over budget.
    pub(crate) fn unpin(&self, idx: EntryIdx, discard: bool) {
        let mut state = self.lock();
        debug_assert!(state.entry(idx).lru.is_none(), "unpin of unpinned entry");
        let purgeable = state.shard(self.id).purgeable;

        if discard || (purgeable && state.n_purgeable > state.n_max_page) {
            state.drop_entry(idx);
        } else if purgeable {
            state.lru_push_head(idx);
        }
        // Non-purgeable caches keep the entry resident, off the LRU.
    }

    /// Move an entry to a new key.
    pub(crate) fn rekey(&self, idx: EntryIdx, new_pgno: u32) {
        let mut state = self.lock();
        state.hash_remove(self.id, idx);
        state.entry_mut(idx).pgno = new_pgno;
        state.hash_insert(self.id, idx);
        let shard = state.shard_mut(self.id);
        shard.max_key = shard.max_key.max(new_pgno);
    }

    /// Drop every entry with `pgno >= first_dropped`.
    pub(crate) fn truncate(&self, first_dropped: u32) {
        let mut state = self.lock();
        let shard = state.shard(self.id);
        if shard.max_key < first_dropped {
            return;
        }
        let victims: Vec<EntryIdx> = self.members(&state)
            .into_iter()
            .filter(|&idx| state.entry(idx).pgno >= first_dropped)
            .collect();
        for idx in victims {
            state.drop_entry(idx);
        }
        state.shard_mut(self.id).max_key = first_dropped.saturating_sub(1);
    }

    /// Drop every unpinned entry belonging to this cache.
    pub fn shrink(&self) {
        let mut state = self.lock();
        let victims: Vec<EntryIdx> = self.members(&state)
            .into_iter()
            .filter(|&idx| state.entry(idx).lru.is_some())
            .collect();
        for idx in victims {
            state.drop_entry(idx);
        }
    }

    /// All entry indices of this cache.
    pub(crate) fn members(&self, state: &GroupState) -> Vec<EntryIdx> {
        let shard = state.shard(self.id);
        let mut out = Vec::with_capacity(shard.n_page as usize);
        for bucket in &shard.hash {
            let mut cursor = *bucket;
            while let Some(idx) = cursor {
                out.push(idx);
                cursor = state.entry(idx).hash_next;
            }
        }
        out
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        let mut state = self.group.state.lock();
        if self.id as usize >= state.shards.len() || state.shards[self.id as usize].is_none() {
            return;
        }
        let victims = self.members(&state);
        for idx in victims {
            state.drop_entry(idx);
        }
        let shard = state.shards[self.id as usize].take().expect("shard vanished");
        if shard.purgeable {
            state.n_max_page -= shard.n_max;
            state.n_min_page -= shard.n_min;
            state.recompute_budget();
        }
    }
}
