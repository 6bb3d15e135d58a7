//! Page cache and transactional pager for the Quarry storage engine.
//!
//! Layering, bottom up:
//!
//! 1. [`page_buf`] — aligned page buffers from slab, arena, or heap;
//! 2. [`cache`] — the pluggable keyed store with group LRU recycling;
//! 3. [`page_cache`] — dirty tracking, pinning, and spill selection;
//! 4. [`journal`] — the rollback-journal wire format and playback;
//! 5. [`pager`] — the seven-state transactional pager.

pub mod cache;
pub mod journal;
pub mod page_buf;
pub mod page_cache;
pub mod pager;

pub use cache::{CacheGroup, CacheHandle, CreateFlag, GroupMode, entry_header_size, global_group};
pub use page_buf::{PageBuf, PageBufPool, SlabSpec, arena_available, configure_page_arena};
pub use page_cache::{FetchOutcome, PageCache};
pub use pager::{
    CheckpointMode, PageCodec, PageHandle, Pager, PagerOptions, PagerState,
};

/// Per-page bookkeeping footprint of the cache layers, excluding the
/// page content buffer itself (the header-size configuration query).
#[must_use]
pub fn page_header_size() -> usize {
    cache::entry_header_size()
}
