//! Page-aligned buffer allocation.
//!
//! Page buffers come from one of three sources, tried in order:
//!
//! 1. the owning cache's **slab** — page slots preallocated when the
//!    cache is created (default 100 pages);
//! 2. the process-global **arena** — uniform slots installed once via
//!    [`configure_page_arena`] before any cache exists;
//! 3. the general **heap**.
//!
//! Buffers are aligned to the page size by over-allocating a `Vec<u8>`
//! and slicing at the first aligned offset; no unsafe code. Dropping a
//! [`PageBuf`] returns slab and arena buffers to their source.
//!
//! Per-entry bookkeeping (the header extension) is always allocated
//! separately from page data, so a data buffer is exactly one page long
//! and never rounds up past a power of two.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use quarry_error::{QuarryError, Result};
use quarry_types::{PageSize, limits};

/// Number of live buffer pools in the process. Arena configuration is
/// refused while nonzero.
static LIVE_POOLS: AtomicUsize = AtomicUsize::new(0);

// ---------------------------------------------------------------------------
// Aligned allocation
// ---------------------------------------------------------------------------

/// Allocate a zero-filled vector whose sub-region at the returned offset
/// is aligned to `align`.
fn allocate_aligned(size: usize, align: usize) -> (Vec<u8>, usize) {
    debug_assert!(align.is_power_of_two());
    let total = size + align - 1;
    let backing = vec![0u8; total];
    let ptr = backing.as_ptr() as usize;
    let misalignment = ptr & (align - 1);
    let offset = if misalignment == 0 { 0 } else { align - misalignment };
    debug_assert!(offset + size <= backing.len());
    (backing, offset)
}

// ---------------------------------------------------------------------------
// Global arena
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ArenaState {
    slot_size: usize,
    free: Vec<(Vec<u8>, usize)>,
}

static ARENA: Mutex<Option<ArenaState>> = Mutex::new(None);

/// Install the process-global page arena: `n_slots` uniform slots of
/// `slot_size` bytes each.
///
/// Must be called before any page cache (buffer pool) exists; afterwards
/// it fails with [`QuarryError::Misuse`]. Calling with `n_slots == 0`
/// removes the arena.
pub fn configure_page_arena(slot_size: usize, n_slots: usize) -> Result<()> {
    if LIVE_POOLS.load(Ordering::Acquire) != 0 {
        return Err(QuarryError::Misuse);
    }
    let mut arena = ARENA.lock();
    if n_slots == 0 {
        *arena = None;
        return Ok(());
    }
    if slot_size < limits::MIN_PAGE_SIZE as usize || !slot_size.is_power_of_two() {
        return Err(QuarryError::Misuse);
    }
    let mut free = Vec::with_capacity(n_slots);
    for _ in 0..n_slots {
        free.push(allocate_aligned(slot_size, slot_size));
    }
    *arena = Some(ArenaState { slot_size, free });
    Ok(())
}

/// Idle slots currently available in the arena, if one is installed.
#[must_use]
pub fn arena_available() -> Option<usize> {
    ARENA.lock().as_ref().map(|a| a.free.len())
}

fn arena_acquire(page_size: usize) -> Option<(Vec<u8>, usize)> {
    let mut arena = ARENA.lock();
    let state = arena.as_mut()?;
    if state.slot_size < page_size {
        return None;
    }
    state.free.pop()
}

fn arena_release(backing: Vec<u8>, offset: usize) {
    let mut arena = ARENA.lock();
    if let Some(state) = arena.as_mut() {
        state.free.push((backing, offset));
    }
    // Arena removed while the buffer was out: the backing drops normally.
}

// ---------------------------------------------------------------------------
// PageBuf
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Origin {
    Heap,
    Slab(Arc<PoolInner>),
    Arena,
}

/// Owned, page-sized, page-aligned buffer.
///
/// On drop the backing allocation returns to its slab or arena.
pub struct PageBuf {
    /// `None` only transiently during drop.
    backing: Option<Vec<u8>>,
    offset: usize,
    page_size: usize,
    origin: Origin,
}

impl PageBuf {
    /// Allocate a standalone heap buffer (not pool-backed).
    #[must_use]
    pub fn new(page_size: PageSize) -> Self {
        let size = page_size.as_usize();
        let (backing, offset) = allocate_aligned(size, size);
        Self {
            backing: Some(backing),
            offset,
            page_size: size,
            origin: Origin::Heap,
        }
    }

    /// The page size in bytes.
    #[inline]
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The aligned region as a slice.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        let backing = self.backing.as_ref().expect("PageBuf backing consumed");
        &backing[self.offset..self.offset + self.page_size]
    }

    /// The aligned region as a mutable slice.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let backing = self.backing.as_mut().expect("PageBuf backing consumed");
        &mut backing[self.offset..self.offset + self.page_size]
    }

    /// Raw pointer to the aligned region, for alignment assertions.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.as_slice().as_ptr()
    }
}

impl std::ops::Deref for PageBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::ops::DerefMut for PageBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl Drop for PageBuf {
    fn drop(&mut self) {
        if let Some(backing) = self.backing.take() {
            match &self.origin {
                Origin::Heap => {}
                Origin::Slab(pool) => pool.return_buf(backing, self.offset),
                Origin::Arena => arena_release(backing, self.offset),
            }
        }
    }
}

impl fmt::Debug for PageBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBuf")
            .field("page_size", &self.page_size)
            .field("aligned_ptr", &format_args!("{:?}", self.as_ptr()))
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Slab specification
// ---------------------------------------------------------------------------

/// Size of a cache's preallocated slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabSpec {
    /// That many page slots.
    Pages(u32),
    /// A total byte budget, divided by the page size.
    Bytes(u64),
}

impl Default for SlabSpec {
    fn default() -> Self {
        Self::from_raw(limits::DEFAULT_SLAB_PAGES)
    }
}

impl SlabSpec {
    /// Decode the raw configuration convention: a non-negative `n` means
    /// `n` pages; a negative `n` means `1024 * -n` bytes total.
    #[must_use]
    pub fn from_raw(n: i32) -> Self {
        match u32::try_from(n) {
            Ok(pages) => Self::Pages(pages),
            Err(_) => Self::Bytes(u64::from(n.unsigned_abs()) * 1024),
        }
    }

    fn slot_count(self, page_size: usize) -> usize {
        match self {
            Self::Pages(n) => n as usize,
            Self::Bytes(total) => usize::try_from(total / page_size as u64).unwrap_or(0),
        }
    }
}

// ---------------------------------------------------------------------------
// PageBufPool
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PoolInner {
    page_size: usize,
    free: Mutex<Vec<(Vec<u8>, usize)>>,
    capacity: usize,
}

impl PoolInner {
    fn return_buf(&self, backing: Vec<u8>, offset: usize) {
        let mut free = self.free.lock();
        debug_assert!(free.len() < self.capacity, "slab over-returned");
        free.push((backing, offset));
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        LIVE_POOLS.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Per-cache buffer source: the slab plus fallback to arena and heap.
///
/// Cheaply cloneable; clones share the slab.
#[derive(Debug, Clone)]
pub struct PageBufPool {
    inner: Arc<PoolInner>,
}

impl PageBufPool {
    /// Create a pool for `page_size`, preallocating the slab described
    /// by `spec`.
    #[must_use]
    pub fn new(page_size: PageSize, spec: SlabSpec) -> Self {
        LIVE_POOLS.fetch_add(1, Ordering::AcqRel);
        let size = page_size.as_usize();
        let capacity = spec.slot_count(size);
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(allocate_aligned(size, size));
        }
        Self {
            inner: Arc::new(PoolInner {
                page_size: size,
                free: Mutex::new(free),
                capacity,
            }),
        }
    }

    /// Acquire a buffer: slab, then arena, then heap.
    ///
    /// Recycled slab and arena buffers retain stale content; callers
    /// overwrite via I/O or zero-fill as needed.
    #[must_use]
    pub fn acquire(&self) -> PageBuf {
        let page_size = self.inner.page_size;

        if let Some((backing, offset)) = self.inner.free.lock().pop() {
            return PageBuf {
                backing: Some(backing),
                offset,
                page_size,
                origin: Origin::Slab(Arc::clone(&self.inner)),
            };
        }

        if let Some((backing, offset)) = arena_acquire(page_size) {
            return PageBuf {
                backing: Some(backing),
                offset,
                page_size,
                origin: Origin::Arena,
            };
        }

        let (backing, offset) = allocate_aligned(page_size, page_size);
        PageBuf {
            backing: Some(backing),
            offset,
            page_size,
            origin: Origin::Heap,
        }
    }

    /// The page size this pool serves.
    #[inline]
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// Idle slab slots.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Preallocated slab slots.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}
