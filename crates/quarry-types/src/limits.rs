//! Process-wide compile-time limits and defaults.

/// Smallest supported database page size in bytes.
pub const MIN_PAGE_SIZE: u32 = 512;

/// Default database page size in bytes.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Largest supported database page size in bytes.
pub const MAX_PAGE_SIZE: u32 = 65_536;

/// Smallest usable page area after subtracting reserved bytes.
pub const MIN_USABLE_SIZE: u32 = 480;

/// Default soft maximum number of pages held by a page cache.
pub const DEFAULT_CACHE_SIZE: i32 = 2000;

/// Default number of page slots preallocated per cache.
///
/// A negative slab configuration of `-N` means `1024 * N` bytes total,
/// divided by the page size.
pub const DEFAULT_SLAB_PAGES: i32 = 100;

/// Largest sector size a VFS may report. Values above this are clamped.
pub const MAX_SECTOR_SIZE: u32 = 65_536;

/// Smallest sector size. Values below this are rounded up.
pub const MIN_SECTOR_SIZE: u32 = 32;

/// Library version number stamped into database headers (bytes 96..100).
pub const QUARRY_VERSION_NUMBER: u32 = 3_046_000;
