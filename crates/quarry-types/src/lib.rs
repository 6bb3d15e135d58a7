//! Core types shared across the Quarry storage engine.
//!
//! This crate is a leaf dependency: identifier newtypes, page-size and
//! page-buffer primitives, the 100-byte database file header codec, lock
//! and journal mode enumerations, flag sets, and the [`Cx`] operation
//! context. Nothing here performs I/O.

pub mod bitvec;
pub mod cx;
pub mod encoding;
pub mod flags;
pub mod limits;

pub use bitvec::Bitvec;
pub use cx::Cx;

use std::fmt;
use std::num::NonZeroU32;

/// A page number in the database file.
///
/// Page numbers are 1-based; page 0 does not exist and is used on disk as
/// the "no page" sentinel. Page 1 carries the database file header.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct PageNumber(NonZeroU32);

impl PageNumber {
    /// Page 1, the database header page.
    pub const ONE: Self = Self(NonZeroU32::MIN);

    /// Create a page number from a raw `u32`.
    ///
    /// Returns `None` for 0.
    #[inline]
    #[must_use]
    pub const fn new(n: u32) -> Option<Self> {
        match NonZeroU32::new(n) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// The raw 1-based value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }

    /// Byte offset of this page within a database file of `page_size` pages.
    #[inline]
    #[must_use]
    pub const fn file_offset(self, page_size: PageSize) -> u64 {
        (self.get() as u64 - 1) * page_size.get() as u64
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u32> for PageNumber {
    type Error = InvalidPageNumber;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidPageNumber)
    }
}

/// Error returned when constructing a `PageNumber` from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidPageNumber;

impl fmt::Display for InvalidPageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("page number cannot be zero")
    }
}

impl std::error::Error for InvalidPageNumber {}

/// Database page size in bytes.
///
/// A power of two between 512 and 65536 inclusive, fixed per database
/// file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageSize(u32);

impl PageSize {
    /// Minimum page size: 512 bytes.
    pub const MIN: Self = Self(limits::MIN_PAGE_SIZE);

    /// Default page size: 4096 bytes.
    pub const DEFAULT: Self = Self(limits::DEFAULT_PAGE_SIZE);

    /// Maximum page size: 65536 bytes.
    pub const MAX: Self = Self(limits::MAX_PAGE_SIZE);

    /// Validate and construct a page size.
    #[must_use]
    pub const fn new(size: u32) -> Option<Self> {
        if size < limits::MIN_PAGE_SIZE || size > limits::MAX_PAGE_SIZE || !size.is_power_of_two() {
            None
        } else {
            Some(Self(size))
        }
    }

    /// The raw size in bytes.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The raw size as `usize`.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Usable bytes per page after the reserved region at the end.
    #[inline]
    #[must_use]
    pub const fn usable(self, reserved: u8) -> u32 {
        self.0 - reserved as u32
    }
}

impl Default for PageSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owned page content. The length always equals the database page size.
#[derive(Clone, PartialEq, Eq)]
pub struct PageData {
    data: Vec<u8>,
}

impl PageData {
    /// A zero-filled page.
    #[must_use]
    pub fn zeroed(size: PageSize) -> Self {
        Self {
            data: vec![0u8; size.as_usize()],
        }
    }

    /// Wrap existing bytes. The caller guarantees the length matches the
    /// page size.
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// The content as a byte slice.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// The content as a mutable byte slice.
    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty (never true for a valid page).
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consume into the inner vector.
    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for PageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageData")
            .field("len", &self.data.len())
            .finish()
    }
}

impl AsRef<[u8]> for PageData {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl AsMut<[u8]> for PageData {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Text encoding recorded in the database header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TextEncoding {
    /// UTF-8.
    #[default]
    Utf8 = 1,
    /// UTF-16 little-endian.
    Utf16le = 2,
    /// UTF-16 big-endian.
    Utf16be = 3,
}

/// Durability backend and journal finalisation policy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JournalMode {
    /// Delete the rollback journal after each transaction.
    #[default]
    Delete,
    /// Truncate the rollback journal to zero length.
    Truncate,
    /// Keep the journal file, zeroing its header.
    Persist,
    /// Keep the rollback journal in memory only.
    Memory,
    /// Write-ahead logging.
    Wal,
    /// No rollback journal at all. Transactions cannot roll back.
    Off,
}

impl JournalMode {
    /// Whether this mode uses a rollback journal (as opposed to WAL or
    /// nothing).
    #[must_use]
    pub const fn uses_rollback_journal(self) -> bool {
        matches!(self, Self::Delete | Self::Truncate | Self::Persist | Self::Memory)
    }
}

/// Sync policy for journal and database writes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SynchronousMode {
    /// Never sync. Fast, and unsafe across power loss.
    Off = 0,
    /// Sync at the critical moments only.
    Normal = 1,
    /// Sync the journal before every dependent database write.
    #[default]
    Full = 2,
    /// Like `Full`, plus directory syncs after file creation/deletion.
    Extra = 3,
}

/// File-lock retention policy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockingMode {
    /// Locks are released at the end of each transaction.
    #[default]
    Normal,
    /// The exclusive lock is retained between transactions.
    Exclusive,
}

/// File lock level. The five levels form a total order; transitions only
/// escalate or fully release.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockLevel {
    /// No lock held.
    #[default]
    None = 0,
    /// Shared read lock.
    Shared = 1,
    /// Intent-to-write lock; coexists with shared locks.
    Reserved = 2,
    /// Waiting for shared holders to drain; blocks new shared locks.
    Pending = 3,
    /// Exclusive write lock.
    Exclusive = 4,
}

/// WAL checkpoint mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CheckpointMode {
    /// Transfer as many frames as possible without waiting.
    Passive = 0,
    /// Transfer every committed frame.
    Full = 1,
    /// Like `Full`, then rewind the log so the next writer restarts it.
    Restart = 2,
    /// Like `Restart`, then truncate the log file to zero bytes.
    Truncate = 3,
}

/// The magic string at the start of every database file.
pub const DATABASE_HEADER_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Size of the database file header in bytes.
pub const DATABASE_HEADER_SIZE: usize = 100;

/// Byte offset of the change counter within the header.
pub const CHANGE_COUNTER_OFFSET: usize = 24;

/// Byte offset of the version-valid-for field within the header.
pub const VERSION_VALID_FOR_OFFSET: usize = 92;

/// First byte of the change-counter region (bytes 24..40): the counter,
/// in-header page count, freelist fields. At least one bit in this range
/// mutates between any two committed content-changing transactions.
pub const CHANGE_REGION: std::ops::Range<usize> = 24..40;

/// Maximum file format version this engine reads or writes.
pub const MAX_FILE_FORMAT_VERSION: u8 = 2;

/// The parsed 100-byte database file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseHeader {
    /// Page size (stored big-endian at offset 16; the value 1 encodes 65536).
    pub page_size: PageSize,
    /// File-format write version (1 = rollback journal, 2 = WAL).
    pub write_version: u8,
    /// File-format read version.
    pub read_version: u8,
    /// Bytes reserved at the end of each page.
    pub reserved_per_page: u8,
    /// File change counter (offset 24).
    pub change_counter: u32,
    /// In-header database size in pages (offset 28).
    pub page_count: u32,
    /// First freelist trunk page, or 0.
    pub freelist_trunk: u32,
    /// Number of freelist pages.
    pub freelist_count: u32,
    /// Schema cookie.
    pub schema_cookie: u32,
    /// Schema format number.
    pub schema_format: u32,
    /// Default page-cache size suggestion.
    pub default_cache_size: i32,
    /// Largest root B-tree page (autovacuum), or 0.
    pub largest_root_page: u32,
    /// Text encoding.
    pub text_encoding: TextEncoding,
    /// User version.
    pub user_version: u32,
    /// Nonzero for incremental-vacuum mode.
    pub incremental_vacuum: u32,
    /// Application ID.
    pub application_id: u32,
    /// The change-counter value current when `library_version` was stamped.
    pub version_valid_for: u32,
    /// Version number of the library that last wrote the file.
    pub library_version: u32,
}

impl Default for DatabaseHeader {
    fn default() -> Self {
        Self {
            page_size: PageSize::DEFAULT,
            write_version: 1,
            read_version: 1,
            reserved_per_page: 0,
            change_counter: 0,
            page_count: 0,
            freelist_trunk: 0,
            freelist_count: 0,
            schema_cookie: 0,
            schema_format: 4,
            default_cache_size: -limits::DEFAULT_CACHE_SIZE,
            largest_root_page: 0,
            text_encoding: TextEncoding::Utf8,
            user_version: 0,
            incremental_vacuum: 0,
            application_id: 0,
            version_valid_for: 0,
            library_version: limits::QUARRY_VERSION_NUMBER,
        }
    }
}

/// Errors from parsing or serialising the database header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseHeaderError {
    /// Magic string mismatch at bytes 0..16.
    InvalidMagic,
    /// The page-size field was not a valid encoding.
    InvalidPageSize {
        /// The raw big-endian field value.
        raw: u16,
    },
    /// Payload fractions (bytes 21..24) were not 64/32/32.
    InvalidPayloadFractions {
        /// Max embedded payload fraction byte.
        max: u8,
        /// Min embedded payload fraction byte.
        min: u8,
        /// Min leaf payload fraction byte.
        leaf: u8,
    },
    /// The usable page area would fall below the supported minimum.
    UsableSizeTooSmall {
        /// Page size from the header.
        page_size: u32,
        /// Reserved bytes per page from the header.
        reserved_per_page: u8,
        /// Resulting usable size.
        usable_size: u32,
    },
    /// The read format version is newer than this engine understands.
    UnsupportedReadVersion {
        /// Read version byte from the header.
        read_version: u8,
        /// Largest supported version.
        max_supported: u8,
    },
    /// The text-encoding field was not 1, 2, or 3.
    InvalidTextEncoding {
        /// The raw field value.
        raw: u32,
    },
}

impl fmt::Display for DatabaseHeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMagic => f.write_str("invalid database header magic"),
            Self::InvalidPageSize { raw } => write!(f, "invalid page size encoding: {raw}"),
            Self::InvalidPayloadFractions { max, min, leaf } => write!(
                f,
                "invalid payload fractions: max={max} min={min} leaf={leaf}"
            ),
            Self::UsableSizeTooSmall {
                page_size,
                reserved_per_page,
                usable_size,
            } => write!(
                f,
                "usable page size too small: page_size={page_size} reserved={reserved_per_page} usable={usable_size}"
            ),
            Self::UnsupportedReadVersion {
                read_version,
                max_supported,
            } => write!(
                f,
                "unsupported read format version: {read_version} (max supported {max_supported})"
            ),
            Self::InvalidTextEncoding { raw } => write!(f, "invalid text encoding: {raw}"),
        }
    }
}

impl std::error::Error for DatabaseHeaderError {}

impl DatabaseHeader {
    /// Parse and validate a 100-byte header.
    pub fn from_bytes(buf: &[u8; DATABASE_HEADER_SIZE]) -> Result<Self, DatabaseHeaderError> {
        if &buf[..DATABASE_HEADER_MAGIC.len()] != DATABASE_HEADER_MAGIC {
            return Err(DatabaseHeaderError::InvalidMagic);
        }

        let page_size_raw = encoding::read_u16_be(&buf[16..18]).expect("fixed u16 field");
        let page_size_u32 = match page_size_raw {
            1 => limits::MAX_PAGE_SIZE,
            0 => return Err(DatabaseHeaderError::InvalidPageSize { raw: page_size_raw }),
            n => u32::from(n),
        };
        let page_size = PageSize::new(page_size_u32)
            .ok_or(DatabaseHeaderError::InvalidPageSize { raw: page_size_raw })?;

        let write_version = buf[18];
        let read_version = buf[19];
        let reserved_per_page = buf[20];

        let (max_payload, min_payload, leaf_payload) = (buf[21], buf[22], buf[23]);
        if (max_payload, min_payload, leaf_payload) != (64, 32, 32) {
            return Err(DatabaseHeaderError::InvalidPayloadFractions {
                max: max_payload,
                min: min_payload,
                leaf: leaf_payload,
            });
        }

        let usable_size = page_size.usable(reserved_per_page);
        if usable_size < limits::MIN_USABLE_SIZE {
            return Err(DatabaseHeaderError::UsableSizeTooSmall {
                page_size: page_size.get(),
                reserved_per_page,
                usable_size,
            });
        }

        if read_version > MAX_FILE_FORMAT_VERSION {
            return Err(DatabaseHeaderError::UnsupportedReadVersion {
                read_version,
                max_supported: MAX_FILE_FORMAT_VERSION,
            });
        }

        let change_counter = encoding::read_u32_be(&buf[24..28]).expect("fixed u32 field");
        let page_count = encoding::read_u32_be(&buf[28..32]).expect("fixed u32 field");
        let freelist_trunk = encoding::read_u32_be(&buf[32..36]).expect("fixed u32 field");
        let freelist_count = encoding::read_u32_be(&buf[36..40]).expect("fixed u32 field");
        let schema_cookie = encoding::read_u32_be(&buf[40..44]).expect("fixed u32 field");
        let schema_format = encoding::read_u32_be(&buf[44..48]).expect("fixed u32 field");
        let default_cache_size = encoding::read_i32_be(&buf[48..52]).expect("fixed i32 field");
        let largest_root_page = encoding::read_u32_be(&buf[52..56]).expect("fixed u32 field");

        let text_encoding_raw = encoding::read_u32_be(&buf[56..60]).expect("fixed u32 field");
        let text_encoding = match text_encoding_raw {
            1 => TextEncoding::Utf8,
            2 => TextEncoding::Utf16le,
            3 => TextEncoding::Utf16be,
            _ => {
                return Err(DatabaseHeaderError::InvalidTextEncoding {
                    raw: text_encoding_raw,
                });
            }
        };

        let user_version = encoding::read_u32_be(&buf[60..64]).expect("fixed u32 field");
        let incremental_vacuum = encoding::read_u32_be(&buf[64..68]).expect("fixed u32 field");
        let application_id = encoding::read_u32_be(&buf[68..72]).expect("fixed u32 field");
        let version_valid_for = encoding::read_u32_be(&buf[92..96]).expect("fixed u32 field");
        let library_version = encoding::read_u32_be(&buf[96..100]).expect("fixed u32 field");

        Ok(Self {
            page_size,
            write_version,
            read_version,
            reserved_per_page,
            change_counter,
            page_count,
            freelist_trunk,
            freelist_count,
            schema_cookie,
            schema_format,
            default_cache_size,
            largest_root_page,
            text_encoding,
            user_version,
            incremental_vacuum,
            application_id,
            version_valid_for,
            library_version,
        })
    }

    /// Whether header-derived size fields may be stale.
    ///
    /// When `version_valid_for` does not match `change_counter`, the file
    /// was last written by a library that did not maintain every header
    /// field; `page_count` must then be recomputed from the file size.
    #[must_use]
    pub const fn is_page_count_stale(&self) -> bool {
        self.version_valid_for != self.change_counter
    }

    /// Derive the page count from the file size in bytes.
    ///
    /// Returns `None` if the size is not a whole number of pages or would
    /// overflow a `u32` page count.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn page_count_from_file_size(&self, file_size: u64) -> Option<u32> {
        let ps = self.page_size.get() as u64;
        if file_size % ps != 0 {
            return None;
        }
        let count = file_size / ps;
        if count > u32::MAX as u64 {
            return None;
        }
        Some(count as u32)
    }

    /// Serialise into a 100-byte buffer.
    pub fn write_to_bytes(
        &self,
        out: &mut [u8; DATABASE_HEADER_SIZE],
    ) -> Result<(), DatabaseHeaderError> {
        let usable_size = self.page_size.usable(self.reserved_per_page);
        if usable_size < limits::MIN_USABLE_SIZE {
            return Err(DatabaseHeaderError::UsableSizeTooSmall {
                page_size: self.page_size.get(),
                reserved_per_page: self.reserved_per_page,
                usable_size,
            });
        }

        out.fill(0);
        out[..DATABASE_HEADER_MAGIC.len()].copy_from_slice(DATABASE_HEADER_MAGIC);

        let page_size_raw = if self.page_size.get() == limits::MAX_PAGE_SIZE {
            1u16
        } else {
            #[allow(clippy::cast_possible_truncation)]
            {
                self.page_size.get() as u16
            }
        };
        encoding::write_u16_be(&mut out[16..18], page_size_raw).expect("fixed u16 field");

        out[18] = self.write_version;
        out[19] = self.read_version;
        out[20] = self.reserved_per_page;
        out[21] = 64;
        out[22] = 32;
        out[23] = 32;

        encoding::write_u32_be(&mut out[24..28], self.change_counter).expect("fixed u32 field");
        encoding::write_u32_be(&mut out[28..32], self.page_count).expect("fixed u32 field");
        encoding::write_u32_be(&mut out[32..36], self.freelist_trunk).expect("fixed u32 field");
        encoding::write_u32_be(&mut out[36..40], self.freelist_count).expect("fixed u32 field");
        encoding::write_u32_be(&mut out[40..44], self.schema_cookie).expect("fixed u32 field");
        encoding::write_u32_be(&mut out[44..48], self.schema_format).expect("fixed u32 field");
        encoding::write_i32_be(&mut out[48..52], self.default_cache_size).expect("fixed i32 field");
        encoding::write_u32_be(&mut out[52..56], self.largest_root_page).expect("fixed u32 field");
        encoding::write_u32_be(&mut out[56..60], self.text_encoding as u32)
            .expect("fixed u32 field");
        encoding::write_u32_be(&mut out[60..64], self.user_version).expect("fixed u32 field");
        encoding::write_u32_be(&mut out[64..68], self.incremental_vacuum).expect("fixed u32 field");
        encoding::write_u32_be(&mut out[68..72], self.application_id).expect("fixed u32 field");

        // Bytes 72..92 are reserved and stay zero.
        encoding::write_u32_be(&mut out[92..96], self.version_valid_for).expect("fixed u32 field");
        encoding::write_u32_be(&mut out[96..100], self.library_version).expect("fixed u32 field");

        Ok(())
    }

    /// Serialise to a fresh 100-byte array.
    pub fn to_bytes(&self) -> Result<[u8; DATABASE_HEADER_SIZE], DatabaseHeaderError> {
        let mut out = [0u8; DATABASE_HEADER_SIZE];
        self.write_to_bytes(&mut out)?;
        Ok(out)
    }
}
