//! Error types for the Quarry storage engine.
//!
//! [`QuarryError`] is the single error type crossing crate boundaries.
//! Variants are structured: each carries the data a caller needs to react,
//! and [`QuarryError::code`] maps every variant onto the numeric
//! [`ErrorCode`] table (including the extended I/O sub-codes) for hosts
//! that speak result codes.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, QuarryError>;

/// Primary error type for Quarry operations.
#[derive(Error, Debug)]
pub enum QuarryError {
    // === Locking ===
    /// A file lock could not be acquired because another connection holds
    /// a conflicting lock.
    #[error("database is busy")]
    Busy,

    /// A conflicting lock is held within this process.
    #[error("database table is locked")]
    Locked,

    // === Resources ===
    /// A page buffer or cache allocation failed against its configured
    /// bounds.
    #[error("out of memory")]
    OutOfMemory,

    /// The database (or its journal) cannot be written.
    #[error("attempt to write a readonly database")]
    ReadOnly,

    /// The operation was interrupted via the context.
    #[error("interrupted")]
    Interrupted,

    /// The disk is full.
    #[error("database or disk is full")]
    Full,

    // === I/O ===
    /// Untyped I/O error from the host filesystem.
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O error reading a database page.
    #[error("disk I/O error reading page {page}")]
    IoRead {
        /// Page number being read.
        page: u32,
    },

    /// Fewer bytes than required were read.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// Bytes required.
        expected: usize,
        /// Bytes obtained.
        actual: usize,
    },

    /// I/O error writing a database page.
    #[error("disk I/O error writing page {page}")]
    IoWrite {
        /// Page number being written.
        page: u32,
    },

    /// `fsync` failed.
    #[error("disk I/O error during fsync")]
    IoFsync,

    /// Directory sync failed after creating or deleting a file.
    #[error("disk I/O error during directory fsync")]
    IoDirFsync,

    /// Truncation failed.
    #[error("disk I/O error during truncate")]
    IoTruncate,

    /// The VFS reported a failure taking a lock (distinct from `Busy`).
    #[error("disk I/O error during lock")]
    IoLock,

    /// The VFS reported a failure releasing a lock.
    #[error("disk I/O error during unlock")]
    IoUnlock,

    /// File deletion failed.
    #[error("disk I/O error during delete")]
    IoDelete,

    // === Content ===
    /// The database image is malformed.
    #[error("database disk image is malformed: {detail}")]
    Corrupt {
        /// What was found to be wrong.
        detail: String,
    },

    /// The file is not a database.
    #[error("file is not a database: '{path}'")]
    NotADatabase {
        /// Offending path.
        path: PathBuf,
    },

    /// The write-ahead log is malformed.
    #[error("WAL file is corrupt: {detail}")]
    WalCorrupt {
        /// What was found to be wrong.
        detail: String,
    },

    // === Protocol ===
    /// A file could not be opened.
    #[error("unable to open database file: '{path}'")]
    CannotOpen {
        /// Offending path.
        path: PathBuf,
    },

    /// The file-locking protocol was violated (e.g. a hot-journal race
    /// that never resolves).
    #[error("locking protocol violation")]
    Protocol,

    /// The API was used out of sequence.
    #[error("library routine called out of sequence")]
    Misuse,

    /// The operation is not supported by the current configuration.
    #[error("unsupported operation")]
    Unsupported,

    /// The pager is latched in the error state; the original code is
    /// re-reported until every page reference is released.
    #[error("pager in error state: {code:?}")]
    ErrorState {
        /// The latched code.
        code: ErrorCode,
    },

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl QuarryError {
    /// Construct an [`QuarryError::Internal`] from any message.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The numeric result code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Busy => ErrorCode::Busy,
            Self::Locked => ErrorCode::Locked,
            Self::OutOfMemory => ErrorCode::NoMem,
            Self::ReadOnly => ErrorCode::ReadOnly,
            Self::Interrupted => ErrorCode::Interrupt,
            Self::Full => ErrorCode::Full,
            Self::Io(_) => ErrorCode::IoErr,
            Self::IoRead { .. } => ErrorCode::IoErrRead,
            Self::ShortRead { .. } => ErrorCode::IoErrShortRead,
            Self::IoWrite { .. } => ErrorCode::IoErrWrite,
            Self::IoFsync => ErrorCode::IoErrFsync,
            Self::IoDirFsync => ErrorCode::IoErrDirFsync,
            Self::IoTruncate => ErrorCode::IoErrTruncate,
            Self::IoLock => ErrorCode::IoErrLock,
            Self::IoUnlock => ErrorCode::IoErrUnlock,
            Self::IoDelete => ErrorCode::IoErrDelete,
            Self::Corrupt { .. } | Self::WalCorrupt { .. } => ErrorCode::Corrupt,
            Self::NotADatabase { .. } => ErrorCode::NotADb,
            Self::CannotOpen { .. } => ErrorCode::CantOpen,
            Self::Protocol => ErrorCode::Protocol,
            Self::Misuse | Self::Unsupported => ErrorCode::Misuse,
            Self::ErrorState { code } => *code,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether the error leaves pager state untouched and the operation
    /// may simply be retried (lock contention and transient allocation
    /// failure).
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Busy | Self::Locked | Self::OutOfMemory)
    }
}

/// Numeric result codes, including the extended I/O sub-codes.
///
/// Extended codes encode the primary code in the low byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Success.
    Ok = 0,
    /// Generic error.
    Error = 1,
    /// Internal logic error.
    Internal = 2,
    /// Callback requested abort.
    Abort = 4,
    /// A lock held by another connection blocked the operation.
    Busy = 5,
    /// A lock held within this process blocked the operation.
    Locked = 6,
    /// Allocation failed.
    NoMem = 7,
    /// Write attempted on a read-only database.
    ReadOnly = 8,
    /// Interrupted.
    Interrupt = 9,
    /// Generic disk I/O error.
    IoErr = 10,
    /// The database image is malformed.
    Corrupt = 11,
    /// The disk is full.
    Full = 13,
    /// A file could not be opened.
    CantOpen = 14,
    /// Locking protocol violation.
    Protocol = 15,
    /// API misuse.
    Misuse = 21,
    /// The file is not a database.
    NotADb = 26,
    /// Read failed.
    IoErrRead = 10 | (1 << 8),
    /// Read returned fewer bytes than required.
    IoErrShortRead = 10 | (2 << 8),
    /// Write failed.
    IoErrWrite = 10 | (3 << 8),
    /// `fsync` failed.
    IoErrFsync = 10 | (4 << 8),
    /// Directory `fsync` failed.
    IoErrDirFsync = 10 | (5 << 8),
    /// Truncate failed.
    IoErrTruncate = 10 | (6 << 8),
    /// Unlock failed.
    IoErrUnlock = 10 | (8 << 8),
    /// Delete failed.
    IoErrDelete = 10 | (10 << 8),
    /// Lock failed.
    IoErrLock = 10 | (15 << 8),
}

impl ErrorCode {
    /// The primary (low byte) code for an extended code.
    #[must_use]
    pub const fn primary(self) -> i32 {
        (self as i32) & 0xff
    }
}
