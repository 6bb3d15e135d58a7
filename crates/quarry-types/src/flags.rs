//! Flag sets crossing the VFS boundary and the page-cache layers.

use bitflags::bitflags;

bitflags! {
    /// Flags passed to [`Vfs::open`] describing what kind of file is being
    /// opened and how.
    ///
    /// The kind flags (`MAIN_DB`, `MAIN_JOURNAL`, `WAL`, ...) let a VFS
    /// apply per-role policy (e.g. different sync behaviour for journals).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VfsOpenFlags: u32 {
        /// Open read-only.
        const READONLY = 1 << 0;
        /// Open for reading and writing.
        const READWRITE = 1 << 1;
        /// Create the file if it does not exist.
        const CREATE = 1 << 2;
        /// Delete the file when the handle is closed.
        const DELETEONCLOSE = 1 << 3;
        /// Fail if the file already exists (with `CREATE`).
        const EXCLUSIVE = 1 << 4;
        /// The main database file.
        const MAIN_DB = 1 << 8;
        /// The main rollback journal.
        const MAIN_JOURNAL = 1 << 9;
        /// A temporary database.
        const TEMP_DB = 1 << 10;
        /// A statement or savepoint sub-journal.
        const SUBJOURNAL = 1 << 11;
        /// A master journal coordinating a multi-file commit.
        const MASTER_JOURNAL = 1 << 12;
        /// A write-ahead log file.
        const WAL = 1 << 13;
    }
}

bitflags! {
    /// Flags for [`VfsFile::sync`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        /// Ordinary fsync-equivalent barrier.
        const NORMAL = 1 << 0;
        /// Full barrier including hardware write caches where supported.
        const FULL = 1 << 1;
        /// Only the file data needs to be durable, not its metadata.
        const DATAONLY = 1 << 4;
    }
}

bitflags! {
    /// Flags for [`Vfs::access`] queries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        /// Does the file exist?
        const EXISTS = 1 << 0;
        /// Is the file readable and writable?
        const READWRITE = 1 << 1;
    }
}

bitflags! {
    /// Device capability flags reported by [`VfsFile::device_characteristics`].
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceCharacteristics: u32 {
        /// Any aligned write of any size is atomic.
        const ATOMIC = 1 << 0;
        /// 512-byte aligned writes are atomic.
        const ATOMIC512 = 1 << 1;
        /// 1 KiB aligned writes are atomic.
        const ATOMIC1K = 1 << 2;
        /// 2 KiB aligned writes are atomic.
        const ATOMIC2K = 1 << 3;
        /// 4 KiB aligned writes are atomic.
        const ATOMIC4K = 1 << 4;
        /// 8 KiB aligned writes are atomic.
        const ATOMIC8K = 1 << 5;
        /// 16 KiB aligned writes are atomic.
        const ATOMIC16K = 1 << 6;
        /// 32 KiB aligned writes are atomic.
        const ATOMIC32K = 1 << 7;
        /// 64 KiB aligned writes are atomic.
        const ATOMIC64K = 1 << 8;
        /// Appends extend the file before any content becomes visible.
        const SAFE_APPEND = 1 << 9;
        /// Writes are applied in the order issued.
        const SEQUENTIAL = 1 << 10;
        /// An interrupted page write cannot corrupt bytes outside the
        /// written range.
        const POWERSAFE_OVERWRITE = 1 << 12;
    }
}

impl DeviceCharacteristics {
    /// Whether the device guarantees an atomic write of one `page_size`
    /// aligned page.
    #[must_use]
    pub fn supports_atomic_write(self, page_size: u32) -> bool {
        if self.contains(Self::ATOMIC) {
            return true;
        }
        let bit = match page_size {
            512 => Self::ATOMIC512,
            1024 => Self::ATOMIC1K,
            2048 => Self::ATOMIC2K,
            4096 => Self::ATOMIC4K,
            8192 => Self::ATOMIC8K,
            16_384 => Self::ATOMIC16K,
            32_768 => Self::ATOMIC32K,
            65_536 => Self::ATOMIC64K,
            _ => return false,
        };
        self.contains(bit)
    }
}

bitflags! {
    /// Per-entry state bits maintained by the page-cache manager.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u16 {
        /// Content differs from the on-disk page.
        const DIRTY = 1 << 0;
        /// The journal record holding this page's original image has not
        /// been synced; the page must not reach the database file yet.
        const NEED_SYNC = 1 << 1;
        /// Do not write this page out (freelist leaf or discarded page).
        const DONT_WRITE = 1 << 2;
        /// The entry is unlikely to be fetched again soon.
        const REUSE_UNLIKELY = 1 << 3;
        /// The page has been journalled and may be modified.
        const WRITEABLE = 1 << 4;
        /// The entry aliases a memory-mapped region (reserved).
        const MMAP = 1 << 5;
    }
}

bitflags! {
    /// Conditions under which the pager refuses stress-driven spill.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SpillGuard: u8 {
        /// Spilling is disabled entirely.
        const OFF = 1 << 0;
        /// A rollback is in progress; cache contents are authoritative.
        const ROLLBACK = 1 << 1;
        /// A sector-grouped journal write is in progress; spills that
        /// would require a journal sync must be refused.
        const NOSYNC = 1 << 2;
    }
}
