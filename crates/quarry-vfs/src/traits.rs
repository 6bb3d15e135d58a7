//! The virtual file system contract.
//!
//! These two traits are the sole boundary between the storage engine and
//! the host operating system. They are open traits: embedders may supply
//! their own implementations (encrypting wrappers, fault injectors,
//! object-store shims) without touching the engine.

use std::path::{Path, PathBuf};

use quarry_error::Result;
use quarry_types::Cx;
use quarry_types::LockLevel;
use quarry_types::flags::{AccessFlags, DeviceCharacteristics, SyncFlags, VfsOpenFlags};

/// Typed file-control operations.
///
/// The set is small by design; implementations ignore operations they do
/// not understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileControl {
    /// Advise the VFS of the final file size of the current transaction so
    /// it can preallocate.
    SizeHint(u64),
}

/// A virtual filesystem.
pub trait Vfs: Send + Sync {
    /// The file handle type produced by this VFS.
    type File: VfsFile;

    /// The name of this VFS (e.g. "memory", "sim").
    fn name(&self) -> &'static str;

    /// Open a file.
    ///
    /// `path` is `None` for auto-named temporary files. `flags` describes
    /// the file's role and open mode. Returns the handle and the flags
    /// actually applied (a VFS may add `READWRITE` when `CREATE` is set).
    fn open(
        &self,
        cx: &Cx,
        path: Option<&Path>,
        flags: VfsOpenFlags,
    ) -> Result<(Self::File, VfsOpenFlags)>;

    /// Delete a file. When `sync_dir` is set, the directory entry removal
    /// is made durable before returning.
    fn delete(&self, cx: &Cx, path: &Path, sync_dir: bool) -> Result<()>;

    /// Check file accessibility per `flags`.
    fn access(&self, cx: &Cx, path: &Path, flags: AccessFlags) -> Result<bool>;

    /// Resolve a possibly relative path to an absolute one.
    fn full_pathname(&self, cx: &Cx, path: &Path) -> Result<PathBuf>;

    /// Fill `buf` with bytes suitable for nonces and temporary names.
    ///
    /// The default is a deterministic xorshift so tests are reproducible;
    /// production implementations should override with OS randomness.
    fn randomness(&self, cx: &Cx, buf: &mut [u8]) {
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15 ^ cx.now_millis();
        if state == 0 {
            state = 0x5DEE_CE66;
        }
        for chunk in buf.chunks_mut(8) {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let bytes = state.to_le_bytes();
            for (dst, &src) in chunk.iter_mut().zip(bytes.iter()) {
                *dst = src;
            }
        }
    }

    /// Current wall-clock time in Unix milliseconds.
    fn current_time_ms(&self, cx: &Cx) -> u64 {
        cx.now_millis()
    }
}

/// An open file handle.
pub trait VfsFile: Send + Sync {
    /// Close the file. The handle must not be used afterwards.
    fn close(&mut self, cx: &Cx) -> Result<()>;

    /// Read `buf.len()` bytes at byte `offset`.
    ///
    /// Returns the number of bytes actually read; on a short read, the
    /// remainder of `buf` is zero-filled.
    fn read(&mut self, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write `buf` at byte `offset`, extending the file as needed.
    fn write(&mut self, cx: &Cx, buf: &[u8], offset: u64) -> Result<()>;

    /// Truncate the file to `size` bytes.
    fn truncate(&mut self, cx: &Cx, size: u64) -> Result<()>;

    /// Flush the file to stable storage.
    fn sync(&mut self, cx: &Cx, flags: SyncFlags) -> Result<()>;

    /// Current size in bytes.
    fn file_size(&self, cx: &Cx) -> Result<u64>;

    /// Escalate the file lock to `level`.
    ///
    /// Returns [`quarry_error::QuarryError::Busy`] when a conflicting
    /// lock is held elsewhere.
    fn lock(&mut self, cx: &Cx, level: LockLevel) -> Result<()>;

    /// Release the file lock down to `level` (`Shared` or `None`).
    fn unlock(&mut self, cx: &Cx, level: LockLevel) -> Result<()>;

    /// Whether any connection holds a RESERVED or higher lock.
    fn check_reserved_lock(&self, cx: &Cx) -> Result<bool>;

    /// The minimum atomic write unit of the underlying storage.
    fn sector_size(&self) -> u32 {
        4096
    }

    /// Capability flags of the underlying storage device.
    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::empty()
    }

    /// Apply a typed file-control operation. Unknown operations are
    /// ignored.
    fn file_control(&mut self, cx: &Cx, op: FileControl) -> Result<()> {
        let _ = (cx, op);
        Ok(())
    }
}
