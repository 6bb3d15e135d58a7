//! In-memory VFS for tests and transient databases.
//!
//! Files are named byte vectors shared across handles. Unlike a plain
//! byte-map stub, every file carries advisory-lock state, so lock
//! conflicts, `check_reserved_lock`, and hot-journal probes behave as
//! they would on a real filesystem.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use quarry_error::{QuarryError, Result};
use quarry_types::Cx;
use quarry_types::LockLevel;
use quarry_types::flags::{AccessFlags, DeviceCharacteristics, SyncFlags, VfsOpenFlags};

use crate::lock_table::LockState;
use crate::traits::{Vfs, VfsFile};

#[derive(Debug, Default)]
struct FileStorage {
    data: Vec<u8>,
    locks: LockState,
}

#[derive(Debug, Default)]
struct MemoryVfsInner {
    files: HashMap<PathBuf, Arc<Mutex<FileStorage>>>,
    next_temp_id: u64,
}

/// An in-memory VFS. Clones share the same file namespace.
#[derive(Debug, Clone)]
pub struct MemoryVfs {
    inner: Arc<Mutex<MemoryVfsInner>>,
    sector_size: u32,
    device: DeviceCharacteristics,
}

impl Default for MemoryVfs {
    fn default() -> Self {
        Self {
            inner: Arc::default(),
            sector_size: 512,
            device: DeviceCharacteristics::empty(),
        }
    }
}

impl MemoryVfs {
    /// Create an empty in-memory VFS reporting 512-byte sectors.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `sector_size` from every file this VFS opens.
    #[must_use]
    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    /// Report `device` capability flags from every file this VFS opens.
    #[must_use]
    pub fn with_device_characteristics(mut self, device: DeviceCharacteristics) -> Self {
        self.device = device;
        self
    }
}

fn lock_err() -> QuarryError {
    QuarryError::internal("MemoryVfs lock poisoned")
}

impl Vfs for MemoryVfs {
    type File = MemoryFile;

    fn name(&self) -> &'static str {
        "memory"
    }

    #[allow(clippy::significant_drop_tightening)]
    fn open(
        &self,
        _cx: &Cx,
        path: Option<&Path>,
        flags: VfsOpenFlags,
    ) -> Result<(Self::File, VfsOpenFlags)> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;

        let resolved = if let Some(p) = path {
            p.to_path_buf()
        } else {
            let id = inner.next_temp_id;
            inner.next_temp_id += 1;
            PathBuf::from(format!("__temp_{id}__"))
        };

        let is_create = flags.contains(VfsOpenFlags::CREATE);
        let storage = if let Some(existing) = inner.files.get(&resolved) {
            if flags.contains(VfsOpenFlags::EXCLUSIVE) && is_create {
                return Err(QuarryError::CannotOpen { path: resolved });
            }
            Arc::clone(existing)
        } else if is_create {
            let storage = Arc::new(Mutex::new(FileStorage::default()));
            inner.files.insert(resolved.clone(), Arc::clone(&storage));
            storage
        } else {
            return Err(QuarryError::CannotOpen { path: resolved });
        };
        drop(inner);

        let file = MemoryFile {
            path: resolved,
            storage,
            lock_level: LockLevel::None,
            delete_on_close: flags.contains(VfsOpenFlags::DELETEONCLOSE),
            vfs: Arc::clone(&self.inner),
            sector_size: self.sector_size,
            device: self.device,
        };

        let mut out_flags = flags;
        if is_create {
            out_flags |= VfsOpenFlags::READWRITE;
        }
        Ok((file, out_flags))
    }

    fn delete(&self, _cx: &Cx, path: &Path, _sync_dir: bool) -> Result<()> {
        self.inner
            .lock()
            .map_err(|_| lock_err())?
            .files
            .remove(path);
        Ok(())
    }

    fn access(&self, _cx: &Cx, path: &Path, _flags: AccessFlags) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| lock_err())?
            .files
            .contains_key(path))
    }

    fn full_pathname(&self, _cx: &Cx, path: &Path) -> Result<PathBuf> {
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(Path::new("/").join(path))
        }
    }
}

/// A handle onto a file in a [`MemoryVfs`].
#[derive(Debug)]
pub struct MemoryFile {
    path: PathBuf,
    storage: Arc<Mutex<FileStorage>>,
    lock_level: LockLevel,
    delete_on_close: bool,
    vfs: Arc<Mutex<MemoryVfsInner>>,
    sector_size: u32,
    device: DeviceCharacteristics,
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        // A dropped handle must not leave its locks behind.
        if self.lock_level != LockLevel::None {
            if let Ok(mut storage) = self.storage.lock() {
                storage.locks.release_all(self.lock_level);
            }
        }
    }
}

impl VfsFile for MemoryFile {
    fn close(&mut self, _cx: &Cx) -> Result<()> {
        if let Ok(mut storage) = self.storage.lock() {
            storage.locks.release_all(self.lock_level);
        }
        self.lock_level = LockLevel::None;
        if self.delete_on_close {
            self.vfs
                .lock()
                .map_err(|_| lock_err())?
                .files
                .remove(&self.path);
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read(&mut self, _cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize> {
        let storage = self.storage.lock().map_err(|_| lock_err())?;

        let offset = offset as usize;
        let file_len = storage.data.len();
        if offset >= file_len {
            drop(storage);
            buf.fill(0);
            return Ok(0);
        }

        let to_read = buf.len().min(file_len - offset);
        buf[..to_read].copy_from_slice(&storage.data[offset..offset + to_read]);
        drop(storage);

        if to_read < buf.len() {
            buf[to_read..].fill(0);
        }
        Ok(to_read)
    }

    #[allow(clippy::cast_possible_truncation, clippy::significant_drop_tightening)]
    fn write(&mut self, _cx: &Cx, buf: &[u8], offset: u64) -> Result<()> {
        let mut storage = self.storage.lock().map_err(|_| lock_err())?;
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > storage.data.len() {
            storage.data.resize(end, 0);
        }
        storage.data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn truncate(&mut self, _cx: &Cx, size: u64) -> Result<()> {
        self.storage
            .lock()
            .map_err(|_| lock_err())?
            .data
            .truncate(size as usize);
        Ok(())
    }

    fn sync(&mut self, _cx: &Cx, _flags: SyncFlags) -> Result<()> {
        Ok(())
    }

    fn file_size(&self, _cx: &Cx) -> Result<u64> {
        Ok(self.storage.lock().map_err(|_| lock_err())?.data.len() as u64)
    }

    fn lock(&mut self, _cx: &Cx, level: LockLevel) -> Result<()> {
        let mut storage = self.storage.lock().map_err(|_| lock_err())?;
        self.lock_level = storage.locks.escalate(self.lock_level, level)?;
        drop(storage);
        // Parked short of the target (readers draining): busy for now.
        if self.lock_level < level {
            return Err(QuarryError::Busy);
        }
        Ok(())
    }

    fn unlock(&mut self, _cx: &Cx, level: LockLevel) -> Result<()> {
        let mut storage = self.storage.lock().map_err(|_| lock_err())?;
        self.lock_level = storage.locks.release(self.lock_level, level);
        Ok(())
    }

    fn check_reserved_lock(&self, _cx: &Cx) -> Result<bool> {
        Ok(self
            .storage
            .lock()
            .map_err(|_| lock_err())?
            .locks
            .reserved_or_higher())
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn device_characteristics(&self) -> DeviceCharacteristics {
        self.device
    }
}
