//! Crash-simulation VFS for durability tests.
//!
//! Every file keeps two images: `current` (what reads observe) and
//! `synced` (what has survived an fsync barrier). [`SimVfs::crash`]
//! discards the difference, modelling power loss where unsynced writes
//! vanish and all locks evaporate. Fault hooks let a test fail the next
//! sync or write on a matching path, so a commit protocol can be stopped
//! at an exact point before "crashing".

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use quarry_error::{QuarryError, Result};
use quarry_types::Cx;
use quarry_types::LockLevel;
use quarry_types::flags::{AccessFlags, DeviceCharacteristics, SyncFlags, VfsOpenFlags};
use tracing::debug;

use crate::lock_table::LockState;
use crate::traits::{Vfs, VfsFile};

#[derive(Debug, Default)]
struct SimStorage {
    current: Vec<u8>,
    synced: Vec<u8>,
    locks: LockState,
}

#[derive(Debug, Default)]
struct Faults {
    /// Fail the next `sync` on exactly this path.
    sync_failure: Option<PathBuf>,
    /// Fail the next `write` on exactly this path.
    write_failure: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct SimVfsInner {
    files: HashMap<PathBuf, Arc<Mutex<SimStorage>>>,
    faults: Faults,
    next_temp_id: u64,
}

/// A VFS whose unsynced writes can be made to vanish.
#[derive(Debug, Clone)]
pub struct SimVfs {
    inner: Arc<Mutex<SimVfsInner>>,
    sector_size: u32,
    device: DeviceCharacteristics,
}

impl Default for SimVfs {
    fn default() -> Self {
        Self {
            inner: Arc::default(),
            sector_size: 512,
            device: DeviceCharacteristics::empty(),
        }
    }
}

fn lock_err() -> QuarryError {
    QuarryError::internal("SimVfs lock poisoned")
}

impl SimVfs {
    /// Create an empty simulator.
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

    /// Simulate power loss: revert every file to its last synced image
    /// and drop all locks.
    pub fn crash(&self) {
        let inner = self.inner.lock().expect("SimVfs lock poisoned");
        for (path, storage) in &inner.files {
            let mut storage = storage.lock().expect("SimVfs storage lock poisoned");
            let lost = storage.current.len() as i64 - storage.synced.len() as i64;
            debug!(path = %path.display(), lost_bytes = lost, "simulated crash");
            storage.current = storage.synced.clone();
            storage.locks = LockState::default();
        }
    }

    /// Arm a one-shot fsync failure for the next `sync` on exactly
    /// `path`.
    pub fn schedule_sync_failure(&self, path: impl Into<PathBuf>) {
        self.inner
            .lock()
            .expect("SimVfs lock poisoned")
            .faults
            .sync_failure = Some(path.into());
    }

    /// Arm a one-shot write failure for the next `write` on exactly
    /// `path`.
    pub fn schedule_write_failure(&self, path: impl Into<PathBuf>) {
        self.inner
            .lock()
            .expect("SimVfs lock poisoned")
            .faults
            .write_failure = Some(path.into());
    }

    /// The durable (synced) length of a file, for test assertions.
    pub fn synced_len(&self, path: &Path) -> Option<u64> {
        let inner = self.inner.lock().expect("SimVfs lock poisoned");
        let storage = inner.files.get(path)?;
        let storage = storage.lock().expect("SimVfs storage lock poisoned");
        Some(storage.synced.len() as u64)
    }
}

impl Vfs for SimVfs {
    type File = SimFile;

    fn name(&self) -> &'static str {
        "sim"
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
            PathBuf::from(format!("__sim_temp_{id}__"))
        };

        let is_create = flags.contains(VfsOpenFlags::CREATE);
        let storage = if let Some(existing) = inner.files.get(&resolved) {
            Arc::clone(existing)
        } else if is_create {
            let storage = Arc::new(Mutex::new(SimStorage::default()));
            inner.files.insert(resolved.clone(), Arc::clone(&storage));
            storage
        } else {
            return Err(QuarryError::CannotOpen { path: resolved });
        };
        drop(inner);

        let file = SimFile {
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

/// A handle onto a file in a [`SimVfs`].
#[derive(Debug)]
pub struct SimFile {
    path: PathBuf,
    storage: Arc<Mutex<SimStorage>>,
    lock_level: LockLevel,
    delete_on_close: bool,
    vfs: Arc<Mutex<SimVfsInner>>,
    sector_size: u32,
    device: DeviceCharacteristics,
}

impl SimFile {
    fn fault_armed(&self, pick: impl Fn(&mut Faults) -> &mut Option<PathBuf>) -> bool {
        let Ok(mut inner) = self.vfs.lock() else {
            return false;
        };
        let slot = pick(&mut inner.faults);
        let matched = slot.as_ref().is_some_and(|p| *p == self.path);
        if matched {
            *slot = None;
        }
        matched
    }
}

impl Drop for SimFile {
    fn drop(&mut self) {
        if self.lock_level != LockLevel::None {
            if let Ok(mut storage) = self.storage.lock() {
                storage.locks.release_all(self.lock_level);
            }
        }
    }
}

impl VfsFile for SimFile {
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
        let file_len = storage.current.len();
        if offset >= file_len {
            drop(storage);
            buf.fill(0);
            return Ok(0);
        }
        let to_read = buf.len().min(file_len - offset);
        buf[..to_read].copy_from_slice(&storage.current[offset..offset + to_read]);
        drop(storage);
        if to_read < buf.len() {
            buf[to_read..].fill(0);
        }
        Ok(to_read)
    }

    #[allow(clippy::cast_possible_truncation, clippy::significant_drop_tightening)]
    fn write(&mut self, _cx: &Cx, buf: &[u8], offset: u64) -> Result<()> {
        if self.fault_armed(|f| &mut f.write_failure) {
            return Err(QuarryError::IoWrite {
                page: u32::try_from(offset / u64::from(self.sector_size)).unwrap_or(0),
            });
        }
        let mut storage = self.storage.lock().map_err(|_| lock_err())?;
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > storage.current.len() {
            storage.current.resize(end, 0);
        }
        storage.current[offset..end].copy_from_slice(buf);
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn truncate(&mut self, _cx: &Cx, size: u64) -> Result<()> {
        self.storage
            .lock()
            .map_err(|_| lock_err())?
            .current
            .truncate(size as usize);
        Ok(())
    }

    fn sync(&mut self, _cx: &Cx, _flags: SyncFlags) -> Result<()> {
        if self.fault_armed(|f| &mut f.sync_failure) {
            return Err(QuarryError::IoFsync);
        }
        let mut storage = self.storage.lock().map_err(|_| lock_err())?;
        storage.synced = storage.current.clone();
        Ok(())
    }

    fn file_size(&self, _cx: &Cx) -> Result<u64> {
        Ok(self.storage.lock().map_err(|_| lock_err())?.current.len() as u64)
    }

    fn lock(&mut self, _cx: &Cx, level: LockLevel) -> Result<()> {
        let mut storage = self.storage.lock().map_err(|_| lock_err())?;
        self.lock_level = storage.locks.escalate(self.lock_level, level)?;
        drop(storage);
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
