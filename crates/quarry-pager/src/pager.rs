//! The transactional pager.
//!
//! Mediates between the page-cache manager and the VFS, owning the
//! database and journal file handles and the seven-state transaction
//! lifecycle:
//!
//! ```text
//! OPEN ⇄ READER → WRITER_LOCKED → WRITER_CACHEMOD → WRITER_DBMOD
//!                                         │                │
//!                                         └── (WAL mode)   └→ WRITER_FINISHED
//! any writer state → READER (commit phase two / rollback)
//! any state → ERROR (latched I/O failure) → OPEN (last ref dropped)
//! ```
//!
//! In rollback-journal modes the durability ordering is: pre-images are
//! journalled before their pages are overwritten in cache, the journal
//! is synced before the first dependent database write, database writes
//! are synced before the journal is finalised. The WAL backend replaces
//! all of this with frame appends and checkpoints.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, warn};

use quarry_error::{ErrorCode, QuarryError, Result};
use quarry_types::flags::{
    AccessFlags, DeviceCharacteristics, PageFlags, SpillGuard, SyncFlags, VfsOpenFlags,
};
use quarry_types::{
    Bitvec, Cx, JournalMode, LockLevel, LockingMode, PageData, PageNumber, PageSize,
    SynchronousMode, limits,
};
use quarry_vfs::{FileControl, Vfs, VfsFile};
use quarry_wal::{CheckpointStats, CheckpointWriter, Wal, WalSalts, WalSnapshot};

use crate::cache::GroupMode;
use crate::journal::{self, JOURNAL_MAGIC, JournalHeader, JournalRecord};
use crate::page_buf::SlabSpec;
use crate::page_cache::{FetchOutcome, PageCache};

pub use quarry_types::CheckpointMode;

// ---------------------------------------------------------------------------
// States and supporting types
// ---------------------------------------------------------------------------

/// The pager lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerState {
    /// No lock held; on-disk state unknown.
    Open,
    /// Shared lock held; reads are consistent.
    Reader,
    /// Write intent taken; nothing modified yet.
    WriterLocked,
    /// Cache modified; journal opened and first header written.
    WriterCacheMod,
    /// The database file itself has been written.
    WriterDbMod,
    /// Commit phase one complete.
    WriterFinished,
    /// A failure left cache and file possibly inconsistent; the error is
    /// latched until the last page reference is released.
    Error,
}

/// The pager's view of its file lock. `Unknown` is entered only when an
/// unlock fails with unknown outcome; the next lock taken from `Unknown`
/// must be EXCLUSIVE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PagerLock {
    Level(LockLevel),
    Unknown,
}

/// A caller-pluggable page transformation, applied in place after every
/// file read and to a copy before every file write. Journal pre-images
/// are stored encoded, so journalled bytes match the disk.
pub trait PageCodec: Send {
    /// Transform a page on its way to disk.
    fn encode(&self, pgno: PageNumber, data: &mut [u8]);
    /// Inverse transform after a page is read.
    fn decode(&self, pgno: PageNumber, data: &mut [u8]);
}

/// A pinned page. Dropping the handle without
/// [`Pager::release`] leaks the pin (and trips the close-time
/// reference-count check), so handles are must-use.
#[derive(Debug)]
#[must_use = "release the page via Pager::release"]
pub struct PageHandle {
    pgno: PageNumber,
}

impl PageHandle {
    /// The page this handle pins.
    #[must_use]
    pub fn pgno(&self) -> PageNumber {
        self.pgno
    }
}

/// Construction-time pager configuration.
#[derive(Debug)]
pub struct PagerOptions {
    /// Database page size.
    pub page_size: PageSize,
    /// Bytes of per-page scratch for upper layers.
    pub extra_size: usize,
    /// Soft maximum cached pages.
    pub cache_size: u32,
    /// Slab preallocation for the cache's buffer pool.
    pub slab: SlabSpec,
    /// Private or global cache group.
    pub group_mode: GroupMode,
    /// Initial journal mode.
    pub journal_mode: JournalMode,
    /// Initial sync policy.
    pub synchronous: SynchronousMode,
    /// Lock retention policy.
    pub locking_mode: LockingMode,
    /// Requested memory-map span; stored, since the VFS contract has no
    /// mapping operation.
    pub mmap_size: u64,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: PageSize::DEFAULT,
            extra_size: 0,
            cache_size: u32::try_from(limits::DEFAULT_CACHE_SIZE).unwrap_or(2000),
            slab: SlabSpec::default(),
            group_mode: GroupMode::Private,
            journal_mode: JournalMode::Delete,
            synchronous: SynchronousMode::Full,
            locking_mode: LockingMode::Normal,
            mmap_size: 0,
        }
    }
}

/// A nested-transaction marker.
#[derive(Debug)]
struct PagerSavepoint {
    /// Main-journal write offset when the savepoint opened.
    #[allow(dead_code)]
    journal_off: u64,
    /// Main-journal header offset when the savepoint opened.
    #[allow(dead_code)]
    hdr_off: u64,
    /// Database size in pages when the savepoint opened.
    orig_page_count: u32,
    /// Pages already captured in the sub-journal for this savepoint.
    in_savepoint: Bitvec,
    /// First sub-journal record belonging to this savepoint.
    sub_rec_index: usize,
}

/// One sub-journal record: a page image at first touch after a
/// savepoint.
#[derive(Debug)]
struct SubRecord {
    pgno: PageNumber,
    content: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Journal storage
// ---------------------------------------------------------------------------

/// In-memory journal backing for `journal_mode = MEMORY`.
#[derive(Debug, Default)]
struct MemJournal {
    data: Vec<u8>,
}

/// Either a VFS-backed or an in-memory rollback journal, presented as a
/// file so the wire codec and playback are shared.
#[derive(Debug)]
enum JournalStore<F: VfsFile> {
    File(F),
    Mem(MemJournal),
}

impl<F: VfsFile> VfsFile for JournalStore<F> {
    fn close(&mut self, cx: &Cx) -> Result<()> {
        match self {
            Self::File(f) => f.close(cx),
            Self::Mem(_) => Ok(()),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read(&mut self, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize> {
        match self {
            Self::File(f) => f.read(cx, buf, offset),
            Self::Mem(m) => {
                let offset = offset as usize;
                if offset >= m.data.len() {
                    buf.fill(0);
                    return Ok(0);
                }
                let n = buf.len().min(m.data.len() - offset);
                buf[..n].copy_from_slice(&m.data[offset..offset + n]);
                buf[n..].fill(0);
                Ok(n)
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write(&mut self, cx: &Cx, buf: &[u8], offset: u64) -> Result<()> {
        match self {
            Self::File(f) => f.write(cx, buf, offset),
            Self::Mem(m) => {
                let offset = offset as usize;
                let end = offset + buf.len();
                if end > m.data.len() {
                    m.data.resize(end, 0);
                }
                m.data[offset..end].copy_from_slice(buf);
                Ok(())
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn truncate(&mut self, cx: &Cx, size: u64) -> Result<()> {
        match self {
            Self::File(f) => f.truncate(cx, size),
            Self::Mem(m) => {
                m.data.truncate(size as usize);
                Ok(())
            }
        }
    }

    fn sync(&mut self, cx: &Cx, flags: SyncFlags) -> Result<()> {
        match self {
            Self::File(f) => f.sync(cx, flags),
            Self::Mem(_) => Ok(()),
        }
    }

    fn file_size(&self, cx: &Cx) -> Result<u64> {
        match self {
            Self::File(f) => f.file_size(cx),
            Self::Mem(m) => Ok(m.data.len() as u64),
        }
    }

    fn lock(&mut self, _cx: &Cx, _level: LockLevel) -> Result<()> {
        Ok(())
    }

    fn unlock(&mut self, _cx: &Cx, _level: LockLevel) -> Result<()> {
        Ok(())
    }

    fn check_reserved_lock(&self, _cx: &Cx) -> Result<bool> {
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// Checkpoint adapter
// ---------------------------------------------------------------------------

/// Writes checkpointed WAL frames straight into the database file.
struct DbWriter<'a, F: VfsFile> {
    file: &'a mut F,
    page_size: usize,
    file_pages: &'a mut u32,
}

impl<F: VfsFile> CheckpointWriter for DbWriter<'_, F> {
    fn write_page(&mut self, cx: &Cx, pgno: PageNumber, data: &[u8]) -> Result<()> {
        let offset = u64::from(pgno.get() - 1) * self.page_size as u64;
        self.file.write(cx, data, offset)?;
        *self.file_pages = (*self.file_pages).max(pgno.get());
        Ok(())
    }

    fn truncate(&mut self, cx: &Cx, n_pages: u32) -> Result<()> {
        if *self.file_pages > n_pages {
            self.file
                .truncate(cx, u64::from(n_pages) * self.page_size as u64)?;
            *self.file_pages = n_pages;
        }
        Ok(())
    }

    fn sync(&mut self, cx: &Cx) -> Result<()> {
        self.file.sync(cx, SyncFlags::NORMAL)
    }
}

// ---------------------------------------------------------------------------
// Pager
// ---------------------------------------------------------------------------

type BusyHandler = Box<dyn FnMut(u32) -> bool + Send>;

/// The transactional pager over one database file.
pub struct Pager<V: Vfs> {
    vfs: Arc<V>,
    db_path: PathBuf,
    journal_path: PathBuf,
    wal_path: PathBuf,
    db_file: V::File,
    journal: Option<JournalStore<V::File>>,
    wal: Option<Wal<V::File>>,
    wal_snapshot: WalSnapshot,
    pcache: PageCache,

    state: PagerState,
    lock: PagerLock,
    err_code: Option<ErrorCode>,

    page_size: PageSize,
    sector_size: u32,
    device: DeviceCharacteristics,

    /// Current logical size in pages.
    db_size: u32,
    /// Size at write-transaction start.
    db_orig_size: u32,
    /// Pages actually on disk.
    db_file_size: u32,

    journal_mode: JournalMode,
    sync_mode: SynchronousMode,
    locking_mode: LockingMode,
    change_count_done: bool,

    /// Next journal write offset.
    journal_off: u64,
    /// Offset of the current journal header.
    journal_hdr_off: u64,
    /// Records written after the current header.
    n_rec: u32,
    /// Checksum nonce of the current journal header.
    nonce: u32,
    /// The current header has been synced; further journalling starts a
    /// fresh header.
    header_sealed: bool,
    /// Pages journalled in this transaction.
    in_journal: Bitvec,

    do_not_spill: SpillGuard,
    savepoints: Vec<PagerSavepoint>,
    sub_journal: Vec<SubRecord>,
    /// WAL commit frames are on disk; only phase two remains. WAL mode
    /// never advances past `WriterCacheMod`.
    wal_committed: bool,

    busy_handler: Option<BusyHandler>,
    codec: Option<Box<dyn PageCodec>>,
    mmap_size: u64,
    /// Bytes 24..40 of page 1 at the last successful read transaction,
    /// for detecting modification by another connection.
    header_signature: Option<[u8; 16]>,
}

impl<V: Vfs> std::fmt::Debug for Pager<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("path", &self.db_path)
            .field("state", &self.state)
            .field("journal_mode", &self.journal_mode)
            .field("db_size", &self.db_size)
            .finish_non_exhaustive()
    }
}

impl<V: Vfs> Pager<V> {
    /// Open (creating if necessary) a database file and construct its
    /// pager in the `OPEN` state.
    pub fn open(vfs: V, path: &Path, opts: PagerOptions) -> Result<Self> {
        let cx = Cx::new();
        let vfs = Arc::new(vfs);

        let mut journal_path = path.as_os_str().to_owned();
        journal_path.push("-journal");
        let mut wal_path = path.as_os_str().to_owned();
        wal_path.push("-wal");

        let flags = VfsOpenFlags::MAIN_DB | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE;
        let (db_file, _) = vfs.open(&cx, Some(path), flags)?;

        let raw_sector = db_file.sector_size();
        let sector_size = if raw_sector < limits::MIN_SECTOR_SIZE {
            512
        } else {
            raw_sector.min(limits::MAX_SECTOR_SIZE)
        };
        let device = db_file.device_characteristics();

        let mut pcache = PageCache::open(
            opts.page_size,
            opts.extra_size,
            true,
            opts.group_mode,
            opts.slab,
        );
        pcache.set_cache_size(opts.cache_size);

        Ok(Self {
            vfs,
            db_path: path.to_owned(),
            journal_path: PathBuf::from(journal_path),
            wal_path: PathBuf::from(wal_path),
            db_file,
            journal: None,
            wal: None,
            wal_snapshot: WalSnapshot::empty(),
            pcache,
            state: PagerState::Open,
            lock: PagerLock::Level(LockLevel::None),
            err_code: None,
            page_size: opts.page_size,
            sector_size,
            device,
            db_size: 0,
            db_orig_size: 0,
            db_file_size: 0,
            journal_mode: opts.journal_mode,
            sync_mode: opts.synchronous,
            locking_mode: opts.locking_mode,
            change_count_done: false,
            journal_off: 0,
            journal_hdr_off: 0,
            n_rec: 0,
            nonce: 0,
            header_sealed: false,
            in_journal: Bitvec::new(),
            do_not_spill: SpillGuard::empty(),
            savepoints: Vec::new(),
            sub_journal: Vec::new(),
            wal_committed: false,
            busy_handler: None,
            codec: None,
            mmap_size: opts.mmap_size,
            header_signature: None,
        })
    }

    // --- accessors -----------------------------------------------------

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PagerState {
        self.state
    }

    /// Current logical database size in pages.
    #[must_use]
    pub fn db_size(&self) -> u32 {
        self.db_size
    }

    /// The configured page size.
    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// The active journal mode.
    #[must_use]
    pub fn journal_mode(&self) -> JournalMode {
        self.journal_mode
    }

    /// Sum of pin counts over all cached pages.
    #[must_use]
    pub fn ref_count_sum(&self) -> i64 {
        self.pcache.ref_count_sum()
    }

    /// Verify cache invariants (test support).
    #[doc(hidden)]
    pub fn check_cache_integrity(&self) {
        self.pcache.check_integrity();
    }

    // --- configuration -------------------------------------------------

    /// Install the busy handler invoked (with the retry count) when lock
    /// escalation reports contention.
    pub fn set_busy_handler(&mut self, handler: Option<BusyHandler>) {
        self.busy_handler = handler;
    }

    /// Install a page codec.
    pub fn set_codec(&mut self, codec: Option<Box<dyn PageCodec>>) {
        self.codec = codec;
    }

    /// Change the sync policy.
    pub fn set_synchronous(&mut self, mode: SynchronousMode) {
        self.sync_mode = mode;
    }

    /// Change the lock retention policy.
    pub fn set_locking_mode(&mut self, mode: LockingMode) {
        self.locking_mode = mode;
    }

    /// Change the cache's soft page limit.
    pub fn set_cache_size(&mut self, n: u32) {
        self.pcache.set_cache_size(n);
    }

    /// Change the spill floor (0 disables it).
    pub fn set_spill_size(&mut self, n: u32) {
        self.pcache.set_spill_size(n);
    }

    /// Store the requested memory-map span.
    pub fn set_mmap_size(&mut self, bytes: u64) {
        self.mmap_size = bytes;
    }

    /// The stored memory-map span.
    #[must_use]
    pub fn mmap_size(&self) -> u64 {
        self.mmap_size
    }

    /// Enable or disable stress spilling entirely.
    pub fn set_spill_enabled(&mut self, enabled: bool) {
        if enabled {
            self.do_not_spill.remove(SpillGuard::OFF);
        } else {
            self.do_not_spill.insert(SpillGuard::OFF);
        }
    }

    /// Switch journal modes. Only allowed outside a write transaction;
    /// leaving WAL checkpoints and removes the log.
    pub fn set_journal_mode(&mut self, cx: &Cx, mode: JournalMode) -> Result<JournalMode> {
        self.ensure_not_error()?;
        if self.in_write_txn() {
            return Err(QuarryError::Misuse);
        }
        if mode == self.journal_mode {
            return Ok(mode);
        }

        if self.journal_mode == JournalMode::Wal && self.wal.is_some() {
            if self.wal.as_ref().is_some_and(|w| w.max_committed() > 0) {
                self.checkpoint(cx, CheckpointMode::Truncate)?;
            }
            if let Some(wal) = self.wal.take() {
                let mut file = wal.into_file();
                let _ = file.close(cx);
            }
            let _ = self.vfs.delete(cx, &self.wal_path, false);
            self.wal_snapshot = WalSnapshot::empty();
        }

        debug!(?mode, "journal mode changed");
        self.journal_mode = mode;
        Ok(mode)
    }

    // --- error latch ---------------------------------------------------

    fn ensure_not_error(&self) -> Result<()> {
        match (self.state, self.err_code) {
            (PagerState::Error, Some(code)) => Err(QuarryError::ErrorState { code }),
            (PagerState::Error, None) => Err(QuarryError::internal("error state without code")),
            _ => Ok(()),
        }
    }

    fn latched(&self) -> QuarryError {
        QuarryError::ErrorState {
            code: self.err_code.unwrap_or(ErrorCode::Internal),
        }
    }

    /// Latch a non-recoverable failure: every subsequent operation
    /// reports it until the last page reference is released.
    fn enter_error_state(&mut self, err: &QuarryError) {
        if err.is_recoverable() {
            return;
        }
        if self.state != PagerState::Error {
            error!(code = ?err.code(), "pager entering error state: {err}");
            self.err_code = Some(err.code());
            self.state = PagerState::Error;
        }
    }

    // --- locking -------------------------------------------------------

    fn current_lock(&self) -> LockLevel {
        match self.lock {
            PagerLock::Level(l) => l,
            PagerLock::Unknown => LockLevel::None,
        }
    }

    fn lock_with_busy(&mut self, cx: &Cx, target: LockLevel) -> Result<()> {
        if let PagerLock::Level(cur) = self.lock {
            if cur >= target {
                return Ok(());
            }
        }
        // Escalation is stepwise: EXCLUSIVE is only reachable from
        // SHARED or better.
        if target == LockLevel::Exclusive && self.current_lock() < LockLevel::Shared {
            self.lock_with_busy(cx, LockLevel::Shared)?;
        }
        let mut attempts = 0u32;
        loop {
            match self.db_file.lock(cx, target) {
                Ok(()) => {
                    self.lock = PagerLock::Level(target);
                    return Ok(());
                }
                Err(QuarryError::Busy) => {
                    let retry = self
                        .busy_handler
                        .as_mut()
                        .is_some_and(|handler| handler(attempts));
                    if !retry {
                        return Err(QuarryError::Busy);
                    }
                    attempts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn unlock_db_to(&mut self, cx: &Cx, level: LockLevel) -> Result<()> {
        match self.db_file.unlock(cx, level) {
            Ok(()) => {
                self.lock = PagerLock::Level(level);
                Ok(())
            }
            Err(_) => {
                // Unknown outcome: the next lock taken must be EXCLUSIVE
                // before any hot-journal inspection.
                warn!("unlock failed; lock state unknown");
                self.lock = PagerLock::Unknown;
                Err(QuarryError::IoUnlock)
            }
        }
    }

    fn in_write_txn(&self) -> bool {
        matches!(
            self.state,
            PagerState::WriterLocked
                | PagerState::WriterCacheMod
                | PagerState::WriterDbMod
                | PagerState::WriterFinished
        )
    }

    fn no_sync(&self) -> bool {
        self.sync_mode == SynchronousMode::Off
    }

    fn db_sync_flags(&self) -> SyncFlags {
        if self.sync_mode >= SynchronousMode::Full {
            SyncFlags::FULL
        } else {
            SyncFlags::NORMAL
        }
    }

    // --- OPEN → READER -------------------------------------------------

    /// Acquire a shared lock and enter `READER`, recovering a hot
    /// journal first if one is found.
    pub fn shared_lock(&mut self, cx: &Cx) -> Result<()> {
        self.ensure_not_error()?;
        if self.state != PagerState::Open {
            return Ok(());
        }
        let result = self.shared_lock_inner(cx);
        if let Err(e) = &result {
            self.enter_error_state(e);
        }
        result
    }

    fn shared_lock_inner(&mut self, cx: &Cx) -> Result<()> {
        // After an unlock of unknown outcome we must go straight to
        // EXCLUSIVE; a hot journal may be read only under it.
        let target = if self.lock == PagerLock::Unknown {
            LockLevel::Exclusive
        } else {
            LockLevel::Shared
        };
        self.lock_with_busy(cx, target)?;

        if let Some(jfile) = self.detect_hot_journal(cx)? {
            warn!(path = %self.journal_path.display(), "hot journal detected; recovering");
            self.lock_with_busy(cx, LockLevel::Exclusive)?;
            self.journal = Some(JournalStore::File(jfile));
            let played = self.playback_journal(cx);
            self.journal = None;
            played?;
            self.vfs.delete(cx, &self.journal_path, true)?;
            if self.locking_mode == LockingMode::Normal {
                let _ = self.unlock_db_to(cx, LockLevel::Shared);
            }
        }

        let file_size = self.db_file.file_size(cx)?;
        let ps = u64::from(self.page_size.get());
        if file_size % ps != 0 {
            return Err(QuarryError::Corrupt {
                detail: format!(
                    "database size {file_size} is not a multiple of the page size {ps}"
                ),
            });
        }
        self.db_file_size = u32::try_from(file_size / ps).map_err(|_| QuarryError::Full)?;
        self.db_size = self.db_file_size;

        if self.journal_mode == JournalMode::Wal {
            self.ensure_wal(cx)?;
            let wal = self.wal.as_ref().expect("wal just ensured");
            self.wal_snapshot = wal.snapshot();
            if wal.db_size() > 0 {
                self.db_size = wal.db_size();
            }
        }

        // Another connection may have modified the file: the change
        // counter region gives it away, and the cache must be purged.
        if self.db_file_size > 0 {
            let mut head = [0u8; 40];
            let _ = self.db_file.read(cx, &mut head, 0)?;
            let signature: [u8; 16] = head[24..40].try_into().expect("16-byte region");
            if self.header_signature.is_some_and(|old| old != signature) {
                debug!("change counter moved; discarding cached pages");
                self.pcache.clear();
            }
            self.header_signature = Some(signature);
        }

        self.state = PagerState::Reader;
        Ok(())
    }

    /// Probe for a journal left behind by a crashed writer.
    fn detect_hot_journal(&mut self, cx: &Cx) -> Result<Option<V::File>> {
        if self.journal.is_some() {
            // Our own (exclusive-mode) journal, not a hot one.
            return Ok(None);
        }
        if !self.vfs.access(cx, &self.journal_path, AccessFlags::EXISTS)? {
            return Ok(None);
        }
        // A live writer holds RESERVED or better; its journal is not hot.
        if self.db_file.check_reserved_lock(cx)? {
            return Ok(None);
        }

        let flags = VfsOpenFlags::MAIN_JOURNAL | VfsOpenFlags::READWRITE;
        let (mut file, _) = self.vfs.open(cx, Some(&self.journal_path), flags)?;

        let size = file.file_size(cx)?;
        if size == 0 {
            let _ = file.close(cx);
            let _ = self.vfs.delete(cx, &self.journal_path, false);
            return Ok(None);
        }

        let mut magic = [0u8; 8];
        let n = file.read(cx, &mut magic, 0)?;
        if n < magic.len() || magic != JOURNAL_MAGIC {
            // A zeroed header (journal_mode=PERSIST leftovers) is cold.
            let _ = file.close(cx);
            return Ok(None);
        }

        if let Some(master) = journal::read_master_name(cx, &mut file)? {
            if !self
                .vfs
                .access(cx, Path::new(&master), AccessFlags::EXISTS)?
            {
                debug!(master, "journal names a finished master; discarding");
                let _ = file.close(cx);
                let _ = self.vfs.delete(cx, &self.journal_path, false);
                return Ok(None);
            }
        }

        Ok(Some(file))
    }

    // --- READER ⇄ OPEN -------------------------------------------------

    /// Drop back to `OPEN` if no page references remain. Called
    /// automatically by [`Pager::release`]; exposed for explicit
    /// transaction teardown.
    pub fn unlock_if_unused(&mut self, cx: &Cx) {
        if self.pcache.ref_count_sum() == 0
            && matches!(self.state, PagerState::Reader | PagerState::Error)
        {
            self.pager_unlock(cx);
        }
    }

    fn pager_unlock(&mut self, cx: &Cx) {
        if self.locking_mode == LockingMode::Exclusive && self.state == PagerState::Reader {
            // Exclusive mode retains the lock and the open journal.
            self.state = PagerState::Reader;
            return;
        }
        self.journal = None;
        let _ = self.unlock_db_to(cx, LockLevel::None);
        if self.state == PagerState::Error {
            warn!("pager leaving error state; cache discarded");
            self.pcache.clear();
            self.err_code = None;
        }
        self.change_count_done = false;
        self.state = PagerState::Open;
    }

    // --- page access ---------------------------------------------------

    /// Fetch and pin a page, reading it from the WAL, the database file,
    /// or zero-filling beyond the end of file.
    pub fn fetch(&mut self, cx: &Cx, pgno: PageNumber) -> Result<PageHandle> {
        self.ensure_not_error()?;
        if self.state == PagerState::Open {
            self.shared_lock(cx)?;
        }

        let outcome = match self.pcache.fetch(pgno, true) {
            FetchOutcome::NeedsSpill(victim) => {
                if let Err(e) = self.stress_spill(cx, victim) {
                    self.enter_error_state(&e);
                    return Err(e);
                }
                self.pcache.fetch_force(pgno)
            }
            other => other,
        };

        let FetchOutcome::Found { is_new } = outcome else {
            return Err(QuarryError::internal("fetch with create cannot miss"));
        };

        if is_new {
            if let Err(e) = self.load_page_content(cx, pgno) {
                let _ = self.pcache.drop_page(pgno);
                self.enter_error_state(&e);
                return Err(e);
            }
        }
        Ok(PageHandle { pgno })
    }

    fn load_page_content(&mut self, cx: &Cx, pgno: PageNumber) -> Result<()> {
        let ps = self.page_size.as_usize();

        if self.journal_mode == JournalMode::Wal {
            if let Some(wal) = &mut self.wal {
                let from_wal = if matches!(
                    self.state,
                    PagerState::WriterLocked
                        | PagerState::WriterCacheMod
                        | PagerState::WriterDbMod
                        | PagerState::WriterFinished
                ) {
                    wal.read_page_latest(cx, pgno)?
                } else {
                    wal.read_page(cx, pgno, self.wal_snapshot)?
                };
                if let Some(mut data) = from_wal {
                    if let Some(codec) = &self.codec {
                        codec.decode(pgno, &mut data);
                    }
                    self.pcache
                        .with_data_mut(pgno, |buf| buf.copy_from_slice(&data))?;
                    return Ok(());
                }
            }
        }

        if pgno.get() <= self.db_file_size {
            let mut buf = vec![0u8; ps];
            let n = self
                .db_file
                .read(cx, &mut buf, pgno.file_offset(self.page_size))
                .map_err(|_| QuarryError::IoRead { page: pgno.get() })?;
            if n < ps {
                return Err(QuarryError::ShortRead {
                    expected: ps,
                    actual: n,
                });
            }
            if let Some(codec) = &self.codec {
                codec.decode(pgno, &mut buf);
            }
            self.pcache
                .with_data_mut(pgno, |dst| dst.copy_from_slice(&buf))?;
        } else {
            // Beyond the end of the file (or the image was truncated):
            // a fresh zero page.
            self.pcache.with_data_mut(pgno, |dst| dst.fill(0))?;
        }
        Ok(())
    }

    /// Copy out a pinned page's content.
    pub fn page_data(&self, handle: &PageHandle) -> Result<PageData> {
        let bytes = self.pcache.with_data(handle.pgno, <[u8]>::to_vec)?;
        Ok(PageData::from_vec(bytes))
    }

    /// Release a pin. Dropping the last reference outside a write
    /// transaction releases the file lock as well.
    pub fn release(&mut self, cx: &Cx, handle: PageHandle) -> Result<()> {
        self.pcache.release(handle.pgno)?;
        self.unlock_if_unused(cx);
        Ok(())
    }

    /// Convenience: fetch, copy, and release in one call.
    pub fn read_page(&mut self, cx: &Cx, pgno: PageNumber) -> Result<PageData> {
        let handle = self.fetch(cx, pgno)?;
        let data = self.page_data(&handle);
        self.release(cx, handle)?;
        data
    }

    /// Exclude a page from journalling and write-out (freelist leaves
    /// and pages whose content is dead).
    pub fn dont_write(&mut self, handle: &PageHandle) -> Result<()> {
        self.pcache.set_flags(handle.pgno, PageFlags::DONT_WRITE)
    }

    // --- write transaction ---------------------------------------------

    /// Begin a write transaction: RESERVED (or EXCLUSIVE) in rollback
    /// modes, the log write slot in WAL mode.
    pub fn begin_write(&mut self, cx: &Cx, exclusive: bool) -> Result<()> {
        self.ensure_not_error()?;
        if self.in_write_txn() {
            return Ok(());
        }
        if self.state == PagerState::Open {
            self.shared_lock(cx)?;
        }

        if self.journal_mode == JournalMode::Wal {
            self.ensure_wal(cx)?;
        } else {
            self.lock_with_busy(cx, LockLevel::Reserved)?;
            if exclusive || self.locking_mode == LockingMode::Exclusive {
                self.lock_with_busy(cx, LockLevel::Exclusive)?;
            }
        }

        self.state = PagerState::WriterLocked;
        self.db_orig_size = self.db_size;
        self.journal_off = 0;
        self.journal_hdr_off = 0;
        self.n_rec = 0;
        self.header_sealed = false;
        self.wal_committed = false;
        self.in_journal.clear_all();
        debug!(orig_pages = self.db_orig_size, "write transaction started");
        Ok(())
    }

    /// Make a pinned page writable with new content. The original image
    /// is journalled first when required by the durability rules.
    pub fn write(&mut self, cx: &Cx, handle: &PageHandle, data: &[u8]) -> Result<()> {
        self.ensure_not_error()?;
        if !self.in_write_txn() {
            return Err(QuarryError::Misuse);
        }
        if data.len() != self.page_size.as_usize() {
            return Err(QuarryError::internal(format!(
                "page write of {} bytes against page size {}",
                data.len(),
                self.page_size
            )));
        }

        let result = self.write_inner(cx, handle.pgno, data);
        if let Err(e) = &result {
            self.enter_error_state(e);
        }
        result
    }

    fn write_inner(&mut self, cx: &Cx, pgno: PageNumber, data: &[u8]) -> Result<()> {
        if self.state == PagerState::WriterLocked {
            self.open_journal(cx)?;
            self.state = PagerState::WriterCacheMod;
        }

        let pages_per_sector = self.sector_size / self.page_size.get();
        if pages_per_sector > 1 && self.journal_mode.uses_rollback_journal() {
            self.write_large_sector(cx, pgno, data)
        } else {
            self.write_single(cx, pgno, Some(data))
        }
    }

    /// Journal and update one page.
    fn write_single(&mut self, cx: &Cx, pgno: PageNumber, data: Option<&[u8]>) -> Result<()> {
        self.journal_page_if_needed(cx, pgno)?;
        self.subjournal_if_needed(pgno)?;
        self.pcache.make_dirty(pgno)?;
        self.pcache.set_flags(pgno, PageFlags::WRITEABLE)?;
        if let Some(data) = data {
            self.pcache
                .with_data_mut(pgno, |buf| buf.copy_from_slice(data))?;
        }
        if pgno.get() > self.db_size {
            self.db_size = pgno.get();
        }
        Ok(())
    }

    /// When sectors are larger than pages, every page sharing the target
    /// page's sector is journalled as a unit, and spills that would sync
    /// the journal are refused for the duration.
    fn write_large_sector(&mut self, cx: &Cx, pgno: PageNumber, data: &[u8]) -> Result<()> {
        self.do_not_spill.insert(SpillGuard::NOSYNC);

        let result = (|| {
            let pps = self.sector_size / self.page_size.get();
            let base = ((pgno.get() - 1) / pps) * pps + 1;
            let mut sector_needs_sync = false;

            for pg in base..base + pps {
                let Some(page) = PageNumber::new(pg) else {
                    continue;
                };
                if page == pgno {
                    self.write_single(cx, page, Some(data))?;
                } else if pg <= self.db_orig_size.max(self.db_size) {
                    let handle = self.fetch(cx, page)?;
                    self.write_single(cx, page, None)?;
                    self.release(cx, handle)?;
                }
                if self.pcache.contains(page)
                    && self
                        .pcache
                        .flags(page)
                        .is_ok_and(|f| f.contains(PageFlags::NEED_SYNC))
                {
                    sector_needs_sync = true;
                }
            }

            // Pages sharing a sector sink or swim together: if one of
            // them must wait for a journal sync, they all must.
            if sector_needs_sync {
                for pg in base..base + pps {
                    let Some(page) = PageNumber::new(pg) else {
                        continue;
                    };
                    if self.pcache.contains(page)
                        && self
                            .pcache
                            .flags(page)
                            .is_ok_and(|f| f.contains(PageFlags::DIRTY))
                    {
                        self.pcache.set_flags(page, PageFlags::NEED_SYNC)?;
                    }
                }
            }
            Ok(())
        })();

        self.do_not_spill.remove(SpillGuard::NOSYNC);
        result
    }

    fn journal_page_if_needed(&mut self, cx: &Cx, pgno: PageNumber) -> Result<()> {
        if !self.journal_mode.uses_rollback_journal() {
            return Ok(());
        }
        // Already captured, or the page did not exist at transaction
        // start (rollback truncates it away instead).
        if self.in_journal.test(pgno) || pgno.get() > self.db_orig_size {
            return Ok(());
        }

        if self.header_sealed {
            self.start_new_journal_header(cx)?;
        }

        let mut content = self.pcache.with_data(pgno, <[u8]>::to_vec)?;
        if let Some(codec) = &self.codec {
            codec.encode(pgno, &mut content);
        }
        let record = JournalRecord {
            pgno: pgno.get(),
            content,
        }
        .encode(self.nonce);

        let store = self
            .journal
            .as_mut()
            .ok_or_else(|| QuarryError::internal("journalling without an open journal"))?;
        store.write(cx, &record, self.journal_off)?;
        self.journal_off += record.len() as u64;
        self.n_rec += 1;
        self.in_journal.set(pgno);
        if !self.no_sync() {
            self.pcache.set_flags(pgno, PageFlags::NEED_SYNC)?;
        }
        debug!(page = pgno.get(), "pre-image journalled");
        Ok(())
    }

    fn subjournal_if_needed(&mut self, pgno: PageNumber) -> Result<()> {
        let needed = self
            .savepoints
            .iter()
            .any(|sp| pgno.get() <= sp.orig_page_count && !sp.in_savepoint.test(pgno));
        if !needed {
            return Ok(());
        }
        let content = self.pcache.with_data(pgno, <[u8]>::to_vec)?;
        self.sub_journal.push(SubRecord { pgno, content });
        for sp in &mut self.savepoints {
            if pgno.get() <= sp.orig_page_count {
                sp.in_savepoint.set(pgno);
            }
        }
        Ok(())
    }

    fn open_journal(&mut self, cx: &Cx) -> Result<()> {
        self.in_journal.clear_all();
        match self.journal_mode {
            JournalMode::Off => return Ok(()),
            JournalMode::Wal => {
                self.ensure_wal(cx)?;
                return Ok(());
            }
            JournalMode::Memory => {
                self.journal = Some(JournalStore::Mem(MemJournal::default()));
            }
            JournalMode::Delete | JournalMode::Truncate | JournalMode::Persist => {
                if self.journal.is_none() {
                    let flags = VfsOpenFlags::MAIN_JOURNAL
                        | VfsOpenFlags::CREATE
                        | VfsOpenFlags::READWRITE;
                    let (file, _) = self.vfs.open(cx, Some(&self.journal_path), flags)?;
                    self.journal = Some(JournalStore::File(file));
                }
                self.journal
                    .as_mut()
                    .expect("journal just opened")
                    .truncate(cx, 0)?;
            }
        }
        self.journal_hdr_off = 0;
        self.write_journal_header(cx)
    }

    fn write_journal_header(&mut self, cx: &Cx) -> Result<()> {
        let mut nonce = [0u8; 4];
        self.vfs.randomness(cx, &mut nonce);
        self.nonce = u32::from_be_bytes(nonce);

        let header = JournalHeader {
            n_rec: 0,
            nonce: self.nonce,
            orig_page_count: self.db_orig_size,
            sector_size: self.sector_size,
            page_size: self.page_size.get(),
        };
        let bytes = header.encode();
        let store = self
            .journal
            .as_mut()
            .ok_or_else(|| QuarryError::internal("no journal to write a header to"))?;
        store.write(cx, &bytes, self.journal_hdr_off)?;
        self.journal_off = self.journal_hdr_off + bytes.len() as u64;
        self.n_rec = 0;
        self.header_sealed = false;
        debug!(offset = self.journal_hdr_off, "journal header written");
        Ok(())
    }

    fn start_new_journal_header(&mut self, cx: &Cx) -> Result<()> {
        let span = journal::header_span(self.sector_size);
        self.journal_hdr_off = self.journal_off.div_ceil(span) * span;
        self.write_journal_header(cx)
    }

    /// Patch the record count into the current journal header and sync
    /// the journal; afterwards the NEED_SYNC pages may hit the database.
    fn sync_journal(&mut self, cx: &Cx) -> Result<()> {
        if self.journal_mode.uses_rollback_journal() {
            let no_sync = self.no_sync();
            if let Some(store) = self.journal.as_mut() {
                if !no_sync {
                    store.write(cx, &self.n_rec.to_be_bytes(), self.journal_hdr_off + 8)?;
                    store
                        .sync(cx, SyncFlags::NORMAL)
                        .map_err(|_| QuarryError::IoFsync)?;
                    self.header_sealed = true;
                    debug!(n_rec = self.n_rec, "journal synced");
                }
            }
        }
        self.pcache.clear_need_sync();
        if self.state == PagerState::WriterCacheMod {
            self.state = PagerState::WriterDbMod;
        }
        Ok(())
    }

    /// Write dirty pages to the database file in page-number order.
    fn write_page_list(&mut self, cx: &Cx, pages: &[PageNumber]) -> Result<()> {
        let hint = u64::from(self.db_size) * u64::from(self.page_size.get());
        let _ = self.db_file.file_control(cx, FileControl::SizeHint(hint));

        for &pgno in pages {
            let flags = self.pcache.flags(pgno)?;
            // Pages beyond the image (truncated away) and explicitly
            // dead pages are dropped, not written.
            if pgno.get() > self.db_size || flags.contains(PageFlags::DONT_WRITE) {
                debug!(page = pgno.get(), "skipping write-out");
                continue;
            }
            debug_assert!(
                !flags.contains(PageFlags::NEED_SYNC),
                "page written before its journal record was synced"
            );
            let mut content = self.pcache.with_data(pgno, <[u8]>::to_vec)?;
            if let Some(codec) = &self.codec {
                codec.encode(pgno, &mut content);
            }
            self.db_file
                .write(cx, &content, pgno.file_offset(self.page_size))
                .map_err(|_| QuarryError::IoWrite { page: pgno.get() })?;
            if pgno.get() > self.db_file_size {
                self.db_file_size = pgno.get();
            }
        }
        Ok(())
    }

    fn pager_truncate(&mut self, cx: &Cx, n_pages: u32) -> Result<()> {
        let size = u64::from(n_pages) * u64::from(self.page_size.get());
        self.db_file
            .truncate(cx, size)
            .map_err(|_| QuarryError::IoTruncate)?;
        self.db_file_size = n_pages;
        Ok(())
    }

    /// Shrink (or extend) the logical database image.
    pub fn truncate_image(&mut self, n_pages: u32) -> Result<()> {
        self.ensure_not_error()?;
        if !self.in_write_txn() {
            return Err(QuarryError::Misuse);
        }
        if n_pages < self.db_size {
            self.pcache.truncate(n_pages);
        }
        self.db_size = n_pages;
        Ok(())
    }

    // --- stress spill --------------------------------------------------

    /// Write back one dirty page under memory pressure.
    fn stress_spill(&mut self, cx: &Cx, pgno: PageNumber) -> Result<()> {
        if self
            .do_not_spill
            .intersects(SpillGuard::OFF | SpillGuard::ROLLBACK)
        {
            debug!(page = pgno.get(), "spill refused by guard");
            return Ok(());
        }
        let flags = self.pcache.flags(pgno)?;
        if self.do_not_spill.contains(SpillGuard::NOSYNC)
            && flags.contains(PageFlags::NEED_SYNC)
        {
            debug!(page = pgno.get(), "spill refused: sector group in progress");
            return Ok(());
        }

        if self.journal_mode == JournalMode::Wal {
            let mut content = self.pcache.with_data(pgno, <[u8]>::to_vec)?;
            if let Some(codec) = &self.codec {
                codec.encode(pgno, &mut content);
            }
            let wal = self
                .wal
                .as_mut()
                .ok_or_else(|| QuarryError::internal("spill in WAL mode without a log"))?;
            wal.append_frame(cx, pgno, &content, 0)?;
        } else {
            if flags.contains(PageFlags::NEED_SYNC) {
                self.sync_journal(cx)?;
            }
            if pgno.get() <= self.db_size && !flags.contains(PageFlags::DONT_WRITE) {
                if self.state == PagerState::WriterCacheMod {
                    // Journal OFF or synchronous OFF never set NEED_SYNC;
                    // the database write still promotes the state.
                    self.state = PagerState::WriterDbMod;
                }
                let mut content = self.pcache.with_data(pgno, <[u8]>::to_vec)?;
                if let Some(codec) = &self.codec {
                    codec.encode(pgno, &mut content);
                }
                self.db_file
                    .write(cx, &content, pgno.file_offset(self.page_size))
                    .map_err(|_| QuarryError::IoWrite { page: pgno.get() })?;
                if pgno.get() > self.db_file_size {
                    self.db_file_size = pgno.get();
                }
            } else {
                debug!(page = pgno.get(), "spill drops dead page");
            }
        }

        debug!(page = pgno.get(), "page spilled");
        self.pcache.make_clean(pgno)
    }

    // --- change counter ------------------------------------------------

    fn increment_change_counter(&mut self, cx: &Cx) -> Result<()> {
        let handle = self.fetch(cx, PageNumber::ONE)?;
        let mut page1 = self.pcache.with_data(PageNumber::ONE, <[u8]>::to_vec)?;

        let counter = u32::from_be_bytes(page1[24..28].try_into().expect("4-byte field"))
            .wrapping_add(1);
        page1[24..28].copy_from_slice(&counter.to_be_bytes());
        page1[92..96].copy_from_slice(&counter.to_be_bytes());
        page1[96..100].copy_from_slice(&limits::QUARRY_VERSION_NUMBER.to_be_bytes());

        let result = self.write(cx, &handle, &page1);
        self.release(cx, handle)?;
        result?;

        if self.locking_mode == LockingMode::Exclusive {
            self.change_count_done = true;
        }
        Ok(())
    }

    // --- commit --------------------------------------------------------

    /// Commit phase one: make the transaction durable up to journal
    /// finalisation. `master` optionally names a master journal
    /// coordinating a multi-file commit.
    pub fn commit_phase_one(&mut self, cx: &Cx, master: Option<&str>) -> Result<()> {
        self.ensure_not_error()?;
        match self.state {
            PagerState::Open | PagerState::Reader => return Err(QuarryError::Misuse),
            PagerState::WriterFinished => return Ok(()),
            _ => {}
        }
        if self.wal_committed {
            return Ok(());
        }
        let result = self.commit_phase_one_inner(cx, master);
        if let Err(e) = &result {
            self.enter_error_state(e);
        }
        result
    }

    #[allow(clippy::too_many_lines)]
    fn commit_phase_one_inner(&mut self, cx: &Cx, master: Option<&str>) -> Result<()> {
        let content_changed = self.pcache.dirty_count() > 0 || self.db_size != self.db_orig_size;
        if !content_changed {
            self.state = PagerState::WriterFinished;
            return Ok(());
        }

        if self.journal_mode == JournalMode::Wal {
            if self.db_size >= 1 && !self.change_count_done {
                self.increment_change_counter(cx)?;
            }
            let dirty = self.pcache.dirty_pages_sorted();
            let total = dirty.len();
            for (i, &pgno) in dirty.iter().enumerate() {
                let mut content = self.pcache.with_data(pgno, <[u8]>::to_vec)?;
                if let Some(codec) = &self.codec {
                    codec.encode(pgno, &mut content);
                }
                let marker = if i + 1 == total { self.db_size } else { 0 };
                let wal = self
                    .wal
                    .as_mut()
                    .ok_or_else(|| QuarryError::internal("WAL commit without a log"))?;
                wal.append_frame(cx, pgno, &content, marker)?;
            }
            if self.sync_mode != SynchronousMode::Off {
                if let Some(wal) = &mut self.wal {
                    wal.sync(cx).map_err(|_| QuarryError::IoFsync)?;
                }
            }
            self.pcache.clean_all();
            // WAL mode never advances past WRITER_CACHEMOD; the commit
            // marker on the last frame is the durability point.
            self.wal_committed = true;
            debug!(frames = total, "WAL commit phase one complete");
            return Ok(());
        }

        // Rollback-journal path. A transaction that only truncated still
        // needs the journal open for the change-counter write.
        if self.state == PagerState::WriterLocked {
            self.open_journal(cx)?;
            self.state = PagerState::WriterCacheMod;
        }
        if self.db_size >= 1 && !self.change_count_done {
            self.increment_change_counter(cx)?;
        }

        if let Some(name) = master {
            let record = journal::encode_master_record(name);
            if let Some(store) = self.journal.as_mut() {
                store.write(cx, &record, self.journal_off)?;
                self.journal_off += record.len() as u64;
            }
        }

        let dirty = self.pcache.dirty_pages_sorted();

        // A single-page change on a device with atomic page writes can
        // skip the journal sync: the lone page lands entirely or not at
        // all, and an unsynced journal replays to the original image.
        let atomic = dirty.len() == 1
            && master.is_none()
            && self.savepoints.is_empty()
            && self.journal_mode == JournalMode::Delete
            && self.db_size == self.db_file_size
            && self.device.supports_atomic_write(self.page_size.get());

        if atomic {
            debug!("atomic-write commit: journal sync skipped");
            self.pcache.clear_need_sync();
            if self.state == PagerState::WriterCacheMod {
                self.state = PagerState::WriterDbMod;
            }
        } else if self.journal_mode.uses_rollback_journal() {
            self.sync_journal(cx)?;
        } else if self.state == PagerState::WriterCacheMod {
            self.state = PagerState::WriterDbMod;
        }

        self.write_page_list(cx, &dirty)?;
        self.pcache.clean_all();

        if self.db_size < self.db_file_size {
            self.pager_truncate(cx, self.db_size)?;
        }
        if self.sync_mode != SynchronousMode::Off {
            let flags = self.db_sync_flags();
            self.db_file.sync(cx, flags).map_err(|_| QuarryError::IoFsync)?;
        }

        self.state = PagerState::WriterFinished;
        debug!(pages = dirty.len(), "commit phase one complete");
        Ok(())
    }

    /// Commit phase two: finalise the journal and return to `READER`.
    pub fn commit_phase_two(&mut self, cx: &Cx) -> Result<()> {
        self.ensure_not_error()?;
        if !self.in_write_txn() {
            return Err(QuarryError::Misuse);
        }
        let result = self.end_transaction(cx);
        if let Err(e) = &result {
            self.enter_error_state(e);
        }
        result
    }

    /// Commit in one step. A phase-one failure rolls the transaction
    /// back and returns the originating error.
    pub fn commit(&mut self, cx: &Cx) -> Result<()> {
        if let Err(e) = self.commit_phase_one(cx, None) {
            let _ = self.rollback(cx);
            return Err(e);
        }
        self.commit_phase_two(cx)
    }

    fn end_transaction(&mut self, cx: &Cx) -> Result<()> {
        let finalise = if self.journal.is_some() {
            self.finalize_journal(cx)
        } else {
            Ok(())
        };

        if self.journal_mode == JournalMode::Wal {
            if let Some(wal) = &mut self.wal {
                wal.discard_uncommitted();
                self.wal_snapshot = wal.snapshot();
            }
        }

        self.in_journal.clear_all();
        self.savepoints.clear();
        self.sub_journal.clear();
        self.n_rec = 0;
        self.journal_off = 0;
        self.journal_hdr_off = 0;
        self.header_sealed = false;
        self.wal_committed = false;
        self.pcache.clear_writable();
        self.db_orig_size = 0;

        finalise?;

        if self.locking_mode == LockingMode::Normal {
            let _ = self.unlock_db_to(cx, LockLevel::Shared);
            self.change_count_done = false;
        }
        self.state = PagerState::Reader;
        Ok(())
    }

    fn finalize_journal(&mut self, cx: &Cx) -> Result<()> {
        let keep_open = self.locking_mode == LockingMode::Exclusive;
        match self.journal_mode {
            JournalMode::Delete if !keep_open => {
                if let Some(mut store) = self.journal.take() {
                    let _ = store.close(cx);
                }
                self.vfs
                    .delete(
                        cx,
                        &self.journal_path,
                        self.sync_mode >= SynchronousMode::Extra,
                    )
                    .map_err(|_| QuarryError::IoDelete)?;
            }
            JournalMode::Delete | JournalMode::Truncate => {
                if let Some(store) = self.journal.as_mut() {
                    store.truncate(cx, 0).map_err(|_| QuarryError::IoTruncate)?;
                    if self.sync_mode != SynchronousMode::Off {
                        store
                            .sync(cx, SyncFlags::NORMAL)
                            .map_err(|_| QuarryError::IoFsync)?;
                    }
                }
                if !keep_open && self.journal_mode == JournalMode::Truncate {
                    if let Some(mut store) = self.journal.take() {
                        let _ = store.close(cx);
                    }
                }
            }
            JournalMode::Persist => {
                if let Some(store) = self.journal.as_mut() {
                    store.write(cx, &[0u8; journal::JOURNAL_HEADER_SIZE], 0)?;
                    if self.sync_mode != SynchronousMode::Off {
                        store
                            .sync(cx, SyncFlags::NORMAL)
                            .map_err(|_| QuarryError::IoFsync)?;
                    }
                }
                if !keep_open {
                    if let Some(mut store) = self.journal.take() {
                        let _ = store.close(cx);
                    }
                }
            }
            JournalMode::Memory => {
                if let Some(store) = self.journal.as_mut() {
                    store.truncate(cx, 0)?;
                }
                if !keep_open {
                    self.journal = None;
                }
            }
            JournalMode::Off | JournalMode::Wal => {
                self.journal = None;
            }
        }
        Ok(())
    }

    // --- rollback ------------------------------------------------------

    /// Abandon the write transaction, restoring the database to its
    /// state at transaction start.
    pub fn rollback(&mut self, cx: &Cx) -> Result<()> {
        match self.state {
            PagerState::Error => return Err(self.latched()),
            PagerState::Open | PagerState::Reader => return Ok(()),
            PagerState::WriterLocked => return self.end_transaction(cx),
            _ => {}
        }

        if self.journal_mode == JournalMode::Wal || !self.journal_mode.uses_rollback_journal() {
            // Nothing has reached the database file in WAL mode; with
            // the journal off, whatever did is unrecoverable and the
            // cache is simply discarded. A WAL transaction whose commit
            // frames are already on disk has nothing left to undo.
            if !self.wal_committed {
                self.pcache.drop_all_dirty();
                self.db_size = self.db_orig_size;
            }
            return self.end_transaction(cx);
        }

        self.do_not_spill.insert(SpillGuard::ROLLBACK);
        let played = self.playback_journal(cx);
        self.do_not_spill.remove(SpillGuard::ROLLBACK);

        match played {
            Ok(()) => {
                // Pages never journalled (allocated past the original
                // size) are simply dropped.
                self.pcache.drop_all_dirty();
                self.end_transaction(cx)
            }
            Err(e) => {
                self.enter_error_state(&e);
                Err(e)
            }
        }
    }

    /// Apply every valid journal record back to the database file and
    /// any cached copies, then truncate to the original size.
    fn playback_journal(&mut self, cx: &Cx) -> Result<()> {
        let Some(mut store) = self.journal.take() else {
            return Ok(());
        };

        let Self {
            db_file,
            pcache,
            codec,
            page_size,
            ..
        } = self;
        let ps = *page_size;

        let scanned = journal::for_each_record(cx, &mut store, |raw_pgno, content| {
            let pgno = PageNumber::new(raw_pgno).ok_or_else(|| QuarryError::Corrupt {
                detail: "journal record for page 0".to_owned(),
            })?;
            db_file
                .write(cx, content, pgno.file_offset(ps))
                .map_err(|_| QuarryError::IoWrite { page: raw_pgno })?;
            if pcache.contains(pgno) {
                let mut decoded = content.to_vec();
                if let Some(codec) = codec.as_ref() {
                    codec.decode(pgno, &mut decoded);
                }
                pcache.with_data_mut(pgno, |buf| buf.copy_from_slice(&decoded))?;
                pcache.make_clean(pgno)?;
            }
            Ok(())
        });
        self.journal = Some(store);
        let info = scanned?;

        if let Some(info) = info {
            debug!(
                records = info.records_applied,
                orig_pages = info.orig_page_count,
                "journal playback complete"
            );
            if self.db_file_size > info.orig_page_count {
                self.pager_truncate(cx, info.orig_page_count)?;
            }
            if !self.no_sync() {
                let flags = self.db_sync_flags();
                self.db_file.sync(cx, flags).map_err(|_| QuarryError::IoFsync)?;
            }
            self.db_size = info.orig_page_count;
            self.db_file_size = info.orig_page_count;
            self.pcache.truncate(info.orig_page_count);
        }
        Ok(())
    }

    // --- savepoints ----------------------------------------------------

    /// Open a nested-transaction marker; returns its index.
    pub fn open_savepoint(&mut self) -> Result<usize> {
        self.ensure_not_error()?;
        if !self.in_write_txn() {
            return Err(QuarryError::Misuse);
        }
        self.savepoints.push(PagerSavepoint {
            journal_off: self.journal_off,
            hdr_off: self.journal_hdr_off,
            orig_page_count: self.db_size,
            in_savepoint: Bitvec::new(),
            sub_rec_index: self.sub_journal.len(),
        });
        Ok(self.savepoints.len() - 1)
    }

    /// Number of open savepoints.
    #[must_use]
    pub fn savepoint_count(&self) -> usize {
        self.savepoints.len()
    }

    /// Release (commit into the parent) the savepoint at `index` and
    /// everything above it.
    pub fn release_savepoint(&mut self, index: usize) -> Result<()> {
        if index >= self.savepoints.len() {
            return Err(QuarryError::Misuse);
        }
        self.savepoints.truncate(index);
        Ok(())
    }

    /// Roll back to the savepoint at `index`: pages touched since revert
    /// to their images at savepoint creation; the savepoint stays open.
    pub fn rollback_to_savepoint(&mut self, cx: &Cx, index: usize) -> Result<()> {
        self.ensure_not_error()?;
        if index >= self.savepoints.len() {
            return Err(QuarryError::Misuse);
        }

        self.do_not_spill.insert(SpillGuard::ROLLBACK);
        let result = self.rollback_to_savepoint_inner(cx, index);
        self.do_not_spill.remove(SpillGuard::ROLLBACK);
        if let Err(e) = &result {
            self.enter_error_state(e);
        }
        result
    }

    fn rollback_to_savepoint_inner(&mut self, cx: &Cx, index: usize) -> Result<()> {
        let start = self.savepoints[index].sub_rec_index;
        let orig = self.savepoints[index].orig_page_count;

        // Newest first, so a page touched repeatedly ends at its oldest
        // (savepoint-time) image.
        for i in (start..self.sub_journal.len()).rev() {
            let (pgno, content) = {
                let rec = &self.sub_journal[i];
                (rec.pgno, rec.content.clone())
            };
            if pgno.get() > orig {
                continue; // dropped below by the image truncation
            }
            let handle = self.fetch(cx, pgno)?;
            self.pcache
                .with_data_mut(pgno, |buf| buf.copy_from_slice(&content))?;
            self.pcache.make_dirty(pgno)?;
            self.release(cx, handle)?;
        }

        self.sub_journal.truncate(start);
        if orig < self.db_size {
            self.pcache.truncate(orig);
        }
        self.db_size = orig;

        // Records for this savepoint were consumed; later writes must
        // capture fresh images.
        self.savepoints.truncate(index + 1);
        let sp = &mut self.savepoints[index];
        sp.in_savepoint = Bitvec::new();
        Ok(())
    }

    // --- WAL -----------------------------------------------------------

    fn ensure_wal(&mut self, cx: &Cx) -> Result<()> {
        if self.wal.is_some() {
            return Ok(());
        }
        let flags = VfsOpenFlags::WAL | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE;
        let (file, _) = self.vfs.open(cx, Some(&self.wal_path), flags)?;
        let size = file.file_size(cx)?;

        let wal = if size >= quarry_wal::WAL_HEADER_SIZE as u64 {
            Wal::open(cx, file)?
        } else {
            let mut salt = [0u8; 8];
            self.vfs.randomness(cx, &mut salt);
            let salts = WalSalts {
                salt1: u32::from_be_bytes(salt[..4].try_into().expect("4-byte salt")),
                salt2: u32::from_be_bytes(salt[4..].try_into().expect("4-byte salt")),
            };
            Wal::create(cx, file, self.page_size.get(), 0, salts)?
        };
        self.wal_snapshot = wal.snapshot();
        self.wal = Some(wal);
        Ok(())
    }

    /// Transfer committed WAL frames into the database file.
    pub fn checkpoint(&mut self, cx: &Cx, mode: CheckpointMode) -> Result<CheckpointStats> {
        self.ensure_not_error()?;
        if self.journal_mode != JournalMode::Wal {
            return Err(QuarryError::Misuse);
        }
        if self.in_write_txn() {
            return Err(QuarryError::Busy);
        }
        if self.state == PagerState::Open {
            self.shared_lock(cx)?;
        }
        self.ensure_wal(cx)?;

        let mut salt = [0u8; 4];
        self.vfs.randomness(cx, &mut salt);
        let old_salts = self.wal.as_ref().expect("wal ensured").salts();
        let new_salts = WalSalts {
            salt1: old_salts.salt1.wrapping_add(1),
            salt2: u32::from_be_bytes(salt),
        };

        let Self {
            wal,
            db_file,
            db_file_size,
            page_size,
            ..
        } = self;
        let wal = wal.as_mut().expect("wal ensured");
        let mut writer = DbWriter {
            file: db_file,
            page_size: page_size.as_usize(),
            file_pages: db_file_size,
        };

        let result = wal.checkpoint(cx, mode, &mut writer, new_salts);
        match result {
            Ok(stats) => {
                self.wal_snapshot = wal.snapshot();
                Ok(stats)
            }
            Err(e) => {
                self.enter_error_state(&e);
                Err(e)
            }
        }
    }

    // --- shutdown ------------------------------------------------------

    /// Close the pager, rolling back any open write transaction.
    pub fn close(mut self, cx: &Cx) -> Result<()> {
        if self.in_write_txn() {
            let _ = self.rollback(cx);
        }
        debug_assert_eq!(self.pcache.ref_count_sum(), 0, "close with live references");
        self.pcache.clear();
        if let Some(mut store) = self.journal.take() {
            let _ = store.close(cx);
        }
        if let Some(wal) = self.wal.take() {
            let mut file = wal.into_file();
            let _ = file.close(cx);
        }
        let _ = self.unlock_db_to(cx, LockLevel::None);
        let _ = self.db_file.close(cx);
        Ok(())
    }
}

/// Debug-only content hash (polynomial, factor 1039). The exact values
/// are not a contract; it exists to catch unintended page mutation in
/// assertions and tests.
#[cfg(any(test, debug_assertions))]
#[must_use]
pub fn page_content_hash(data: &[u8]) -> u32 {
    let mut hash = 0u32;
    for &byte in data {
        hash = hash.wrapping_mul(1039).wrapping_add(u32::from(byte));
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_vfs::MemoryVfs;

    fn pn(n: u32) -> PageNumber {
        PageNumber::new(n).unwrap()
    }

    fn open_pager(vfs: MemoryVfs, name: &str) -> Pager<MemoryVfs> {
        Pager::open(vfs, Path::new(name), PagerOptions::default()).unwrap()
    }

    fn page_of(byte: u8) -> Vec<u8> {
        vec![byte; PageSize::DEFAULT.as_usize()]
    }

    #[test]
    fn open_starts_in_open_state() {
        let pager = open_pager(MemoryVfs::new(), "a.db");
        assert_eq!(pager.state(), PagerState::Open);
        assert_eq!(pager.db_size(), 0);
    }

    #[test]
    fn shared_lock_reads_empty_database() {
        let cx = Cx::new();
        let mut pager = open_pager(MemoryVfs::new(), "a.db");
        pager.shared_lock(&cx).unwrap();
        assert_eq!(pager.state(), PagerState::Reader);
        assert_eq!(pager.db_size(), 0);
    }

    #[test]
    fn fetch_beyond_eof_reads_zeroes() {
        let cx = Cx::new();
        let mut pager = open_pager(MemoryVfs::new(), "a.db");
        let h = pager.fetch(&cx, pn(1)).unwrap();
        let data = pager.page_data(&h).unwrap();
        assert!(data.as_bytes().iter().all(|&b| b == 0));
        pager.release(&cx, h).unwrap();
        assert_eq!(pager.ref_count_sum(), 0);
        // Last reference released outside a write txn: back to OPEN.
        assert_eq!(pager.state(), PagerState::Open);
    }

    #[test]
    fn write_requires_write_transaction() {
        let cx = Cx::new();
        let mut pager = open_pager(MemoryVfs::new(), "a.db");
        let h = pager.fetch(&cx, pn(1)).unwrap();
        let err = pager.write(&cx, &h, &page_of(0xAA)).unwrap_err();
        assert!(matches!(err, QuarryError::Misuse));
        pager.release(&cx, h).unwrap();
    }

    #[test]
    fn state_walk_through_commit() {
        let cx = Cx::new();
        let mut pager = open_pager(MemoryVfs::new(), "a.db");

        pager.shared_lock(&cx).unwrap();
        pager.begin_write(&cx, false).unwrap();
        assert_eq!(pager.state(), PagerState::WriterLocked);

        let h = pager.fetch(&cx, pn(1)).unwrap();
        pager.write(&cx, &h, &page_of(0x11)).unwrap();
        assert_eq!(pager.state(), PagerState::WriterCacheMod);
        pager.release(&cx, h).unwrap();

        pager.commit_phase_one(&cx, None).unwrap();
        assert_eq!(pager.state(), PagerState::WriterFinished);
        pager.commit_phase_two(&cx).unwrap();
        assert_eq!(pager.state(), PagerState::Reader);
        assert_eq!(pager.db_size(), 1);
    }

    #[test]
    fn journal_file_removed_after_commit() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = open_pager(vfs.clone(), "a.db");

        pager.begin_write(&cx, false).unwrap();
        let h = pager.fetch(&cx, pn(1)).unwrap();
        pager.write(&cx, &h, &page_of(0x22)).unwrap();
        pager.release(&cx, h).unwrap();

        // The journal exists while the transaction is active.
        assert!(vfs
            .access(&cx, Path::new("a.db-journal"), AccessFlags::EXISTS)
            .unwrap());

        pager.commit(&cx).unwrap();
        assert!(!vfs
            .access(&cx, Path::new("a.db-journal"), AccessFlags::EXISTS)
            .unwrap());
    }

    #[test]
    fn rollback_restores_previous_content() {
        let cx = Cx::new();
        let mut pager = open_pager(MemoryVfs::new(), "a.db");

        pager.begin_write(&cx, false).unwrap();
        let h = pager.fetch(&cx, pn(1)).unwrap();
        pager.write(&cx, &h, &page_of(0x33)).unwrap();
        pager.release(&cx, h).unwrap();
        pager.commit(&cx).unwrap();

        pager.begin_write(&cx, false).unwrap();
        let h = pager.fetch(&cx, pn(1)).unwrap();
        pager.write(&cx, &h, &page_of(0x44)).unwrap();
        pager.release(&cx, h).unwrap();
        pager.rollback(&cx).unwrap();
        assert_eq!(pager.state(), PagerState::Reader);

        let data = pager.read_page(&cx, pn(1)).unwrap();
        assert_eq!(data.as_bytes()[200], 0x33, "rollback must restore");
        pager.check_cache_integrity();
    }

    #[test]
    fn change_counter_advances_on_commit() {
        let cx = Cx::new();
        let mut pager = open_pager(MemoryVfs::new(), "a.db");

        for round in 1..=3u32 {
            pager.begin_write(&cx, false).unwrap();
            let h = pager.fetch(&cx, pn(1)).unwrap();
            // Read-modify-write, preserving the header region the pager
            // maintains.
            let mut content = pager.page_data(&h).unwrap().into_vec();
            content[500] = u8::try_from(round).unwrap();
            pager.write(&cx, &h, &content).unwrap();
            pager.release(&cx, h).unwrap();
            pager.commit(&cx).unwrap();

            let page1 = pager.read_page(&cx, pn(1)).unwrap();
            let counter =
                u32::from_be_bytes(page1.as_bytes()[24..28].try_into().unwrap());
            assert_eq!(counter, round, "counter must advance once per commit");
        }
    }

    #[test]
    fn truncate_image_discards_cache_beyond() {
        let cx = Cx::new();
        let mut pager = open_pager(MemoryVfs::new(), "a.db");

        pager.begin_write(&cx, false).unwrap();
        for n in 1..=4u32 {
            let h = pager.fetch(&cx, pn(n)).unwrap();
            pager.write(&cx, &h, &page_of(0x40 + u8::try_from(n).unwrap())).unwrap();
            pager.release(&cx, h).unwrap();
        }
        pager.truncate_image(2).unwrap();
        assert_eq!(pager.db_size(), 2);
        pager.commit(&cx).unwrap();

        assert_eq!(pager.db_size(), 2);
        let data = pager.read_page(&cx, pn(2)).unwrap();
        assert_eq!(data.as_bytes()[10], 0x42);
    }

    #[test]
    fn memory_journal_mode_rolls_back() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = Pager::open(
            vfs.clone(),
            Path::new("m.db"),
            PagerOptions {
                journal_mode: JournalMode::Memory,
                ..PagerOptions::default()
            },
        )
        .unwrap();

        pager.begin_write(&cx, false).unwrap();
        let h = pager.fetch(&cx, pn(1)).unwrap();
        pager.write(&cx, &h, &page_of(0x55)).unwrap();
        pager.release(&cx, h).unwrap();
        pager.commit(&cx).unwrap();
        // No journal file on disk in MEMORY mode.
        assert!(!vfs
            .access(&cx, Path::new("m.db-journal"), AccessFlags::EXISTS)
            .unwrap());

        pager.begin_write(&cx, false).unwrap();
        let h = pager.fetch(&cx, pn(1)).unwrap();
        pager.write(&cx, &h, &page_of(0x66)).unwrap();
        pager.release(&cx, h).unwrap();
        pager.rollback(&cx).unwrap();

        let data = pager.read_page(&cx, pn(1)).unwrap();
        assert_eq!(data.as_bytes()[0], 0x55);
    }

    #[test]
    fn busy_handler_retries_lock() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();

        // Another connection holds RESERVED.
        let flags = VfsOpenFlags::MAIN_DB | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE;
        let (mut rival, _) = vfs.open(&cx, Some(Path::new("b.db")), flags).unwrap();
        rival.lock(&cx, LockLevel::Shared).unwrap();
        rival.lock(&cx, LockLevel::Reserved).unwrap();

        let mut pager = open_pager(vfs.clone(), "b.db");
        pager.shared_lock(&cx).unwrap();

        // Without a handler: immediate BUSY.
        let err = pager.begin_write(&cx, false).unwrap_err();
        assert!(matches!(err, QuarryError::Busy));

        // With a handler that releases the rival on the second try.
        let released = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = std::sync::Arc::clone(&released);
        pager.set_busy_handler(Some(Box::new(move |count| {
            if count >= 1 {
                flag.store(true, std::sync::atomic::Ordering::Release);
            }
            count < 3
        })));

        // The rival releases its lock out of band; the retry loop must
        // observe it. Emulate by dropping the rival's lock now.
        rival.unlock(&cx, LockLevel::None).unwrap();
        pager.begin_write(&cx, false).unwrap();
        assert_eq!(pager.state(), PagerState::WriterLocked);
    }

    #[test]
    fn error_state_latches_until_last_release() {
        let cx = Cx::new();
        let vfs = quarry_vfs::SimVfs::new();
        let mut pager = Pager::open(vfs.clone(), Path::new("e.db"), PagerOptions::default())
            .unwrap();

        pager.begin_write(&cx, false).unwrap();
        let h = pager.fetch(&cx, pn(1)).unwrap();
        pager.write(&cx, &h, &page_of(0x70)).unwrap();

        // Fail the journal fsync during phase one.
        vfs.schedule_sync_failure("e.db-journal");
        let err = pager.commit_phase_one(&cx, None).unwrap_err();
        assert!(matches!(err, QuarryError::IoFsync));
        assert_eq!(pager.state(), PagerState::Error);

        // Every operation now reports the latched code.
        let err = pager.read_page(&cx, pn(1)).unwrap_err();
        assert!(matches!(
            err,
            QuarryError::ErrorState {
                code: ErrorCode::IoErrFsync
            }
        ));

        // Dropping the last reference resets to OPEN.
        pager.release(&cx, h).unwrap();
        assert_eq!(pager.state(), PagerState::Open);

        // The pager recovers on next use (hot journal replay).
        let data = pager.read_page(&cx, pn(1)).unwrap();
        assert!(data.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn exclusive_locking_mode_retains_lock() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = Pager::open(
            vfs.clone(),
            Path::new("x.db"),
            PagerOptions {
                locking_mode: LockingMode::Exclusive,
                ..PagerOptions::default()
            },
        )
        .unwrap();

        pager.begin_write(&cx, false).unwrap();
        let h = pager.fetch(&cx, pn(1)).unwrap();
        pager.write(&cx, &h, &page_of(0x77)).unwrap();
        pager.release(&cx, h).unwrap();
        pager.commit(&cx).unwrap();

        // A second connection cannot even read.
        let flags = VfsOpenFlags::MAIN_DB | VfsOpenFlags::READWRITE;
        let (mut rival, _) = vfs.open(&cx, Some(Path::new("x.db")), flags).unwrap();
        assert!(matches!(
            rival.lock(&cx, LockLevel::Shared),
            Err(QuarryError::Busy)
        ));

        // Second commit must not advance the change counter again
        // (change_count_done suppression).
        let before = pager.read_page(&cx, pn(1)).unwrap();
        let counter_before =
            u32::from_be_bytes(before.as_bytes()[24..28].try_into().unwrap());
        pager.begin_write(&cx, false).unwrap();
        let h = pager.fetch(&cx, pn(1)).unwrap();
        let mut content = before.as_bytes().to_vec();
        content[600] = 0x78;
        pager.write(&cx, &h, &content).unwrap();
        pager.release(&cx, h).unwrap();
        pager.commit(&cx).unwrap();
        let after = pager.read_page(&cx, pn(1)).unwrap();
        let counter_after =
            u32::from_be_bytes(after.as_bytes()[24..28].try_into().unwrap());
        assert_eq!(counter_before, counter_after);
    }

    #[test]
    fn content_hash_is_order_sensitive() {
        assert_ne!(page_content_hash(b"ab"), page_content_hash(b"ba"));
        assert_eq!(page_content_hash(b""), 0);
    }
}
