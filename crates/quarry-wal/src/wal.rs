//! The write-ahead log file.
//!
//! [`Wal`] appends modified pages as frames, serves page reads for
//! snapshot readers, and transfers committed frames back into the main
//! database file during checkpoint. Frames become visible to readers only
//! once a commit frame (nonzero database size) seals them; a torn tail,
//! salt mismatch, or checksum break terminates the valid chain at the
//! last commit.

use std::collections::HashMap;

use quarry_error::{QuarryError, Result};
use quarry_types::flags::SyncFlags;
use quarry_types::{CheckpointMode, Cx, PageNumber};
use quarry_vfs::VfsFile;
use tracing::{debug, error};

use crate::checksum::{
    WAL_FRAME_HEADER_SIZE, WAL_FORMAT_VERSION, WAL_HEADER_SIZE, WAL_MAGIC_LE, WalChecksum,
    WalFrameHeader, WalHeader, WalSalts, frame_checksum, header_computed_checksum,
    header_stored_checksum, seal_frame,
};

/// Destination for pages leaving the log during a checkpoint.
///
/// Implemented by the pager over its database file handle; defined here
/// so the log does not depend on the pager.
pub trait CheckpointWriter {
    /// Write one page image into the database file.
    fn write_page(&mut self, cx: &Cx, pgno: PageNumber, data: &[u8]) -> Result<()>;

    /// Shrink the database file to `n_pages` if it is larger.
    fn truncate(&mut self, cx: &Cx, n_pages: u32) -> Result<()>;

    /// Make the transferred pages durable.
    fn sync(&mut self, cx: &Cx) -> Result<()>;
}

/// Outcome of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    /// Committed frames present in the log.
    pub frames_in_log: usize,
    /// Distinct pages transferred into the database file.
    pub pages_transferred: usize,
    /// Whether the log was rewound afterwards.
    pub log_reset: bool,
}

/// A snapshot of the log taken at read-transaction start.
///
/// Frames appended after the snapshot are invisible to the holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalSnapshot {
    max_frame: u32,
}

impl WalSnapshot {
    /// A snapshot seeing nothing (empty log).
    #[must_use]
    pub const fn empty() -> Self {
        Self { max_frame: 0 }
    }

    /// Number of frames visible to this snapshot.
    #[must_use]
    pub const fn max_frame(self) -> u32 {
        self.max_frame
    }
}

/// A VFS-backed write-ahead log.
#[derive(Debug)]
pub struct Wal<F: VfsFile> {
    file: F,
    page_size: usize,
    big_endian: bool,
    header: WalHeader,
    /// Running checksum after the last appended (possibly uncommitted) frame.
    running: WalChecksum,
    /// Frames appended and chain-valid, committed or not.
    n_appended: u32,
    /// Frames sealed by the last commit frame.
    max_committed: u32,
    /// Running checksum as of `max_committed`.
    committed_checksum: WalChecksum,
    /// Database size in pages after the last commit (0 before any commit).
    db_size: u32,
    /// Committed frame indices (1-based, ascending) per page.
    page_index: HashMap<u32, Vec<u32>>,
    /// Frames appended since the last commit frame.
    pending: Vec<(u32, u32)>,
    /// The header must be rewritten before the next append (after a
    /// truncating reset).
    needs_header_write: bool,
}

impl<F: VfsFile> Wal<F> {
    /// Bytes per frame.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        WAL_FRAME_HEADER_SIZE + self.page_size
    }

    fn frame_offset(&self, index_1based: u32) -> u64 {
        WAL_HEADER_SIZE as u64 + u64::from(index_1based - 1) * self.frame_size() as u64
    }

    /// Committed frame count.
    #[must_use]
    pub fn max_committed(&self) -> u32 {
        self.max_committed
    }

    /// Database size in pages after the last commit, or 0.
    #[must_use]
    pub fn db_size(&self) -> u32 {
        self.db_size
    }

    /// The current salt pair.
    #[must_use]
    pub fn salts(&self) -> WalSalts {
        self.header.salts
    }

    /// Take a snapshot for a read transaction.
    #[must_use]
    pub fn snapshot(&self) -> WalSnapshot {
        WalSnapshot {
            max_frame: self.max_committed,
        }
    }

    /// Create a fresh log, writing the 32-byte header.
    pub fn create(cx: &Cx, mut file: F, page_size: u32, checkpoint_seq: u32, salts: WalSalts) -> Result<Self> {
        let header = WalHeader {
            magic: WAL_MAGIC_LE,
            format_version: WAL_FORMAT_VERSION,
            page_size,
            checkpoint_seq,
            salts,
            checksum: WalChecksum::default(),
        };
        let header_bytes = header.to_bytes()?;
        file.write(cx, &header_bytes, 0)?;
        file.truncate(cx, WAL_HEADER_SIZE as u64)?;
        let running = header_stored_checksum(&header_bytes)?;

        debug!(page_size, checkpoint_seq, "WAL created");

        Ok(Self {
            file,
            page_size: usize::try_from(page_size).expect("page size fits usize"),
            big_endian: false,
            header,
            running,
            n_appended: 0,
            max_committed: 0,
            committed_checksum: running,
            db_size: 0,
            page_index: HashMap::new(),
            pending: Vec::new(),
            needs_header_write: false,
        })
    }

    /// Open an existing log, scanning frames to find the valid committed
    /// prefix.
    pub fn open(cx: &Cx, mut file: F) -> Result<Self> {
        let mut header_buf = [0u8; WAL_HEADER_SIZE];
        let n = file.read(cx, &mut header_buf, 0)?;
        if n < WAL_HEADER_SIZE {
            return Err(QuarryError::WalCorrupt {
                detail: format!("WAL too small for header: {n} bytes"),
            });
        }
        let header = WalHeader::from_bytes(&header_buf)?;
        let big_endian = header.big_endian_checksum();
        if header_stored_checksum(&header_buf)? != header_computed_checksum(&header_buf, big_endian)?
        {
            error!("WAL header checksum mismatch");
            return Err(QuarryError::WalCorrupt {
                detail: "WAL header checksum mismatch".to_owned(),
            });
        }

        let page_size = usize::try_from(header.page_size).expect("page size fits usize");
        let frame_size = WAL_FRAME_HEADER_SIZE + page_size;
        let file_size = file.file_size(cx)?;
        let max_frames = u32::try_from(
            file_size.saturating_sub(WAL_HEADER_SIZE as u64) / frame_size as u64,
        )
        .unwrap_or(u32::MAX);

        let seed = header_stored_checksum(&header_buf)?;
        let mut running = seed;
        let mut n_valid = 0u32;
        let mut max_committed = 0u32;
        let mut committed_checksum = seed;
        let mut db_size = 0u32;
        let mut chain: Vec<(u32, u32)> = Vec::new();
        let mut page_index: HashMap<u32, Vec<u32>> = HashMap::new();
        let mut frame_buf = vec![0u8; frame_size];

        for idx in 1..=max_frames {
            if cx.is_cancelled() {
                return Err(QuarryError::Interrupted);
            }
            let offset = WAL_HEADER_SIZE as u64 + u64::from(idx - 1) * frame_size as u64;
            let n = file.read(cx, &mut frame_buf, offset)?;
            if n < frame_size {
                debug!(frame = idx, "torn frame terminates WAL scan");
                break;
            }
            let frame_header = WalFrameHeader::from_bytes(&frame_buf)?;
            if frame_header.salts != header.salts {
                debug!(frame = idx, "salt mismatch terminates WAL scan");
                break;
            }
            let expected = frame_checksum(&frame_buf, page_size, running, big_endian)?;
            if frame_header.checksum != expected {
                debug!(frame = idx, "checksum mismatch terminates WAL scan");
                break;
            }

            running = expected;
            n_valid = idx;
            chain.push((frame_header.page_number, idx));

            if frame_header.is_commit() {
                max_committed = n_valid;
                committed_checksum = running;
                db_size = frame_header.db_size;
                for (pgno, frame_idx) in chain.drain(..) {
                    page_index.entry(pgno).or_default().push(frame_idx);
                }
            }
        }

        debug!(
            frames = max_committed,
            db_size, "WAL opened with committed prefix"
        );

        Ok(Self {
            file,
            page_size,
            big_endian,
            header,
            running: committed_checksum,
            n_appended: max_committed,
            max_committed,
            committed_checksum,
            db_size,
            page_index,
            pending: Vec::new(),
            needs_header_write: false,
        })
    }

    /// Append a frame. `db_size_if_commit` is the database size in pages
    /// for a commit frame, or 0.
    pub fn append_frame(
        &mut self,
        cx: &Cx,
        pgno: PageNumber,
        page_data: &[u8],
        db_size_if_commit: u32,
    ) -> Result<()> {
        if page_data.len() != self.page_size {
            return Err(QuarryError::WalCorrupt {
                detail: format!(
                    "frame content size mismatch: expected {}, got {}",
                    self.page_size,
                    page_data.len()
                ),
            });
        }

        if self.needs_header_write {
            let header_bytes = self.header.to_bytes()?;
            self.file.write(cx, &header_bytes, 0)?;
            self.running = header_stored_checksum(&header_bytes)?;
            self.committed_checksum = self.running;
            self.needs_header_write = false;
        }

        let frame_size = self.frame_size();
        let mut frame = vec![0u8; frame_size];
        frame[..4].copy_from_slice(&pgno.get().to_be_bytes());
        frame[4..8].copy_from_slice(&db_size_if_commit.to_be_bytes());
        frame[WAL_FRAME_HEADER_SIZE..].copy_from_slice(page_data);

        let new_checksum = seal_frame(
            &mut frame,
            self.page_size,
            self.header.salts,
            self.running,
            self.big_endian,
        )?;

        let idx = self.n_appended + 1;
        self.file.write(cx, &frame, self.frame_offset(idx))?;
        self.running = new_checksum;
        self.n_appended = idx;
        self.pending.push((pgno.get(), idx));

        if db_size_if_commit > 0 {
            self.max_committed = idx;
            self.committed_checksum = new_checksum;
            self.db_size = db_size_if_commit;
            for (pgno, frame_idx) in self.pending.drain(..) {
                self.page_index.entry(pgno).or_default().push(frame_idx);
            }
        }

        debug!(
            frame = idx,
            page = pgno.get(),
            is_commit = db_size_if_commit > 0,
            "WAL frame appended"
        );
        Ok(())
    }

    /// Drop frames appended since the last commit (writer rollback).
    pub fn discard_uncommitted(&mut self) {
        self.n_appended = self.max_committed;
        self.running = self.committed_checksum;
        self.pending.clear();
    }

    /// Read the newest committed image of `pgno` visible to `snapshot`,
    /// if the log has one.
    pub fn read_page(
        &mut self,
        cx: &Cx,
        pgno: PageNumber,
        snapshot: WalSnapshot,
    ) -> Result<Option<Vec<u8>>> {
        let Some(frames) = self.page_index.get(&pgno.get()) else {
            return Ok(None);
        };
        let Some(&frame_idx) = frames.iter().rev().find(|&&idx| idx <= snapshot.max_frame) else {
            return Ok(None);
        };
        self.read_frame_content(cx, frame_idx).map(Some)
    }

    /// Read the newest image of `pgno` including frames the writer has
    /// appended but not yet committed. For the writer's own reads during
    /// a transaction that has spilled pages into the log.
    pub fn read_page_latest(&mut self, cx: &Cx, pgno: PageNumber) -> Result<Option<Vec<u8>>> {
        let pending = self
            .pending
            .iter()
            .rev()
            .find(|&&(p, _)| p == pgno.get())
            .map(|&(_, idx)| idx);
        if let Some(frame_idx) = pending {
            return self.read_frame_content(cx, frame_idx).map(Some);
        }
        let snapshot = WalSnapshot {
            max_frame: self.max_committed,
        };
        self.read_page(cx, pgno, snapshot)
    }

    fn read_frame_content(&mut self, cx: &Cx, frame_idx: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.frame_size()];
        let offset = self.frame_offset(frame_idx);
        let n = self.file.read(cx, &mut buf, offset)?;
        if n < buf.len() {
            return Err(QuarryError::WalCorrupt {
                detail: format!("short read at frame {frame_idx}"),
            });
        }
        Ok(buf.split_off(WAL_FRAME_HEADER_SIZE))
    }

    /// Sync the log file.
    pub fn sync(&mut self, cx: &Cx) -> Result<()> {
        self.file.sync(cx, SyncFlags::NORMAL)
    }

    /// Transfer every committed frame into the database file.
    ///
    /// For [`CheckpointMode::Restart`] the log is rewound with `new_salts`
    /// afterwards; for [`CheckpointMode::Truncate`] it is also truncated
    /// to zero bytes. `Passive` and `Full` transfer without rewinding.
    pub fn checkpoint<W: CheckpointWriter>(
        &mut self,
        cx: &Cx,
        mode: CheckpointMode,
        writer: &mut W,
        new_salts: WalSalts,
    ) -> Result<CheckpointStats> {
        let frames_in_log = self.max_committed as usize;
        let mut pages_transferred = 0usize;

        // Newest committed frame per page; earlier images are dead.
        let mut newest: Vec<(u32, u32)> = self
            .page_index
            .iter()
            .filter_map(|(&pgno, frames)| {
                frames
                    .iter()
                    .rev()
                    .find(|&&idx| idx <= self.max_committed)
                    .map(|&idx| (pgno, idx))
            })
            .collect();
        newest.sort_by_key(|&(pgno, _)| pgno);

        let mut frame_buf = vec![0u8; self.frame_size()];
        for (pgno, frame_idx) in newest {
            if cx.is_cancelled() {
                return Err(QuarryError::Interrupted);
            }
            let offset = self.frame_offset(frame_idx);
            let n = self.file.read(cx, &mut frame_buf, offset)?;
            if n < frame_buf.len() {
                return Err(QuarryError::WalCorrupt {
                    detail: format!("short read at frame {frame_idx} during checkpoint"),
                });
            }
            let page = PageNumber::new(pgno).ok_or_else(|| QuarryError::WalCorrupt {
                detail: "frame for page 0".to_owned(),
            })?;
            writer.write_page(cx, page, &frame_buf[WAL_FRAME_HEADER_SIZE..])?;
            pages_transferred += 1;
        }

        if self.db_size > 0 {
            writer.truncate(cx, self.db_size)?;
        }
        writer.sync(cx)?;

        let log_reset = matches!(mode, CheckpointMode::Restart | CheckpointMode::Truncate);
        if log_reset {
            self.reset(cx, new_salts)?;
            if mode == CheckpointMode::Truncate {
                self.file.truncate(cx, 0)?;
                self.needs_header_write = true;
            }
        }

        debug!(
            frames_in_log,
            pages_transferred, log_reset, "checkpoint complete"
        );
        Ok(CheckpointStats {
            frames_in_log,
            pages_transferred,
            log_reset,
        })
    }

    /// Rewind the log: bump the checkpoint sequence, install new salts,
    /// and truncate to the bare header.
    pub fn reset(&mut self, cx: &Cx, new_salts: WalSalts) -> Result<()> {
        self.header.checkpoint_seq = self.header.checkpoint_seq.wrapping_add(1);
        self.header.salts = new_salts;
        let header_bytes = self.header.to_bytes()?;
        self.file.write(cx, &header_bytes, 0)?;
        self.file.truncate(cx, WAL_HEADER_SIZE as u64)?;
        self.file.sync(cx, SyncFlags::NORMAL)?;

        self.running = header_stored_checksum(&header_bytes)?;
        self.committed_checksum = self.running;
        self.n_appended = 0;
        self.max_committed = 0;
        self.db_size = 0;
        self.page_index.clear();
        self.pending.clear();
        self.needs_header_write = false;
        Ok(())
    }

    /// Consume the log, returning the underlying file handle.
    pub fn into_file(self) -> F {
        self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_types::flags::VfsOpenFlags;
    use quarry_vfs::{MemoryVfs, Vfs};
    use std::path::Path;

    const PS: u32 = 512;

    fn open_wal_file(vfs: &MemoryVfs, cx: &Cx) -> quarry_vfs::MemoryFile {
        let flags = VfsOpenFlags::WAL | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE;
        vfs.open(cx, Some(Path::new("test.db-wal")), flags).unwrap().0
    }

    fn pn(n: u32) -> PageNumber {
        PageNumber::new(n).unwrap()
    }

    fn page(byte: u8) -> Vec<u8> {
        vec![byte; PS as usize]
    }

    fn fresh_wal(vfs: &MemoryVfs, cx: &Cx) -> Wal<quarry_vfs::MemoryFile> {
        let file = open_wal_file(vfs, cx);
        Wal::create(
            cx,
            file,
            PS,
            0,
            WalSalts {
                salt1: 0xAA,
                salt2: 0xBB,
            },
        )
        .unwrap()
    }

    #[test]
    fn empty_wal_round_trip() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let wal = fresh_wal(&vfs, &cx);
        assert_eq!(wal.max_committed(), 0);
        drop(wal);

        let file = open_wal_file(&vfs, &cx);
        let reopened = Wal::open(&cx, file).unwrap();
        assert_eq!(reopened.max_committed(), 0);
        assert_eq!(reopened.db_size(), 0);
    }

    #[test]
    fn committed_frames_become_visible() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut wal = fresh_wal(&vfs, &cx);

        wal.append_frame(&cx, pn(1), &page(0x01), 0).unwrap();
        wal.append_frame(&cx, pn(2), &page(0x02), 2).unwrap();
        assert_eq!(wal.max_committed(), 2);
        assert_eq!(wal.db_size(), 2);

        let snap = wal.snapshot();
        assert_eq!(
            wal.read_page(&cx, pn(1), snap).unwrap().unwrap(),
            page(0x01)
        );
        assert_eq!(
            wal.read_page(&cx, pn(2), snap).unwrap().unwrap(),
            page(0x02)
        );
        assert!(wal.read_page(&cx, pn(3), snap).unwrap().is_none());
    }

    #[test]
    fn uncommitted_frames_invisible_to_snapshot() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut wal = fresh_wal(&vfs, &cx);

        wal.append_frame(&cx, pn(1), &page(0x01), 1).unwrap();
        let snap = wal.snapshot();

        wal.append_frame(&cx, pn(1), &page(0xEE), 0).unwrap();
        // The pending frame is not indexed and the old snapshot still
        // sees the committed image.
        assert_eq!(
            wal.read_page(&cx, pn(1), snap).unwrap().unwrap(),
            page(0x01)
        );

        wal.append_frame(&cx, pn(1), &page(0xFF), 1).unwrap();
        assert_eq!(
            wal.read_page(&cx, pn(1), snap).unwrap().unwrap(),
            page(0x01),
            "old snapshot keeps seeing its own version"
        );
        let newer = wal.snapshot();
        assert_eq!(
            wal.read_page(&cx, pn(1), newer).unwrap().unwrap(),
            page(0xFF)
        );
    }

    #[test]
    fn reopen_stops_at_last_commit() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut wal = fresh_wal(&vfs, &cx);

        wal.append_frame(&cx, pn(1), &page(0x01), 1).unwrap();
        wal.append_frame(&cx, pn(2), &page(0x02), 0).unwrap(); // never committed
        drop(wal);

        let file = open_wal_file(&vfs, &cx);
        let mut reopened = Wal::open(&cx, file).unwrap();
        assert_eq!(reopened.max_committed(), 1);
        let snap = reopened.snapshot();
        assert!(reopened.read_page(&cx, pn(2), snap).unwrap().is_none());
    }

    #[test]
    fn corrupt_frame_terminates_scan() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut wal = fresh_wal(&vfs, &cx);
        wal.append_frame(&cx, pn(1), &page(0x01), 1).unwrap();
        wal.append_frame(&cx, pn(2), &page(0x02), 2).unwrap();
        drop(wal);

        // Flip a byte in the second frame's content.
        let mut file = open_wal_file(&vfs, &cx);
        let offset = WAL_HEADER_SIZE as u64
            + (WAL_FRAME_HEADER_SIZE + PS as usize) as u64
            + WAL_FRAME_HEADER_SIZE as u64
            + 5;
        file.write(&cx, &[0x99], offset).unwrap();
        drop(file);

        let file = open_wal_file(&vfs, &cx);
        let reopened = Wal::open(&cx, file).unwrap();
        assert_eq!(
            reopened.max_committed(),
            1,
            "chain must stop at the corrupt frame"
        );
    }

    #[test]
    fn discard_uncommitted_rewinds_writer() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut wal = fresh_wal(&vfs, &cx);

        wal.append_frame(&cx, pn(1), &page(0x01), 1).unwrap();
        wal.append_frame(&cx, pn(2), &page(0x02), 0).unwrap();
        wal.discard_uncommitted();
        assert_eq!(wal.max_committed(), 1);

        // The next append overwrites the abandoned frame and commits.
        wal.append_frame(&cx, pn(3), &page(0x03), 3).unwrap();
        let snap = wal.snapshot();
        assert!(wal.read_page(&cx, pn(2), snap).unwrap().is_none());
        assert_eq!(
            wal.read_page(&cx, pn(3), snap).unwrap().unwrap(),
            page(0x03)
        );
    }

    struct VecWriter {
        pages: std::collections::BTreeMap<u32, Vec<u8>>,
        truncated_to: Option<u32>,
        synced: bool,
    }

    impl CheckpointWriter for VecWriter {
        fn write_page(&mut self, _cx: &Cx, pgno: PageNumber, data: &[u8]) -> Result<()> {
            self.pages.insert(pgno.get(), data.to_vec());
            Ok(())
        }
        fn truncate(&mut self, _cx: &Cx, n_pages: u32) -> Result<()> {
            self.truncated_to = Some(n_pages);
            Ok(())
        }
        fn sync(&mut self, _cx: &Cx) -> Result<()> {
            self.synced = true;
            Ok(())
        }
    }

    #[test]
    fn checkpoint_transfers_newest_images_and_resets() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut wal = fresh_wal(&vfs, &cx);

        wal.append_frame(&cx, pn(1), &page(0x01), 0).unwrap();
        wal.append_frame(&cx, pn(2), &page(0x02), 2).unwrap();
        wal.append_frame(&cx, pn(1), &page(0x11), 2).unwrap(); // newer image of page 1

        let mut writer = VecWriter {
            pages: std::collections::BTreeMap::new(),
            truncated_to: None,
            synced: false,
        };
        let stats = wal
            .checkpoint(
                &cx,
                CheckpointMode::Restart,
                &mut writer,
                WalSalts {
                    salt1: 0xAB,
                    salt2: 0xCD,
                },
            )
            .unwrap();

        assert_eq!(stats.frames_in_log, 3);
        assert_eq!(stats.pages_transferred, 2);
        assert!(stats.log_reset);
        assert_eq!(writer.pages[&1], page(0x11), "newest image wins");
        assert_eq!(writer.pages[&2], page(0x02));
        assert_eq!(writer.truncated_to, Some(2));
        assert!(writer.synced);

        assert_eq!(wal.max_committed(), 0);
        assert_eq!(wal.salts().salt1, 0xAB);
        let snap = wal.snapshot();
        assert!(wal.read_page(&cx, pn(1), snap).unwrap().is_none());
    }

    #[test]
    fn truncate_mode_empties_the_file() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut wal = fresh_wal(&vfs, &cx);
        wal.append_frame(&cx, pn(1), &page(0x01), 1).unwrap();

        let mut writer = VecWriter {
            pages: std::collections::BTreeMap::new(),
            truncated_to: None,
            synced: false,
        };
        wal.checkpoint(
            &cx,
            CheckpointMode::Truncate,
            &mut writer,
            WalSalts { salt1: 1, salt2: 2 },
        )
        .unwrap();

        // The log file is now zero bytes.
        let probe = open_wal_file(&vfs, &cx);
        assert_eq!(probe.file_size(&cx).unwrap(), 0);
        drop(probe);

        // The next append lazily rewrites the header and starts a new
        // generation.
        wal.append_frame(&cx, pn(1), &page(0x07), 1).unwrap();
        let snap = wal.snapshot();
        assert_eq!(
            wal.read_page(&cx, pn(1), snap).unwrap().unwrap(),
            page(0x07)
        );
        drop(wal);

        let file = open_wal_file(&vfs, &cx);
        let mut reopened = Wal::open(&cx, file).unwrap();
        assert_eq!(reopened.max_committed(), 1);
        let snap = reopened.snapshot();
        assert_eq!(
            reopened.read_page(&cx, pn(1), snap).unwrap().unwrap(),
            page(0x07)
        );
    }
}
