//! End-to-end pager scenarios over the in-memory and crash-simulation
//! VFS implementations: clean commits, crash recovery around the journal
//! sync barrier, eviction under pressure, savepoints, and the
//! atomic-write fast path.

use std::path::Path;

use quarry_pager::journal::{self, JournalHeader, JournalRecord};
use quarry_pager::{Pager, PagerOptions, PagerState};
use quarry_types::flags::{AccessFlags, DeviceCharacteristics, VfsOpenFlags};
use quarry_types::{Cx, DatabaseHeader, JournalMode, PageNumber, PageSize};
use quarry_vfs::{MemoryVfs, SimVfs, Vfs, VfsFile};

fn pn(n: u32) -> PageNumber {
    PageNumber::new(n).unwrap()
}

fn opts(page_size: PageSize) -> PagerOptions {
    PagerOptions {
        page_size,
        ..PagerOptions::default()
    }
}

/// Page 1 content: a valid database header followed by `payload`.
fn header_page(page_size: PageSize, page_count: u32, payload: &[u8]) -> Vec<u8> {
    let header = DatabaseHeader {
        page_size,
        page_count,
        ..DatabaseHeader::default()
    };
    let mut page = vec![0u8; page_size.as_usize()];
    page[..100].copy_from_slice(&header.to_bytes().unwrap());
    page[100..100 + payload.len()].copy_from_slice(payload);
    page
}

fn filled_page(page_size: PageSize, payload: &[u8]) -> Vec<u8> {
    let mut page = vec![0u8; page_size.as_usize()];
    page[..payload.len()].copy_from_slice(payload);
    page
}

fn raw_file_bytes<V: Vfs>(vfs: &V, cx: &Cx, path: &str) -> Vec<u8> {
    let flags = VfsOpenFlags::MAIN_DB | VfsOpenFlags::READWRITE;
    let (mut file, _) = vfs.open(cx, Some(Path::new(path)), flags).unwrap();
    let size = usize::try_from(file.file_size(cx).unwrap()).unwrap();
    let mut buf = vec![0u8; size];
    if size > 0 {
        file.read(cx, &mut buf, 0).unwrap();
    }
    buf
}

fn commit_three_pages<V: Vfs>(pager: &mut Pager<V>, cx: &Cx, ps: PageSize) {
    pager.begin_write(cx, false).unwrap();
    let pages = [
        header_page(ps, 3, b"A"),
        filled_page(ps, b"BB"),
        filled_page(ps, b"CCC"),
    ];
    for (i, content) in pages.iter().enumerate() {
        let handle = pager.fetch(cx, pn(u32::try_from(i).unwrap() + 1)).unwrap();
        pager.write(cx, &handle, content).unwrap();
        pager.release(cx, handle).unwrap();
    }
    pager.commit(cx).unwrap();
}

// ---------------------------------------------------------------------------
// Scenario: clean commit in rollback mode
// ---------------------------------------------------------------------------

#[test]
fn clean_commit_persists_across_reopen() {
    let cx = Cx::new();
    let vfs = MemoryVfs::new();
    let ps = PageSize::DEFAULT;

    let mut pager = Pager::open(vfs.clone(), Path::new("clean.db"), opts(ps)).unwrap();
    commit_three_pages(&mut pager, &cx, ps);
    assert_eq!(pager.ref_count_sum(), 0);
    pager.close(&cx).unwrap();

    // No journal survives a clean commit.
    assert!(!vfs
        .access(&cx, Path::new("clean.db-journal"), AccessFlags::EXISTS)
        .unwrap());

    let mut reopened = Pager::open(vfs, Path::new("clean.db"), opts(ps)).unwrap();
    reopened.shared_lock(&cx).unwrap();
    assert_eq!(reopened.db_size(), 3);

    let p1 = reopened.read_page(&cx, pn(1)).unwrap();
    assert_eq!(&p1.as_bytes()[..16], b"SQLite format 3\0");
    assert_eq!(p1.as_bytes()[100], b'A');
    let p2 = reopened.read_page(&cx, pn(2)).unwrap();
    assert_eq!(&p2.as_bytes()[..2], b"BB");
    let p3 = reopened.read_page(&cx, pn(3)).unwrap();
    assert_eq!(&p3.as_bytes()[..3], b"CCC");
}

// ---------------------------------------------------------------------------
// Scenario: crash before the journal sync
// ---------------------------------------------------------------------------

#[test]
fn crash_before_journal_sync_leaves_original_state() {
    let cx = Cx::new();
    let vfs = SimVfs::new();
    let ps = PageSize::DEFAULT;

    let mut pager = Pager::open(vfs.clone(), Path::new("c2.db"), opts(ps)).unwrap();
    pager.begin_write(&cx, false).unwrap();
    for n in 1..=3u32 {
        let content = if n == 1 {
            header_page(ps, 3, b"A")
        } else {
            filled_page(ps, &[0x40 + u8::try_from(n).unwrap()])
        };
        let handle = pager.fetch(&cx, pn(n)).unwrap();
        pager.write(&cx, &handle, &content).unwrap();
        pager.release(&cx, handle).unwrap();
    }

    // The journal fsync dies; the process "exits" with the transaction
    // half-written.
    vfs.schedule_sync_failure("c2.db-journal");
    assert!(pager.commit_phase_one(&cx, None).is_err());
    assert_eq!(pager.state(), PagerState::Error);
    drop(pager);
    vfs.crash();

    let mut reopened = Pager::open(vfs.clone(), Path::new("c2.db"), opts(ps)).unwrap();
    reopened.shared_lock(&cx).unwrap();
    assert_eq!(reopened.db_size(), 0, "database must still be empty");
    assert_eq!(raw_file_bytes(&vfs, &cx, "c2.db"), Vec::<u8>::new());
}

// ---------------------------------------------------------------------------
// Scenario: crash between the journal sync and the database write
// ---------------------------------------------------------------------------

#[test]
fn crash_after_journal_sync_replays_hot_journal() {
    let cx = Cx::new();
    let vfs = SimVfs::new();
    let ps = PageSize::DEFAULT;

    // Durable baseline: two committed pages.
    let mut pager = Pager::open(vfs.clone(), Path::new("c3.db"), opts(ps)).unwrap();
    pager.begin_write(&cx, false).unwrap();
    for n in 1..=2u32 {
        let content = if n == 1 {
            header_page(ps, 2, b"base")
        } else {
            filled_page(ps, b"second")
        };
        let handle = pager.fetch(&cx, pn(n)).unwrap();
        pager.write(&cx, &handle, &content).unwrap();
        pager.release(&cx, handle).unwrap();
    }
    pager.commit(&cx).unwrap();
    let baseline_p2 = pager.read_page(&cx, pn(2)).unwrap().into_vec();
    pager.close(&cx).unwrap();
    let baseline_file = raw_file_bytes(&vfs, &cx, "c3.db");

    // Second transaction: the journal syncs, then the first database
    // write fails and the process dies.
    let mut pager = Pager::open(vfs.clone(), Path::new("c3.db"), opts(ps)).unwrap();
    pager.begin_write(&cx, false).unwrap();
    let handle = pager.fetch(&cx, pn(2)).unwrap();
    pager.write(&cx, &handle, &filled_page(ps, b"OVERWRITTEN")).unwrap();
    pager.release(&cx, handle).unwrap();

    vfs.schedule_write_failure("c3.db");
    assert!(pager.commit_phase_one(&cx, None).is_err());
    assert_eq!(pager.state(), PagerState::Error);
    drop(pager);
    vfs.crash();

    // The journal is hot (synced before the crash) and must replay.
    assert!(vfs
        .access(&cx, Path::new("c3.db-journal"), AccessFlags::EXISTS)
        .unwrap());
    let mut reopened = Pager::open(vfs.clone(), Path::new("c3.db"), opts(ps)).unwrap();
    reopened.shared_lock(&cx).unwrap();
    assert_eq!(reopened.db_size(), 2);
    assert_eq!(
        reopened.read_page(&cx, pn(2)).unwrap().into_vec(),
        baseline_p2,
        "hot-journal replay must restore the committed image"
    );
    assert!(
        !vfs.access(&cx, Path::new("c3.db-journal"), AccessFlags::EXISTS)
            .unwrap(),
        "journal removed after recovery"
    );
    reopened.close(&cx).unwrap();
    assert_eq!(raw_file_bytes(&vfs, &cx, "c3.db"), baseline_file);
}

// ---------------------------------------------------------------------------
// Scenario: durable write survives a crash
// ---------------------------------------------------------------------------

#[test]
fn committed_data_survives_crash() {
    let cx = Cx::new();
    let vfs = SimVfs::new();
    let ps = PageSize::DEFAULT;

    let mut pager = Pager::open(vfs.clone(), Path::new("dur.db"), opts(ps)).unwrap();
    pager.begin_write(&cx, false).unwrap();
    let handle = pager.fetch(&cx, pn(1)).unwrap();
    pager
        .write(&cx, &handle, &header_page(ps, 1, b"durable-payload"))
        .unwrap();
    pager.release(&cx, handle).unwrap();
    pager.commit(&cx).unwrap();
    drop(pager);

    vfs.crash();

    let mut reopened = Pager::open(vfs, Path::new("dur.db"), opts(ps)).unwrap();
    let p1 = reopened.read_page(&cx, pn(1)).unwrap();
    assert_eq!(&p1.as_bytes()[100..115], b"durable-payload");
}

// ---------------------------------------------------------------------------
// Scenario: dirty eviction under pressure
// ---------------------------------------------------------------------------

#[test]
fn dirty_eviction_under_pressure_spills_and_commits() {
    let cx = Cx::new();
    let vfs = MemoryVfs::new();
    let ps = PageSize::DEFAULT;

    let mut pager = Pager::open(
        vfs.clone(),
        Path::new("spill.db"),
        PagerOptions {
            page_size: ps,
            cache_size: 2,
            ..PagerOptions::default()
        },
    )
    .unwrap();

    // Modify pages 1 and 2, then fetch page 3: the third allocation
    // overflows the two-page cache and forces a dirty page out through
    // the stress path (journal sync + database write).
    pager.begin_write(&cx, false).unwrap();
    for n in 1..=2u32 {
        let content = if n == 1 {
            header_page(ps, 2, b"one")
        } else {
            filled_page(ps, &[0x50 + u8::try_from(n).unwrap()])
        };
        let handle = pager.fetch(&cx, pn(n)).unwrap();
        pager.write(&cx, &handle, &content).unwrap();
        pager.release(&cx, handle).unwrap();
        pager.check_cache_integrity();
    }
    let handle = pager.fetch(&cx, pn(3)).unwrap();
    pager.release(&cx, handle).unwrap();
    pager.check_cache_integrity();
    assert_eq!(pager.ref_count_sum(), 0);
    pager.commit(&cx).unwrap();
    pager.close(&cx).unwrap();

    let mut reopened = Pager::open(vfs, Path::new("spill.db"), opts(ps)).unwrap();
    reopened.shared_lock(&cx).unwrap();
    assert_eq!(reopened.db_size(), 2);
    assert_eq!(reopened.read_page(&cx, pn(1)).unwrap().as_bytes()[100], b'o');
    assert_eq!(reopened.read_page(&cx, pn(2)).unwrap().as_bytes()[0], 0x52);
}

// ---------------------------------------------------------------------------
// Scenario: nested savepoint rollback
// ---------------------------------------------------------------------------

#[test]
fn savepoint_rollback_reverts_only_inner_writes() {
    let cx = Cx::new();
    let vfs = MemoryVfs::new();
    let ps = PageSize::DEFAULT;

    let mut pager = Pager::open(vfs, Path::new("sp.db"), opts(ps)).unwrap();
    pager.begin_write(&cx, false).unwrap();

    for n in 1..=4u32 {
        let content = if n == 1 {
            header_page(ps, 4, b"hdr")
        } else {
            filled_page(ps, &[0x60 + u8::try_from(n).unwrap()])
        };
        let handle = pager.fetch(&cx, pn(n)).unwrap();
        pager.write(&cx, &handle, &content).unwrap();
        pager.release(&cx, handle).unwrap();
    }

    let sp = pager.open_savepoint().unwrap();
    let handle = pager.fetch(&cx, pn(5)).unwrap();
    pager.write(&cx, &handle, &filled_page(ps, b"inner")).unwrap();
    pager.release(&cx, handle).unwrap();
    // Also modify page 4 inside the savepoint.
    let handle = pager.fetch(&cx, pn(4)).unwrap();
    pager
        .write(&cx, &handle, &filled_page(ps, b"clobbered"))
        .unwrap();
    pager.release(&cx, handle).unwrap();
    assert_eq!(pager.db_size(), 5);

    pager.rollback_to_savepoint(&cx, sp).unwrap();
    assert_eq!(pager.db_size(), 4, "image shrinks back to the savepoint");

    // Page 4 reverts to its pre-savepoint (outer) content; page 5 is
    // gone.
    let p4 = pager.read_page(&cx, pn(4)).unwrap();
    assert_eq!(p4.as_bytes()[0], 0x64);
    let p5 = pager.read_page(&cx, pn(5)).unwrap();
    assert!(p5.as_bytes().iter().all(|&b| b == 0));

    // The savepoint is still open and can be rolled back to again.
    let handle = pager.fetch(&cx, pn(4)).unwrap();
    pager.write(&cx, &handle, &filled_page(ps, b"again")).unwrap();
    pager.release(&cx, handle).unwrap();
    pager.rollback_to_savepoint(&cx, sp).unwrap();
    let p4 = pager.read_page(&cx, pn(4)).unwrap();
    assert_eq!(p4.as_bytes()[0], 0x64);

    pager.commit(&cx).unwrap();
    assert_eq!(pager.db_size(), 4);

    // Outer content survives the full commit.
    let p2 = pager.read_page(&cx, pn(2)).unwrap();
    assert_eq!(p2.as_bytes()[0], 0x62);
}

#[test]
fn release_savepoint_keeps_changes() {
    let cx = Cx::new();
    let ps = PageSize::DEFAULT;
    let mut pager = Pager::open(MemoryVfs::new(), Path::new("rel.db"), opts(ps)).unwrap();

    pager.begin_write(&cx, false).unwrap();
    let handle = pager.fetch(&cx, pn(1)).unwrap();
    pager.write(&cx, &handle, &header_page(ps, 1, b"x")).unwrap();
    pager.release(&cx, handle).unwrap();

    let sp = pager.open_savepoint().unwrap();
    let handle = pager.fetch(&cx, pn(2)).unwrap();
    pager.write(&cx, &handle, &filled_page(ps, b"kept")).unwrap();
    pager.release(&cx, handle).unwrap();
    pager.release_savepoint(sp).unwrap();
    assert_eq!(pager.savepoint_count(), 0);

    pager.commit(&cx).unwrap();
    let p2 = pager.read_page(&cx, pn(2)).unwrap();
    assert_eq!(&p2.as_bytes()[..4], b"kept");
}

// ---------------------------------------------------------------------------
// Round-trip law: rollback restores the file byte for byte
// ---------------------------------------------------------------------------

#[test]
fn rollback_restores_file_byte_identical() {
    let cx = Cx::new();
    let vfs = MemoryVfs::new();
    let ps = PageSize::DEFAULT;

    let mut pager = Pager::open(vfs.clone(), Path::new("rb.db"), opts(ps)).unwrap();
    commit_three_pages(&mut pager, &cx, ps);
    let before = raw_file_bytes(&vfs, &cx, "rb.db");

    pager.begin_write(&cx, false).unwrap();
    for n in 1..=3u32 {
        let handle = pager.fetch(&cx, pn(n)).unwrap();
        pager.write(&cx, &handle, &filled_page(ps, b"zzz")).unwrap();
        pager.release(&cx, handle).unwrap();
    }
    // Grow the image too; rollback must shrink it again.
    let handle = pager.fetch(&cx, pn(4)).unwrap();
    pager.write(&cx, &handle, &filled_page(ps, b"new")).unwrap();
    pager.release(&cx, handle).unwrap();

    pager.rollback(&cx).unwrap();
    assert_eq!(pager.db_size(), 3);
    assert_eq!(
        raw_file_bytes(&vfs, &cx, "rb.db"),
        before,
        "rollback must restore the pre-transaction file exactly"
    );
}

// ---------------------------------------------------------------------------
// Boundary: page sizes 512 and 65536
// ---------------------------------------------------------------------------

#[test]
fn boundary_page_sizes_have_identical_outcomes() {
    for page_size in [PageSize::MIN, PageSize::MAX] {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut pager = Pager::open(vfs.clone(), Path::new("b.db"), opts(page_size)).unwrap();
        commit_three_pages(&mut pager, &cx, page_size);
        pager.close(&cx).unwrap();

        let mut reopened = Pager::open(vfs, Path::new("b.db"), opts(page_size)).unwrap();
        reopened.shared_lock(&cx).unwrap();
        assert_eq!(reopened.db_size(), 3, "page_size={page_size}");
        let p3 = reopened.read_page(&cx, pn(3)).unwrap();
        assert_eq!(&p3.as_bytes()[..3], b"CCC", "page_size={page_size}");
    }
}

// ---------------------------------------------------------------------------
// Atomic-write optimisation
// ---------------------------------------------------------------------------

#[test]
fn single_page_atomic_write_skips_journal_sync() {
    let cx = Cx::new();
    let ps = PageSize::DEFAULT;
    let vfs = SimVfs::new().with_device_characteristics(DeviceCharacteristics::ATOMIC4K);

    let mut pager = Pager::open(vfs.clone(), Path::new("at.db"), opts(ps)).unwrap();

    // Baseline page so the next transaction is a pure single-page
    // update.
    pager.begin_write(&cx, false).unwrap();
    let handle = pager.fetch(&cx, pn(1)).unwrap();
    pager.write(&cx, &handle, &header_page(ps, 1, b"v1")).unwrap();
    pager.release(&cx, handle).unwrap();
    pager.commit(&cx).unwrap();

    // Arm a journal fsync failure. The atomic path never syncs the
    // journal, so the commit must succeed anyway.
    vfs.schedule_sync_failure("at.db-journal");
    pager.begin_write(&cx, false).unwrap();
    let handle = pager.fetch(&cx, pn(1)).unwrap();
    let mut content = pager.page_data(&handle).unwrap().into_vec();
    content[101] = b'2';
    pager.write(&cx, &handle, &content).unwrap();
    pager.release(&cx, handle).unwrap();
    pager.commit(&cx).expect("atomic commit must bypass the journal sync");

    let p1 = pager.read_page(&cx, pn(1)).unwrap();
    assert_eq!(p1.as_bytes()[101], b'2');
}

// ---------------------------------------------------------------------------
// Journal replay idempotence
// ---------------------------------------------------------------------------

#[test]
fn replaying_a_journal_twice_equals_once() {
    let cx = Cx::new();
    let vfs = MemoryVfs::new();
    let ps = 512usize;

    // Hand-build a journal with two pre-images.
    let flags = VfsOpenFlags::MAIN_JOURNAL | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE;
    let (mut jfile, _) = vfs.open(&cx, Some(Path::new("i.db-journal")), flags).unwrap();
    let header = JournalHeader {
        n_rec: 2,
        nonce: 0xBEEF,
        orig_page_count: 2,
        sector_size: 512,
        page_size: 512,
    };
    let mut offset = 0u64;
    let bytes = header.encode();
    jfile.write(&cx, &bytes, offset).unwrap();
    offset += journal::header_span(512);
    for pgno in 1..=2u32 {
        let rec = JournalRecord {
            pgno,
            content: vec![0x10 * pgno as u8; ps],
        };
        let bytes = rec.encode(header.nonce);
        jfile.write(&cx, &bytes, offset).unwrap();
        offset += bytes.len() as u64;
    }

    let mut replay = |db: &mut Vec<u8>| {
        journal::for_each_record(&cx, &mut jfile, |pgno, content| {
            let start = (pgno as usize - 1) * ps;
            if db.len() < start + ps {
                db.resize(start + ps, 0);
            }
            db[start..start + ps].copy_from_slice(content);
            Ok(())
        })
        .unwrap()
        .unwrap()
    };

    let mut db = vec![0xFFu8; 2 * ps];
    let first = replay(&mut db);
    let after_once = db.clone();
    let second = replay(&mut db);
    assert_eq!(first, second);
    assert_eq!(db, after_once, "second replay must be a no-op");
}

// ---------------------------------------------------------------------------
// Hot-journal edge: stale master journal reference
// ---------------------------------------------------------------------------

#[test]
fn journal_with_missing_master_is_not_hot() {
    let cx = Cx::new();
    let vfs = MemoryVfs::new();
    let ps = PageSize::DEFAULT;

    // Commit a baseline.
    let mut pager = Pager::open(vfs.clone(), Path::new("mj.db"), opts(ps)).unwrap();
    pager.begin_write(&cx, false).unwrap();
    let handle = pager.fetch(&cx, pn(1)).unwrap();
    pager.write(&cx, &handle, &header_page(ps, 1, b"keep")).unwrap();
    pager.release(&cx, handle).unwrap();
    pager.commit(&cx).unwrap();
    pager.close(&cx).unwrap();
    let committed = raw_file_bytes(&vfs, &cx, "mj.db");

    // Fake a leftover journal that would revert the page, naming a
    // master journal that no longer exists (its transaction finished).
    let flags = VfsOpenFlags::MAIN_JOURNAL | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE;
    let (mut jfile, _) = vfs.open(&cx, Some(Path::new("mj.db-journal")), flags).unwrap();
    let header = JournalHeader {
        n_rec: 1,
        nonce: 7,
        orig_page_count: 1,
        sector_size: 512,
        page_size: ps.get(),
    };
    let mut offset = 0u64;
    jfile.write(&cx, &header.encode(), offset).unwrap();
    offset += journal::header_span(512);
    let rec = JournalRecord {
        pgno: 1,
        content: vec![0u8; ps.as_usize()],
    };
    let bytes = rec.encode(header.nonce);
    jfile.write(&cx, &bytes, offset).unwrap();
    offset += bytes.len() as u64;
    jfile
        .write(&cx, &journal::encode_master_record("gone-mj01"), offset)
        .unwrap();

    // Reopen: the journal must be discarded, not replayed.
    let mut reopened = Pager::open(vfs.clone(), Path::new("mj.db"), opts(ps)).unwrap();
    reopened.shared_lock(&cx).unwrap();
    assert!(!vfs
        .access(&cx, Path::new("mj.db-journal"), AccessFlags::EXISTS)
        .unwrap());
    reopened.close(&cx).unwrap();
    assert_eq!(raw_file_bytes(&vfs, &cx, "mj.db"), committed);
}

// ---------------------------------------------------------------------------
// Sector-size grouping
// ---------------------------------------------------------------------------

#[test]
fn large_sector_groups_journal_writes() {
    let cx = Cx::new();
    let ps = PageSize::DEFAULT;
    // 8 KiB sectors: two 4 KiB pages per sector.
    let vfs = MemoryVfs::new().with_sector_size(8192);

    let mut pager = Pager::open(vfs.clone(), Path::new("sec.db"), opts(ps)).unwrap();
    commit_three_pages(&mut pager, &cx, ps);
    let before = raw_file_bytes(&vfs, &cx, "sec.db");

    // Touch only page 1. With two pages per sector, its sector-mate
    // (page 2) must be journalled as part of the same unit.
    pager.begin_write(&cx, false).unwrap();
    let handle = pager.fetch(&cx, pn(1)).unwrap();
    pager.write(&cx, &handle, &filled_page(ps, b"mutated")).unwrap();
    pager.release(&cx, handle).unwrap();
    pager.rollback(&cx).unwrap();

    assert_eq!(
        raw_file_bytes(&vfs, &cx, "sec.db"),
        before,
        "rollback after sector-grouped journalling restores everything"
    );
}

// ---------------------------------------------------------------------------
// Persist mode leaves a cold journal
// ---------------------------------------------------------------------------

#[test]
fn persist_mode_journal_is_not_hot() {
    let cx = Cx::new();
    let vfs = MemoryVfs::new();
    let ps = PageSize::DEFAULT;

    let mut pager = Pager::open(
        vfs.clone(),
        Path::new("p.db"),
        PagerOptions {
            page_size: ps,
            journal_mode: JournalMode::Persist,
            ..PagerOptions::default()
        },
    )
    .unwrap();
    commit_three_pages(&mut pager, &cx, ps);
    pager.close(&cx).unwrap();

    // The journal file remains, header zeroed.
    assert!(vfs
        .access(&cx, Path::new("p.db-journal"), AccessFlags::EXISTS)
        .unwrap());

    let mut reopened = Pager::open(vfs, Path::new("p.db"), opts(ps)).unwrap();
    reopened.shared_lock(&cx).unwrap();
    assert_eq!(reopened.db_size(), 3, "zeroed journal must not replay");
    let p3 = reopened.read_page(&cx, pn(3)).unwrap();
    assert_eq!(&p3.as_bytes()[..3], b"CCC");
}
