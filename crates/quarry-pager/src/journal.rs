//! Rollback-journal wire format.
//!
//! A journal is a sequence of sector-padded headers, each followed by
//! page records holding pre-transaction page images:
//!
//! ```text
//! [header: magic, n_rec, nonce, orig page count, sector size, page size]
//! [record: pgno, page content, checksum] * n_rec
//! [header ...]                                  (after a mid-txn sync)
//! ...
//! [master record: 0, name, name len, cksum, magic]     (optional)
//! ```
//!
//! `n_rec == 0` in the final header means "records run to end of file";
//! the per-record checksum (the nonce plus every 200th content byte)
//! detects torn tails, and playback stops at the first invalid record.

use quarry_error::{QuarryError, Result};
use quarry_types::Cx;
use quarry_vfs::VfsFile;
use tracing::debug;

/// Journal header magic.
pub const JOURNAL_MAGIC: [u8; 8] = [0xd9, 0xd5, 0x05, 0xf9, 0x20, 0xa1, 0x63, 0xd7];

/// Unpadded journal header size.
pub const JOURNAL_HEADER_SIZE: usize = 28;

/// The padded span a header occupies: headers (and the records after
/// them) start on sector boundaries so a torn sector write cannot
/// straddle a header and an unrelated record.
#[must_use]
pub fn header_span(sector_size: u32) -> u64 {
    u64::from(sector_size.max(JOURNAL_HEADER_SIZE as u32))
}

/// On-disk size of one page record.
#[must_use]
pub fn record_size(page_size: usize) -> u64 {
    4 + page_size as u64 + 4
}

/// Additive record checksum: the nonce plus every 200th content byte,
/// walking down from the end.
#[must_use]
pub fn record_checksum(nonce: u32, content: &[u8]) -> u32 {
    let mut cksum = nonce;
    let mut i = content.len() as i64 - 200;
    while i > 0 {
        #[allow(clippy::cast_sign_loss)]
        let byte = content[i as usize];
        cksum = cksum.wrapping_add(u32::from(byte));
        i -= 200;
    }
    cksum
}

/// A parsed journal header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    /// Record count after this header; 0 means "to end of file" (only
    /// valid for the final header).
    pub n_rec: u32,
    /// Checksum nonce for the records after this header.
    pub nonce: u32,
    /// Database size in pages when the transaction started.
    pub orig_page_count: u32,
    /// Sector size the journal was written with.
    pub sector_size: u32,
    /// Database page size.
    pub page_size: u32,
}

impl JournalHeader {
    /// Serialise, padded to the header span for this header's sector
    /// size.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let span = usize::try_from(header_span(self.sector_size)).expect("span fits usize");
        let mut out = vec![0u8; span];
        out[..8].copy_from_slice(&JOURNAL_MAGIC);
        out[8..12].copy_from_slice(&self.n_rec.to_be_bytes());
        out[12..16].copy_from_slice(&self.nonce.to_be_bytes());
        out[16..20].copy_from_slice(&self.orig_page_count.to_be_bytes());
        out[20..24].copy_from_slice(&self.sector_size.to_be_bytes());
        out[24..28].copy_from_slice(&self.page_size.to_be_bytes());
        out
    }

    /// Parse from at least 28 bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < JOURNAL_HEADER_SIZE {
            return Err(QuarryError::Corrupt {
                detail: format!("journal header too small: {} bytes", buf.len()),
            });
        }
        if buf[..8] != JOURNAL_MAGIC {
            return Err(QuarryError::Corrupt {
                detail: "journal header magic mismatch".to_owned(),
            });
        }
        let field = |at: usize| {
            let raw: [u8; 4] = buf[at..at + 4].try_into().expect("4-byte field");
            u32::from_be_bytes(raw)
        };
        Ok(Self {
            n_rec: field(8),
            nonce: field(12),
            orig_page_count: field(16),
            sector_size: field(20),
            page_size: field(24),
        })
    }
}

/// One page pre-image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    /// The page this image restores.
    pub pgno: u32,
    /// The original page content.
    pub content: Vec<u8>,
}

impl JournalRecord {
    /// Serialise with the checksum derived from `nonce`.
    #[must_use]
    pub fn encode(&self, nonce: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.content.len());
        out.extend_from_slice(&self.pgno.to_be_bytes());
        out.extend_from_slice(&self.content);
        out.extend_from_slice(&record_checksum(nonce, &self.content).to_be_bytes());
        out
    }

    /// Parse and verify one record. A zero page number or checksum
    /// mismatch is reported as corruption (playback treats it as the end
    /// of valid records).
    pub fn decode(buf: &[u8], page_size: usize, nonce: u32) -> Result<Self> {
        let expect = usize::try_from(record_size(page_size)).expect("record size fits usize");
        if buf.len() < expect {
            return Err(QuarryError::Corrupt {
                detail: format!("journal record truncated: {} of {expect} bytes", buf.len()),
            });
        }
        let pgno = u32::from_be_bytes(buf[..4].try_into().expect("4-byte field"));
        if pgno == 0 {
            return Err(QuarryError::Corrupt {
                detail: "journal record for page 0".to_owned(),
            });
        }
        let content = buf[4..4 + page_size].to_vec();
        let stored = u32::from_be_bytes(
            buf[4 + page_size..8 + page_size]
                .try_into()
                .expect("4-byte field"),
        );
        let computed = record_checksum(nonce, &content);
        if stored != computed {
            return Err(QuarryError::Corrupt {
                detail: format!(
                    "journal record checksum mismatch for page {pgno}: stored {stored:#010x} computed {computed:#010x}"
                ),
            });
        }
        Ok(Self { pgno, content })
    }
}

// ---------------------------------------------------------------------------
// Master journal record
// ---------------------------------------------------------------------------

/// Serialise the master-journal trailer: a zero page-number marker, the
/// name, its length, an additive name checksum, and the magic.
#[must_use]
pub fn encode_master_record(name: &str) -> Vec<u8> {
    let bytes = name.as_bytes();
    let cksum: u32 = bytes.iter().fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)));
    let mut out = Vec::with_capacity(4 + bytes.len() + 16);
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(bytes);
    out.extend_from_slice(&u32::try_from(bytes.len()).expect("name length fits u32").to_be_bytes());
    out.extend_from_slice(&cksum.to_be_bytes());
    out.extend_from_slice(&JOURNAL_MAGIC);
    out
}

/// Read the master-journal name from the tail of a journal file, if a
/// valid master record is present.
pub fn read_master_name(cx: &Cx, file: &mut impl VfsFile) -> Result<Option<String>> {
    let size = file.file_size(cx)?;
    if size < 16 {
        return Ok(None);
    }

    let mut tail = [0u8; 16];
    let n = file.read(cx, &mut tail, size - 16)?;
    if n < 16 || tail[8..16] != JOURNAL_MAGIC {
        return Ok(None);
    }
    let name_len = u32::from_be_bytes(tail[..4].try_into().expect("4-byte field"));
    let stored_cksum = u32::from_be_bytes(tail[4..8].try_into().expect("4-byte field"));

    let record_len = u64::from(name_len) + 20;
    if u64::from(name_len) == 0 || record_len > size {
        return Ok(None);
    }
    let mut name_buf = vec![0u8; name_len as usize];
    let n = file.read(cx, &mut name_buf, size - 16 - u64::from(name_len))?;
    if n < name_buf.len() {
        return Ok(None);
    }
    let computed: u32 = name_buf
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)));
    if computed != stored_cksum {
        return Ok(None);
    }
    Ok(String::from_utf8(name_buf).ok())
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

/// Summary of a journal playback scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackInfo {
    /// Database size in pages at transaction start, from the first
    /// header.
    pub orig_page_count: u32,
    /// Valid records applied.
    pub records_applied: u32,
}

/// Walk every valid record in a journal, invoking `apply(pgno, content)`
/// for each.
///
/// Iteration handles multiple headers (each at a sector-aligned offset)
/// and stops cleanly at the first torn or corrupt record, a zeroed or
/// missing header, or end of file. Replay is idempotent: records restore
/// full page images, so applying them again is harmless.
pub fn for_each_record(
    cx: &Cx,
    file: &mut impl VfsFile,
    mut apply: impl FnMut(u32, &[u8]) -> Result<()>,
) -> Result<Option<PlaybackInfo>> {
    let size = file.file_size(cx)?;
    if size < JOURNAL_HEADER_SIZE as u64 {
        return Ok(None);
    }

    let mut header_buf = [0u8; JOURNAL_HEADER_SIZE];
    let n = file.read(cx, &mut header_buf, 0)?;
    if n < JOURNAL_HEADER_SIZE {
        return Ok(None);
    }
    let Ok(first) = JournalHeader::decode(&header_buf) else {
        return Ok(None);
    };
    let page_size = first.page_size as usize;
    let span = header_span(first.sector_size);
    let rec_size = record_size(page_size);

    let mut info = PlaybackInfo {
        orig_page_count: first.orig_page_count,
        records_applied: 0,
    };
    let mut header = first;
    let mut offset = span;
    let mut rec_buf = vec![0u8; usize::try_from(rec_size).expect("record size fits usize")];

    'headers: loop {
        // A zero count means records run to the end of the file.
        let n_rec = if header.n_rec == 0 {
            u32::try_from((size.saturating_sub(offset)) / rec_size).unwrap_or(u32::MAX)
        } else {
            header.n_rec
        };

        for _ in 0..n_rec {
            if cx.is_cancelled() {
                return Err(QuarryError::Interrupted);
            }
            let n = file.read(cx, &mut rec_buf, offset)?;
            if (n as u64) < rec_size {
                debug!(offset, "torn journal record ends playback");
                break 'headers;
            }
            let Ok(record) = JournalRecord::decode(&rec_buf, page_size, header.nonce) else {
                debug!(offset, "invalid journal record ends playback");
                break 'headers;
            };
            apply(record.pgno, &record.content)?;
            info.records_applied += 1;
            offset += rec_size;
        }

        // Advance to the next sector-aligned header, if any.
        offset = offset.div_next_multiple(span);
        if offset + JOURNAL_HEADER_SIZE as u64 > size {
            break;
        }
        let n = file.read(cx, &mut header_buf, offset)?;
        if n < JOURNAL_HEADER_SIZE {
            break;
        }
        let Ok(next) = JournalHeader::decode(&header_buf) else {
            break;
        };
        header = next;
        offset += span;
    }

    Ok(Some(info))
}

trait NextMultiple {
    fn div_next_multiple(self, unit: u64) -> u64;
}

impl NextMultiple for u64 {
    /// Round up to the next multiple of `unit` (identity when already
    /// aligned).
    fn div_next_multiple(self, unit: u64) -> u64 {
        self.div_ceil(unit) * unit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_types::flags::VfsOpenFlags;
    use quarry_vfs::{MemoryVfs, Vfs};
    use std::path::Path;

    const PS: usize = 512;

    fn header(n_rec: u32) -> JournalHeader {
        JournalHeader {
            n_rec,
            nonce: 0x1234_5678,
            orig_page_count: 2,
            sector_size: 512,
            page_size: PS as u32,
        }
    }

    #[test]
    fn header_round_trip_and_padding() {
        let hdr = header(3);
        let bytes = hdr.encode();
        assert_eq!(bytes.len(), 512, "padded to the sector size");
        assert_eq!(JournalHeader::decode(&bytes).unwrap(), hdr);
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut bytes = header(1).encode();
        bytes[0] ^= 0xFF;
        assert!(JournalHeader::decode(&bytes).is_err());
    }

    #[test]
    fn record_round_trip() {
        let content = vec![0x5Au8; PS];
        let rec = JournalRecord {
            pgno: 7,
            content: content.clone(),
        };
        let bytes = rec.encode(0xDEAD);
        assert_eq!(bytes.len() as u64, record_size(PS));
        let parsed = JournalRecord::decode(&bytes, PS, 0xDEAD).unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn record_checksum_detects_corruption() {
        let rec = JournalRecord {
            pgno: 7,
            content: vec![0x5Au8; PS],
        };
        let mut bytes = rec.encode(0xDEAD);
        bytes[4 + 300] ^= 0x01;
        assert!(JournalRecord::decode(&bytes, PS, 0xDEAD).is_err());
    }

    #[test]
    fn record_rejects_page_zero() {
        let rec = JournalRecord {
            pgno: 1,
            content: vec![0u8; PS],
        };
        let mut bytes = rec.encode(0);
        bytes[..4].copy_from_slice(&0u32.to_be_bytes());
        assert!(JournalRecord::decode(&bytes, PS, 0).is_err());
    }

    #[test]
    fn checksum_samples_every_200th_byte() {
        let mut content = vec![0u8; PS];
        let base = record_checksum(9, &content);
        // Offsets 312 and 112 are sampled for a 512-byte page; 100 is not.
        content[312] = 1;
        content[112] = 2;
        content[100] = 50;
        assert_eq!(record_checksum(9, &content), base + 3);
    }

    fn open_journal(vfs: &MemoryVfs, cx: &Cx) -> quarry_vfs::MemoryFile {
        let flags = VfsOpenFlags::MAIN_JOURNAL | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE;
        vfs.open(cx, Some(Path::new("t.db-journal")), flags).unwrap().0
    }

    #[test]
    fn playback_applies_records_until_torn_tail() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut file = open_journal(&vfs, &cx);

        let hdr = header(0); // count from file size
        let mut offset = 0u64;
        let hdr_bytes = hdr.encode();
        file.write(&cx, &hdr_bytes, offset).unwrap();
        offset += hdr_bytes.len() as u64;

        for pgno in 1..=3u32 {
            let rec = JournalRecord {
                pgno,
                content: vec![pgno as u8; PS],
            };
            let bytes = rec.encode(hdr.nonce);
            file.write(&cx, &bytes, offset).unwrap();
            offset += bytes.len() as u64;
        }
        // A torn fourth record: half written.
        file.write(&cx, &vec![0xEEu8; 100], offset).unwrap();

        let mut seen = Vec::new();
        let info = for_each_record(&cx, &mut file, |pgno, content| {
            seen.push((pgno, content[0]));
            Ok(())
        })
        .unwrap()
        .unwrap();

        assert_eq!(info.orig_page_count, 2);
        assert_eq!(info.records_applied, 3);
        assert_eq!(seen, vec![(1, 1), (2, 2), (3, 3)]);
    }

    #[test]
    fn playback_handles_multiple_headers() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut file = open_journal(&vfs, &cx);

        // First header with one record, then a second header (as after a
        // mid-transaction journal sync) with one more.
        let h1 = header(1);
        let mut offset = 0u64;
        file.write(&cx, &h1.encode(), offset).unwrap();
        offset += header_span(h1.sector_size);
        let r1 = JournalRecord {
            pgno: 4,
            content: vec![0x44; PS],
        };
        file.write(&cx, &r1.encode(h1.nonce), offset).unwrap();
        offset += record_size(PS);

        let offset = offset.div_next_multiple(header_span(h1.sector_size));
        let h2 = JournalHeader {
            nonce: 0x9999,
            n_rec: 1,
            ..h1
        };
        file.write(&cx, &h2.encode(), offset).unwrap();
        let offset = offset + header_span(h2.sector_size);
        let r2 = JournalRecord {
            pgno: 5,
            content: vec![0x55; PS],
        };
        file.write(&cx, &r2.encode(h2.nonce), offset).unwrap();

        let mut seen = Vec::new();
        let info = for_each_record(&cx, &mut file, |pgno, _| {
            seen.push(pgno);
            Ok(())
        })
        .unwrap()
        .unwrap();
        assert_eq!(info.records_applied, 2);
        assert_eq!(seen, vec![4, 5]);
    }

    #[test]
    fn playback_of_empty_or_headerless_file_is_none() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut file = open_journal(&vfs, &cx);
        assert!(for_each_record(&cx, &mut file, |_, _| Ok(())).unwrap().is_none());

        file.write(&cx, &[0u8; 40], 0).unwrap();
        assert!(for_each_record(&cx, &mut file, |_, _| Ok(())).unwrap().is_none());
    }

    #[test]
    fn master_record_round_trip() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut file = open_journal(&vfs, &cx);

        let hdr = header(1);
        file.write(&cx, &hdr.encode(), 0).unwrap();
        let mut offset = header_span(hdr.sector_size);
        let rec = JournalRecord {
            pgno: 1,
            content: vec![0; PS],
        };
        file.write(&cx, &rec.encode(hdr.nonce), offset).unwrap();
        offset += record_size(PS);
        file.write(&cx, &encode_master_record("main.db-mj01"), offset)
            .unwrap();

        assert_eq!(
            read_master_name(&cx, &mut file).unwrap().as_deref(),
            Some("main.db-mj01")
        );
    }

    #[test]
    fn master_name_absent_when_no_record() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut file = open_journal(&vfs, &cx);
        let hdr = header(0);
        file.write(&cx, &hdr.encode(), 0).unwrap();
        assert!(read_master_name(&cx, &mut file).unwrap().is_none());
    }
}
