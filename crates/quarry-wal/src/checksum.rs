//! WAL wire format: header and frame codecs and the cumulative checksum
//! chain.
//!
//! On-disk layout:
//! ```text
//! [WAL header: 32 bytes]
//! [frame 0: 24-byte header + page_size bytes]
//! [frame 1: 24-byte header + page_size bytes]
//! ...
//! ```
//!
//! The checksum is a rolling sum over 8-byte chunks, seeded by the header
//! checksum and threaded through every frame, so a valid frame N proves
//! the integrity of frames 0..=N. The magic selects whether checksum
//! input words are read big- or little-endian.

use quarry_error::{QuarryError, Result};

/// Size of the WAL file header.
pub const WAL_HEADER_SIZE: usize = 32;

/// Size of each frame header.
pub const WAL_FRAME_HEADER_SIZE: usize = 24;

/// Magic for little-endian checksum words.
pub const WAL_MAGIC_LE: u32 = 0x377F_0682;

/// Magic for big-endian checksum words.
pub const WAL_MAGIC_BE: u32 = 0x377F_0683;

/// WAL format version.
pub const WAL_FORMAT_VERSION: u32 = 3_007_000;

const HDR_SALT1: usize = 16;
const HDR_SALT2: usize = 20;
const HDR_CKSUM1: usize = 24;
const HDR_CKSUM2: usize = 28;

const FRAME_DB_SIZE: usize = 4;
const FRAME_SALT1: usize = 8;
const FRAME_SALT2: usize = 12;
const FRAME_CKSUM1: usize = 16;
const FRAME_CKSUM2: usize = 20;

/// Cumulative checksum pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalChecksum {
    /// First accumulator.
    pub s1: u32,
    /// Second accumulator.
    pub s2: u32,
}

/// Salt pair copied from the WAL header into every frame.
///
/// A frame whose salts differ from the header belongs to a previous log
/// generation and terminates the valid chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalSalts {
    /// Incremented on every log reset.
    pub salt1: u32,
    /// Freshly random on every log reset.
    pub salt2: u32,
}

/// Parsed 32-byte WAL header.
///
/// ```text
/// Offset  Size  Field
///   0       4   Magic (0x377F0682 LE checksums / 0x377F0683 BE)
///   4       4   Format version (3007000)
///   8       4   Page size
///  12       4   Checkpoint sequence number
///  16       4   Salt-1
///  20       4   Salt-2
///  24       8   Checksum of bytes 0..24
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    /// Magic number.
    pub magic: u32,
    /// Format version.
    pub format_version: u32,
    /// Database page size.
    pub page_size: u32,
    /// Incremented on every checkpoint that resets the log.
    pub checkpoint_seq: u32,
    /// Current salt pair.
    pub salts: WalSalts,
    /// Header checksum over bytes 0..24.
    pub checksum: WalChecksum,
}

impl WalHeader {
    /// Whether checksum input words are big-endian.
    #[must_use]
    pub const fn big_endian_checksum(&self) -> bool {
        self.magic == WAL_MAGIC_BE
    }

    /// Parse a header from at least 32 bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, WAL_HEADER_SIZE, "WAL header")?;
        let magic = read_be_u32(buf, 0);
        if magic != WAL_MAGIC_LE && magic != WAL_MAGIC_BE {
            return Err(QuarryError::WalCorrupt {
                detail: format!("invalid WAL magic: {magic:#010x}"),
            });
        }
        let format_version = read_be_u32(buf, 4);
        if format_version != WAL_FORMAT_VERSION {
            return Err(QuarryError::WalCorrupt {
                detail: format!("unsupported WAL format version: {format_version}"),
            });
        }
        Ok(Self {
            magic,
            format_version,
            page_size: read_be_u32(buf, 8),
            checkpoint_seq: read_be_u32(buf, 12),
            salts: WalSalts {
                salt1: read_be_u32(buf, HDR_SALT1),
                salt2: read_be_u32(buf, HDR_SALT2),
            },
            checksum: WalChecksum {
                s1: read_be_u32(buf, HDR_CKSUM1),
                s2: read_be_u32(buf, HDR_CKSUM2),
            },
        })
    }

    /// Serialise, computing and embedding the header checksum.
    pub fn to_bytes(&self) -> Result<[u8; WAL_HEADER_SIZE]> {
        let mut buf = [0u8; WAL_HEADER_SIZE];
        write_be_u32(&mut buf, 0, self.magic);
        write_be_u32(&mut buf, 4, self.format_version);
        write_be_u32(&mut buf, 8, self.page_size);
        write_be_u32(&mut buf, 12, self.checkpoint_seq);
        write_be_u32(&mut buf, HDR_SALT1, self.salts.salt1);
        write_be_u32(&mut buf, HDR_SALT2, self.salts.salt2);
        let checksum = rolling_checksum(
            &buf[..HDR_CKSUM1],
            WalChecksum::default(),
            self.big_endian_checksum(),
        )?;
        write_be_u32(&mut buf, HDR_CKSUM1, checksum.s1);
        write_be_u32(&mut buf, HDR_CKSUM2, checksum.s2);
        Ok(buf)
    }
}

/// Read the embedded checksum of a serialised header.
pub fn header_stored_checksum(buf: &[u8]) -> Result<WalChecksum> {
    ensure_len(buf, WAL_HEADER_SIZE, "WAL header")?;
    Ok(WalChecksum {
        s1: read_be_u32(buf, HDR_CKSUM1),
        s2: read_be_u32(buf, HDR_CKSUM2),
    })
}

/// Recompute the checksum a serialised header should carry.
pub fn header_computed_checksum(buf: &[u8], big_endian: bool) -> Result<WalChecksum> {
    ensure_len(buf, WAL_HEADER_SIZE, "WAL header")?;
    rolling_checksum(&buf[..HDR_CKSUM1], WalChecksum::default(), big_endian)
}

/// Parsed 24-byte frame header.
///
/// ```text
/// Offset  Size  Field
///   0       4   Page number
///   4       4   Database size in pages after commit (0 for non-commit)
///   8       8   Salt copy (must match the header)
///  16       8   Cumulative checksum through this frame
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalFrameHeader {
    /// Destination page number.
    pub page_number: u32,
    /// Database size after commit; nonzero marks a commit frame.
    pub db_size: u32,
    /// Salt copy.
    pub salts: WalSalts,
    /// Cumulative checksum.
    pub checksum: WalChecksum,
}

impl WalFrameHeader {
    /// Whether this frame commits the preceding frames.
    #[must_use]
    pub const fn is_commit(&self) -> bool {
        self.db_size > 0
    }

    /// Parse a frame header from at least 24 bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, WAL_FRAME_HEADER_SIZE, "WAL frame header")?;
        Ok(Self {
            page_number: read_be_u32(buf, 0),
            db_size: read_be_u32(buf, FRAME_DB_SIZE),
            salts: WalSalts {
                salt1: read_be_u32(buf, FRAME_SALT1),
                salt2: read_be_u32(buf, FRAME_SALT2),
            },
            checksum: WalChecksum {
                s1: read_be_u32(buf, FRAME_CKSUM1),
                s2: read_be_u32(buf, FRAME_CKSUM2),
            },
        })
    }
}

/// Compute the cumulative checksum of one frame given the prior running
/// checksum. The input is the first 8 bytes of the frame header plus the
/// page content; salts and the checksum itself are excluded.
pub fn frame_checksum(
    frame: &[u8],
    page_size: usize,
    previous: WalChecksum,
    big_endian: bool,
) -> Result<WalChecksum> {
    ensure_len(frame, WAL_FRAME_HEADER_SIZE + page_size, "WAL frame")?;
    let header_part = rolling_checksum(&frame[..8], previous, big_endian)?;
    rolling_checksum(
        &frame[WAL_FRAME_HEADER_SIZE..WAL_FRAME_HEADER_SIZE + page_size],
        header_part,
        big_endian,
    )
}

/// Fill in the salts and checksum of an assembled frame, returning the
/// new running checksum.
pub fn seal_frame(
    frame: &mut [u8],
    page_size: usize,
    salts: WalSalts,
    previous: WalChecksum,
    big_endian: bool,
) -> Result<WalChecksum> {
    ensure_len(frame, WAL_FRAME_HEADER_SIZE + page_size, "WAL frame")?;
    write_be_u32(frame, FRAME_SALT1, salts.salt1);
    write_be_u32(frame, FRAME_SALT2, salts.salt2);
    let checksum = frame_checksum(frame, page_size, previous, big_endian)?;
    write_be_u32(frame, FRAME_CKSUM1, checksum.s1);
    write_be_u32(frame, FRAME_CKSUM2, checksum.s2);
    Ok(checksum)
}

/// Rolling checksum over 8-byte chunks.
pub fn rolling_checksum(data: &[u8], seed: WalChecksum, big_endian: bool) -> Result<WalChecksum> {
    if data.len() % 8 != 0 {
        return Err(QuarryError::WalCorrupt {
            detail: format!(
                "checksum input must be 8-byte aligned, got {} bytes",
                data.len()
            ),
        });
    }

    let mut s1 = seed.s1;
    let mut s2 = seed.s2;
    for chunk in data.chunks_exact(8) {
        let first = decode_word(&chunk[..4], big_endian);
        let second = decode_word(&chunk[4..], big_endian);
        s1 = s1.wrapping_add(first).wrapping_add(s2);
        s2 = s2.wrapping_add(second).wrapping_add(s1);
    }
    Ok(WalChecksum { s1, s2 })
}

fn decode_word(bytes: &[u8], big_endian: bool) -> u32 {
    let raw: [u8; 4] = bytes.try_into().expect("4-byte word");
    if big_endian {
        u32::from_be_bytes(raw)
    } else {
        u32::from_le_bytes(raw)
    }
}

fn read_be_u32(buf: &[u8], offset: usize) -> u32 {
    let raw: [u8; 4] = buf[offset..offset + 4].try_into().expect("4-byte field");
    u32::from_be_bytes(raw)
}

fn write_be_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn ensure_len(buf: &[u8], minimum: usize, label: &str) -> Result<()> {
    if buf.len() < minimum {
        return Err(QuarryError::WalCorrupt {
            detail: format!("{label} too small: expected >= {minimum}, got {}", buf.len()),
        });
    }
    Ok(())
}
