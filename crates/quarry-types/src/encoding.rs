//! Big-endian field helpers for on-disk structures.
//!
//! All multibyte integers in the database file, rollback journal, and WAL
//! are stored big-endian. These helpers return `None` when the slice does
//! not cover the full field, so callers on fixed-size buffers can use
//! `expect("fixed field")` while variable-length parsers propagate the
//! failure.

/// Read a big-endian `u16` from the start of `buf`.
#[must_use]
pub fn read_u16_be(buf: &[u8]) -> Option<u16> {
    let raw: [u8; 2] = buf.get(..2)?.try_into().ok()?;
    Some(u16::from_be_bytes(raw))
}

/// Read a big-endian `u32` from the start of `buf`.
#[must_use]
pub fn read_u32_be(buf: &[u8]) -> Option<u32> {
    let raw: [u8; 4] = buf.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(raw))
}

/// Read a big-endian `i32` from the start of `buf`.
#[must_use]
pub fn read_i32_be(buf: &[u8]) -> Option<i32> {
    let raw: [u8; 4] = buf.get(..4)?.try_into().ok()?;
    Some(i32::from_be_bytes(raw))
}

/// Write a big-endian `u16` at the start of `buf`.
pub fn write_u16_be(buf: &mut [u8], value: u16) -> Option<()> {
    buf.get_mut(..2)?.copy_from_slice(&value.to_be_bytes());
    Some(())
}

/// Write a big-endian `u32` at the start of `buf`.
pub fn write_u32_be(buf: &mut [u8], value: u32) -> Option<()> {
    buf.get_mut(..4)?.copy_from_slice(&value.to_be_bytes());
    Some(())
}

/// Write a big-endian `i32` at the start of `buf`.
pub fn write_i32_be(buf: &mut [u8], value: i32) -> Option<()> {
    buf.get_mut(..4)?.copy_from_slice(&value.to_be_bytes());
    Some(())
}
