//! Write-ahead log backend for the Quarry storage engine.

pub mod checksum;
pub mod wal;

pub use checksum::{
    WAL_FRAME_HEADER_SIZE, WAL_FORMAT_VERSION, WAL_HEADER_SIZE, WAL_MAGIC_BE, WAL_MAGIC_LE,
    WalChecksum, WalFrameHeader, WalHeader, WalSalts,
};
pub use wal::{CheckpointStats, CheckpointWriter, Wal, WalSnapshot};
