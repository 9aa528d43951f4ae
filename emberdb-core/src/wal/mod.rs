//! Write-Ahead Log (WAL) implementation
//!
//! The WAL provides durability by writing all changes to disk before
//! committing them to memory. Each segment file is a concatenation of
//! fixed-size blocks; a block holds one or more physical records. A logical
//! record (one serialized write batch) is stored as a single `Full` record,
//! or as a `First`..`Middle`..`Last` chain of fragments when it crosses a
//! block boundary.
//!
//! ## Physical record format
//!
//! ```text
//! | crc32c (4, masked, LE) | length (2, LE) | type (1) | payload (length) |
//! ```
//!
//! The checksum is a masked CRC-32C over the type byte and the payload. A
//! block with fewer than seven trailing bytes cannot hold a header; the
//! writer zero-fills the trailer and the reader skips it.
//!
//! Recycled record types carry an extra 32-bit log number after the type
//! byte, so a reader can tell leftover records of a previous user of the
//! file apart from live data.

mod batch;
mod iterator;
mod reader;
mod segment;
mod writer;

pub use batch::{BatchResult, WriteBatch, BATCH_HEADER_SIZE};
pub use iterator::TransactionLogIterator;
pub use reader::LogReader;
pub use segment::{
    archived_log_file_path, log_file_path, LogFile, SegmentOpener, WalFileKind, ARCHIVE_DIR,
};
pub use writer::LogWriter;

use crate::EmberError;
use tracing::{error, info};

/// Size of one WAL block
pub const BLOCK_SIZE: usize = 32768;

/// Header size for base record types: crc32c (4) + length (2) + type (1)
pub const HEADER_SIZE: usize = 7;

/// Header size for recycled record types: base header + log number (4)
pub const RECYCLED_HEADER_SIZE: usize = 11;

const CRC_MASK_DELTA: u32 = 0xa282_ead8;

/// Mask a CRC so that checksums of data containing embedded checksums do
/// not alias the header encoding
pub fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(CRC_MASK_DELTA)
}

/// Invert [`mask_crc`]
pub fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(CRC_MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

/// Physical record type stored in the header's type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Preallocated file regions are zero-filled
    Zero = 0,
    /// A logical record held entirely in one physical record
    Full = 1,
    /// First fragment of a logical record
    First = 2,
    /// Interior fragment
    Middle = 3,
    /// Final fragment
    Last = 4,
    /// Like `Full`, tagged with the log number that wrote it
    RecycledFull = 5,
    /// Like `First`, tagged with the log number that wrote it
    RecycledFirst = 6,
    /// Like `Middle`, tagged with the log number that wrote it
    RecycledMiddle = 7,
    /// Like `Last`, tagged with the log number that wrote it
    RecycledLast = 8,
}

impl RecordType {
    /// Converts a byte to a record type
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Zero),
            1 => Some(Self::Full),
            2 => Some(Self::First),
            3 => Some(Self::Middle),
            4 => Some(Self::Last),
            5 => Some(Self::RecycledFull),
            6 => Some(Self::RecycledFirst),
            7 => Some(Self::RecycledMiddle),
            8 => Some(Self::RecycledLast),
            _ => None,
        }
    }

    /// Converts the record type to a byte
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// True for the recycled family, whose header carries a log number
    pub fn is_recycled(self) -> bool {
        matches!(
            self,
            Self::RecycledFull | Self::RecycledFirst | Self::RecycledMiddle | Self::RecycledLast
        )
    }

    /// On-disk header size for this type
    pub fn header_size(self) -> usize {
        if self.is_recycled() {
            RECYCLED_HEADER_SIZE
        } else {
            HEADER_SIZE
        }
    }
}

/// Policy for a damaged WAL tail during recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    /// Silently discard an incomplete trailing record (crash mid-append)
    TolerateCorruptedTailRecords,
    /// Report any tail damage; a clean shutdown leaves none
    AbsoluteConsistency,
    /// Stop replay at the last complete batch
    PointInTimeRecovery,
    /// Skip over anything unparseable and keep going
    SkipAnyCorruptedRecords,
}

impl Default for RecoveryMode {
    fn default() -> Self {
        RecoveryMode::TolerateCorruptedTailRecords
    }
}

/// Read-time options for WAL iteration
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    /// Verify record checksums while reading
    pub verify_checksums: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: true,
        }
    }
}

/// Sink for diagnostics emitted while reading a log.
///
/// Invoked synchronously from the reading thread; an implementation shared
/// across iterators must be thread-safe.
pub trait Reporter: Send + Sync {
    /// Some data was dropped; `bytes` is the approximate number lost
    fn corruption(&self, bytes: usize, reason: &EmberError);

    /// Transient notice about iterator progress
    fn info(&self, message: &str);
}

/// Default reporter forwarding diagnostics to `tracing`
#[derive(Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn corruption(&self, bytes: usize, reason: &EmberError) {
        error!("dropping {} bytes; {}", bytes, reason);
    }

    fn info(&self, message: &str) {
        info!("{}", message);
    }
}
