//! WAL segment files and the live/archive directory layout

use crate::{Result, SequenceNumber};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Subdirectory of the WAL directory where rotated segments are archived
pub const ARCHIVE_DIR: &str = "archive";

/// Where a segment file lived when the WAL directory was listed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalFileKind {
    /// In the live WAL directory
    Live,
    /// Moved to the archive directory
    Archived,
}

/// Descriptor of one WAL segment file
#[derive(Debug, Clone)]
pub struct LogFile {
    log_number: u64,
    kind: WalFileKind,
    start_sequence: SequenceNumber,
    size_bytes: u64,
}

impl LogFile {
    /// Create a descriptor
    pub fn new(
        log_number: u64,
        kind: WalFileKind,
        start_sequence: SequenceNumber,
        size_bytes: u64,
    ) -> Self {
        Self {
            log_number,
            kind,
            start_sequence,
            size_bytes,
        }
    }

    /// Segment identity; ascending across the WAL
    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    /// Live or archived at listing time
    pub fn kind(&self) -> WalFileKind {
        self.kind
    }

    /// Sequence number of the first batch expected in this segment
    pub fn start_sequence(&self) -> SequenceNumber {
        self.start_sequence
    }

    /// File size at listing time
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Path of this segment under the WAL directory
    pub fn path(&self, dir: &Path) -> PathBuf {
        match self.kind {
            WalFileKind::Live => log_file_path(dir, self.log_number),
            WalFileKind::Archived => archived_log_file_path(dir, self.log_number),
        }
    }
}

/// Path of a live segment: `<dir>/<log_number>.log`
pub fn log_file_path(dir: &Path, log_number: u64) -> PathBuf {
    dir.join(format!("{:06}.log", log_number))
}

/// Path of an archived segment: `<dir>/archive/<log_number>.log`
pub fn archived_log_file_path(dir: &Path, log_number: u64) -> PathBuf {
    dir.join(ARCHIVE_DIR).join(format!("{:06}.log", log_number))
}

/// Opens segment byte streams, tolerating live-to-archive rotation
#[derive(Debug, Clone)]
pub struct SegmentOpener {
    dir: PathBuf,
}

impl SegmentOpener {
    /// Create an opener rooted at the WAL directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Open the byte stream for a segment.
    ///
    /// A live segment may have rotated to the archive between listing and
    /// open; retry there before giving up.
    pub fn open(&self, log_file: &LogFile) -> Result<File> {
        match File::open(log_file.path(&self.dir)) {
            Ok(file) => Ok(file),
            Err(primary) => match log_file.kind() {
                WalFileKind::Live => {
                    let path = archived_log_file_path(&self.dir, log_file.log_number());
                    Ok(File::open(path)?)
                }
                WalFileKind::Archived => Err(primary.into()),
            },
        }
    }
}
