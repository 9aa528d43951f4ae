//! WAL reader implementation
//!
//! Parses one segment file into its logical records: refills fixed-size
//! blocks from a sequential source, verifies checksums, reassembles
//! fragmented records and reports anything it has to drop. Corruption is
//! absorbed and reported, never returned; an I/O error finishes the reader.

use super::{
    unmask_crc, RecordType, RecoveryMode, Reporter, BLOCK_SIZE, HEADER_SIZE, RECYCLED_HEADER_SIZE,
};
use crate::EmberError;
use bytes::{Buf, Bytes, BytesMut};
use std::io::Read;
use std::sync::Arc;

/// Outcome of parsing one physical record
enum Physical {
    /// A whole record or one fragment of a larger one
    Fragment {
        kind: RecordType,
        data: Bytes,
        offset: u64,
    },
    /// End of the readable stream
    Eof,
    /// An unusable record was skipped (bad checksum, zero fill, unknown
    /// type, or one ending before the initial offset)
    BadRecord,
    /// A record torn mid-write at the end of the file
    BadHeader { dropped: usize },
    /// A leftover record from a previous user of this file
    OldRecord,
}

/// Outcome of refilling the block buffer
enum Refill {
    Ok,
    Eof,
    BadHeader(usize),
}

/// Reads logical records from one WAL segment.
///
/// The reader consumes the source strictly forward in [`BLOCK_SIZE`] units
/// and never returns a record that starts before the configured initial
/// offset. Unfragmented records are zero-copy slices of the block buffer.
pub struct LogReader<R: Read> {
    src: R,
    reporter: Option<Arc<dyn Reporter>>,
    verify_checksums: bool,
    recovery_mode: RecoveryMode,

    /// Unconsumed remainder of the current block
    buffer: BytesMut,
    /// Last refill returned fewer than [`BLOCK_SIZE`] bytes
    eof: bool,
    /// The source failed; the reader is finished
    read_error: bool,
    /// Bytes received from the short block when EOF was detected
    eof_offset: usize,
    /// Offset of the first byte past `buffer` within the segment
    end_of_buffer_offset: u64,
    /// Offset where the last returned record begins
    last_record_offset: u64,
    /// Records ending before this offset are skipped
    initial_offset: u64,
    /// Identity of this segment, for old-record detection
    log_number: u64,
    initial_skip_done: bool,
}

impl<R: Read> LogReader<R> {
    /// Create a reader over one segment's byte stream
    pub fn new(src: R, log_number: u64) -> Self {
        Self {
            src,
            reporter: None,
            verify_checksums: true,
            recovery_mode: RecoveryMode::default(),
            buffer: BytesMut::new(),
            eof: false,
            read_error: false,
            eof_offset: 0,
            end_of_buffer_offset: 0,
            last_record_offset: 0,
            initial_offset: 0,
            log_number,
            initial_skip_done: false,
        }
    }

    /// Report dropped bytes through `reporter`
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Toggle checksum verification
    pub fn with_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Start at the first record located at or after `offset`
    pub fn with_initial_offset(mut self, offset: u64) -> Self {
        self.initial_offset = offset;
        self
    }

    /// Select the damaged-tail policy
    pub fn with_recovery_mode(mut self, mode: RecoveryMode) -> Self {
        self.recovery_mode = mode;
        self
    }

    /// Read the next logical record.
    ///
    /// Returns `None` at end of stream. Corruption is reported to the
    /// reporter and skipped rather than returned.
    pub fn read_record(&mut self) -> Option<Bytes> {
        if self.read_error {
            return None;
        }
        if !self.initial_skip_done {
            if !self.skip_to_initial_block() {
                return None;
            }
            self.initial_skip_done = true;
        }

        let mut scratch = BytesMut::new();
        let mut in_fragmented_record = false;
        // Offset of the fragmented record being assembled
        let mut prospective_offset = 0u64;

        loop {
            match self.read_physical_record() {
                Physical::Fragment { kind, data, offset } => match kind {
                    RecordType::Full | RecordType::RecycledFull => {
                        if in_fragmented_record && !scratch.is_empty() {
                            self.report_corruption(scratch.len(), "partial record without end");
                        }
                        self.last_record_offset = offset;
                        return Some(data);
                    }
                    RecordType::First | RecordType::RecycledFirst => {
                        if in_fragmented_record && !scratch.is_empty() {
                            self.report_corruption(scratch.len(), "partial record without end");
                        }
                        prospective_offset = offset;
                        scratch.clear();
                        scratch.extend_from_slice(&data);
                        in_fragmented_record = true;
                    }
                    RecordType::Middle | RecordType::RecycledMiddle => {
                        if !in_fragmented_record {
                            self.report_corruption(
                                data.len(),
                                "missing start of fragmented record",
                            );
                        } else {
                            scratch.extend_from_slice(&data);
                        }
                    }
                    RecordType::Last | RecordType::RecycledLast => {
                        if !in_fragmented_record {
                            self.report_corruption(
                                data.len(),
                                "missing start of fragmented record",
                            );
                        } else {
                            scratch.extend_from_slice(&data);
                            self.last_record_offset = prospective_offset;
                            return Some(scratch.freeze());
                        }
                    }
                    RecordType::Zero => {
                        self.report_corruption(data.len(), "unknown record type");
                        scratch.clear();
                        in_fragmented_record = false;
                    }
                },
                Physical::BadHeader { dropped } => {
                    if self.recovery_mode == RecoveryMode::AbsoluteConsistency {
                        self.report_corruption(dropped, "truncated record at end of file");
                    }
                    if in_fragmented_record {
                        if self.recovery_mode == RecoveryMode::AbsoluteConsistency {
                            self.report_corruption(scratch.len(), "error reading trailing data");
                        }
                        // Crash while appending; drop the incomplete
                        // logical record
                    }
                    return None;
                }
                Physical::Eof => {
                    if in_fragmented_record {
                        if self.recovery_mode == RecoveryMode::AbsoluteConsistency {
                            self.report_corruption(scratch.len(), "error reading trailing data");
                        }
                    }
                    return None;
                }
                Physical::OldRecord => {
                    if self.recovery_mode != RecoveryMode::SkipAnyCorruptedRecords {
                        // A record of an earlier user of this file marks
                        // the end of live data
                        if in_fragmented_record {
                            if self.recovery_mode == RecoveryMode::AbsoluteConsistency {
                                self.report_corruption(
                                    scratch.len(),
                                    "error reading trailing data",
                                );
                            }
                        }
                        return None;
                    }
                    if in_fragmented_record {
                        self.report_corruption(scratch.len(), "error in middle of record");
                        in_fragmented_record = false;
                        scratch.clear();
                    }
                }
                Physical::BadRecord => {
                    if in_fragmented_record {
                        self.report_corruption(scratch.len(), "error in middle of record");
                        in_fragmented_record = false;
                        scratch.clear();
                    }
                }
            }
        }
    }

    /// Physical offset where the last returned record begins.
    ///
    /// Undefined before the first successful [`read_record`](Self::read_record).
    pub fn last_record_offset(&self) -> u64 {
        self.last_record_offset
    }

    /// True once the source has reported end of stream
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Resume reading after the writer appended more data.
    ///
    /// Realigns with the writer's block boundaries by consuming the
    /// remainder of the block that was only partially read at EOF.
    pub fn unmark_eof(&mut self) {
        if self.read_error {
            return;
        }
        self.eof = false;
        if self.eof_offset == 0 {
            return;
        }

        let remaining = BLOCK_SIZE - self.eof_offset;
        let mut tail = vec![0u8; remaining];
        match read_full(&mut self.src, &mut tail) {
            Ok(n) => {
                self.buffer.extend_from_slice(&tail[..n]);
                self.end_of_buffer_offset += n as u64;
                if n < remaining {
                    self.eof = true;
                    self.eof_offset += n;
                } else {
                    self.eof_offset = 0;
                }
            }
            Err(e) => {
                self.read_error = true;
                self.report_drop(remaining, EmberError::Io(e));
            }
        }
    }

    /// Position the stream at the block holding `initial_offset` by reading
    /// and discarding, then consume the intra-block prefix.
    ///
    /// Returns false if the source failed, which finishes the reader.
    fn skip_to_initial_block(&mut self) -> bool {
        let offset_in_block = (self.initial_offset % BLOCK_SIZE as u64) as usize;
        let mut block_start = self.initial_offset - offset_in_block as u64;
        let mut prefix = offset_in_block;

        // A header never starts inside a block's zero trailer
        if offset_in_block + HEADER_SIZE > BLOCK_SIZE {
            block_start += BLOCK_SIZE as u64;
            prefix = 0;
        }

        self.end_of_buffer_offset = block_start;

        let mut remaining = block_start;
        if remaining > 0 {
            let mut junk = vec![0u8; BLOCK_SIZE];
            while remaining > 0 {
                let want = remaining.min(BLOCK_SIZE as u64) as usize;
                match read_full(&mut self.src, &mut junk[..want]) {
                    Ok(n) => {
                        if n < want {
                            // The segment ends before the requested offset
                            self.eof = true;
                            self.eof_offset = 0;
                            return true;
                        }
                        remaining -= n as u64;
                    }
                    Err(e) => {
                        self.read_error = true;
                        // Not routed through report_drop: the skipped
                        // region lies before initial_offset
                        if let Some(reporter) = &self.reporter {
                            reporter.corruption(block_start as usize, &EmberError::Io(e));
                        }
                        return false;
                    }
                }
            }
        }

        if prefix > 0 {
            if matches!(self.read_more(), Refill::Ok) {
                let n = prefix.min(self.buffer.len());
                self.buffer.advance(n);
            }
        }
        !self.read_error
    }

    /// Parse the next physical record out of the block buffer, refilling as
    /// needed
    fn read_physical_record(&mut self) -> Physical {
        loop {
            let mut need = HEADER_SIZE;
            if self.buffer.len() >= HEADER_SIZE && is_recycled_byte(self.buffer[6]) {
                need = RECYCLED_HEADER_SIZE;
            }
            if self.buffer.len() < need {
                match self.read_more() {
                    Refill::Ok => continue,
                    Refill::Eof => return Physical::Eof,
                    Refill::BadHeader(dropped) => return Physical::BadHeader { dropped },
                }
            }

            let length = u16::from_le_bytes([self.buffer[4], self.buffer[5]]) as usize;
            let type_byte = self.buffer[6];
            let header_size = if is_recycled_byte(type_byte) {
                RECYCLED_HEADER_SIZE
            } else {
                HEADER_SIZE
            };

            if header_size + length > self.buffer.len() {
                let dropped = self.buffer.len();
                self.buffer.clear();
                if !self.eof {
                    // The length points past the block: the header is
                    // corrupt and the remainder is unparseable
                    self.report_corruption(dropped, "bad record length");
                    return Physical::BadRecord;
                }
                // The writer died mid-append; the tail policy upstream
                // decides what to report
                return Physical::BadHeader { dropped };
            }

            if type_byte == RecordType::Zero.as_byte() && length == 0 {
                // Zero-filled preallocated region; nothing left to parse in
                // this block, and no drop to report
                self.buffer.clear();
                return Physical::BadRecord;
            }

            if self.verify_checksums {
                let expected = unmask_crc(u32::from_le_bytes([
                    self.buffer[0],
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                ]));
                let actual = crc32c::crc32c(&self.buffer[6..header_size + length]);
                if actual != expected {
                    // Length already validated against the block, so
                    // records after this one stay parseable
                    let dropped = header_size + length;
                    self.buffer.advance(dropped);
                    self.report_drop(dropped, EmberError::ChecksumMismatch { expected, actual });
                    return Physical::BadRecord;
                }
            }

            let kind = match RecordType::from_byte(type_byte) {
                Some(kind) => kind,
                None => {
                    let dropped = header_size + length;
                    self.buffer.advance(dropped);
                    self.report_corruption(dropped, &format!("unknown record type {}", type_byte));
                    return Physical::BadRecord;
                }
            };

            if kind.is_recycled() {
                let tag = u32::from_le_bytes([
                    self.buffer[7],
                    self.buffer[8],
                    self.buffer[9],
                    self.buffer[10],
                ]);
                if u64::from(tag) < self.log_number {
                    self.buffer.advance(header_size + length);
                    return Physical::OldRecord;
                }
            }

            let mut record = self.buffer.split_to(header_size + length);
            record.advance(header_size);
            let offset = self.end_of_buffer_offset
                - self.buffer.len() as u64
                - (header_size + length) as u64;

            if offset + ((header_size + length) as u64) < self.initial_offset {
                // Ends before the requested start; skip without reporting
                return Physical::BadRecord;
            }

            return Physical::Fragment {
                kind,
                data: record.freeze(),
                offset,
            };
        }
    }

    /// Refill the block buffer from the source.
    ///
    /// Any remainder shorter than a header is block padding and is
    /// discarded, unless EOF was already reached, in which case it is a
    /// header torn by a crash mid-append.
    fn read_more(&mut self) -> Refill {
        if !self.eof && !self.read_error {
            self.buffer.clear();
            self.buffer.resize(BLOCK_SIZE, 0);
            match read_full(&mut self.src, &mut self.buffer) {
                Ok(n) => {
                    self.buffer.truncate(n);
                    self.end_of_buffer_offset += n as u64;
                    if n < BLOCK_SIZE {
                        self.eof = true;
                        self.eof_offset = n;
                    }
                    Refill::Ok
                }
                Err(e) => {
                    self.buffer.clear();
                    self.read_error = true;
                    self.report_drop(BLOCK_SIZE, EmberError::Io(e));
                    Refill::Eof
                }
            }
        } else if !self.buffer.is_empty() {
            let dropped = self.buffer.len();
            self.buffer.clear();
            Refill::BadHeader(dropped)
        } else {
            Refill::Eof
        }
    }

    fn report_corruption(&self, bytes: usize, reason: &str) {
        self.report_drop(bytes, EmberError::Corruption(reason.to_string()));
    }

    /// Drops entirely before the initial offset are not reported
    fn report_drop(&self, bytes: usize, reason: EmberError) {
        if let Some(reporter) = &self.reporter {
            let drop_start = self
                .end_of_buffer_offset
                .saturating_sub(self.buffer.len() as u64)
                .saturating_sub(bytes as u64);
            if drop_start >= self.initial_offset {
                reporter.corruption(bytes, &reason);
            }
        }
    }
}

fn is_recycled_byte(type_byte: u8) -> bool {
    (RecordType::RecycledFull.as_byte()..=RecordType::RecycledLast.as_byte()).contains(&type_byte)
}

/// Read until `buf` is full or the source is exhausted
fn read_full<R: Read>(src: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
