//! WAL writer implementation
//!
//! Produces the block/record format consumed by [`LogReader`]: each logical
//! record becomes one `Full` physical record, or a `First`..`Middle`..`Last`
//! chain when it crosses a block boundary. Block trailers too short for a
//! header are zero-filled so the reader can realign.
//!
//! [`LogReader`]: super::LogReader

use super::{mask_crc, RecordType, BLOCK_SIZE, HEADER_SIZE, RECYCLED_HEADER_SIZE};
use crate::Result;
use bytes::{BufMut, BytesMut};
use std::io::Write;

const ZERO_TRAILER: [u8; RECYCLED_HEADER_SIZE] = [0; RECYCLED_HEADER_SIZE];

/// Appends logical records to one WAL segment
pub struct LogWriter<W: Write> {
    dest: W,
    block_offset: usize,
    log_number: u64,
    recycle: bool,
}

impl<W: Write> LogWriter<W> {
    /// Create a writer emitting base record types
    pub fn new(dest: W) -> Self {
        Self {
            dest,
            block_offset: 0,
            log_number: 0,
            recycle: false,
        }
    }

    /// Create a writer emitting recycled record types tagged with
    /// `log_number`
    pub fn recycled(dest: W, log_number: u64) -> Self {
        Self {
            dest,
            block_offset: 0,
            log_number,
            recycle: true,
        }
    }

    /// Append one logical record, fragmenting across blocks as needed
    pub fn add_record(&mut self, payload: &[u8]) -> Result<()> {
        let header_size = if self.recycle {
            RECYCLED_HEADER_SIZE
        } else {
            HEADER_SIZE
        };

        let mut left = payload;
        let mut begin = true;
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < header_size {
                // Not even a header fits; zero-fill the trailer and start a
                // fresh block
                if leftover > 0 {
                    self.dest.write_all(&ZERO_TRAILER[..leftover])?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - header_size;
            let fragment_len = left.len().min(avail);
            let end = fragment_len == left.len();

            let kind = match (begin, end, self.recycle) {
                (true, true, false) => RecordType::Full,
                (true, false, false) => RecordType::First,
                (false, false, false) => RecordType::Middle,
                (false, true, false) => RecordType::Last,
                (true, true, true) => RecordType::RecycledFull,
                (true, false, true) => RecordType::RecycledFirst,
                (false, false, true) => RecordType::RecycledMiddle,
                (false, true, true) => RecordType::RecycledLast,
            };

            self.emit_physical_record(kind, &left[..fragment_len])?;
            left = &left[fragment_len..];
            begin = false;
            if end {
                break;
            }
        }
        Ok(())
    }

    /// Flush buffered bytes to the destination
    pub fn flush(&mut self) -> Result<()> {
        self.dest.flush()?;
        Ok(())
    }

    /// Current write offset within the open block
    pub fn block_offset(&self) -> usize {
        self.block_offset
    }

    fn emit_physical_record(&mut self, kind: RecordType, payload: &[u8]) -> Result<()> {
        let mut crc = crc32c::crc32c(&[kind.as_byte()]);
        if kind.is_recycled() {
            crc = crc32c::crc32c_append(crc, &(self.log_number as u32).to_le_bytes());
        }
        crc = crc32c::crc32c_append(crc, payload);

        let mut header = BytesMut::with_capacity(RECYCLED_HEADER_SIZE);
        header.put_u32_le(mask_crc(crc));
        header.put_u16_le(payload.len() as u16);
        header.put_u8(kind.as_byte());
        if kind.is_recycled() {
            header.put_u32_le(self.log_number as u32);
        }

        self.dest.write_all(&header)?;
        self.dest.write_all(payload)?;
        self.block_offset += header.len() + payload.len();
        Ok(())
    }
}
