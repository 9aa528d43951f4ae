//! Write batch envelope
//!
//! A batch is the unit the WAL stores: an opaque body prefixed by the
//! sequence number of its first operation and the number of operations it
//! carries. A batch occupies the sequence range
//! `[sequence, sequence + count - 1]`. The log layer never parses the body.

use crate::{EmberError, Result, SequenceNumber};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the `sequence (8, LE) + count (4, LE)` prefix
pub const BATCH_HEADER_SIZE: usize = 12;

/// An atomic group of mutations sharing a contiguous sequence range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    rep: Bytes,
}

impl WriteBatch {
    /// Adopt a stored batch serialization.
    ///
    /// Anything shorter than the 12-byte prefix is corruption.
    pub fn from_contents(rep: Bytes) -> Result<Self> {
        if rep.len() < BATCH_HEADER_SIZE {
            return Err(EmberError::Corruption(format!(
                "write batch too small: {} bytes",
                rep.len()
            )));
        }
        Ok(Self { rep })
    }

    /// Build a batch covering `count` sequence numbers starting at
    /// `sequence`, with an opaque body
    pub fn new(sequence: SequenceNumber, count: u32, body: &[u8]) -> Self {
        let mut rep = BytesMut::with_capacity(BATCH_HEADER_SIZE + body.len());
        rep.put_u64_le(sequence);
        rep.put_u32_le(count);
        rep.put_slice(body);
        Self { rep: rep.freeze() }
    }

    /// Sequence number of the first operation in the batch
    pub fn sequence(&self) -> SequenceNumber {
        (&self.rep[..8]).get_u64_le()
    }

    /// Number of operations in the batch
    pub fn count(&self) -> u32 {
        (&self.rep[8..12]).get_u32_le()
    }

    /// Sequence number of the last operation in the batch
    pub fn last_sequence(&self) -> SequenceNumber {
        self.sequence() + u64::from(self.count()).saturating_sub(1)
    }

    /// Stored serialization
    pub fn data(&self) -> &[u8] {
        &self.rep
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        self.rep.len()
    }
}

/// A batch handed out by the transaction-log iterator
#[derive(Debug)]
pub struct BatchResult {
    /// Sequence number of the batch's first operation
    pub sequence: SequenceNumber,
    /// The batch itself
    pub write_batch: WriteBatch,
}
