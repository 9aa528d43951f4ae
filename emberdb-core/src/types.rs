//! Core types for EmberDB

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotone identifier assigned by the writer to every operation
pub type SequenceNumber = u64;

/// Publishes the highest sequence number durable to the store.
///
/// The transaction-log iterator consults this before every read so it never
/// hands out a batch the rest of the system has not acknowledged yet. Reads
/// are lock-free; the write path updates it after each durable append.
#[derive(Debug, Default)]
pub struct VersionSet {
    last_sequence: AtomicU64,
}

impl VersionSet {
    /// Create a version set with the given last durable sequence
    pub fn new(last_sequence: SequenceNumber) -> Self {
        Self {
            last_sequence: AtomicU64::new(last_sequence),
        }
    }

    /// Highest sequence number durable to the store
    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence.load(Ordering::Acquire)
    }

    /// Publish a new last durable sequence
    pub fn set_last_sequence(&self, seq: SequenceNumber) {
        self.last_sequence.store(seq, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_set_publish() {
        let versions = VersionSet::new(10);
        assert_eq!(versions.last_sequence(), 10);

        versions.set_last_sequence(25);
        assert_eq!(versions.last_sequence(), 25);
    }
}
