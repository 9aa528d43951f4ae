//! Transaction-log iterator
//!
//! A forward-only cursor over the write batches stored in an ordered list
//! of WAL segments. The iterator seeks to a caller-chosen sequence number,
//! validates that batches arrive in contiguous sequence order, reseeks
//! around gaps and surfaces discontinuities through [`status`].
//!
//! The iterator never reads past the version set's last durable sequence,
//! so batches the rest of the system has not acknowledged are invisible.
//!
//! [`status`]: TransactionLogIterator::status

use super::batch::{BatchResult, WriteBatch, BATCH_HEADER_SIZE};
use super::reader::LogReader;
use super::segment::{LogFile, SegmentOpener};
use super::{LogReporter, ReadOptions, Reporter};
use crate::{EmberError, Result, SequenceNumber, VersionSet};
use bytes::Bytes;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

/// Forward cursor over write batches spanning WAL segments
pub struct TransactionLogIterator {
    opener: SegmentOpener,
    read_options: ReadOptions,
    starting_sequence_number: SequenceNumber,
    files: Vec<LogFile>,
    versions: Arc<VersionSet>,
    reporter: Arc<dyn Reporter>,

    started: bool,
    is_valid: bool,
    current_file_index: usize,
    current_batch: Option<WriteBatch>,
    current_log_reader: Option<LogReader<File>>,
    /// Sequence number at the start of the current batch
    current_batch_seq: SequenceNumber,
    /// Last sequence in the current batch
    current_last_seq: SequenceNumber,
    current_status: Result<()>,
}

impl TransactionLogIterator {
    /// Create an iterator over `files` and seek to `starting_sequence`.
    ///
    /// `files` is sorted by ascending log number. An empty list leaves the
    /// iterator permanently invalid with an `Ok` status.
    pub fn new(
        dir: impl Into<PathBuf>,
        read_options: ReadOptions,
        starting_sequence: SequenceNumber,
        files: Vec<LogFile>,
        versions: Arc<VersionSet>,
    ) -> Self {
        Self::with_reporter(
            dir,
            read_options,
            starting_sequence,
            files,
            versions,
            Arc::new(LogReporter),
        )
    }

    /// Create an iterator routing diagnostics to a custom reporter
    pub fn with_reporter(
        dir: impl Into<PathBuf>,
        read_options: ReadOptions,
        starting_sequence: SequenceNumber,
        files: Vec<LogFile>,
        versions: Arc<VersionSet>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let mut iter = Self {
            opener: SegmentOpener::new(dir),
            read_options,
            starting_sequence_number: starting_sequence,
            files,
            versions,
            reporter,
            started: false,
            is_valid: false,
            current_file_index: 0,
            current_batch: None,
            current_log_reader: None,
            current_batch_seq: 0,
            current_last_seq: 0,
            current_status: Ok(()),
        };
        iter.seek_to_start_sequence(0, false);
        iter
    }

    /// True when the cursor rests on a usable batch
    pub fn valid(&self) -> bool {
        self.started && self.is_valid
    }

    /// Advance to the next batch
    pub fn next(&mut self) {
        self.next_impl(false);
    }

    /// Sticky iterator status; `Ok` after a clean end of the log
    pub fn status(&self) -> &Result<()> {
        &self.current_status
    }

    /// Hand the current batch out to the caller.
    ///
    /// Returns `None` unless [`valid`](Self::valid). The batch moves out,
    /// so calling again without an intervening [`next`](Self::next) also
    /// returns `None`.
    pub fn get_batch(&mut self) -> Option<BatchResult> {
        if !self.valid() {
            return None;
        }
        let write_batch = self.current_batch.take()?;
        Some(BatchResult {
            sequence: self.current_batch_seq,
            write_batch,
        })
    }

    /// Read the next record unless the current batch already reaches the
    /// last durable sequence
    fn restricted_read(&mut self) -> Option<Bytes> {
        if self.current_last_seq >= self.versions.last_sequence() {
            return None;
        }
        self.current_log_reader.as_mut()?.read_record()
    }

    /// Seek to `starting_sequence_number`, scanning from `start_file_index`.
    ///
    /// With `strict` set the first batch must begin exactly at the target
    /// sequence; this is the reseek path after a detected gap.
    fn seek_to_start_sequence(&mut self, start_file_index: usize, strict: bool) {
        self.started = false;
        self.is_valid = false;
        if start_file_index >= self.files.len() {
            return;
        }
        self.current_file_index = start_file_index;
        if let Err(e) = self.open_log_reader(start_file_index) {
            self.reporter.info(&e.to_string());
            self.current_status = Err(e);
            return;
        }

        while let Some(record) = self.restricted_read() {
            if record.len() < BATCH_HEADER_SIZE {
                self.reporter.corruption(
                    record.len(),
                    &EmberError::Corruption("very small log record".to_string()),
                );
                continue;
            }
            self.update_current_write_batch(record);
            if self.current_last_seq >= self.starting_sequence_number {
                if strict && self.current_batch_seq != self.starting_sequence_number {
                    let err = EmberError::Corruption(
                        "Gap in sequence number. Could not seek to required sequence number"
                            .to_string(),
                    );
                    self.reporter.info(&err.to_string());
                    self.current_status = Err(err);
                    return;
                } else if strict {
                    self.reporter
                        .info("Could seek required sequence number. Iterator will continue.");
                }
                self.is_valid = true;
                self.started = true;
                return;
            }
            self.is_valid = false;
        }

        // The start sequence was not in the file scanned above. Normally
        // that file is the only one; otherwise surface the error and let
        // the inner advance find the next available entry.
        if strict {
            let err = EmberError::Corruption(
                "Gap in sequence number. Could not seek to required sequence number".to_string(),
            );
            self.reporter.info(&err.to_string());
            self.current_status = Err(err);
        } else if self.files.len() != 1 {
            let err = EmberError::Corruption(
                "Start sequence was not found, skipping to the next available".to_string(),
            );
            self.reporter.info(&err.to_string());
            self.current_status = Err(err);
            // started stays false so the catch-up advance skips gap checks
            self.next_impl(true);
        }
    }

    fn next_impl(&mut self, internal: bool) {
        self.is_valid = false;
        if !internal && !self.started {
            // Runs every time until the start sequence is reachable
            return self.seek_to_start_sequence(0, false);
        }
        loop {
            if let Some(reader) = self.current_log_reader.as_mut() {
                if reader.is_eof() {
                    // The live tail may have grown since the last read
                    reader.unmark_eof();
                }
            }
            while let Some(record) = self.restricted_read() {
                if record.len() < BATCH_HEADER_SIZE {
                    self.reporter.corruption(
                        record.len(),
                        &EmberError::Corruption("very small log record".to_string()),
                    );
                    continue;
                }
                self.update_current_write_batch(record);
                if internal && !self.started {
                    self.started = true;
                }
                return;
            }

            // Current segment exhausted; open the next one
            if self.current_file_index + 1 < self.files.len() {
                self.current_file_index += 1;
                if let Err(e) = self.open_log_reader(self.current_file_index) {
                    self.is_valid = false;
                    self.current_status = Err(e);
                    return;
                }
            } else {
                self.is_valid = false;
                self.current_status = if self.current_last_seq == self.versions.last_sequence() {
                    Ok(())
                } else {
                    Err(EmberError::Corruption("NO MORE DATA LEFT".to_string()))
                };
                return;
            }
        }
    }

    /// Adopt `record` as the current batch if it continues the sequence;
    /// otherwise reseek to the expected sequence
    fn update_current_write_batch(&mut self, record: Bytes) {
        let batch = match WriteBatch::from_contents(record) {
            Ok(batch) => batch,
            Err(e) => {
                self.is_valid = false;
                self.current_status = Err(e);
                return;
            }
        };

        let expected_seq = self.current_last_seq + 1;
        let batch_seq = batch.sequence();
        if self.started && batch_seq != expected_seq {
            self.reporter.info(&format!(
                "Discontinuity in log records. Got seq={}, Expected seq={}, Last flushed seq={}. \
                 Log iterator will reseek the correct batch.",
                batch_seq,
                expected_seq,
                self.versions.last_sequence()
            ));
            // The missing batch may live in an earlier segment
            if expected_seq < self.files[self.current_file_index].start_sequence()
                && self.current_file_index > 0
            {
                self.current_file_index -= 1;
            }
            self.starting_sequence_number = expected_seq;
            // Overwritten with Ok if the reseek lands
            self.current_status = Err(EmberError::NotFound("Gap in sequence numbers".to_string()));
            return self.seek_to_start_sequence(self.current_file_index, true);
        }

        self.current_batch_seq = batch_seq;
        self.current_last_seq = batch.last_sequence();
        debug_assert!(self.current_last_seq <= self.versions.last_sequence());
        self.current_batch = Some(batch);
        self.is_valid = true;
        self.current_status = Ok(());
    }

    /// Open a fresh record reader over `files[index]`, always from offset 0
    fn open_log_reader(&mut self, index: usize) -> Result<()> {
        let log_file = &self.files[index];
        let file = self.opener.open(log_file)?;
        let reader = LogReader::new(file, log_file.log_number())
            .with_reporter(Arc::clone(&self.reporter))
            .with_checksums(self.read_options.verify_checksums);
        self.current_log_reader = Some(reader);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::segment::{archived_log_file_path, log_file_path, WalFileKind, ARCHIVE_DIR};
    use super::super::{LogWriter, HEADER_SIZE};
    use super::*;
    use parking_lot::Mutex;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CapturingReporter {
        drops: Mutex<Vec<(usize, String)>>,
        infos: Mutex<Vec<String>>,
    }

    impl Reporter for CapturingReporter {
        fn corruption(&self, bytes: usize, reason: &EmberError) {
            self.drops.lock().push((bytes, reason.to_string()));
        }

        fn info(&self, message: &str) {
            self.infos.lock().push(message.to_string());
        }
    }

    const BODY: &[u8] = b"opaque operations";

    /// Write one segment holding the given `(sequence, count)` batches and
    /// return its descriptor
    fn write_segment(
        dir: &Path,
        log_number: u64,
        batches: &[(SequenceNumber, u32)],
    ) -> LogFile {
        let path = log_file_path(dir, log_number);
        let mut writer = LogWriter::new(fs::File::create(&path).unwrap());
        for &(seq, count) in batches {
            let batch = WriteBatch::new(seq, count, BODY);
            writer.add_record(batch.data()).unwrap();
        }
        writer.flush().unwrap();

        let size = fs::metadata(&path).unwrap().len();
        LogFile::new(log_number, WalFileKind::Live, batches[0].0, size)
    }

    fn collect(iter: &mut TransactionLogIterator) -> Vec<SequenceNumber> {
        let mut seqs = Vec::new();
        while iter.valid() {
            let batch = iter.get_batch().unwrap();
            seqs.push(batch.sequence);
            iter.next();
        }
        seqs
    }

    #[test]
    fn test_clean_multi_segment_iteration() {
        let temp_dir = TempDir::new().unwrap();
        let batches1: Vec<_> = (1..=10).map(|s| (s, 1)).collect();
        let batches2: Vec<_> = (11..=20).map(|s| (s, 1)).collect();
        let files = vec![
            write_segment(temp_dir.path(), 1, &batches1),
            write_segment(temp_dir.path(), 2, &batches2),
        ];
        let versions = Arc::new(VersionSet::new(20));

        let mut iter = TransactionLogIterator::new(
            temp_dir.path(),
            ReadOptions::default(),
            1,
            files,
            versions,
        );
        let seqs = collect(&mut iter);
        assert_eq!(seqs, (1..=20).collect::<Vec<_>>());
        assert!(!iter.valid());
        assert!(iter.status().is_ok());
    }

    #[test]
    fn test_start_mid_segment() {
        let temp_dir = TempDir::new().unwrap();
        let batches1: Vec<_> = (1..=10).map(|s| (s, 1)).collect();
        let batches2: Vec<_> = (11..=20).map(|s| (s, 1)).collect();
        let files = vec![
            write_segment(temp_dir.path(), 1, &batches1),
            write_segment(temp_dir.path(), 2, &batches2),
        ];
        let versions = Arc::new(VersionSet::new(20));

        let mut iter = TransactionLogIterator::new(
            temp_dir.path(),
            ReadOptions::default(),
            15,
            files,
            versions,
        );
        assert_eq!(collect(&mut iter), (15..=20).collect::<Vec<_>>());
        assert!(iter.status().is_ok());
    }

    #[test]
    fn test_start_inside_batch() {
        // The first batch returned is the one whose range covers the start
        let temp_dir = TempDir::new().unwrap();
        let files = vec![write_segment(temp_dir.path(), 1, &[(1, 3), (4, 5), (9, 2)])];
        let versions = Arc::new(VersionSet::new(10));

        let mut iter = TransactionLogIterator::new(
            temp_dir.path(),
            ReadOptions::default(),
            6,
            files,
            versions,
        );
        assert!(iter.valid());
        assert_eq!(collect(&mut iter), vec![4, 9]);
        assert!(iter.status().is_ok());
    }

    #[test]
    fn test_batch_counts_cover_last_sequence() {
        let temp_dir = TempDir::new().unwrap();
        let files = vec![write_segment(
            temp_dir.path(),
            1,
            &[(1, 3), (4, 1), (5, 4), (9, 2)],
        )];
        let versions = Arc::new(VersionSet::new(10));

        let mut iter = TransactionLogIterator::new(
            temp_dir.path(),
            ReadOptions::default(),
            1,
            files,
            versions.clone(),
        );
        let mut total = 0u64;
        while iter.valid() {
            total += u64::from(iter.get_batch().unwrap().write_batch.count());
            iter.next();
        }
        assert_eq!(total, versions.last_sequence());
        assert!(iter.status().is_ok());
    }

    #[test]
    fn test_corruption_triggers_gap_reseek() {
        let temp_dir = TempDir::new().unwrap();
        let batches: Vec<_> = (1..=5).map(|s| (s, 1)).collect();
        let files = vec![write_segment(temp_dir.path(), 1, &batches)];
        let versions = Arc::new(VersionSet::new(5));

        // Flip one payload byte inside the third record
        let path = log_file_path(temp_dir.path(), 1);
        let mut raw = fs::read(&path).unwrap();
        let record_len = HEADER_SIZE + BATCH_HEADER_SIZE + BODY.len();
        raw[2 * record_len + HEADER_SIZE + BATCH_HEADER_SIZE] ^= 0xFF;
        fs::write(&path, raw).unwrap();

        let reporter = Arc::new(CapturingReporter::default());
        let mut iter = TransactionLogIterator::with_reporter(
            temp_dir.path(),
            ReadOptions::default(),
            1,
            files,
            versions,
            reporter.clone(),
        );

        // Batches 1 and 2 come through; batch 4 then breaks continuity and
        // the strict reseek cannot land on the missing sequence 3
        assert_eq!(collect(&mut iter), vec![1, 2]);
        let err = iter.status().as_ref().unwrap_err();
        assert!(err.to_string().contains("Gap in sequence number"));

        let drops = reporter.drops.lock();
        assert!(drops
            .iter()
            .any(|(bytes, reason)| *bytes == record_len && reason.contains("Checksum mismatch")));
        assert!(reporter
            .infos
            .lock()
            .iter()
            .any(|m| m.contains("Discontinuity")));
    }

    #[test]
    fn test_truncated_tail_unclean_end() {
        let temp_dir = TempDir::new().unwrap();
        let batches: Vec<_> = (1..=10).map(|s| (s, 1)).collect();
        let files = vec![write_segment(temp_dir.path(), 1, &batches)];
        let versions = Arc::new(VersionSet::new(10));

        // Cut the last record's payload short
        let path = log_file_path(temp_dir.path(), 1);
        let len = fs::metadata(&path).unwrap().len();
        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();

        let mut iter = TransactionLogIterator::new(
            temp_dir.path(),
            ReadOptions::default(),
            1,
            files,
            versions,
        );
        assert_eq!(collect(&mut iter), (1..=9).collect::<Vec<_>>());
        let err = iter.status().as_ref().unwrap_err();
        assert!(err.to_string().contains("NO MORE DATA LEFT"));
    }

    #[test]
    fn test_rotation_to_archive_during_iteration() {
        let temp_dir = TempDir::new().unwrap();
        let batches: Vec<_> = (1..=5).map(|s| (s, 1)).collect();
        let files = vec![write_segment(temp_dir.path(), 1, &batches)];
        let versions = Arc::new(VersionSet::new(5));

        // Rotate the segment away after listing but before open
        fs::create_dir(temp_dir.path().join(ARCHIVE_DIR)).unwrap();
        fs::rename(
            log_file_path(temp_dir.path(), 1),
            archived_log_file_path(temp_dir.path(), 1),
        )
        .unwrap();

        let mut iter = TransactionLogIterator::new(
            temp_dir.path(),
            ReadOptions::default(),
            1,
            files,
            versions,
        );
        assert_eq!(collect(&mut iter), (1..=5).collect::<Vec<_>>());
        assert!(iter.status().is_ok());
    }

    #[test]
    fn test_missing_start_sequence_skips_to_next_segment() {
        // Batches 6..=10 were lost with a deleted segment
        let temp_dir = TempDir::new().unwrap();
        let batches1: Vec<_> = (1..=5).map(|s| (s, 1)).collect();
        let batches2: Vec<_> = (11..=15).map(|s| (s, 1)).collect();
        let files = vec![
            write_segment(temp_dir.path(), 1, &batches1),
            write_segment(temp_dir.path(), 3, &batches2),
        ];
        let versions = Arc::new(VersionSet::new(15));

        let reporter = Arc::new(CapturingReporter::default());
        let mut iter = TransactionLogIterator::with_reporter(
            temp_dir.path(),
            ReadOptions::default(),
            7,
            files,
            versions,
            reporter.clone(),
        );

        assert!(iter.valid());
        assert_eq!(collect(&mut iter), (11..=15).collect::<Vec<_>>());
        assert!(iter.status().is_ok());
        assert!(reporter
            .infos
            .lock()
            .iter()
            .any(|m| m.contains("Start sequence was not found")));
    }

    #[test]
    fn test_missing_start_sequence_single_file() {
        let temp_dir = TempDir::new().unwrap();
        let files = vec![write_segment(temp_dir.path(), 1, &[(1, 1), (2, 1)])];
        let versions = Arc::new(VersionSet::new(10));

        let mut iter = TransactionLogIterator::new(
            temp_dir.path(),
            ReadOptions::default(),
            8,
            files,
            versions,
        );
        // The only segment lacks the start sequence; the iterator never
        // starts but holds no error either
        assert!(!iter.valid());
    }

    #[test]
    fn test_empty_file_list() {
        let temp_dir = TempDir::new().unwrap();
        let versions = Arc::new(VersionSet::new(5));

        let mut iter = TransactionLogIterator::new(
            temp_dir.path(),
            ReadOptions::default(),
            1,
            Vec::new(),
            versions,
        );
        assert!(!iter.valid());
        assert!(iter.status().is_ok());
        assert!(iter.get_batch().is_none());

        iter.next();
        assert!(!iter.valid());
        assert!(iter.status().is_ok());
    }

    #[test]
    fn test_live_tail_growth_picked_up() {
        let temp_dir = TempDir::new().unwrap();
        let path = log_file_path(temp_dir.path(), 1);
        let mut writer = LogWriter::new(fs::File::create(&path).unwrap());
        for seq in 1..=3u64 {
            writer.add_record(WriteBatch::new(seq, 1, BODY).data()).unwrap();
        }
        writer.flush().unwrap();

        let versions = Arc::new(VersionSet::new(5));
        let files = vec![LogFile::new(1, WalFileKind::Live, 1, 0)];
        let mut iter = TransactionLogIterator::new(
            temp_dir.path(),
            ReadOptions::default(),
            1,
            files,
            versions.clone(),
        );

        let mut seqs = Vec::new();
        while iter.valid() {
            seqs.push(iter.get_batch().unwrap().sequence);
            iter.next();
        }
        assert_eq!(seqs, vec![1, 2, 3]);
        // Two durable batches are still missing from the tail
        assert!(iter.status().is_err());

        // The writer catches up; the next advance picks up the appends
        for seq in 4..=5u64 {
            writer.add_record(WriteBatch::new(seq, 1, BODY).data()).unwrap();
        }
        writer.flush().unwrap();

        iter.next();
        assert!(iter.valid());
        assert_eq!(iter.get_batch().unwrap().sequence, 4);
        iter.next();
        assert!(iter.valid());
        assert_eq!(iter.get_batch().unwrap().sequence, 5);
        iter.next();
        assert!(!iter.valid());
        assert!(iter.status().is_ok());
    }
}
