//! Persistent id sequence.
//!
//! Ids are handed out from memory; every `batch_size` ids a checkpoint is
//! written to the bindings journal. After a restart the sequence resumes
//! at the highest checkpoint, so ids are never reused, at the cost of
//! skipping at most one batch.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, Span};

use crate::core::error::{BrokerError, Result};
use crate::journal::Journal;

use super::ID_COUNTER_RECORD;

#[derive(Debug)]
struct Counter {
    next: u64,
    /// First id not covered by a stored checkpoint.
    checkpoint: u64,
    /// Journal ids of stored checkpoint records, oldest first.
    records: Vec<u64>,
}

#[derive(Debug)]
pub struct BatchingIdGenerator {
    journal: Arc<Journal>,
    batch_size: u64,
    counter: Mutex<Counter>,
    span: Span,
}

impl BatchingIdGenerator {
    pub fn new(start: u64, batch_size: u64, journal: Arc<Journal>, parent: &Span) -> Self {
        Self {
            journal,
            batch_size: batch_size.max(1),
            counter: Mutex::new(Counter {
                next: start,
                checkpoint: start,
                records: Vec::new(),
            }),
            span: tracing::debug_span!(parent: parent, "id_generator"),
        }
    }

    /// Feeds a checkpoint read back from the journal.
    pub fn load_state(&self, record_id: u64, mut data: &[u8]) -> Result<()> {
        if data.len() < 8 {
            return Err(BrokerError::Decode(format!(
                "id counter record {record_id} is {} bytes",
                data.len()
            )));
        }
        let checkpoint = bytes::Buf::get_u64(&mut data);
        let mut counter = self.counter.lock();
        counter.next = counter.next.max(checkpoint).max(record_id + 1);
        counter.checkpoint = counter.next;
        counter.records.push(record_id);
        Ok(())
    }

    /// Never hand out anything at or below `id`.
    pub fn ensure_above(&self, id: u64) {
        let mut counter = self.counter.lock();
        if counter.next <= id {
            counter.next = id + 1;
            counter.checkpoint = counter.next;
        }
    }

    pub fn current(&self) -> u64 {
        self.counter.lock().next
    }

    pub fn generate_id(&self) -> Result<u64> {
        self.reserve(1)
    }

    /// Reserves `count` consecutive ids and returns the first.
    pub fn reserve(&self, count: u64) -> Result<u64> {
        let mut counter = self.counter.lock();
        if counter.next + count > counter.checkpoint {
            self.store_checkpoint(&mut counter, count)?;
        }
        let first = counter.next;
        counter.next += count;
        Ok(first)
    }

    /// Hands out the next id without writing a checkpoint. Only for callers
    /// that cannot report a storage failure.
    pub fn generate_unchecked(&self) -> u64 {
        let mut counter = self.counter.lock();
        let id = counter.next;
        counter.next += 1;
        id
    }

    fn store_checkpoint(&self, counter: &mut Counter, needed: u64) -> Result<()> {
        // The record itself takes an id so it never collides with a binding record.
        let record_id = counter.next;
        counter.next += 1;
        let checkpoint = counter.next + needed.max(self.batch_size);

        let mut data = BytesMut::with_capacity(8);
        data.put_u64(checkpoint);
        self.journal
            .append_add_record(record_id, ID_COUNTER_RECORD, data.freeze(), true)?;
        counter.checkpoint = checkpoint;

        // Only the newest checkpoint matters.
        for old in std::mem::take(&mut counter.records) {
            if let Err(e) = self.journal.append_delete_record(old, false) {
                debug!(parent: &self.span, record_id = old, error = %e, "could not delete old id checkpoint");
            }
        }
        counter.records.push(record_id);
        debug!(parent: &self.span, checkpoint, "id checkpoint stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{JournalConfig, SyncSequentialFileFactory};
    use tempfile::tempdir;

    fn checkpoint_data(checkpoint: u64) -> Vec<u8> {
        checkpoint.to_be_bytes().to_vec()
    }

    fn journal(dir: &std::path::Path) -> (Arc<Journal>, crate::journal::LoadedJournal) {
        let factory = Arc::new(SyncSequentialFileFactory::new(dir));
        let journal = Journal::new(
            JournalConfig {
                file_size: 4096,
                ..JournalConfig::new("ids", "rmqb")
            },
            factory,
            &Span::none(),
        )
        .unwrap();
        journal.start().unwrap();
        let loaded = journal.load().unwrap();
        (Arc::new(journal), loaded)
    }

    #[test]
    fn ids_resume_past_the_last_checkpoint() {
        let dir = tempdir().unwrap();
        let last = {
            let (journal, _) = journal(dir.path());
            let ids = BatchingIdGenerator::new(1, 10, journal.clone(), &Span::none());
            let mut last = 0;
            for _ in 0..25 {
                let id = ids.generate_id().unwrap();
                assert!(id > last);
                last = id;
            }
            journal.stop().unwrap();
            last
        };

        let (journal, loaded) = journal(dir.path());
        let checkpoints: Vec<_> = loaded
            .records
            .iter()
            .filter(|r| r.user_type == ID_COUNTER_RECORD)
            .collect();
        assert_eq!(checkpoints.len(), 1, "older checkpoints are deleted");

        let ids = BatchingIdGenerator::new(1, 10, journal, &Span::none());
        for record in checkpoints {
            ids.load_state(record.id, &record.data).unwrap();
        }
        assert!(ids.generate_id().unwrap() > last);
    }

    #[test]
    fn reserve_covers_large_blocks() {
        let dir = tempdir().unwrap();
        let (journal, _) = journal(dir.path());
        let ids = BatchingIdGenerator::new(1, 4, journal, &Span::none());
        let first = ids.reserve(100).unwrap();
        assert_eq!(ids.current(), first + 100);
        assert!(ids.generate_id().unwrap() >= first + 100);
    }

    #[test]
    fn short_checkpoint_is_rejected() {
        let dir = tempdir().unwrap();
        let (journal, _) = journal(dir.path());
        let ids = BatchingIdGenerator::new(1, 4, journal, &Span::none());
        assert!(ids.load_state(3, &[1, 2]).is_err());
        ids.load_state(3, &checkpoint_data(500)).unwrap();
        assert_eq!(ids.current(), 500);
        ids.ensure_above(900);
        assert_eq!(ids.current(), 901);
    }
}
