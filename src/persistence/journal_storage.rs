use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, error, info, warn, Span};

use crate::config::{IoMode, JournalConfig as StorageConfig};
use crate::core::error::{BrokerError, Result};
use crate::core::message::ServerMessage;
use crate::core::reference::MessageReference;
use crate::journal::{
    AsyncSequentialFileFactory, IoErrorListener, Journal, JournalConfig, JournalResult, RecordInfo,
    SequentialFileFactory, SyncSequentialFileFactory,
};

use super::id_generator::BatchingIdGenerator;
use super::{
    QueueBindingInfo, StorageManager, ACKNOWLEDGE_REF_RECORD, ADD_MESSAGE_RECORD, ADD_REF_RECORD,
    ID_COUNTER_RECORD, QUEUE_BINDING_RECORD, SET_SCHEDULED_DELIVERY_TIME_RECORD,
    UPDATE_DELIVERY_COUNT_RECORD,
};

pub const MESSAGE_FILE_PREFIX: &str = "relaymq-data";
pub const MESSAGE_FILE_EXTENSION: &str = "rmq";
pub const BINDINGS_FILE_PREFIX: &str = "relaymq-bindings";
pub const BINDINGS_FILE_EXTENSION: &str = "rmqb";

/// Where a recovered message is still referenced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredReference {
    pub queue_id: u64,
    pub delivery_count: u32,
    pub scheduled_delivery_time: Option<u64>,
}

#[derive(Debug)]
pub struct RecoveredMessage {
    pub message: ServerMessage,
    pub references: Vec<RecoveredReference>,
}

/// Everything read back from storage at startup.
#[derive(Debug, Default)]
pub struct LoadedState {
    pub bindings: Vec<QueueBindingInfo>,
    pub messages: Vec<RecoveredMessage>,
    /// Prepared transactions found and rolled back.
    pub rolled_back: usize,
    /// Messages deleted because no queue referenced them any more.
    pub orphans_deleted: usize,
}

/// Marks storage degraded on the first I/O error.
#[derive(Debug)]
struct DegradedListener {
    degraded: Arc<AtomicBool>,
}

impl IoErrorListener for DegradedListener {
    fn on_io_error(&self, code: i32, message: &str, file: &str) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            error!(target: "relaymq::storage", code, file, "storage degraded: {message}");
        }
    }
}

/// Storage on two journals: queue bindings plus the id counter in one,
/// messages and their per-queue state in the other.
#[derive(Debug)]
pub struct JournalStorageManager {
    messages: Arc<Journal>,
    bindings: Arc<Journal>,
    ids: BatchingIdGenerator,
    sync_transactional: bool,
    sync_non_transactional: bool,
    degraded: Arc<AtomicBool>,
    span: Span,
}

impl JournalStorageManager {
    pub fn new(config: &StorageConfig, parent: &Span) -> Result<Self> {
        let span = tracing::info_span!(parent: parent, "storage");
        let degraded = Arc::new(AtomicBool::new(false));

        let factory = |dir: &std::path::Path| -> Arc<dyn SequentialFileFactory> {
            let factory: Arc<dyn SequentialFileFactory> = match config.io_mode {
                IoMode::Sync => Arc::new(SyncSequentialFileFactory::new(dir)),
                IoMode::Async => Arc::new(AsyncSequentialFileFactory::new(
                    dir,
                    config.max_io,
                    config.buffer_size,
                )),
            };
            factory.set_io_error_listener(Arc::new(DegradedListener {
                degraded: degraded.clone(),
            }));
            factory
        };
        let journal_config = |prefix: &str, extension: &str| JournalConfig {
            file_size: config.file_size as u64,
            min_files: config.min_files,
            compact_min_files: config.compact_min_files,
            compact_percentage: config.compact_percentage,
            ..JournalConfig::new(prefix, extension)
        };

        let messages = Arc::new(Journal::new(
            journal_config(MESSAGE_FILE_PREFIX, MESSAGE_FILE_EXTENSION),
            factory(config.directory.as_path()),
            &span,
        )?);
        let bindings = Arc::new(Journal::new(
            journal_config(BINDINGS_FILE_PREFIX, BINDINGS_FILE_EXTENSION),
            factory(config.bindings_directory.as_path()),
            &span,
        )?);
        let ids = BatchingIdGenerator::new(1, config.id_batch_size, bindings.clone(), &span);

        Ok(Self {
            messages,
            bindings,
            ids,
            sync_transactional: config.sync_transactional,
            sync_non_transactional: config.sync_non_transactional,
            degraded,
            span,
        })
    }

    pub fn message_journal(&self) -> &Arc<Journal> {
        &self.messages
    }

    pub fn bindings_journal(&self) -> &Arc<Journal> {
        &self.bindings
    }

    /// Starts both journals and reads back the stored state. Prepared
    /// transactions are rolled back and unreferenced messages deleted.
    pub fn start(&self) -> Result<LoadedState> {
        self.bindings.start()?;
        self.messages.start()?;
        let mut state = LoadedState::default();

        let bindings = self.bindings.load()?;
        for tx in &bindings.prepared {
            self.bindings.append_rollback_record(tx.tx_id, true)?;
            state.rolled_back += 1;
        }
        for record in &bindings.records {
            match record.user_type {
                QUEUE_BINDING_RECORD if !record.is_update => {
                    state
                        .bindings
                        .push(QueueBindingInfo::decode(record.id, &record.data)?);
                }
                ID_COUNTER_RECORD => self.ids.load_state(record.id, &record.data)?,
                other => {
                    warn!(parent: &self.span, record_id = record.id, user_type = other, "skipping unknown bindings record")
                }
            }
        }

        let messages = self.messages.load()?;
        for tx in &messages.prepared {
            warn!(parent: &self.span, tx_id = tx.tx_id, records = tx.records.len(), "rolling back prepared transaction");
            self.messages.append_rollback_record(tx.tx_id, true)?;
            state.rolled_back += 1;
        }
        self.ids.ensure_above(bindings.max_id.max(messages.max_id));

        let queue_ids: HashSet<u64> = state.bindings.iter().map(|b| b.id).collect();
        let mut recovered: Vec<RecoveredMessage> = Vec::new();
        let mut by_id = std::collections::HashMap::new();
        for record in messages.records {
            if record.user_type == ADD_MESSAGE_RECORD && !record.is_update {
                let message = ServerMessage::decode(&mut &record.data[..])?.with_durable(true);
                by_id.insert(record.id, recovered.len());
                recovered.push(RecoveredMessage {
                    message,
                    references: Vec::new(),
                });
                continue;
            }
            let Some(&index) = by_id.get(&record.id) else {
                warn!(parent: &self.span, message_id = record.id, user_type = record.user_type, "update for unknown message");
                continue;
            };
            apply_update(&mut recovered[index], &record)?;
        }

        for entry in recovered {
            let before = entry.references.len();
            let references: Vec<RecoveredReference> = entry
                .references
                .into_iter()
                .filter(|r| queue_ids.contains(&r.queue_id))
                .collect();
            if references.len() < before {
                debug!(parent: &self.span, message_id = entry.message.id(), dropped = before - references.len(), "references to deleted queues dropped");
            }
            if references.is_empty() {
                self.messages.append_delete_record(entry.message.id(), false)?;
                state.orphans_deleted += 1;
                continue;
            }
            state.messages.push(RecoveredMessage {
                message: entry.message,
                references,
            });
        }

        info!(
            parent: &self.span,
            queues = state.bindings.len(),
            messages = state.messages.len(),
            rolled_back = state.rolled_back,
            orphans_deleted = state.orphans_deleted,
            "storage loaded"
        );
        Ok(state)
    }

    pub fn stop(&self) -> Result<()> {
        self.messages.stop()?;
        self.bindings.stop()?;
        Ok(())
    }

    fn queue_record(queue_id: u64) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64(queue_id);
        buf.freeze()
    }

    /// Converts a journal failure and marks storage degraded.
    fn journaled(&self, result: JournalResult<()>) -> Result<()> {
        result
            .map_err(BrokerError::from)
            .inspect_err(|e| self.report(e))
    }

    fn report(&self, e: &BrokerError) {
        if matches!(e, BrokerError::Journal(_) | BrokerError::Io(_)) {
            self.degraded.store(true, Ordering::Release);
        }
    }
}

fn apply_update(entry: &mut RecoveredMessage, record: &RecordInfo) -> Result<()> {
    let mut data = &record.data[..];
    if data.remaining() < 8 {
        return Err(BrokerError::Decode(format!(
            "record type {} for message {} is {} bytes",
            record.user_type,
            record.id,
            data.len()
        )));
    }
    let queue_id = data.get_u64();
    let position = entry.references.iter().position(|r| r.queue_id == queue_id);
    match record.user_type {
        ADD_REF_RECORD => {
            if position.is_none() {
                entry.references.push(RecoveredReference {
                    queue_id,
                    delivery_count: 0,
                    scheduled_delivery_time: entry.message.scheduled_delivery_time(),
                });
            }
        }
        ACKNOWLEDGE_REF_RECORD => {
            if let Some(position) = position {
                entry.references.remove(position);
            }
        }
        UPDATE_DELIVERY_COUNT_RECORD if data.remaining() >= 4 => {
            let count = data.get_u32();
            if let Some(position) = position {
                entry.references[position].delivery_count = count;
            }
        }
        SET_SCHEDULED_DELIVERY_TIME_RECORD if data.remaining() >= 8 => {
            let at = data.get_u64();
            if let Some(position) = position {
                entry.references[position].scheduled_delivery_time = (at != 0).then_some(at);
            }
        }
        other => {
            return Err(BrokerError::Decode(format!(
                "unexpected record type {other} for message {}",
                record.id
            )))
        }
    }
    Ok(())
}

impl StorageManager for JournalStorageManager {
    fn generate_unique_id(&self) -> u64 {
        match self.ids.generate_id() {
            Ok(id) => id,
            Err(e) => {
                error!(parent: &self.span, error = %e, "could not store id checkpoint");
                self.report(&e);
                self.ids.generate_unchecked()
            }
        }
    }

    fn reserve_ids(&self, count: u64) -> Result<u64> {
        self.ids.reserve(count).inspect_err(|e| self.report(e))
    }

    fn store_message(&self, message: &ServerMessage) -> Result<()> {
        let mut buf = BytesMut::with_capacity(message.encode_size());
        message.encode(&mut buf)?;
        self.journaled(self.messages.append_add_record(
            message.id(),
            ADD_MESSAGE_RECORD,
            buf.freeze(),
            self.sync_non_transactional,
        ))
    }

    fn store_reference(&self, queue_id: u64, message_id: u64) -> Result<()> {
        self.journaled(self.messages.append_update_record(
            message_id,
            ADD_REF_RECORD,
            Self::queue_record(queue_id),
            self.sync_non_transactional,
        ))
    }

    fn store_acknowledge(&self, queue_id: u64, message_id: u64) -> Result<()> {
        self.journaled(self.messages.append_update_record(
            message_id,
            ACKNOWLEDGE_REF_RECORD,
            Self::queue_record(queue_id),
            self.sync_non_transactional,
        ))
    }

    fn delete_message(&self, message_id: u64) -> Result<()> {
        self.journaled(
            self.messages
                .append_delete_record(message_id, self.sync_non_transactional),
        )
    }

    fn update_delivery_count(&self, reference: &MessageReference) -> Result<()> {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u64(reference.queue_id());
        buf.put_u32(reference.delivery_count());
        self.journaled(self.messages.append_update_record(
            reference.message_id(),
            UPDATE_DELIVERY_COUNT_RECORD,
            buf.freeze(),
            false,
        ))
    }

    fn update_scheduled_delivery_time(&self, reference: &MessageReference) -> Result<()> {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u64(reference.queue_id());
        buf.put_u64(reference.scheduled_delivery_time().unwrap_or(0));
        self.journaled(self.messages.append_update_record(
            reference.message_id(),
            SET_SCHEDULED_DELIVERY_TIME_RECORD,
            buf.freeze(),
            self.sync_non_transactional,
        ))
    }

    fn store_message_transactional(&self, tx_id: u64, message: &ServerMessage) -> Result<()> {
        let mut buf = BytesMut::with_capacity(message.encode_size());
        message.encode(&mut buf)?;
        self.journaled(self.messages.append_add_record_transactional(
            tx_id,
            message.id(),
            ADD_MESSAGE_RECORD,
            buf.freeze(),
        ))
    }

    fn store_reference_transactional(
        &self,
        tx_id: u64,
        queue_id: u64,
        message_id: u64,
    ) -> Result<()> {
        self.journaled(self.messages.append_update_record_transactional(
            tx_id,
            message_id,
            ADD_REF_RECORD,
            Self::queue_record(queue_id),
        ))
    }

    fn store_acknowledge_transactional(
        &self,
        tx_id: u64,
        queue_id: u64,
        message_id: u64,
    ) -> Result<()> {
        self.journaled(self.messages.append_update_record_transactional(
            tx_id,
            message_id,
            ACKNOWLEDGE_REF_RECORD,
            Self::queue_record(queue_id),
        ))
    }

    fn delete_message_transactional(&self, tx_id: u64, message_id: u64) -> Result<()> {
        self.journaled(
            self.messages
                .append_delete_record_transactional(tx_id, message_id),
        )
    }

    fn prepare(&self, tx_id: u64, data: &[u8]) -> Result<()> {
        self.journaled(self.messages.append_prepare_record(
            tx_id,
            Bytes::copy_from_slice(data),
            self.sync_transactional,
        ))
    }

    fn commit(&self, tx_id: u64) -> Result<()> {
        self.journaled(
            self.messages
                .append_commit_record(tx_id, self.sync_transactional),
        )
    }

    fn rollback(&self, tx_id: u64) -> Result<()> {
        self.journaled(
            self.messages
                .append_rollback_record(tx_id, self.sync_transactional),
        )
    }

    fn add_queue_binding(&self, binding: &QueueBindingInfo) -> Result<()> {
        let data = binding.encode()?.freeze();
        self.journaled(
            self.bindings
                .append_add_record(binding.id, QUEUE_BINDING_RECORD, data, true),
        )
    }

    fn delete_queue_binding(&self, queue_id: u64) -> Result<()> {
        self.journaled(self.bindings.append_delete_record(queue_id, true))
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }
}
