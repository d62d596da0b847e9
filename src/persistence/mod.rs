//! Storage abstraction used by the post office and queues.

pub mod id_generator;
pub mod journal_storage;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;

use crate::core::error::Result;
use crate::core::id_generator::IdBlockSource;
use crate::core::message::ServerMessage;
use crate::core::reference::MessageReference;
use crate::wire::codec;

pub use id_generator::BatchingIdGenerator;
pub use journal_storage::{JournalStorageManager, LoadedState, RecoveredMessage, RecoveredReference};

// ─── Journal record types ──────────────────────────────────
// Bindings journal.
pub const QUEUE_BINDING_RECORD: u8 = 21;
pub const ID_COUNTER_RECORD: u8 = 24;
// Message journal.
pub const ADD_MESSAGE_RECORD: u8 = 31;
pub const ADD_REF_RECORD: u8 = 32;
pub const ACKNOWLEDGE_REF_RECORD: u8 = 33;
pub const UPDATE_DELIVERY_COUNT_RECORD: u8 = 34;
pub const SET_SCHEDULED_DELIVERY_TIME_RECORD: u8 = 36;

/// Durable record of a queue and the address it is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBindingInfo {
    pub id: u64,
    pub name: String,
    pub address: String,
    pub filter: Option<String>,
}

impl QueueBindingInfo {
    pub fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        codec::put_string(&mut buf, &self.name)?;
        codec::put_string(&mut buf, &self.address)?;
        codec::put_opt_string(&mut buf, self.filter.as_deref())?;
        Ok(buf)
    }

    pub fn decode(id: u64, mut buf: &[u8]) -> Result<Self> {
        let name = codec::get_string(&mut buf, "queue name")?;
        let address = codec::get_string(&mut buf, "queue address")?;
        let filter = codec::get_opt_string(&mut buf, "queue filter")?;
        Ok(Self {
            id,
            name,
            address,
            filter,
        })
    }
}

/// Everything the broker persists. Transactional variants write records
/// that only take effect once `commit` is stored.
pub trait StorageManager: Send + Sync + fmt::Debug {
    fn generate_unique_id(&self) -> u64;

    /// Reserves `count` consecutive ids and returns the first one.
    fn reserve_ids(&self, count: u64) -> Result<u64>;

    fn store_message(&self, message: &ServerMessage) -> Result<()>;

    fn store_reference(&self, queue_id: u64, message_id: u64) -> Result<()>;

    fn store_acknowledge(&self, queue_id: u64, message_id: u64) -> Result<()>;

    fn delete_message(&self, message_id: u64) -> Result<()>;

    fn update_delivery_count(&self, reference: &MessageReference) -> Result<()>;

    fn update_scheduled_delivery_time(&self, reference: &MessageReference) -> Result<()>;

    fn store_message_transactional(&self, tx_id: u64, message: &ServerMessage) -> Result<()>;

    fn store_reference_transactional(&self, tx_id: u64, queue_id: u64, message_id: u64)
        -> Result<()>;

    fn store_acknowledge_transactional(
        &self,
        tx_id: u64,
        queue_id: u64,
        message_id: u64,
    ) -> Result<()>;

    fn delete_message_transactional(&self, tx_id: u64, message_id: u64) -> Result<()>;

    fn prepare(&self, tx_id: u64, data: &[u8]) -> Result<()>;

    fn commit(&self, tx_id: u64) -> Result<()>;

    fn rollback(&self, tx_id: u64) -> Result<()>;

    fn add_queue_binding(&self, binding: &QueueBindingInfo) -> Result<()>;

    fn delete_queue_binding(&self, queue_id: u64) -> Result<()>;

    /// True once an I/O error has been reported by the underlying files.
    fn is_degraded(&self) -> bool {
        false
    }
}

/// Storage for brokers running with persistence disabled.
#[derive(Debug)]
pub struct NullStorageManager {
    next_id: AtomicU64,
}

impl NullStorageManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for NullStorageManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageManager for NullStorageManager {
    fn generate_unique_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn reserve_ids(&self, count: u64) -> Result<u64> {
        Ok(self.next_id.fetch_add(count, Ordering::Relaxed))
    }

    fn store_message(&self, _message: &ServerMessage) -> Result<()> {
        Ok(())
    }

    fn store_reference(&self, _queue_id: u64, _message_id: u64) -> Result<()> {
        Ok(())
    }

    fn store_acknowledge(&self, _queue_id: u64, _message_id: u64) -> Result<()> {
        Ok(())
    }

    fn delete_message(&self, _message_id: u64) -> Result<()> {
        Ok(())
    }

    fn update_delivery_count(&self, _reference: &MessageReference) -> Result<()> {
        Ok(())
    }

    fn update_scheduled_delivery_time(&self, _reference: &MessageReference) -> Result<()> {
        Ok(())
    }

    fn store_message_transactional(&self, _tx_id: u64, _message: &ServerMessage) -> Result<()> {
        Ok(())
    }

    fn store_reference_transactional(
        &self,
        _tx_id: u64,
        _queue_id: u64,
        _message_id: u64,
    ) -> Result<()> {
        Ok(())
    }

    fn store_acknowledge_transactional(
        &self,
        _tx_id: u64,
        _queue_id: u64,
        _message_id: u64,
    ) -> Result<()> {
        Ok(())
    }

    fn delete_message_transactional(&self, _tx_id: u64, _message_id: u64) -> Result<()> {
        Ok(())
    }

    fn prepare(&self, _tx_id: u64, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn commit(&self, _tx_id: u64) -> Result<()> {
        Ok(())
    }

    fn rollback(&self, _tx_id: u64) -> Result<()> {
        Ok(())
    }

    fn add_queue_binding(&self, _binding: &QueueBindingInfo) -> Result<()> {
        Ok(())
    }

    fn delete_queue_binding(&self, _queue_id: u64) -> Result<()> {
        Ok(())
    }
}

/// Lets message id generators reserve blocks from the storage id sequence.
#[derive(Debug, Clone)]
pub struct StorageIdSource(pub Arc<dyn StorageManager>);

impl IdBlockSource for StorageIdSource {
    fn reserve_block(&self, size: u64) -> Result<u64> {
        self.0.reserve_ids(size)
    }
}
