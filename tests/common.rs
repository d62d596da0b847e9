#![allow(dead_code)]

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Once};

use parking_lot::Mutex;
use relaymq::core::distributor::DistributionPolicy;
use relaymq::core::executor::DirectExecutor;
use relaymq::core::id_generator::MessageIdGenerator;
use relaymq::core::message::ServerMessage;
use relaymq::core::outbound::{self, Outbound, OutboundReceiver};
use relaymq::core::postoffice::PostOffice;
use relaymq::core::reference::MessageReference;
use relaymq::core::session::{ServerSession, SessionKind, SessionOptions};
use relaymq::core::settings::{AddressSettings, AddressSettingsRepository};
use relaymq::persistence::{NullStorageManager, QueueBindingInfo, StorageIdSource, StorageManager};
use relaymq::{Broker, BrokerError, Config, Result};
use tracing::Span;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let mut logging = relaymq::config::LoggingConfig::default();
        logging.filter = "warn".to_string();
        let _ = relaymq::logging::init_logging(&logging);
    });
}

/// In-memory broker configuration with consumer flow control off.
pub fn memory_config() -> Config {
    let mut config = Config::default();
    config.server.persistence_enabled = false;
    config.delivery.consumer_window_size = -1;
    config
}

/// Persistent configuration with both journals under `dir`.
pub fn persistent_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.journal.directory = dir.join("journal");
    config.journal.bindings_directory = dir.join("bindings");
    config.journal.file_size = 16 * 1024;
    config.journal.compact_min_files = 0;
    config.delivery.consumer_window_size = -1;
    config
}

/// Starts a broker that delivers on the calling thread.
pub fn start_broker(config: Config) -> Arc<Broker> {
    init_logging();
    Broker::start(config, Arc::new(DirectExecutor)).expect("broker starts")
}

pub fn open_session(
    broker: &Broker,
    kind: SessionKind,
    transacted: bool,
) -> (Arc<ServerSession>, OutboundReceiver) {
    let (tx, rx) = outbound::channel();
    let options = SessionOptions {
        kind,
        transacted,
        ..broker.session_options()
    };
    (broker.create_session(options, tx), rx)
}

/// Drains every delivery currently queued on `rx` as (consumer, message id, delivery count).
pub fn deliveries(rx: &mut OutboundReceiver) -> Vec<(u64, u64, u32)> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Outbound::Deliver {
            consumer_id,
            reference,
        } = event
        {
            out.push((consumer_id, reference.message_id(), reference.delivery_count()));
        }
    }
    out
}

/// Drains every producer credit grant currently queued on `rx`.
pub fn credit_grants(rx: &mut OutboundReceiver) -> Vec<(u64, i64)> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Outbound::ProducerCredits {
            producer_id,
            credits,
        } = event
        {
            out.push((producer_id, credits));
        }
    }
    out
}

// ───────────────────────────────────────────────────────────
// Storage that fails on demand
// ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    StoreMessage,
    Acknowledge,
    AcknowledgeTransactional,
    DeleteMessage,
    Commit,
    AddQueueBinding,
}

type BindingHook = Box<dyn FnOnce() + Send>;

/// Keeps nothing, like the in-memory storage, but fails chosen operations
/// once they have succeeded a given number of times.
#[derive(Default)]
pub struct FailingStorage {
    ids: NullStorageManager,
    /// Successes left per operation before every later call fails.
    faults: Mutex<HashMap<StorageOp, usize>>,
    calls: Mutex<HashMap<StorageOp, usize>>,
    deleted_bindings: Mutex<Vec<u64>>,
    on_add_binding: Mutex<Option<BindingHook>>,
}

impl fmt::Debug for FailingStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailingStorage")
            .field("faults", &*self.faults.lock())
            .finish()
    }
}

impl FailingStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Lets `op` succeed `successes` more times, then fails it.
    pub fn fail_after(&self, op: StorageOp, successes: usize) {
        self.faults.lock().insert(op, successes);
    }

    pub fn heal(&self) {
        self.faults.lock().clear();
    }

    /// Successful calls of `op` so far.
    pub fn calls(&self, op: StorageOp) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    pub fn deleted_bindings(&self) -> Vec<u64> {
        self.deleted_bindings.lock().clone()
    }

    /// Runs `hook` inside the next `add_queue_binding` call.
    pub fn on_add_binding(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_add_binding.lock() = Some(Box::new(hook));
    }

    fn check(&self, op: StorageOp) -> Result<()> {
        if let Some(left) = self.faults.lock().get_mut(&op) {
            if *left == 0 {
                return Err(BrokerError::Io(std::io::Error::other(format!(
                    "{op:?} failed"
                ))));
            }
            *left -= 1;
        }
        *self.calls.lock().entry(op).or_default() += 1;
        Ok(())
    }
}

impl StorageManager for FailingStorage {
    fn generate_unique_id(&self) -> u64 {
        self.ids.generate_unique_id()
    }

    fn reserve_ids(&self, count: u64) -> Result<u64> {
        self.ids.reserve_ids(count)
    }

    fn store_message(&self, _message: &ServerMessage) -> Result<()> {
        self.check(StorageOp::StoreMessage)
    }

    fn store_reference(&self, _queue_id: u64, _message_id: u64) -> Result<()> {
        Ok(())
    }

    fn store_acknowledge(&self, _queue_id: u64, _message_id: u64) -> Result<()> {
        self.check(StorageOp::Acknowledge)
    }

    fn delete_message(&self, _message_id: u64) -> Result<()> {
        self.check(StorageOp::DeleteMessage)
    }

    fn update_delivery_count(&self, _reference: &MessageReference) -> Result<()> {
        Ok(())
    }

    fn update_scheduled_delivery_time(&self, _reference: &MessageReference) -> Result<()> {
        Ok(())
    }

    fn store_message_transactional(&self, _tx_id: u64, _message: &ServerMessage) -> Result<()> {
        self.check(StorageOp::StoreMessage)
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
        self.check(StorageOp::AcknowledgeTransactional)
    }

    fn delete_message_transactional(&self, _tx_id: u64, _message_id: u64) -> Result<()> {
        self.check(StorageOp::DeleteMessage)
    }

    fn prepare(&self, _tx_id: u64, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn commit(&self, _tx_id: u64) -> Result<()> {
        self.check(StorageOp::Commit)
    }

    fn rollback(&self, _tx_id: u64) -> Result<()> {
        Ok(())
    }

    fn add_queue_binding(&self, _binding: &QueueBindingInfo) -> Result<()> {
        let hook = self.on_add_binding.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        self.check(StorageOp::AddQueueBinding)
    }

    fn delete_queue_binding(&self, queue_id: u64) -> Result<()> {
        self.deleted_bindings.lock().push(queue_id);
        Ok(())
    }
}

/// A post office on `storage` that delivers on the calling thread.
pub fn post_office_on(storage: Arc<dyn StorageManager>, settings: AddressSettings) -> Arc<PostOffice> {
    init_logging();
    PostOffice::new(
        "node-test",
        storage,
        Arc::new(AddressSettingsRepository::new(settings)),
        Arc::new(DirectExecutor),
        DistributionPolicy::RoundRobin,
        &Span::none(),
    )
}

pub fn session_on(
    post_office: &Arc<PostOffice>,
    transacted: bool,
) -> (Arc<ServerSession>, OutboundReceiver) {
    let storage = post_office.storage().clone();
    let ids = Arc::new(MessageIdGenerator::new(Arc::new(StorageIdSource(storage)), 16));
    let (tx, rx) = outbound::channel();
    let options = SessionOptions {
        transacted,
        ..SessionOptions::default()
    };
    let session = ServerSession::new(options, post_office.clone(), ids, tx, &Span::none());
    (session, rx)
}
