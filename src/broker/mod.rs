//! # Broker Module
//!
//! The server context that wires storage, the post office, message id
//! generation, the interceptor pipeline and management together, plus
//! the TCP engine in [`engine`] that puts sessions on the network.
//!
//! Startup order matters: storage is loaded first, durable queues are
//! rebuilt from their bindings and only then are recovered references
//! put back on those queues.

pub mod engine;

pub use self::engine::serve;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, info_span, warn, Span};

use crate::config::Config;
use crate::core::error::Result;
use crate::core::executor::Executor;
use crate::core::id_generator::{GeneratorRegistry, MessageIdGenerator};
use crate::core::outbound::OutboundSender;
use crate::core::pipeline::{LoggingInterceptor, Pipeline};
use crate::core::postoffice::PostOffice;
use crate::core::queue::Queue;
use crate::core::session::{ServerSession, SessionOptions};
use crate::core::settings::{AddressSettings, AddressSettingsRepository};
use crate::management::ManagementService;
use crate::persistence::{
    JournalStorageManager, LoadedState, NullStorageManager, StorageIdSource, StorageManager,
};

/// Outcome of reading stored state back at startup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    pub queues: usize,
    pub messages: usize,
    pub references: usize,
    pub rolled_back: usize,
    pub orphans_deleted: usize,
}

pub struct Broker {
    config: Config,
    storage: Arc<dyn StorageManager>,
    journals: Option<Arc<JournalStorageManager>>,
    post_office: Arc<PostOffice>,
    generators: Arc<GeneratorRegistry>,
    id_generator: Arc<MessageIdGenerator>,
    pipeline: Pipeline,
    management: ManagementService,
    recovery: RecoveryStats,
    stopped: AtomicBool,
    span: Span,
}

impl Broker {
    /// Starts a broker with its own generator registry.
    pub fn start(config: Config, executor: Arc<dyn Executor>) -> Result<Arc<Self>> {
        Self::start_with_registry(config, executor, Arc::new(GeneratorRegistry::new()))
    }

    /// Starts a broker sharing `generators` with other brokers in the
    /// same process. Brokers with the same server id share one generator.
    pub fn start_with_registry(
        config: Config,
        executor: Arc<dyn Executor>,
        generators: Arc<GeneratorRegistry>,
    ) -> Result<Arc<Self>> {
        let span = info_span!("broker", server_id = %config.server.server_id);

        let mut journals = None;
        let mut loaded = LoadedState::default();
        let storage: Arc<dyn StorageManager> = if config.server.persistence_enabled {
            let manager = Arc::new(JournalStorageManager::new(&config.journal, &span)?);
            loaded = manager.start()?;
            journals = Some(manager.clone());
            manager
        } else {
            debug!(parent: &span, "persistence disabled");
            Arc::new(NullStorageManager::new())
        };

        let settings = Arc::new(AddressSettingsRepository::new(AddressSettings::default()));
        for (pattern, address_settings) in &config.address_settings {
            settings.add_match(pattern, address_settings.clone());
        }

        let post_office = PostOffice::new(
            config.server.node_id.to_string(),
            storage.clone(),
            settings,
            executor,
            config.delivery.distribution,
            &span,
        );

        let recovery = Self::recover(&post_office, loaded, &span)?;

        let id_generator = generators.get_generator(
            &config.server.server_id,
            Arc::new(StorageIdSource(storage.clone())),
        );

        let pipeline = Pipeline::new().with(Arc::new(LoggingInterceptor));

        let mut management = ManagementService::new(post_office.clone(), &span);
        if let Some(journals) = &journals {
            management = management
                .with_journal("messages", journals.message_journal().clone())
                .with_journal("bindings", journals.bindings_journal().clone());
        }

        info!(
            parent: &span,
            queues = recovery.queues,
            messages = recovery.messages,
            references = recovery.references,
            "broker started"
        );

        Ok(Arc::new(Self {
            config,
            storage,
            journals,
            post_office,
            generators,
            id_generator,
            pipeline,
            management,
            recovery,
            stopped: AtomicBool::new(false),
            span,
        }))
    }

    /// Rebuilds durable queues, then hands every recovered reference back
    /// to its queue.
    fn recover(post_office: &PostOffice, loaded: LoadedState, span: &Span) -> Result<RecoveryStats> {
        let mut stats = RecoveryStats {
            rolled_back: loaded.rolled_back,
            orphans_deleted: loaded.orphans_deleted,
            ..RecoveryStats::default()
        };

        let mut queues: HashMap<u64, Arc<Queue>> = HashMap::with_capacity(loaded.bindings.len());
        for binding in &loaded.bindings {
            let queue = post_office.load_queue(binding)?;
            queues.insert(binding.id, queue);
        }
        stats.queues = queues.len();

        for recovered in loaded.messages {
            let message = Arc::new(recovered.message);
            stats.messages += 1;
            for reference in recovered.references {
                match queues.get(&reference.queue_id) {
                    Some(queue) => {
                        queue.load_reference(
                            message.clone(),
                            reference.delivery_count,
                            reference.scheduled_delivery_time,
                        );
                        stats.references += 1;
                    }
                    None => warn!(
                        parent: span,
                        message_id = message.id(),
                        queue_id = reference.queue_id,
                        "reference to unknown queue dropped"
                    ),
                }
            }
        }
        Ok(stats)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageManager> {
        &self.storage
    }

    pub fn journals(&self) -> Option<&Arc<JournalStorageManager>> {
        self.journals.as_ref()
    }

    pub fn post_office(&self) -> &Arc<PostOffice> {
        &self.post_office
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn management(&self) -> &ManagementService {
        &self.management
    }

    pub fn id_generator(&self) -> &Arc<MessageIdGenerator> {
        &self.id_generator
    }

    pub fn recovery(&self) -> RecoveryStats {
        self.recovery
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Opens a session whose deliveries and credit grants go to `outbound`.
    pub fn create_session(
        &self,
        options: SessionOptions,
        outbound: OutboundSender,
    ) -> Arc<ServerSession> {
        ServerSession::new(
            options,
            self.post_office.clone(),
            self.id_generator.clone(),
            outbound,
            &self.span,
        )
    }

    /// Session options with the configured producer window.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            producer_window_size: self.config.delivery.producer_window_size,
            ..SessionOptions::default()
        }
    }

    /// Sends every expired message on every queue to its expiry address.
    pub fn expire_messages(&self) -> usize {
        let mut expired = 0;
        for queue in self.post_office.queues() {
            match queue.expire_expired_messages() {
                Ok(n) => expired += n,
                Err(e) => {
                    warn!(parent: &self.span, queue = %queue.name(), error = %e, "expiry scan failed")
                }
            }
        }
        if expired > 0 {
            debug!(parent: &self.span, expired, "expired messages");
        }
        expired
    }

    /// Returns the id generator and stops storage. Idempotent.
    pub fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.generators.return_generator(&self.config.server.server_id)?;
        if let Some(journals) = &self.journals {
            journals.stop()?;
        }
        info!(parent: &self.span, "broker stopped");
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("server_id", &self.config.server.server_id)
            .field("persistent", &self.journals.is_some())
            .field("recovery", &self.recovery)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::executor::DirectExecutor;
    use crate::core::message::ServerMessage;
    use crate::core::outbound;
    use bytes::Bytes;

    fn config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.journal.directory = dir.join("journal");
        config.journal.bindings_directory = dir.join("bindings");
        config.journal.file_size = 64 * 1024;
        config
    }

    #[test]
    fn durable_messages_survive_restart() {
        let dir = tempfile::tempdir().unwrap();

        let broker = Broker::start(config(dir.path()), Arc::new(DirectExecutor)).unwrap();
        let (tx, _rx) = outbound::channel();
        let session = broker.create_session(broker.session_options(), tx);
        session.create_queue("orders", "orders.eu", None, true, false).unwrap();
        session.create_producer(1, Some("orders.eu")).unwrap();
        let message = ServerMessage::new(0, "orders.eu", Bytes::from_static(b"hello")).with_durable(true);
        session.send(1, message).unwrap();
        session.close().unwrap();
        broker.stop().unwrap();

        let broker = Broker::start(config(dir.path()), Arc::new(DirectExecutor)).unwrap();
        let recovery = broker.recovery();
        assert_eq!(recovery.queues, 1);
        assert_eq!(recovery.references, 1);
        let queue = broker.post_office().get_queue("orders").unwrap();
        assert_eq!(queue.message_count(), 1);
        broker.stop().unwrap();
    }

    #[test]
    fn stop_returns_the_generator() {
        let mut config = Config::default();
        config.server.persistence_enabled = false;
        let registry = Arc::new(GeneratorRegistry::new());

        let a = Broker::start_with_registry(config.clone(), Arc::new(DirectExecutor), registry.clone())
            .unwrap();
        let b = Broker::start_with_registry(config, Arc::new(DirectExecutor), registry.clone()).unwrap();
        assert!(Arc::ptr_eq(a.id_generator(), b.id_generator()));

        a.stop().unwrap();
        assert!(registry.contains("relaymq-1"));
        a.stop().unwrap();
        b.stop().unwrap();
        assert!(registry.is_empty());
    }
}
