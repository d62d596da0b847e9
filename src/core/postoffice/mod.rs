//! Bindings and routing.
//!
//! The post office maps address patterns to queues. Routing a message
//! finds every live binding whose address matches the message address and
//! whose queue filter accepts it, then adds one reference per queue.

pub mod binding;
pub mod queue_info;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, trace, warn, Span};

use crate::core::address::Address;
use crate::core::distributor::DistributionPolicy;
use crate::core::error::{BrokerError, Result};
use crate::core::executor::Executor;
use crate::core::filter::parse_filter;
use crate::core::flow::AddressFlowController;
use crate::core::message::ServerMessage;
use crate::core::queue::{AddReferenceOperation, Queue, QueueContext};
use crate::core::reference::MessageReference;
use crate::core::settings::AddressSettingsRepository;
use crate::core::transaction::Transaction;
use crate::persistence::{QueueBindingInfo, StorageManager};

pub use binding::Binding;
pub use queue_info::QueueInfo;

const EVENT_CAPACITY: usize = 1024;

/// Sends messages to the queues bound to their address.
pub trait Router: Send + Sync + fmt::Debug {
    /// Routes `message`. Inside a transaction the references become
    /// visible on commit. Returns the bindings that received it.
    fn route(&self, message: ServerMessage, tx: Option<&mut Transaction>) -> Result<Vec<Arc<Binding>>>;

    /// Called once the last reference to a message is gone.
    fn message_released(&self, message: &ServerMessage);
}

/// Changes published for other nodes.
#[derive(Debug, Clone)]
pub enum BindingEvent {
    BindingAdded(QueueInfo),
    BindingRemoved {
        routing_name: String,
        cluster_name: String,
    },
    ConsumerAdded {
        cluster_name: String,
        filter: Option<String>,
    },
    ConsumerRemoved {
        cluster_name: String,
        filter: Option<String>,
    },
}

#[derive(Debug, Default)]
struct BindingTable {
    by_queue: HashMap<String, Arc<Binding>>,
    /// Bindings whose address has no wildcard, keyed by address.
    exact: HashMap<Address, Vec<Arc<Binding>>>,
    wildcard: Vec<Arc<Binding>>,
}

impl BindingTable {
    fn insert(&mut self, binding: Arc<Binding>) {
        if binding.address().contains_wildcard() {
            self.wildcard.push(binding.clone());
        } else {
            self.exact
                .entry(binding.address().clone())
                .or_default()
                .push(binding.clone());
        }
        self.by_queue
            .insert(binding.queue().name().to_string(), binding);
    }

    fn remove(&mut self, queue_name: &str) -> Option<Arc<Binding>> {
        let binding = self.by_queue.remove(queue_name)?;
        if binding.address().contains_wildcard() {
            self.wildcard.retain(|b| !Arc::ptr_eq(b, &binding));
        } else if let Some(list) = self.exact.get_mut(binding.address()) {
            list.retain(|b| !Arc::ptr_eq(b, &binding));
            if list.is_empty() {
                self.exact.remove(binding.address());
            }
        }
        Some(binding)
    }

    fn matching(&self, address: &Address) -> Vec<Arc<Binding>> {
        let mut out = Vec::new();
        if address.contains_wildcard() {
            for binding in self.by_queue.values() {
                if binding.address().matches(address) {
                    out.push(binding.clone());
                }
            }
            return out;
        }
        if let Some(list) = self.exact.get(address) {
            out.extend(list.iter().cloned());
        }
        out.extend(
            self.wildcard
                .iter()
                .filter(|b| b.address().matches(address))
                .cloned(),
        );
        out
    }
}

pub struct PostOffice {
    node_id: String,
    storage: Arc<dyn StorageManager>,
    settings: Arc<AddressSettingsRepository>,
    executor: Arc<dyn Executor>,
    distribution: DistributionPolicy,
    bindings: RwLock<BindingTable>,
    queue_infos: DashMap<String, QueueInfo>,
    flow_controllers: DashMap<Address, Arc<AddressFlowController>>,
    events: broadcast::Sender<BindingEvent>,
    span: Span,
    self_ref: Weak<PostOffice>,
}

impl PostOffice {
    pub fn new(
        node_id: impl Into<String>,
        storage: Arc<dyn StorageManager>,
        settings: Arc<AddressSettingsRepository>,
        executor: Arc<dyn Executor>,
        distribution: DistributionPolicy,
        parent: &Span,
    ) -> Arc<Self> {
        let node_id = node_id.into();
        let span = info_span!(parent: parent, "postoffice", node = %node_id);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|self_ref| Self {
            node_id,
            storage,
            settings,
            executor,
            distribution,
            bindings: RwLock::new(BindingTable::default()),
            queue_infos: DashMap::new(),
            flow_controllers: DashMap::new(),
            events,
            span,
            self_ref: self_ref.clone(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn storage(&self) -> &Arc<dyn StorageManager> {
        &self.storage
    }

    pub fn settings(&self) -> &Arc<AddressSettingsRepository> {
        &self.settings
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BindingEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: BindingEvent) {
        // No receivers is the normal single-node case.
        let _ = self.events.send(event);
    }

    fn queue_context(&self) -> QueueContext {
        QueueContext {
            storage: self.storage.clone(),
            settings: self.settings.clone(),
            executor: self.executor.clone(),
            distribution: self.distribution,
            span: self.span.clone(),
        }
    }

    fn new_queue(
        &self,
        id: u64,
        name: &str,
        address: &str,
        filter: Option<&str>,
        durable: bool,
        temporary: bool,
    ) -> Result<Arc<Queue>> {
        let filter = parse_filter(filter)?;
        let queue = Queue::new(id, name, address, filter, durable, temporary, self.queue_context());
        let router: Weak<dyn Router> = self.self_ref.clone();
        queue.set_router(router);
        Ok(queue)
    }

    // ───────────────────────────────────────────────────────────
    // Queues
    // ───────────────────────────────────────────────────────────

    /// Creates a queue and binds it locally. Durable queues are persisted
    /// before the binding becomes visible.
    pub fn create_queue(
        &self,
        name: &str,
        address: &str,
        filter: Option<&str>,
        durable: bool,
        temporary: bool,
    ) -> Result<Arc<Queue>> {
        if name.is_empty() || address.is_empty() {
            return Err(BrokerError::InvalidArgument(
                "queue name and address must not be empty".into(),
            ));
        }
        if self.bindings.read().by_queue.contains_key(name) {
            return Err(BrokerError::QueueExists(name.to_string()));
        }
        let id = self.storage.generate_unique_id();
        let queue = self.new_queue(id, name, address, filter, durable, temporary)?;
        if durable {
            self.storage.add_queue_binding(&QueueBindingInfo {
                id,
                name: name.to_string(),
                address: address.to_string(),
                filter: filter.map(str::to_string),
            })?;
        }
        if let Err(e) = self.bind(Address::new(address), queue.clone(), 0) {
            // Lost a race with another create of the same name.
            if durable {
                if let Err(cleanup) = self.storage.delete_queue_binding(id) {
                    warn!(parent: &self.span, queue = name, error = %cleanup, "failed to remove stored binding");
                }
            }
            return Err(e);
        }
        info!(parent: &self.span, queue = name, address, durable, temporary, "queue created");
        Ok(queue)
    }

    /// Rebuilds a durable queue from its stored binding without writing it again.
    pub fn load_queue(&self, info: &QueueBindingInfo) -> Result<Arc<Queue>> {
        let queue = self.new_queue(
            info.id,
            &info.name,
            &info.address,
            info.filter.as_deref(),
            true,
            false,
        )?;
        self.bind(Address::new(&info.address), queue.clone(), 0)?;
        Ok(queue)
    }

    /// Unbinds and deletes a queue along with every waiting reference.
    pub fn destroy_queue(&self, name: &str) -> Result<bool> {
        let binding = match self.unbind(name) {
            Some(binding) => binding,
            None => return Ok(false),
        };
        let queue = binding.queue();
        let deleted = queue.delete_all_references()?;
        if queue.is_durable() {
            self.storage.delete_queue_binding(queue.id())?;
        }
        info!(parent: &self.span, queue = name, deleted, "queue destroyed");
        Ok(true)
    }

    pub fn get_queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.bindings
            .read()
            .by_queue
            .get(name)
            .map(|b| b.queue().clone())
    }

    pub fn queues(&self) -> Vec<Arc<Queue>> {
        self.bindings
            .read()
            .by_queue
            .values()
            .map(|b| b.queue().clone())
            .collect()
    }

    pub fn queue_info(&self, name: &str) -> Option<QueueInfo> {
        self.queue_infos.get(name).map(|i| i.clone())
    }

    // ───────────────────────────────────────────────────────────
    // Bindings
    // ───────────────────────────────────────────────────────────

    pub fn bind(&self, address: Address, queue: Arc<Queue>, distance: u32) -> Result<Arc<Binding>> {
        let node_id = self.node_id.clone();
        self.bind_with_node(&node_id, address, queue, distance)
    }

    pub fn bind_with_node(
        &self,
        node_id: &str,
        address: Address,
        queue: Arc<Queue>,
        distance: u32,
    ) -> Result<Arc<Binding>> {
        let info = QueueInfo::new(
            queue.name(),
            queue.name(),
            address.as_str(),
            queue.filter().and_then(|f| f.expression()).map(str::to_string),
            queue.id(),
            Some(distance),
        )?;
        let binding = Arc::new(Binding::new(node_id, address, queue, distance));
        {
            let mut table = self.bindings.write();
            if table.by_queue.contains_key(binding.queue().name()) {
                return Err(BrokerError::QueueExists(binding.queue().name().to_string()));
            }
            table.insert(binding.clone());
        }
        self.queue_infos
            .insert(binding.queue().name().to_string(), info.clone());
        debug!(
            parent: &self.span,
            queue = binding.queue().name(),
            address = %binding.address(),
            node = node_id,
            distance,
            "binding added"
        );
        self.publish(BindingEvent::BindingAdded(info));
        Ok(binding)
    }

    pub fn unbind(&self, queue_name: &str) -> Option<Arc<Binding>> {
        let binding = self.bindings.write().remove(queue_name)?;
        self.queue_infos.remove(queue_name);
        debug!(parent: &self.span, queue = queue_name, "binding removed");
        self.publish(BindingEvent::BindingRemoved {
            routing_name: queue_name.to_string(),
            cluster_name: queue_name.to_string(),
        });
        Some(binding)
    }

    /// Live bindings whose address matches `address`.
    pub fn match_bindings(&self, address: &Address) -> Vec<Arc<Binding>> {
        let mut bindings = self.bindings.read().matching(address);
        bindings.retain(|b| !b.is_failed());
        bindings
    }

    pub fn all_bindings(&self) -> Vec<Arc<Binding>> {
        self.bindings.read().by_queue.values().cloned().collect()
    }

    /// Marks every binding owned by `node_id`. Returns how many changed.
    pub fn set_node_failed(&self, node_id: &str, failed: bool) -> usize {
        let table = self.bindings.read();
        let mut changed = 0;
        for binding in table.by_queue.values() {
            if binding.node_id() == node_id && binding.is_failed() != failed {
                binding.set_failed(failed);
                changed += 1;
            }
        }
        if changed > 0 {
            warn!(parent: &self.span, node = node_id, failed, changed, "node bindings updated");
        }
        changed
    }

    pub fn consumer_attached(&self, queue_name: &str, filter: Option<&str>) {
        if let Some(mut info) = self.queue_infos.get_mut(queue_name) {
            info.increment_consumers();
            if let Some(filter) = filter {
                info.add_filter_string(filter.to_string());
            }
        }
        self.publish(BindingEvent::ConsumerAdded {
            cluster_name: queue_name.to_string(),
            filter: filter.map(str::to_string),
        });
    }

    pub fn consumer_detached(&self, queue_name: &str, filter: Option<&str>) {
        if let Some(mut info) = self.queue_infos.get_mut(queue_name) {
            info.decrement_consumers();
            if let Some(filter) = filter {
                info.remove_filter_string(filter);
            }
        }
        self.publish(BindingEvent::ConsumerRemoved {
            cluster_name: queue_name.to_string(),
            filter: filter.map(str::to_string),
        });
    }

    // ───────────────────────────────────────────────────────────
    // Flow control
    // ───────────────────────────────────────────────────────────

    pub fn flow_controller(&self, address: &Address) -> Arc<AddressFlowController> {
        self.flow_controllers
            .entry(address.clone())
            .or_insert_with(|| {
                let max_size = self.settings.get_match(address).max_size_bytes;
                Arc::new(AddressFlowController::new(
                    address.clone(),
                    max_size,
                    self.executor.clone(),
                    &self.span,
                ))
            })
            .clone()
    }
}

impl Router for PostOffice {
    fn route(
        &self,
        message: ServerMessage,
        mut tx: Option<&mut Transaction>,
    ) -> Result<Vec<Arc<Binding>>> {
        let mut bindings = self.match_bindings(message.address());
        bindings.retain(|b| b.queue().filter().map_or(true, |f| f.matches(&message)));
        if bindings.is_empty() {
            debug!(
                parent: &self.span,
                address = %message.address(),
                message_id = message.id(),
                "no bindings for address, dropping message"
            );
            return Ok(bindings);
        }

        let message = Arc::new(message);
        let durable: Vec<&Arc<Binding>> = bindings
            .iter()
            .filter(|b| b.queue().is_durable() && message.is_durable())
            .collect();

        // Persist first so a storage failure leaves nothing half routed.
        let transactional = tx.is_some();
        if !durable.is_empty() {
            match tx.as_deref_mut() {
                None => {
                    self.storage.store_message(&message)?;
                    for binding in &durable {
                        self.storage
                            .store_reference(binding.queue().id(), message.id())?;
                    }
                }
                Some(tx) => {
                    self.storage.store_message_transactional(tx.id(), &message)?;
                    for binding in &durable {
                        self.storage.store_reference_transactional(
                            tx.id(),
                            binding.queue().id(),
                            message.id(),
                        )?;
                    }
                    tx.mark_persistent();
                }
            }
        }

        for binding in &bindings {
            let queue = binding.queue().clone();
            message.increment_ref_count();
            if queue.is_durable() && message.is_durable() {
                message.increment_durable_ref_count();
            }
            let reference = MessageReference::new(message.clone(), queue.id());
            match tx.as_deref_mut() {
                None => queue.add_last(reference),
                Some(tx) => tx.add_operation(Box::new(AddReferenceOperation {
                    queue,
                    reference: Some(reference),
                })),
            }
        }

        self.flow_controller(message.address())
            .message_routed(message.encode_size() as u64);
        trace!(
            parent: &self.span,
            message_id = message.id(),
            queues = bindings.len(),
            transactional,
            "message routed"
        );
        Ok(bindings)
    }

    fn message_released(&self, message: &ServerMessage) {
        let fc = self
            .flow_controllers
            .get(message.address())
            .map(|fc| fc.clone());
        if let Some(fc) = fc {
            fc.message_released(message.encode_size() as u64);
        }
    }
}

impl fmt::Debug for PostOffice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostOffice")
            .field("node_id", &self.node_id)
            .field("bindings", &self.bindings.read().by_queue.len())
            .finish()
    }
}
