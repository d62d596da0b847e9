//! Queue delivery engine.
//!
//! A queue owns message references in three disjoint places:
//! - `pending`: waiting for a consumer, highest priority first
//! - `scheduled`: deferred until a timestamp, then moved to `pending`
//! - `delivering`: handed to a consumer, waiting for ack or cancel
//!
//! All of it sits behind one mutex per queue. Consumers are called with
//! the lock held, so `Consumer::handle` must not block or call back into
//! the queue. Routing (expiry, dead letter, move) always happens after the
//! lock is released.

mod admin;
pub mod priority;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, info_span, trace, warn, Span};

use crate::core::address::Address;
use crate::core::consumer::{Consumer, ConsumerId};
use crate::core::distributor::{Distribution, DistributionPolicy, Distributor};
use crate::core::error::{BrokerError, Result};
use crate::core::executor::Executor;
use crate::core::filter::Filter;
use crate::core::message::{current_timestamp, ServerMessage};
use crate::core::postoffice::Router;
use crate::core::reference::MessageReference;
use crate::core::settings::AddressSettingsRepository;
use crate::core::transaction::{Transaction, TransactionOperation};
use crate::persistence::StorageManager;

use priority::{PriorityList, Visit};

/// Collaborators shared by every queue of a broker.
#[derive(Debug, Clone)]
pub struct QueueContext {
    pub storage: Arc<dyn StorageManager>,
    pub settings: Arc<AddressSettingsRepository>,
    pub executor: Arc<dyn Executor>,
    pub distribution: DistributionPolicy,
    /// Parent span for the queue's own logging span.
    pub span: Span,
}

#[derive(Debug)]
struct Delivering {
    reference: MessageReference,
    /// `None` when the reference was taken out by a management or
    /// failover operation rather than a consumer.
    consumer: Option<ConsumerId>,
}

#[derive(Debug)]
struct QueueState {
    pending: PriorityList,
    scheduled: BTreeMap<(u64, u64), MessageReference>,
    scheduled_seq: u64,
    delivering: HashMap<u64, Delivering>,
    distributor: Box<dyn Distributor>,
    backup: bool,
    consumers_to_failover: usize,
}

impl QueueState {
    fn take_waiting(&mut self, message_id: u64) -> Option<MessageReference> {
        if let Some(r) = self.pending.remove(message_id) {
            return Some(r);
        }
        let key = self
            .scheduled
            .iter()
            .find(|(_, r)| r.message_id() == message_id)
            .map(|(k, _)| *k)?;
        self.scheduled.remove(&key)
    }

    fn take_waiting_where<F>(&mut self, mut pred: F) -> Vec<MessageReference>
    where
        F: FnMut(&MessageReference) -> bool,
    {
        let mut taken = self.pending.remove_where(&mut pred);
        let keys: Vec<(u64, u64)> = self
            .scheduled
            .iter()
            .filter(|(_, r)| pred(r))
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            if let Some(r) = self.scheduled.remove(&key) {
                taken.push(r);
            }
        }
        taken
    }
}

pub struct Queue {
    id: u64,
    name: String,
    address: Address,
    filter: Option<Arc<dyn Filter>>,
    durable: bool,
    temporary: bool,
    storage: Arc<dyn StorageManager>,
    settings: Arc<AddressSettingsRepository>,
    executor: Arc<dyn Executor>,
    router: RwLock<Option<Weak<dyn Router>>>,
    state: Mutex<QueueState>,
    messages_added: AtomicU64,
    span: Span,
    self_ref: Weak<Queue>,
}

impl Queue {
    pub fn new(
        id: u64,
        name: impl Into<String>,
        address: impl Into<Address>,
        filter: Option<Arc<dyn Filter>>,
        durable: bool,
        temporary: bool,
        context: QueueContext,
    ) -> Arc<Self> {
        let name = name.into();
        let address = address.into();
        let span = info_span!(parent: &context.span, "queue", queue = %name, queue_id = id);
        Arc::new_cyclic(|self_ref| Self {
            id,
            name,
            address,
            filter,
            durable,
            temporary,
            storage: context.storage,
            settings: context.settings,
            executor: context.executor,
            router: RwLock::new(None),
            state: Mutex::new(QueueState {
                pending: PriorityList::default(),
                scheduled: BTreeMap::new(),
                scheduled_seq: 0,
                delivering: HashMap::new(),
                distributor: context.distribution.create(),
                backup: false,
                consumers_to_failover: 0,
            }),
            messages_added: AtomicU64::new(0),
            span,
            self_ref: self_ref.clone(),
        })
    }

    // ───────────────────────────────────────────────────────────
    // Identity
    // ───────────────────────────────────────────────────────────

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn filter(&self) -> Option<&Arc<dyn Filter>> {
        self.filter.as_ref()
    }

    #[inline]
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    #[inline]
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Attaches the router used for expiry, dead letter and move.
    pub fn set_router(&self, router: Weak<dyn Router>) {
        *self.router.write() = Some(router);
    }

    fn router(&self) -> Option<Arc<dyn Router>> {
        self.router.read().as_ref().and_then(Weak::upgrade)
    }

    fn this(&self) -> Result<Arc<Queue>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| BrokerError::Internal(format!("queue {} is being dropped", self.name)))
    }

    // ───────────────────────────────────────────────────────────
    // Adding references
    // ───────────────────────────────────────────────────────────

    /// Appends a reference and triggers a delivery pass. References with
    /// a future scheduled delivery time are parked until then.
    pub fn add_last(&self, reference: MessageReference) {
        self.messages_added.fetch_add(1, Ordering::Relaxed);
        let now = current_timestamp();
        {
            let mut state = self.state.lock();
            match reference.scheduled_delivery_time() {
                Some(at) if at > now => self.schedule_locked(&mut state, reference, at, now),
                _ => state.pending.push_back(reference),
            }
        }
        self.deliver_async(self.executor.as_ref());
    }

    /// Puts a reference at the head of its priority level.
    pub fn add_first(&self, reference: MessageReference) {
        self.state.lock().pending.push_front(reference);
        self.deliver_async(self.executor.as_ref());
    }

    /// Hands back references that were taken out of the queue for an
    /// operation that then failed. Each goes back to the head of its
    /// priority level, or to the schedule if it is not due yet; the first
    /// one ends up first. Starts no delivery pass, so an expired reference
    /// whose expiry keeps failing is not retried in a loop.
    pub(crate) fn restore_waiting(&self, references: Vec<MessageReference>) {
        if references.is_empty() {
            return;
        }
        let now = current_timestamp();
        let mut state = self.state.lock();
        for reference in references.into_iter().rev() {
            match reference.scheduled_delivery_time() {
                Some(at) if at > now => self.schedule_locked(&mut state, reference, at, now),
                _ => state.pending.push_front(reference),
            }
        }
    }

    /// Adds a reference for an already stored message without writing to
    /// storage. Used when replaying state on a backup or after recovery.
    pub fn reroute(
        &self,
        message: Arc<ServerMessage>,
        tx: Option<&mut Transaction>,
    ) -> Result<MessageReference> {
        let reference = MessageReference::new(message.clone(), self.id);
        message.increment_ref_count();
        if self.durable && message.is_durable() {
            message.increment_durable_ref_count();
        }
        match tx {
            Some(tx) => tx.add_operation(Box::new(AddReferenceOperation {
                queue: self.this()?,
                reference: Some(reference.clone()),
            })),
            None => self.add_last(reference.clone()),
        }
        Ok(reference)
    }

    /// Restores a stored reference with its delivery state.
    pub fn load_reference(
        &self,
        message: Arc<ServerMessage>,
        delivery_count: u32,
        scheduled_delivery_time: Option<u64>,
    ) -> MessageReference {
        let mut reference = MessageReference::new(message.clone(), self.id);
        reference.set_delivery_count(delivery_count);
        reference.set_scheduled_delivery_time(scheduled_delivery_time);
        message.increment_ref_count();
        if self.durable && message.is_durable() {
            message.increment_durable_ref_count();
        }
        self.add_last(reference.clone());
        reference
    }

    fn schedule_locked(
        &self,
        state: &mut QueueState,
        reference: MessageReference,
        at: u64,
        now: u64,
    ) {
        state.scheduled_seq += 1;
        let key = (at, state.scheduled_seq);
        state.scheduled.insert(key, reference);

        let weak = self.self_ref.clone();
        self.executor.schedule(
            Duration::from_millis(at.saturating_sub(now)),
            Box::new(move || {
                if let Some(queue) = weak.upgrade() {
                    queue.fire_scheduled(key);
                }
            }),
        );
    }

    fn fire_scheduled(&self, key: (u64, u64)) {
        let moved = {
            let mut state = self.state.lock();
            match state.scheduled.remove(&key) {
                Some(mut reference) => {
                    reference.set_scheduled_delivery_time(None);
                    state.pending.push_back(reference);
                    true
                }
                None => false,
            }
        };
        if moved {
            trace!(parent: &self.span, "scheduled reference became deliverable");
            self.deliver_async(self.executor.as_ref());
        }
    }

    // ───────────────────────────────────────────────────────────
    // Delivery
    // ───────────────────────────────────────────────────────────

    /// Schedules a delivery pass on `executor`.
    pub fn deliver_async(&self, executor: &dyn Executor) {
        let weak = self.self_ref.clone();
        executor.execute(Box::new(move || {
            if let Some(queue) = weak.upgrade() {
                queue.deliver_now();
            }
        }));
    }

    /// Schedules a delivery pass on the queue's own executor.
    pub fn force_delivery(&self) {
        self.deliver_async(self.executor.as_ref());
    }

    /// Runs a delivery pass on the calling thread.
    pub fn deliver_now(&self) {
        let now = current_timestamp();
        let mut expired = Vec::new();
        let mut delivered = 0usize;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.backup || state.pending.is_empty() {
                return;
            }
            if state.distributor.consumers().is_empty() {
                return;
            }
            let delivering = &mut state.delivering;
            let distributor = &mut state.distributor;
            state.pending.visit(|reference| {
                if reference.is_expired(now) {
                    expired.push(reference.clone());
                    return Visit::Take;
                }
                match distributor.distribute(reference) {
                    Distribution::Handled(consumer) => {
                        delivering.insert(
                            reference.message_id(),
                            Delivering {
                                reference: reference.clone(),
                                consumer: Some(consumer),
                            },
                        );
                        delivered += 1;
                        Visit::Take
                    }
                    Distribution::NoMatch => Visit::Keep,
                    Distribution::Busy => Visit::Stop,
                }
            });
        }

        if delivered > 0 {
            trace!(parent: &self.span, delivered, "delivery pass");
        }
        for reference in expired {
            let message_id = reference.message_id();
            if let Err(e) = self.expire_reference(reference) {
                warn!(parent: &self.span, message_id, error = %e, "failed to expire reference");
            }
        }
    }

    // ───────────────────────────────────────────────────────────
    // Consumers
    // ───────────────────────────────────────────────────────────

    pub fn add_consumer(&self, consumer: Arc<dyn Consumer>) {
        debug!(parent: &self.span, consumer_id = consumer.id(), "consumer attached");
        self.state.lock().distributor.add_consumer(consumer);
        self.deliver_async(self.executor.as_ref());
    }

    pub fn remove_consumer(&self, consumer_id: ConsumerId) -> bool {
        let removed = self
            .state
            .lock()
            .distributor
            .remove_consumer(consumer_id)
            .is_some();
        if removed {
            debug!(parent: &self.span, consumer_id, "consumer detached");
        }
        removed
    }

    pub fn consumers(&self) -> Vec<Arc<dyn Consumer>> {
        self.state.lock().distributor.consumers().to_vec()
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().distributor.consumers().len()
    }

    pub fn distribution_policy(&self) -> DistributionPolicy {
        self.state.lock().distributor.policy()
    }

    pub fn set_distribution_policy(&self, policy: DistributionPolicy) {
        let mut state = self.state.lock();
        if state.distributor.policy() == policy {
            return;
        }
        let consumers = state.distributor.drain_consumers();
        let mut distributor = policy.create();
        for consumer in consumers {
            distributor.add_consumer(consumer);
        }
        state.distributor = distributor;
    }

    // ───────────────────────────────────────────────────────────
    // Counters
    // ───────────────────────────────────────────────────────────

    /// References waiting in the pending list.
    pub fn message_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn delivering_count(&self) -> usize {
        self.state.lock().delivering.len()
    }

    pub fn scheduled_count(&self) -> usize {
        self.state.lock().scheduled.len()
    }

    pub fn scheduled_messages(&self) -> Vec<MessageReference> {
        self.state.lock().scheduled.values().cloned().collect()
    }

    /// Total references ever added to this queue.
    pub fn messages_added(&self) -> u64 {
        self.messages_added.load(Ordering::Relaxed)
    }

    // ───────────────────────────────────────────────────────────
    // Acknowledgement and cancellation
    // ───────────────────────────────────────────────────────────

    /// Removes a delivered reference. Returns false if it was not being
    /// delivered by this queue.
    pub fn acknowledge(&self, reference: &MessageReference) -> Result<bool> {
        let removed = self
            .state
            .lock()
            .delivering
            .remove(&reference.message_id());
        match removed {
            Some(d) => match self.post_acknowledge(&d.reference) {
                Ok(()) => Ok(true),
                Err(e) => {
                    self.state.lock().delivering.insert(d.reference.message_id(), d);
                    Err(e)
                }
            },
            None => {
                debug!(
                    parent: &self.span,
                    message_id = reference.message_id(),
                    "acknowledge for a reference that is not being delivered"
                );
                Ok(false)
            }
        }
    }

    /// Acknowledges inside `tx`; the reference leaves the delivering set
    /// on commit and returns to the head of the queue on rollback.
    pub fn acknowledge_transactional(
        &self,
        tx: &mut Transaction,
        reference: &MessageReference,
    ) -> Result<bool> {
        let held = self
            .state
            .lock()
            .delivering
            .get(&reference.message_id())
            .map(|d| d.reference.clone());
        match held {
            Some(reference) => {
                self.ack_in_tx(tx, reference, AckSource::Delivering)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Acknowledges, inside `tx`, a reference that is still pending here
    /// (it was consumed elsewhere, e.g. on the live node before failover).
    pub fn reacknowledge(&self, tx: &mut Transaction, reference: &MessageReference) -> Result<bool> {
        let id = reference.message_id();
        let taken = {
            let mut state = self.state.lock();
            let taken = state.take_waiting(id);
            if let Some(r) = &taken {
                state.delivering.insert(
                    id,
                    Delivering {
                        reference: r.clone(),
                        consumer: None,
                    },
                );
            }
            taken
        };
        match taken {
            Some(reference) => {
                self.ack_in_tx(tx, reference, AckSource::Delivering)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Returns a delivered reference to the head of the queue with its
    /// delivery count incremented. Inside a transaction this happens when
    /// the transaction ends. Returns the new delivery count, or `None`
    /// if the reference was not being delivered.
    pub fn cancel(
        &self,
        tx: Option<&mut Transaction>,
        reference: &MessageReference,
    ) -> Result<Option<u32>> {
        match tx {
            None => self.cancel_now(reference.message_id(), true),
            Some(tx) => {
                let held = self
                    .state
                    .lock()
                    .delivering
                    .get(&reference.message_id())
                    .map(|d| d.reference.delivery_count());
                match held {
                    Some(count) => {
                        tx.add_operation(Box::new(CancelOperation {
                            queue: self.this()?,
                            message_id: reference.message_id(),
                            count_attempt: true,
                        }));
                        Ok(Some(count + 1))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    /// Returns a delivered reference the client never acknowledged once
    /// `tx` ends, without counting it as a failed delivery attempt.
    pub fn return_unacknowledged(
        &self,
        tx: &mut Transaction,
        reference: &MessageReference,
    ) -> Result<bool> {
        let held = self
            .state
            .lock()
            .delivering
            .contains_key(&reference.message_id());
        if held {
            tx.add_operation(Box::new(CancelOperation {
                queue: self.this()?,
                message_id: reference.message_id(),
                count_attempt: false,
            }));
        }
        Ok(held)
    }

    fn cancel_now(&self, message_id: u64, count_attempt: bool) -> Result<Option<u32>> {
        let mut reference = match self.state.lock().delivering.remove(&message_id) {
            Some(d) => d.reference,
            None => return Ok(None),
        };
        if !count_attempt {
            let count = reference.delivery_count();
            self.add_first(reference);
            debug!(parent: &self.span, message_id, delivery_count = count, "reference returned");
            return Ok(Some(count));
        }
        let count = reference.increment_delivery_count();
        let persistent = self.durable && reference.message().is_durable();

        let mut outcome = Ok(Some(count));
        if persistent {
            if let Err(e) = self.storage.update_delivery_count(&reference) {
                outcome = Err(e);
            }
        }

        let delay = self.settings.get_match(&self.address).redelivery_delay_ms;
        if delay > 0 {
            let now = current_timestamp();
            let at = now + delay;
            reference.set_scheduled_delivery_time(Some(at));
            if persistent {
                if let Err(e) = self.storage.update_scheduled_delivery_time(&reference) {
                    outcome = Err(e);
                }
            }
            let mut state = self.state.lock();
            self.schedule_locked(&mut state, reference, at, now);
        } else {
            self.state.lock().pending.push_front(reference);
            self.deliver_async(self.executor.as_ref());
        }
        debug!(parent: &self.span, message_id, delivery_count = count, "reference cancelled");
        outcome
    }

    /// Writes the acknowledgement of a reference that is no longer in any
    /// list and releases it. On error nothing has changed and the caller
    /// still owns the reference.
    fn post_acknowledge(&self, reference: &MessageReference) -> Result<()> {
        let message = reference.message();
        if self.durable && message.is_durable() {
            self.storage.store_acknowledge(self.id, message.id())?;
            if message.decrement_durable_ref_count() == 0 {
                // The acknowledgement is already stored; a message left
                // behind has no references and is deleted at the next start.
                if let Err(e) = self.storage.delete_message(message.id()) {
                    warn!(
                        parent: &self.span,
                        message_id = message.id(),
                        error = %e,
                        "failed to delete fully acknowledged message"
                    );
                }
            }
        }
        self.release(reference);
        Ok(())
    }

    fn release(&self, reference: &MessageReference) {
        let message = reference.message();
        if message.decrement_ref_count() == 0 {
            if let Some(router) = self.router() {
                router.message_released(message);
            }
        }
    }

    fn ack_in_tx(
        &self,
        tx: &mut Transaction,
        reference: MessageReference,
        source: AckSource,
    ) -> Result<()> {
        let message = reference.message().clone();
        let durable = self.durable && message.is_durable();
        if durable {
            if let Err(e) = self
                .storage
                .store_acknowledge_transactional(tx.id(), self.id, message.id())
            {
                tx.mark_rollback_only();
                return Err(e);
            }
            tx.mark_persistent();
            if message.decrement_durable_ref_count() == 0 {
                if let Err(e) = self.storage.delete_message_transactional(tx.id(), message.id()) {
                    // The acknowledgement record is in the transaction but
                    // nothing else is; the transaction must not commit.
                    message.increment_durable_ref_count();
                    tx.mark_rollback_only();
                    return Err(e);
                }
            }
        }
        tx.add_operation(Box::new(AckOperation {
            queue: self.this()?,
            reference,
            durable,
            source,
        }));
        Ok(())
    }

    // ───────────────────────────────────────────────────────────
    // Backup / failover
    // ───────────────────────────────────────────────────────────

    /// Puts the queue in passive mode: it keeps references but does not deliver.
    pub fn set_backup(&self) {
        let mut state = self.state.lock();
        state.backup = true;
        state.consumers_to_failover = 0;
    }

    pub fn is_backup(&self) -> bool {
        self.state.lock().backup
    }

    /// Starts activation. Activates immediately when no consumers are
    /// expected to fail over; otherwise waits for `consumer_failed_over`.
    pub fn activate(&self) -> bool {
        let activated = {
            let mut state = self.state.lock();
            state.consumers_to_failover = state.distributor.consumers().len();
            if state.consumers_to_failover == 0 {
                state.backup = false;
                true
            } else {
                false
            }
        };
        if activated {
            info!(parent: &self.span, "queue activated");
            self.deliver_async(self.executor.as_ref());
        }
        activated
    }

    /// Activates regardless of consumers still expected to fail over.
    pub fn activate_now(&self, executor: &dyn Executor) {
        let was_backup = {
            let mut state = self.state.lock();
            let was_backup = state.backup;
            state.backup = false;
            state.consumers_to_failover = 0;
            was_backup
        };
        if was_backup {
            info!(
                parent: &self.span,
                "timed out waiting for consumers to fail over, activating queue now"
            );
        }
        self.deliver_async(executor);
    }

    /// Records one consumer reattached after failover. Returns true when
    /// that was the last one and the queue became active.
    pub fn consumer_failed_over(&self) -> bool {
        let activated = {
            let mut state = self.state.lock();
            if !state.backup {
                return false;
            }
            state.consumers_to_failover = state.consumers_to_failover.saturating_sub(1);
            if state.consumers_to_failover == 0 {
                state.backup = false;
                true
            } else {
                false
            }
        };
        if activated {
            info!(parent: &self.span, "all consumers failed over, queue activated");
            self.deliver_async(self.executor.as_ref());
        }
        activated
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("durable", &self.durable)
            .field("temporary", &self.temporary)
            .finish()
    }
}

// ───────────────────────────────────────────────────────────
// Transaction operations
// ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckSource {
    /// The reference sits in the delivering set until the outcome.
    Delivering,
    /// The reference was already taken out of every list.
    Detached,
}

struct AckOperation {
    queue: Arc<Queue>,
    reference: MessageReference,
    durable: bool,
    source: AckSource,
}

impl TransactionOperation for AckOperation {
    fn after_commit(&mut self) {
        if self.source == AckSource::Delivering {
            self.queue
                .state
                .lock()
                .delivering
                .remove(&self.reference.message_id());
        }
        self.queue.release(&self.reference);
    }

    fn after_rollback(&mut self) {
        if self.durable {
            self.reference.message().increment_durable_ref_count();
        }
        match self.source {
            AckSource::Delivering => {
                if let Err(e) = self.queue.cancel_now(self.reference.message_id(), true) {
                    warn!(parent: &self.queue.span, error = %e, "cancel after rollback failed");
                }
            }
            AckSource::Detached => self.queue.restore_waiting(vec![self.reference.clone()]),
        }
    }
}

struct CancelOperation {
    queue: Arc<Queue>,
    message_id: u64,
    count_attempt: bool,
}

impl CancelOperation {
    fn run(&self) {
        if let Err(e) = self.queue.cancel_now(self.message_id, self.count_attempt) {
            warn!(parent: &self.queue.span, error = %e, "deferred cancel failed");
        }
    }
}

impl TransactionOperation for CancelOperation {
    fn after_commit(&mut self) {
        self.run();
    }

    fn after_rollback(&mut self) {
        self.run();
    }
}

/// Makes a routed reference visible once the transaction commits.
pub(crate) struct AddReferenceOperation {
    pub(crate) queue: Arc<Queue>,
    pub(crate) reference: Option<MessageReference>,
}

impl TransactionOperation for AddReferenceOperation {
    fn after_commit(&mut self) {
        if let Some(reference) = self.reference.take() {
            self.queue.add_last(reference);
        }
    }

    fn after_rollback(&mut self) {
        if let Some(reference) = self.reference.take() {
            let message = reference.message();
            if self.queue.durable && message.is_durable() {
                message.decrement_durable_ref_count();
            }
            self.queue.release(&reference);
        }
    }
}
