//! Server side of a client session.
//!
//! A session owns the producers and consumers a client created, and for
//! transacted sessions the transaction currently collecting its sends and
//! acknowledgements. Cancelled deliveries go through the max-delivery
//! policy here before they return to their queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, info_span, warn, Span};
use uuid::Uuid;

use crate::core::address::Address;
use crate::core::consumer::{ConsumerId, ServerConsumer};
use crate::core::error::{BrokerError, Result};
use crate::core::filter::parse_filter;
use crate::core::flow::{FlowController, ServerProducer};
use crate::core::id_generator::MessageIdGenerator;
use crate::core::message::ServerMessage;
use crate::core::outbound::OutboundSender;
use crate::core::postoffice::PostOffice;
use crate::core::queue::Queue;
use crate::core::reference::MessageReference;
use crate::core::transaction::Transaction;
use crate::wire::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionKind {
    #[default]
    Generic,
    /// Point-to-point only: consumers attach to existing queues.
    Queue,
    /// Publish/subscribe: each consumer gets its own temporary queue.
    Topic,
    /// Always transacted.
    Xa,
}

impl SessionKind {
    pub fn to_byte(self) -> u8 {
        match self {
            SessionKind::Generic => 0,
            SessionKind::Queue => 1,
            SessionKind::Topic => 2,
            SessionKind::Xa => 3,
        }
    }

    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(SessionKind::Generic),
            1 => Ok(SessionKind::Queue),
            2 => Ok(SessionKind::Topic),
            3 => Ok(SessionKind::Xa),
            other => Err(BrokerError::Decode(format!("unknown session kind {other}"))),
        }
    }

    fn name(self) -> &'static str {
        match self {
            SessionKind::Generic => "generic",
            SessionKind::Queue => "queue",
            SessionKind::Topic => "topic",
            SessionKind::Xa => "xa",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub kind: SessionKind,
    pub transacted: bool,
    pub producer_window_size: i64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            kind: SessionKind::Generic,
            transacted: false,
            producer_window_size: 64 * 1024,
        }
    }
}

pub struct ServerSession {
    id: String,
    kind: SessionKind,
    transacted: bool,
    producer_window_size: i64,
    post_office: Arc<PostOffice>,
    id_generator: Arc<MessageIdGenerator>,
    producers: DashMap<u64, Arc<ServerProducer>>,
    consumers: DashMap<ConsumerId, Arc<ServerConsumer>>,
    /// Temporary queues created for topic subscriptions, by consumer.
    subscriptions: DashMap<ConsumerId, String>,
    tx: Mutex<Option<Transaction>>,
    started: AtomicBool,
    closed: AtomicBool,
    outbound: OutboundSender,
    span: Span,
}

impl ServerSession {
    pub fn new(
        options: SessionOptions,
        post_office: Arc<PostOffice>,
        id_generator: Arc<MessageIdGenerator>,
        outbound: OutboundSender,
        parent: &Span,
    ) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        let span = info_span!(parent: parent, "session", session = %id, kind = options.kind.name());
        let transacted = options.transacted || options.kind == SessionKind::Xa;
        debug!(parent: &span, transacted, "session created");
        Arc::new(Self {
            id,
            kind: options.kind,
            transacted,
            producer_window_size: options.producer_window_size,
            post_office,
            id_generator,
            producers: DashMap::new(),
            consumers: DashMap::new(),
            subscriptions: DashMap::new(),
            tx: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            outbound,
            span,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn is_transacted(&self) -> bool {
        self.transacted
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn consumer(&self, id: ConsumerId) -> Option<Arc<ServerConsumer>> {
        self.consumers.get(&id).map(|c| c.clone())
    }

    pub fn producer(&self, id: u64) -> Option<Arc<ServerProducer>> {
        self.producers.get(&id).map(|p| p.clone())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::SessionClosed);
        }
        Ok(())
    }

    /// Runs `f` with the current transaction, or with none on
    /// non-transacted sessions.
    fn with_tx<T>(&self, f: impl FnOnce(Option<&mut Transaction>) -> Result<T>) -> Result<T> {
        if !self.transacted {
            return f(None);
        }
        let mut guard = self.tx.lock();
        let tx = guard.get_or_insert_with(|| Transaction::new(self.post_office.storage().clone()));
        f(Some(tx))
    }

    // ───────────────────────────────────────────────────────────
    // Packet dispatch
    // ───────────────────────────────────────────────────────────

    /// Applies one inbound packet. Returns the response to send back.
    pub fn handle_packet(&self, packet: Packet) -> Result<Option<Packet>> {
        match packet {
            Packet::CreateQueue {
                name,
                address,
                filter,
                durable,
                temporary,
            } => {
                self.create_queue(&name, &address, filter.as_deref(), durable, temporary)?;
            }
            Packet::DeleteQueue { name } => {
                self.delete_queue(&name)?;
            }
            Packet::CreateProducer {
                producer_id,
                address,
            } => self.create_producer(producer_id, address.as_deref())?,
            Packet::CloseProducer { producer_id } => self.close_producer(producer_id)?,
            Packet::CreateConsumer {
                consumer_id,
                queue,
                filter,
                window_size,
            } => self.create_consumer(consumer_id, &queue, filter.as_deref(), window_size)?,
            Packet::CloseConsumer { consumer_id } => self.close_consumer(consumer_id)?,
            Packet::Start => self.start(),
            Packet::Stop => self.stop(),
            Packet::Send {
                producer_id,
                message,
            } => {
                self.send(producer_id, message)?;
            }
            Packet::Acknowledge {
                consumer_id,
                message_id,
            } => {
                self.acknowledge(consumer_id, message_id)?;
            }
            Packet::IndividualAcknowledge {
                consumer_id,
                message_id,
            } => {
                self.individual_acknowledge(consumer_id, message_id)?;
            }
            Packet::ConsumerCredits {
                consumer_id,
                credits,
            } => {
                // Credits carry no response.
                self.receive_consumer_credits(consumer_id, credits)?;
                return Ok(None);
            }
            Packet::Commit => self.commit()?,
            Packet::Rollback => self.rollback()?,
            Packet::Close => self.close()?,
            other => {
                return Err(BrokerError::InvalidArgument(format!(
                    "unexpected packet type {} on a session",
                    other.type_byte()
                )))
            }
        }
        Ok(Some(Packet::ok()))
    }

    // ───────────────────────────────────────────────────────────
    // Queues
    // ───────────────────────────────────────────────────────────

    pub fn create_queue(
        &self,
        name: &str,
        address: &str,
        filter: Option<&str>,
        durable: bool,
        temporary: bool,
    ) -> Result<Arc<Queue>> {
        self.ensure_open()?;
        if self.kind == SessionKind::Topic {
            return Err(BrokerError::Unsupported(self.kind.name()));
        }
        self.post_office
            .create_queue(name, address, filter, durable && !temporary, temporary)
    }

    pub fn delete_queue(&self, name: &str) -> Result<bool> {
        self.ensure_open()?;
        self.post_office.destroy_queue(name)
    }

    // ───────────────────────────────────────────────────────────
    // Producers
    // ───────────────────────────────────────────────────────────

    pub fn create_producer(&self, producer_id: u64, address: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        let address = address.map(Address::new);
        let flow_controller = address.as_ref().map(|a| {
            let fc: Arc<dyn FlowController> = self.post_office.flow_controller(a);
            fc
        });
        let producer = ServerProducer::new(
            producer_id,
            address,
            self.producer_window_size,
            flow_controller,
            self.outbound.clone(),
        );
        producer.send_initial_credits();
        self.producers.insert(producer_id, producer);
        Ok(())
    }

    pub fn close_producer(&self, producer_id: u64) -> Result<()> {
        self.producers
            .remove(&producer_id)
            .map(|_| ())
            .ok_or(BrokerError::ProducerNotFound(producer_id))
    }

    /// Assigns the message an id and routes it through `producer_id`.
    /// Returns how many queues received it.
    pub fn send(&self, producer_id: u64, mut message: ServerMessage) -> Result<usize> {
        self.ensure_open()?;
        let producer = self
            .producer(producer_id)
            .ok_or(BrokerError::ProducerNotFound(producer_id))?;
        message.set_id(self.id_generator.next_id()?);
        self.with_tx(|tx| producer.send(self.post_office.as_ref(), message, tx))
    }

    // ───────────────────────────────────────────────────────────
    // Consumers
    // ───────────────────────────────────────────────────────────

    /// Attaches a consumer. On topic sessions `queue` is an address and a
    /// temporary queue is created for the subscription.
    pub fn create_consumer(
        &self,
        consumer_id: ConsumerId,
        queue: &str,
        filter: Option<&str>,
        window_size: i64,
    ) -> Result<()> {
        self.ensure_open()?;
        if self.consumers.contains_key(&consumer_id) {
            return Err(BrokerError::InvalidArgument(format!(
                "consumer {consumer_id} already exists"
            )));
        }

        let target = if self.kind == SessionKind::Topic {
            let name = format!("{queue}.{}", Uuid::new_v4());
            let created = self.post_office.create_queue(&name, queue, None, false, true)?;
            self.subscriptions.insert(consumer_id, name);
            created
        } else {
            self.post_office
                .get_queue(queue)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?
        };

        let parsed = parse_filter(filter)?;
        let consumer = ServerConsumer::new(
            consumer_id,
            target.clone(),
            parsed,
            window_size,
            self.outbound.clone(),
            &self.span,
        );
        self.consumers.insert(consumer_id, consumer.clone());
        target.add_consumer(consumer.clone());
        self.post_office.consumer_attached(target.name(), filter);
        if window_size > 0 {
            consumer.receive_credits(window_size);
        }
        if self.started.load(Ordering::Acquire) {
            consumer.set_started(true);
        }
        debug!(parent: &self.span, consumer_id, queue = target.name(), "consumer created");
        Ok(())
    }

    pub fn close_consumer(&self, consumer_id: ConsumerId) -> Result<()> {
        let (_, consumer) = self
            .consumers
            .remove(&consumer_id)
            .ok_or(BrokerError::ConsumerNotFound(consumer_id))?;
        let queue = consumer.queue().clone();
        let unacknowledged = consumer.close();
        for reference in &unacknowledged {
            self.cancel_delivered(&queue, reference)?;
        }
        let filter = consumer_filter(&consumer);
        self.post_office
            .consumer_detached(queue.name(), filter.as_deref());
        if let Some((_, name)) = self.subscriptions.remove(&consumer_id) {
            self.post_office.destroy_queue(&name)?;
        }
        Ok(())
    }

    pub fn receive_consumer_credits(&self, consumer_id: ConsumerId, credits: i64) -> Result<()> {
        self.consumer(consumer_id)
            .ok_or(BrokerError::ConsumerNotFound(consumer_id))?
            .receive_credits(credits);
        Ok(())
    }

    pub fn acknowledge(&self, consumer_id: ConsumerId, message_id: u64) -> Result<usize> {
        self.ensure_open()?;
        let consumer = self
            .consumer(consumer_id)
            .ok_or(BrokerError::ConsumerNotFound(consumer_id))?;
        self.with_tx(|tx| consumer.acknowledge(tx, message_id))
    }

    pub fn individual_acknowledge(&self, consumer_id: ConsumerId, message_id: u64) -> Result<bool> {
        self.ensure_open()?;
        let consumer = self
            .consumer(consumer_id)
            .ok_or(BrokerError::ConsumerNotFound(consumer_id))?;
        self.with_tx(|tx| consumer.individual_acknowledge(tx, message_id))
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
        for consumer in self.consumers.iter() {
            consumer.set_started(true);
        }
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::Release);
        for consumer in self.consumers.iter() {
            consumer.set_started(false);
        }
    }

    /// Returns a delivered reference to its queue, or sends it to the dead
    /// letter address once it has used up its delivery attempts.
    fn cancel_delivered(&self, queue: &Arc<Queue>, reference: &MessageReference) -> Result<()> {
        let max = self
            .post_office
            .settings()
            .get_match(queue.address())
            .max_delivery_attempts;
        if max > 0 && reference.delivery_count() + 1 >= max {
            warn!(
                parent: &self.span,
                message_id = reference.message_id(),
                queue = queue.name(),
                attempts = reference.delivery_count() + 1,
                "delivery attempts exhausted, sending to dead letter address"
            );
            queue.send_to_dead_letter(reference)?;
        } else {
            queue.cancel(None, reference)?;
        }
        Ok(())
    }

    // ───────────────────────────────────────────────────────────
    // Transactions
    // ───────────────────────────────────────────────────────────

    /// Commits the current transaction. If the commit fails the
    /// transaction is rolled back before the error is returned.
    pub fn commit(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.transacted {
            return Err(BrokerError::Unsupported("non-transacted"));
        }
        let tx = self.tx.lock().take();
        let mut tx = match tx {
            Some(tx) => tx,
            None => return Ok(()),
        };
        if let Err(e) = tx.commit() {
            warn!(parent: &self.span, tx_id = tx.id(), error = %e, "commit failed, rolling back");
            if let Err(rollback) = self.roll_back(tx) {
                warn!(parent: &self.span, error = %rollback, "rollback after failed commit failed");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Rolls back the current transaction. Acknowledged references go back
    /// to their queues as failed deliveries, delivered but unacknowledged
    /// ones go back as they were, and those out of delivery attempts are
    /// dead-lettered.
    pub fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.transacted {
            return Err(BrokerError::Unsupported("non-transacted"));
        }
        let tx = self
            .tx
            .lock()
            .take()
            .unwrap_or_else(|| Transaction::new(self.post_office.storage().clone()));
        self.roll_back(tx)
    }

    fn roll_back(&self, mut tx: Transaction) -> Result<()> {
        let was_started = self.started.load(Ordering::Acquire);
        if was_started {
            self.stop();
        }

        let mut queues: Vec<Arc<Queue>> = Vec::new();
        for consumer in self.consumers.iter() {
            let queue = consumer.queue();
            // Reversed so the earliest delivery ends up first in the queue.
            for reference in consumer.take_delivering().iter().rev() {
                if let Err(e) = queue.return_unacknowledged(&mut tx, reference) {
                    warn!(
                        parent: &self.span,
                        message_id = reference.message_id(),
                        error = %e,
                        "failed to return unacknowledged delivery"
                    );
                }
            }
            if !queues.iter().any(|q| Arc::ptr_eq(q, queue)) {
                queues.push(queue.clone());
            }
        }
        let mut outcome = tx.rollback();

        for queue in &queues {
            let max = self
                .post_office
                .settings()
                .get_match(queue.address())
                .max_delivery_attempts;
            if max == 0 {
                continue;
            }
            for reference in queue.list(None) {
                if reference.delivery_count() >= max {
                    if let Err(e) = queue.send_message_to_dead_letter_address(reference.message_id())
                    {
                        warn!(
                            parent: &self.span,
                            message_id = reference.message_id(),
                            error = %e,
                            "failed to dead-letter after rollback"
                        );
                        outcome = outcome.and(Err(e));
                    }
                }
            }
        }

        if was_started {
            self.start();
        }
        outcome
    }

    // ───────────────────────────────────────────────────────────
    // Close
    // ───────────────────────────────────────────────────────────

    /// Rolls back open work, cancels every unacknowledged delivery and
    /// removes temporary subscriptions. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.transacted {
            if let Err(e) = self.rollback() {
                warn!(parent: &self.span, error = %e, "rollback on close failed");
            }
        }
        self.closed.store(true, Ordering::Release);

        let ids: Vec<ConsumerId> = self.consumers.iter().map(|c| *c.key()).collect();
        for id in ids {
            if let Err(e) = self.close_consumer(id) {
                warn!(parent: &self.span, consumer_id = id, error = %e, "failed to close consumer");
            }
        }
        self.producers.clear();
        info!(parent: &self.span, "session closed");
        Ok(())
    }
}

fn consumer_filter(consumer: &ServerConsumer) -> Option<String> {
    consumer.filter().and_then(|f| f.expression()).map(str::to_string)
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("transacted", &self.transacted)
            .field("producers", &self.producers.len())
            .field("consumers", &self.consumers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::distributor::DistributionPolicy;
    use crate::core::executor::DirectExecutor;
    use crate::core::outbound::{self, Outbound};
    use crate::core::settings::{AddressSettings, AddressSettingsRepository};
    use crate::persistence::{NullStorageManager, StorageIdSource, StorageManager};
    use bytes::Bytes;

    fn post_office(settings: AddressSettings) -> Arc<PostOffice> {
        PostOffice::new(
            "node-1",
            Arc::new(NullStorageManager::new()),
            Arc::new(AddressSettingsRepository::new(settings)),
            Arc::new(DirectExecutor),
            DistributionPolicy::RoundRobin,
            &Span::none(),
        )
    }

    fn session(
        post_office: &Arc<PostOffice>,
        options: SessionOptions,
    ) -> (Arc<ServerSession>, outbound::OutboundReceiver) {
        let storage: Arc<dyn StorageManager> = post_office.storage().clone();
        let ids = Arc::new(MessageIdGenerator::new(Arc::new(StorageIdSource(storage)), 16));
        let (tx, rx) = outbound::channel();
        let session = ServerSession::new(options, post_office.clone(), ids, tx, &Span::none());
        (session, rx)
    }

    fn deliveries(rx: &mut outbound::OutboundReceiver) -> Vec<(u64, u32)> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Outbound::Deliver { reference, .. } = event {
                out.push((reference.message_id(), reference.delivery_count()));
            }
        }
        out
    }

    #[test]
    fn topic_subscription_uses_a_temporary_queue() {
        let po = post_office(AddressSettings::default());
        let options = SessionOptions {
            kind: SessionKind::Topic,
            ..SessionOptions::default()
        };
        let (session, mut rx) = session(&po, options);
        session.create_consumer(1, "news.sport", None, -1).unwrap();
        session.start();
        assert_eq!(po.queues().len(), 1);

        session.create_producer(10, Some("news.sport")).unwrap();
        session
            .send(10, ServerMessage::new(0, "news.sport", Bytes::from_static(b"goal")))
            .unwrap();
        assert_eq!(deliveries(&mut rx).len(), 1);

        session.close_consumer(1).unwrap();
        assert!(po.queues().is_empty());
        assert!(session.create_queue("q", "a", None, false, false).is_err());
    }

    #[test]
    fn closing_consumer_dead_letters_exhausted_references() {
        let po = post_office(AddressSettings {
            max_delivery_attempts: 2,
            dead_letter_address: Some("dla".into()),
            ..AddressSettings::default()
        });
        let dla = po.create_queue("dla", "dla", None, false, false).unwrap();
        let (session, mut rx) = session(&po, SessionOptions::default());
        session.create_queue("work", "work", None, false, false).unwrap();
        session.create_producer(1, None).unwrap();
        session
            .send(1, ServerMessage::new(0, "work", Bytes::from_static(b"job")))
            .unwrap();

        session.start();
        session.create_consumer(1, "work", None, -1).unwrap();
        session.close_consumer(1).unwrap();
        session.create_consumer(2, "work", None, -1).unwrap();
        assert_eq!(deliveries(&mut rx).iter().map(|d| d.1).collect::<Vec<_>>(), vec![0, 1]);

        session.close_consumer(2).unwrap();
        assert_eq!(po.get_queue("work").unwrap().message_count(), 0);
        assert_eq!(dla.message_count(), 1);
    }

    #[test]
    fn transacted_send_is_visible_on_commit() {
        let po = post_office(AddressSettings::default());
        let queue = po.create_queue("q", "a", None, false, false).unwrap();
        let options = SessionOptions {
            transacted: true,
            ..SessionOptions::default()
        };
        let (session, _rx) = session(&po, options);
        session.create_producer(1, Some("a")).unwrap();
        session.send(1, ServerMessage::new(0, "a", Bytes::new())).unwrap();
        assert_eq!(queue.message_count(), 0);
        session.commit().unwrap();
        assert_eq!(queue.message_count(), 1);

        session.send(1, ServerMessage::new(0, "a", Bytes::new())).unwrap();
        session.rollback().unwrap();
        assert_eq!(queue.message_count(), 1);
    }

    #[test]
    fn rollback_returns_unacknowledged_deliveries() {
        let po = post_office(AddressSettings::default());
        let queue = po.create_queue("q", "a", None, false, false).unwrap();
        let options = SessionOptions {
            transacted: true,
            ..SessionOptions::default()
        };
        let (session, mut rx) = session(&po, options);
        session.create_producer(1, Some("a")).unwrap();
        for _ in 0..2 {
            session.send(1, ServerMessage::new(0, "a", Bytes::new())).unwrap();
        }
        session.commit().unwrap();
        session.create_consumer(1, "q", None, -1).unwrap();
        session.start();
        let first = deliveries(&mut rx);
        assert_eq!(first.len(), 2);

        session.acknowledge(1, first[0].0).unwrap();
        session.rollback().unwrap();
        let mut again = deliveries(&mut rx);
        again.sort();
        assert_eq!(again, vec![(first[0].0, 1), (first[1].0, 0)]);
        assert_eq!(queue.delivering_count(), 2);

        // Nothing acknowledged yet; the deliveries still go back.
        session.rollback().unwrap();
        let mut third = deliveries(&mut rx);
        third.sort();
        assert_eq!(third, vec![(first[0].0, 1), (first[1].0, 0)]);
    }

    #[test]
    fn commit_requires_a_transacted_session() {
        let po = post_office(AddressSettings::default());
        let (session, _rx) = session(&po, SessionOptions::default());
        assert!(matches!(session.commit(), Err(BrokerError::Unsupported(_))));
        session.close().unwrap();
        assert!(matches!(
            session.create_producer(1, None),
            Err(BrokerError::SessionClosed)
        ));
    }
}
