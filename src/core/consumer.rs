use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, Span};

use crate::core::error::Result;
use crate::core::filter::Filter;
use crate::core::outbound::{Outbound, OutboundSender};
use crate::core::queue::Queue;
use crate::core::reference::MessageReference;
use crate::core::transaction::Transaction;

pub type ConsumerId = u64;

/// Window size that turns consumer flow control off.
pub const UNLIMITED_WINDOW: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    Handled,
    /// Out of credits, stopped or closed.
    Busy,
    /// The consumer's filter rejects the message.
    NoMatch,
}

/// Anything a queue can hand references to. Called with the queue lock
/// held: implementations must not block or call back into the queue.
pub trait Consumer: Send + Sync + fmt::Debug {
    fn id(&self) -> ConsumerId;

    fn handle(&self, reference: &MessageReference) -> HandleStatus;
}

/// A client consumer attached to one queue. Deliveries go out through the
/// session's outbound channel; credits are counted in encoded bytes.
#[derive(Debug)]
pub struct ServerConsumer {
    id: ConsumerId,
    queue: Arc<Queue>,
    filter: Option<Arc<dyn Filter>>,
    credits: AtomicI64,
    flow_controlled: bool,
    started: AtomicBool,
    closed: AtomicBool,
    /// Delivered and not yet acknowledged, in delivery order.
    delivering: Mutex<VecDeque<MessageReference>>,
    outbound: OutboundSender,
    span: Span,
}

impl ServerConsumer {
    pub fn new(
        id: ConsumerId,
        queue: Arc<Queue>,
        filter: Option<Arc<dyn Filter>>,
        window_size: i64,
        outbound: OutboundSender,
        parent: &Span,
    ) -> Arc<Self> {
        let span = tracing::debug_span!(parent: parent, "consumer", consumer_id = id, queue = %queue.name());
        Arc::new(Self {
            id,
            queue,
            filter,
            credits: AtomicI64::new(0),
            flow_controlled: window_size != UNLIMITED_WINDOW,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            delivering: Mutex::new(VecDeque::new()),
            outbound,
            span,
        })
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn filter(&self) -> Option<&Arc<dyn Filter>> {
        self.filter.as_ref()
    }

    pub fn credits(&self) -> i64 {
        self.credits.load(Ordering::Acquire)
    }

    pub fn is_flow_controlled(&self) -> bool {
        self.flow_controlled
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn delivering_count(&self) -> usize {
        self.delivering.lock().len()
    }

    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::Release);
        if started {
            self.queue.force_delivery();
        }
    }

    /// Adds credits. Crossing from non-positive to positive restarts
    /// delivery on the queue.
    pub fn receive_credits(&self, credits: i64) {
        if !self.flow_controlled || credits == 0 {
            return;
        }
        let previous = self.credits.fetch_add(credits, Ordering::AcqRel);
        trace!(parent: &self.span, credits, total = previous + credits, "credits received");
        if previous <= 0 && previous + credits > 0 {
            self.queue.force_delivery();
        }
    }

    /// Acknowledges every delivered reference up to and including
    /// `message_id`. Returns how many were acknowledged; zero when the id
    /// is not being delivered to this consumer. A reference leaves this
    /// consumer only once its queue took the acknowledgement, so on error
    /// the failed reference and the ones after it are still delivered here.
    pub fn acknowledge(&self, mut tx: Option<&mut Transaction>, message_id: u64) -> Result<usize> {
        let acked: Vec<MessageReference> = {
            let delivering = self.delivering.lock();
            match delivering.iter().position(|r| r.message_id() == message_id) {
                Some(pos) => delivering.iter().take(pos + 1).cloned().collect(),
                None => return Ok(0),
            }
        };
        for reference in &acked {
            match tx.as_deref_mut() {
                Some(tx) => self.queue.acknowledge_transactional(tx, reference)?,
                None => self.queue.acknowledge(reference)?,
            };
            self.forget(reference.message_id());
        }
        Ok(acked.len())
    }

    /// Acknowledges a single delivered reference out of order.
    pub fn individual_acknowledge(
        &self,
        tx: Option<&mut Transaction>,
        message_id: u64,
    ) -> Result<bool> {
        let reference = self
            .delivering
            .lock()
            .iter()
            .find(|r| r.message_id() == message_id)
            .cloned();
        let reference = match reference {
            Some(reference) => reference,
            None => return Ok(false),
        };
        let acked = match tx {
            Some(tx) => self.queue.acknowledge_transactional(tx, &reference)?,
            None => self.queue.acknowledge(&reference)?,
        };
        self.forget(message_id);
        Ok(acked)
    }

    fn forget(&self, message_id: u64) {
        let mut delivering = self.delivering.lock();
        if let Some(pos) = delivering.iter().position(|r| r.message_id() == message_id) {
            delivering.remove(pos);
        }
    }

    /// Takes every delivered, unacknowledged reference away from this
    /// consumer without detaching it.
    pub fn take_delivering(&self) -> Vec<MessageReference> {
        self.delivering.lock().drain(..).collect()
    }

    /// Detaches from the queue and hands back every unacknowledged
    /// reference for the session to cancel.
    pub fn close(&self) -> Vec<MessageReference> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        self.queue.remove_consumer(self.id);
        let pending = self.take_delivering();
        debug!(parent: &self.span, unacknowledged = pending.len(), "consumer closed");
        pending
    }
}

impl Consumer for ServerConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn handle(&self, reference: &MessageReference) -> HandleStatus {
        if self.closed.load(Ordering::Acquire) || !self.started.load(Ordering::Acquire) {
            return HandleStatus::Busy;
        }
        if let Some(filter) = &self.filter {
            if !filter.matches(reference.message()) {
                return HandleStatus::NoMatch;
            }
        }
        if self.flow_controlled && self.credits.load(Ordering::Acquire) <= 0 {
            return HandleStatus::Busy;
        }

        let delivery = Outbound::Deliver {
            consumer_id: self.id,
            reference: reference.clone(),
        };
        if self.outbound.send(delivery).is_err() {
            // Connection is gone; the session will close us.
            return HandleStatus::Busy;
        }
        if self.flow_controlled {
            let size = reference.message().encode_size() as i64;
            self.credits.fetch_sub(size, Ordering::AcqRel);
        }
        self.delivering.lock().push_back(reference.clone());
        HandleStatus::Handled
    }
}
