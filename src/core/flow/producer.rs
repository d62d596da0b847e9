use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::core::address::Address;
use crate::core::error::Result;
use crate::core::message::ServerMessage;
use crate::core::outbound::{Outbound, OutboundSender};
use crate::core::postoffice::Router;
use crate::core::transaction::Transaction;

use super::FlowController;

/// Server side of a client producer. Counts the bytes sent since the last
/// grant and asks for more credits once a full window has been used.
#[derive(Debug)]
pub struct ServerProducer {
    id: u64,
    /// `None` for anonymous producers, which are never flow controlled.
    address: Option<Address>,
    window_size: i64,
    credits_to_send: AtomicI64,
    /// Set while a credit request is outstanding.
    waiting: AtomicBool,
    flow_controller: Option<Arc<dyn FlowController>>,
    outbound: OutboundSender,
}

impl ServerProducer {
    pub fn new(
        id: u64,
        address: Option<Address>,
        window_size: i64,
        flow_controller: Option<Arc<dyn FlowController>>,
        outbound: OutboundSender,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            address,
            window_size,
            credits_to_send: AtomicI64::new(0),
            waiting: AtomicBool::new(false),
            flow_controller,
            outbound,
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    pub fn window_size(&self) -> i64 {
        self.window_size
    }

    pub fn credits_to_send(&self) -> i64 {
        self.credits_to_send.load(Ordering::Acquire)
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }

    fn is_flow_controlled(&self) -> bool {
        self.flow_controller.is_some() && self.window_size > 0
    }

    /// Hands the client its first window. Does not touch the counters.
    pub fn send_initial_credits(&self) {
        if self.is_flow_controlled() {
            let _ = self.outbound.send(Outbound::ProducerCredits {
                producer_id: self.id,
                credits: self.window_size,
            });
        }
    }

    /// Routes `message` and accounts for its size.
    pub fn send(
        self: &Arc<Self>,
        router: &dyn Router,
        mut message: ServerMessage,
        tx: Option<&mut Transaction>,
    ) -> Result<usize> {
        if let Some(address) = &self.address {
            message.set_address(address.clone());
        }
        let size = message.encode_size() as i64;
        let routed = router.route(message, tx)?.len();
        self.on_sent(size);
        Ok(routed)
    }

    fn on_sent(self: &Arc<Self>, size: i64) {
        let flow_controller = match &self.flow_controller {
            Some(fc) if self.window_size > 0 => fc,
            _ => return,
        };
        let total = self.credits_to_send.fetch_add(size, Ordering::AcqRel) + size;
        if total >= self.window_size
            && self
                .waiting
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            trace!(
                target: "relaymq::flow",
                producer_id = self.id,
                credits = total,
                "requesting credits"
            );
            flow_controller.request_and_send_credits(self, total);
        }
    }

    /// Called by the flow controller with the granted amount.
    pub fn send_credits(&self, credits: i64) {
        self.credits_to_send.fetch_sub(credits, Ordering::AcqRel);
        let _ = self.outbound.send(Outbound::ProducerCredits {
            producer_id: self.id,
            credits,
        });
        self.waiting.store(false, Ordering::Release);
    }
}
