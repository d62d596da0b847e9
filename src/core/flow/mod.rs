//! Producer credits and per-address flow control.
//!
//! A producer may send `window_size` bytes before it needs more credits.
//! Once it has sent a full window it asks its address flow controller,
//! which grants right away while the address holds less than
//! `max_size_bytes` of unconsumed messages and parks the request otherwise.

pub mod producer;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, Span};

use crate::core::address::Address;
use crate::core::executor::Executor;

pub use producer::ServerProducer;

pub trait FlowController: Send + Sync + fmt::Debug {
    /// Asks for `credits` on behalf of `producer`. The grant may happen
    /// later and on another thread.
    fn request_and_send_credits(&self, producer: &Arc<ServerProducer>, credits: i64);
}

#[derive(Debug, Default)]
struct FlowState {
    /// Encoded bytes of messages routed to the address and not yet released.
    size: u64,
    waiting: VecDeque<(Weak<ServerProducer>, i64)>,
}

#[derive(Debug)]
pub struct AddressFlowController {
    address: Address,
    max_size: Option<u64>,
    executor: Arc<dyn Executor>,
    state: Mutex<FlowState>,
    span: Span,
}

impl AddressFlowController {
    pub fn new(
        address: Address,
        max_size: Option<u64>,
        executor: Arc<dyn Executor>,
        parent: &Span,
    ) -> Self {
        let span = tracing::debug_span!(parent: parent, "flow", address = %address);
        Self {
            address,
            max_size,
            executor,
            state: Mutex::new(FlowState::default()),
            span,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiting.len()
    }

    fn has_room(&self, size: u64) -> bool {
        self.max_size.map_or(true, |max| size < max)
    }

    fn grant(&self, producer: Arc<ServerProducer>, credits: i64) {
        self.executor
            .execute(Box::new(move || producer.send_credits(credits)));
    }

    pub fn message_routed(&self, size: u64) {
        self.state.lock().size += size;
    }

    /// Subtracts a consumed message and grants parked requests while
    /// there is room again.
    pub fn message_released(&self, size: u64) {
        let granted = {
            let mut state = self.state.lock();
            state.size = state.size.saturating_sub(size);
            let mut granted = Vec::new();
            while self.has_room(state.size) {
                match state.waiting.pop_front() {
                    Some((producer, credits)) => {
                        if let Some(producer) = producer.upgrade() {
                            granted.push((producer, credits));
                        }
                    }
                    None => break,
                }
            }
            granted
        };
        for (producer, credits) in granted {
            trace!(parent: &self.span, producer_id = producer.id(), credits, "granting parked credits");
            self.grant(producer, credits);
        }
    }
}

impl FlowController for AddressFlowController {
    fn request_and_send_credits(&self, producer: &Arc<ServerProducer>, credits: i64) {
        {
            let mut state = self.state.lock();
            if !self.has_room(state.size) {
                debug!(
                    parent: &self.span,
                    producer_id = producer.id(),
                    size = state.size,
                    "address full, parking credit request"
                );
                state.waiting.push_back((Arc::downgrade(producer), credits));
                return;
            }
        }
        self.grant(producer.clone(), credits);
    }
}
