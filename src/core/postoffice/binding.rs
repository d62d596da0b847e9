use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::address::Address;
use crate::core::queue::Queue;

/// Links an address pattern to a queue on some node.
pub struct Binding {
    node_id: String,
    address: Address,
    queue: Arc<Queue>,
    /// Hops to the node owning the queue; 0 for local queues.
    distance: u32,
    failed: AtomicBool,
}

impl Binding {
    pub fn new(node_id: impl Into<String>, address: Address, queue: Arc<Queue>, distance: u32) -> Self {
        Self {
            node_id: node_id.into(),
            address,
            queue,
            distance,
            failed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[inline]
    pub fn address(&self) -> &Address {
        &self.address
    }

    #[inline]
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    #[inline]
    pub fn distance(&self) -> u32 {
        self.distance
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn set_failed(&self, failed: bool) {
        self.failed.store(failed, Ordering::Release);
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("node_id", &self.node_id)
            .field("address", &self.address)
            .field("queue", &self.queue.name())
            .field("distance", &self.distance)
            .field("failed", &self.is_failed())
            .finish()
    }
}
