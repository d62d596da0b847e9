use std::sync::Arc;

use crate::core::message::ServerMessage;

/// Per-queue handle to a shared message body.
#[derive(Debug, Clone)]
pub struct MessageReference {
    message: Arc<ServerMessage>,
    queue_id: u64,
    delivery_count: u32,
    scheduled_delivery_time: Option<u64>,
    priority: u8,
}

impl MessageReference {
    pub fn new(message: Arc<ServerMessage>, queue_id: u64) -> Self {
        let scheduled_delivery_time = message.scheduled_delivery_time();
        let priority = message.priority();
        Self {
            message,
            queue_id,
            delivery_count: 0,
            scheduled_delivery_time,
            priority,
        }
    }

    #[inline]
    pub fn message(&self) -> &Arc<ServerMessage> {
        &self.message
    }

    #[inline]
    pub fn message_id(&self) -> u64 {
        self.message.id()
    }

    #[inline]
    pub fn queue_id(&self) -> u64 {
        self.queue_id
    }

    #[inline]
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn set_delivery_count(&mut self, count: u32) {
        self.delivery_count = count;
    }

    pub fn increment_delivery_count(&mut self) -> u32 {
        self.delivery_count = self.delivery_count.saturating_add(1);
        self.delivery_count
    }

    #[inline]
    pub fn scheduled_delivery_time(&self) -> Option<u64> {
        self.scheduled_delivery_time
    }

    pub fn set_scheduled_delivery_time(&mut self, at_ms: Option<u64>) {
        self.scheduled_delivery_time = at_ms;
    }

    /// Queue-local priority; starts as the message priority.
    #[inline]
    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority.min(crate::core::message::MAX_PRIORITY);
    }

    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.message.is_expired(now_ms)
    }
}
