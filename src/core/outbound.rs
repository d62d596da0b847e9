//! Events flowing from the broker to a connected client.

use tokio::sync::mpsc;

use crate::core::consumer::ConsumerId;
use crate::core::reference::MessageReference;

#[derive(Debug, Clone)]
pub enum Outbound {
    Deliver {
        consumer_id: ConsumerId,
        reference: MessageReference,
    },
    ProducerCredits {
        producer_id: u64,
        credits: i64,
    },
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<Outbound>;

pub fn channel() -> (OutboundSender, OutboundReceiver) {
    mpsc::unbounded_channel()
}
