//! Management operations over a running broker.
//!
//! Every operation goes through [`ManagementService::invoke`] and comes
//! back as a [`ManagementResult`]; failures never escape as errors so a
//! management dispatcher can forward the result as is.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn, Span};

use crate::core::address::Address;
use crate::core::distributor::DistributionPolicy;
use crate::core::error::{BrokerError, Result};
use crate::core::filter::parse_filter;
use crate::core::postoffice::PostOffice;
use crate::core::queue::Queue;
use crate::core::reference::MessageReference;
use crate::journal::{Journal, JournalStats};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementOperation {
    CreateQueue {
        name: String,
        address: String,
        filter: Option<String>,
        durable: bool,
    },
    DestroyQueue {
        name: String,
    },
    ListQueues,
    QueueAttributes {
        name: String,
    },
    ListBindings {
        address: String,
    },
    ListMessages {
        queue: String,
        filter: Option<String>,
    },
    RemoveMessage {
        queue: String,
        message_id: u64,
    },
    RemoveMessages {
        queue: String,
        filter: Option<String>,
    },
    ExpireMessage {
        queue: String,
        message_id: u64,
    },
    ExpireMessages {
        queue: String,
        filter: Option<String>,
    },
    SendMessageToDeadLetterAddress {
        queue: String,
        message_id: u64,
    },
    MoveMessage {
        queue: String,
        message_id: u64,
        address: String,
    },
    MoveMessages {
        queue: String,
        filter: Option<String>,
        address: String,
    },
    ChangeMessagePriority {
        queue: String,
        message_id: u64,
        priority: u8,
    },
    SetDistributionPolicy {
        queue: String,
        policy: DistributionPolicy,
    },
    JournalStats,
    StorageStatus,
}

impl ManagementOperation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateQueue { .. } => "create_queue",
            Self::DestroyQueue { .. } => "destroy_queue",
            Self::ListQueues => "list_queues",
            Self::QueueAttributes { .. } => "queue_attributes",
            Self::ListBindings { .. } => "list_bindings",
            Self::ListMessages { .. } => "list_messages",
            Self::RemoveMessage { .. } => "remove_message",
            Self::RemoveMessages { .. } => "remove_messages",
            Self::ExpireMessage { .. } => "expire_message",
            Self::ExpireMessages { .. } => "expire_messages",
            Self::SendMessageToDeadLetterAddress { .. } => "send_message_to_dead_letter_address",
            Self::MoveMessage { .. } => "move_message",
            Self::MoveMessages { .. } => "move_messages",
            Self::ChangeMessagePriority { .. } => "change_message_priority",
            Self::SetDistributionPolicy { .. } => "set_distribution_policy",
            Self::JournalStats => "journal_stats",
            Self::StorageStatus => "storage_status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub id: u64,
    pub name: String,
    pub address: String,
    pub filter: Option<String>,
    pub durable: bool,
    pub temporary: bool,
    pub message_count: usize,
    pub delivering_count: usize,
    pub scheduled_count: usize,
    pub consumer_count: usize,
    pub messages_added: u64,
    pub distribution: DistributionPolicy,
}

impl QueueSummary {
    fn of(queue: &Queue) -> Self {
        Self {
            id: queue.id(),
            name: queue.name().to_string(),
            address: queue.address().as_str().to_string(),
            filter: queue.filter().and_then(|f| f.expression().map(str::to_string)),
            durable: queue.is_durable(),
            temporary: queue.is_temporary(),
            message_count: queue.message_count(),
            delivering_count: queue.delivering_count(),
            scheduled_count: queue.scheduled_count(),
            consumer_count: queue.consumer_count(),
            messages_added: queue.messages_added(),
            distribution: queue.distribution_policy(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageSummary {
    pub message_id: u64,
    pub address: String,
    pub priority: u8,
    pub durable: bool,
    pub expiration: u64,
    pub delivery_count: u32,
    pub body_size: usize,
}

impl From<&MessageReference> for MessageSummary {
    fn from(reference: &MessageReference) -> Self {
        let message = reference.message();
        Self {
            message_id: message.id(),
            address: message.address().as_str().to_string(),
            priority: reference.priority(),
            durable: message.is_durable(),
            expiration: message.expiration(),
            delivery_count: reference.delivery_count(),
            body_size: message.body().len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindingSummary {
    pub queue: String,
    pub address: String,
    pub node_id: String,
    pub distance: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ManagementValue {
    Bool(bool),
    Count(u64),
    Queue(QueueSummary),
    Queues(Vec<QueueSummary>),
    Bindings(Vec<BindingSummary>),
    Messages(Vec<MessageSummary>),
    Journals(Vec<(String, JournalStats)>),
}

/// Outcome of one management operation.
#[derive(Debug, Clone, Serialize)]
pub struct ManagementResult {
    pub success: bool,
    pub value: Option<ManagementValue>,
    pub error: Option<String>,
}

impl ManagementResult {
    pub fn ok(value: ManagementValue) -> Self {
        Self {
            success: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug)]
pub struct ManagementService {
    post_office: Arc<PostOffice>,
    journals: Vec<(String, Arc<Journal>)>,
    span: Span,
}

impl ManagementService {
    pub fn new(post_office: Arc<PostOffice>, parent: &Span) -> Self {
        Self {
            post_office,
            journals: Vec::new(),
            span: tracing::debug_span!(parent: parent, "management"),
        }
    }

    /// Exposes a journal's statistics under `name`.
    pub fn with_journal(mut self, name: impl Into<String>, journal: Arc<Journal>) -> Self {
        self.journals.push((name.into(), journal));
        self
    }

    pub fn invoke(&self, operation: ManagementOperation) -> ManagementResult {
        let name = operation.name();
        match self.execute(operation) {
            Ok(value) => {
                debug!(parent: &self.span, operation = name, "management operation succeeded");
                ManagementResult::ok(value)
            }
            Err(e) => {
                warn!(parent: &self.span, operation = name, error = %e, "management operation failed");
                ManagementResult::failed(e.to_string())
            }
        }
    }

    fn queue(&self, name: &str) -> Result<Arc<Queue>> {
        self.post_office
            .get_queue(name)
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))
    }

    fn execute(&self, operation: ManagementOperation) -> Result<ManagementValue> {
        use ManagementOperation as Op;
        use ManagementValue as Value;

        Ok(match operation {
            Op::CreateQueue {
                name,
                address,
                filter,
                durable,
            } => {
                let queue =
                    self.post_office
                        .create_queue(&name, &address, filter.as_deref(), durable, false)?;
                Value::Queue(QueueSummary::of(&queue))
            }
            Op::DestroyQueue { name } => Value::Bool(self.post_office.destroy_queue(&name)?),
            Op::ListQueues => {
                let mut queues: Vec<QueueSummary> = self
                    .post_office
                    .queues()
                    .iter()
                    .map(|q| QueueSummary::of(q))
                    .collect();
                queues.sort_by(|a, b| a.name.cmp(&b.name));
                Value::Queues(queues)
            }
            Op::QueueAttributes { name } => {
                let queue = self.queue(&name)?;
                Value::Queue(QueueSummary::of(&queue))
            }
            Op::ListBindings { address } => {
                let bindings = self
                    .post_office
                    .match_bindings(&Address::new(&address))
                    .iter()
                    .map(|b| BindingSummary {
                        queue: b.queue().name().to_string(),
                        address: b.address().as_str().to_string(),
                        node_id: b.node_id().to_string(),
                        distance: b.distance(),
                    })
                    .collect();
                Value::Bindings(bindings)
            }
            Op::ListMessages { queue, filter } => {
                let filter = parse_filter(filter.as_deref())?;
                let messages = self
                    .queue(&queue)?
                    .list(filter.as_deref())
                    .iter()
                    .map(MessageSummary::from)
                    .collect();
                Value::Messages(messages)
            }
            Op::RemoveMessage { queue, message_id } => {
                Value::Bool(self.queue(&queue)?.delete_reference(message_id)?)
            }
            Op::RemoveMessages { queue, filter } => {
                let filter = parse_filter(filter.as_deref())?;
                let removed = self.queue(&queue)?.delete_matching_references(filter.as_deref())?;
                Value::Count(removed as u64)
            }
            Op::ExpireMessage { queue, message_id } => {
                Value::Bool(self.queue(&queue)?.expire_message(message_id)?)
            }
            Op::ExpireMessages { queue, filter } => {
                let filter = parse_filter(filter.as_deref())?;
                Value::Count(self.queue(&queue)?.expire_messages(filter.as_deref())? as u64)
            }
            Op::SendMessageToDeadLetterAddress { queue, message_id } => {
                Value::Bool(self.queue(&queue)?.send_message_to_dead_letter_address(message_id)?)
            }
            Op::MoveMessage {
                queue,
                message_id,
                address,
            } => Value::Bool(
                self.queue(&queue)?
                    .move_message(message_id, &Address::new(&address))?,
            ),
            Op::MoveMessages {
                queue,
                filter,
                address,
            } => {
                let filter = parse_filter(filter.as_deref())?;
                let moved = self
                    .queue(&queue)?
                    .move_messages(filter.as_deref(), &Address::new(&address))?;
                Value::Count(moved as u64)
            }
            Op::ChangeMessagePriority {
                queue,
                message_id,
                priority,
            } => Value::Bool(self.queue(&queue)?.change_message_priority(message_id, priority)),
            Op::SetDistributionPolicy { queue, policy } => {
                self.queue(&queue)?.set_distribution_policy(policy);
                Value::Bool(true)
            }
            Op::JournalStats => Value::Journals(
                self.journals
                    .iter()
                    .map(|(name, journal)| (name.clone(), journal.stats()))
                    .collect(),
            ),
            Op::StorageStatus => Value::Bool(!self.post_office.storage().is_degraded()),
        })
    }
}
