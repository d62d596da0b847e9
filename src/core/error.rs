use thiserror::Error;

use crate::journal::JournalError;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid filter expression {expression:?}: {reason}")]
    InvalidFilter { expression: String, reason: String },

    #[error("queue {0} already exists")]
    QueueExists(String),

    #[error("queue {0} does not exist")]
    QueueNotFound(String),

    #[error("no generator registered for server id {0}")]
    GeneratorNotFound(String),

    #[error("transaction {0} is not active")]
    TransactionNotActive(u64),

    #[error("transaction {0} can only be rolled back")]
    RollbackOnly(u64),

    #[error("consumer {0} does not exist")]
    ConsumerNotFound(u64),

    #[error("producer {0} does not exist")]
    ProducerNotFound(u64),

    #[error("operation not supported by a {0} session")]
    Unsupported(&'static str),

    #[error("session is closed")]
    SessionClosed,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;
