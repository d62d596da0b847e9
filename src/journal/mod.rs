//! Append-only journal on top of sequential files.
//!
//! * `file`       – `SequentialFile` / `SequentialFileFactory` traits and callbacks
//! * `sync_file`  – buffered std I/O files
//! * `async_file` – files written by a dedicated writer thread
//! * `buffer`     – write buffer pool shared by async files
//! * `callback`   – waitable completion
//! * `record`     – file header and record codec
//! * `journal`    – records, transactions, rotation, reclaim, compaction, replay

pub mod async_file;
pub mod buffer;
pub mod callback;
pub mod file;
#[allow(clippy::module_inception)]
pub mod journal;
pub mod record;
pub mod sync_file;

use thiserror::Error;

pub use async_file::{AsyncSequentialFile, AsyncSequentialFileFactory};
pub use callback::SyncIoCallback;
pub use file::{BufferCallback, IoCallback, IoErrorListener, SequentialFile, SequentialFileFactory};
pub use journal::{
    Journal, JournalConfig, JournalStats, LoadedJournal, PreparedTransaction, RecordInfo,
};
pub use sync_file::{SyncSequentialFile, SyncSequentialFileFactory};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error {code} on {file}: {message}")]
    IoFailed {
        code: i32,
        message: String,
        file: String,
    },

    #[error("journal corruption: {0}")]
    Corruption(String),

    #[error("journal is not {0}")]
    InvalidState(&'static str),

    #[error("file {0} is not open")]
    FileNotOpen(String),

    #[error("record of {size} bytes does not fit a {max} byte journal file")]
    RecordTooLarge { size: usize, max: u64 },

    #[error("record {0} does not exist")]
    UnknownRecord(u64),

    #[error("transaction {0} does not exist")]
    UnknownTransaction(u64),

    #[error("cannot compact while {0} transactions are open")]
    TransactionsPending(usize),

    #[error("invalid journal configuration: {0}")]
    InvalidConfig(String),

    #[error("file writer stopped")]
    WriterStopped,

    #[error("file {0} failed a write and accepts no more")]
    FileBroken(String),
}

pub type JournalResult<T> = std::result::Result<T, JournalError>;
