use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::file::IoCallback;
use super::{JournalError, JournalResult};

/// An [`IoCallback`] a thread can block on.
#[derive(Debug, Default)]
pub struct SyncIoCallback {
    outcome: Mutex<Option<Result<(), (i32, String)>>>,
    cond: Condvar,
}

impl SyncIoCallback {
    pub fn new() -> Self {
        Self::default()
    }

    fn complete(&self, outcome: Result<(), (i32, String)>) {
        let mut guard = self.outcome.lock();
        if guard.is_none() {
            *guard = Some(outcome);
        }
        self.cond.notify_all();
    }

    /// Blocks until the write completes.
    pub fn wait(&self) -> JournalResult<()> {
        let mut guard = self.outcome.lock();
        while guard.is_none() {
            self.cond.wait(&mut guard);
        }
        Self::to_result(guard.as_ref())
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning
    /// `Ok(false)` if the write is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> JournalResult<bool> {
        let mut guard = self.outcome.lock();
        if guard.is_none() {
            let _ = self.cond.wait_for(&mut guard, timeout);
        }
        if guard.is_none() {
            return Ok(false);
        }
        Self::to_result(guard.as_ref()).map(|_| true)
    }

    fn to_result(outcome: Option<&Result<(), (i32, String)>>) -> JournalResult<()> {
        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err((code, message))) => Err(JournalError::IoFailed {
                code: *code,
                message: message.clone(),
                file: String::new(),
            }),
            None => Err(JournalError::WriterStopped),
        }
    }
}

impl IoCallback for SyncIoCallback {
    fn done(&self) {
        self.complete(Ok(()));
    }

    fn on_error(&self, code: i32, message: &str) {
        self.complete(Err((code, message.to_string())));
    }
}
