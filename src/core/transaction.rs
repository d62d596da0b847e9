use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::error::{BrokerError, Result};
use crate::persistence::StorageManager;

/// Work attached to a transaction. `before_*` hooks may write transactional
/// records and report whether they did; `after_*` hooks apply in-memory
/// effects once the outcome is durable.
pub trait TransactionOperation: Send {
    fn before_commit(&mut self, _storage: &dyn StorageManager, _tx_id: u64) -> Result<bool> {
        Ok(false)
    }

    fn after_commit(&mut self) {}

    fn before_rollback(&mut self, _storage: &dyn StorageManager, _tx_id: u64) -> Result<()> {
        Ok(())
    }

    fn after_rollback(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Prepared,
    Committed,
    RolledBack,
}

pub struct Transaction {
    id: u64,
    storage: Arc<dyn StorageManager>,
    state: TransactionState,
    operations: Vec<Box<dyn TransactionOperation>>,
    persistent: bool,
    rollback_only: bool,
}

impl Transaction {
    pub fn new(storage: Arc<dyn StorageManager>) -> Self {
        let id = storage.generate_unique_id();
        Self::with_id(id, storage)
    }

    pub fn with_id(id: u64, storage: Arc<dyn StorageManager>) -> Self {
        Self {
            id,
            storage,
            state: TransactionState::Active,
            operations: Vec::new(),
            persistent: false,
            rollback_only: false,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn storage(&self) -> &Arc<dyn StorageManager> {
        &self.storage
    }

    /// Records that transactional records were written for this transaction.
    pub fn mark_persistent(&mut self) {
        self.persistent = true;
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Refuses any later commit. Set when storage failed part way through
    /// work done in this transaction.
    pub fn mark_rollback_only(&mut self) {
        if !self.rollback_only {
            warn!(target: "relaymq::tx", tx_id = self.id, "transaction marked rollback-only");
        }
        self.rollback_only = true;
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    pub fn add_operation(&mut self, operation: Box<dyn TransactionOperation>) {
        self.operations.push(operation);
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            TransactionState::Active | TransactionState::Prepared => Ok(()),
            _ => Err(BrokerError::TransactionNotActive(self.id)),
        }
    }

    pub fn prepare(&mut self, data: &[u8]) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(BrokerError::TransactionNotActive(self.id));
        }
        for op in &mut self.operations {
            if op.before_commit(self.storage.as_ref(), self.id)? {
                self.persistent = true;
            }
        }
        // Hooks already ran; commit must not run them again.
        self.state = TransactionState::Prepared;
        if self.persistent {
            self.storage.prepare(self.id, data)?;
        }
        debug!(target: "relaymq::tx", tx_id = self.id, "prepared");
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.rollback_only {
            return Err(BrokerError::RollbackOnly(self.id));
        }
        if self.state == TransactionState::Active {
            for op in &mut self.operations {
                if op.before_commit(self.storage.as_ref(), self.id)? {
                    self.persistent = true;
                }
            }
        }
        if self.persistent {
            self.storage.commit(self.id)?;
        }
        self.state = TransactionState::Committed;
        for op in &mut self.operations {
            op.after_commit();
        }
        debug!(
            target: "relaymq::tx",
            tx_id = self.id,
            operations = self.operations.len(),
            "committed"
        );
        self.operations.clear();
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        let mut outcome = Ok(());
        for op in &mut self.operations {
            if let Err(e) = op.before_rollback(self.storage.as_ref(), self.id) {
                warn!(target: "relaymq::tx", tx_id = self.id, error = %e, "rollback hook failed");
                outcome = Err(e);
            }
        }
        if self.persistent {
            if let Err(e) = self.storage.rollback(self.id) {
                outcome = Err(e);
            }
        }
        self.state = TransactionState::RolledBack;
        for op in &mut self.operations {
            op.after_rollback();
        }
        debug!(target: "relaymq::tx", tx_id = self.id, "rolled back");
        self.operations.clear();
        outcome
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("operations", &self.operations.len())
            .field("persistent", &self.persistent)
            .field("rollback_only", &self.rollback_only)
            .finish()
    }
}
