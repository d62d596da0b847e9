//! Operations on waiting references: lookup, delete, expire, dead letter
//! and move. References are taken out of the queue first; routing and
//! storage happen without the queue lock. A reference whose operation
//! fails goes back to the queue, as do the ones a bulk operation had not
//! reached yet.

use tracing::{debug, warn};

use super::{AckSource, Delivering, Queue};
use crate::core::address::Address;
use crate::core::error::Result;
use crate::core::filter::Filter;
use crate::core::message::{
    current_timestamp, PROP_ACTUAL_EXPIRY_TIME, PROP_ORIGINAL_ADDRESS, PROP_ORIGINAL_MESSAGE_ID,
    PROP_ORIGINAL_QUEUE, PROP_SCHEDULED_DELIVERY_TIME,
};
use crate::core::reference::MessageReference;
use crate::core::transaction::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveReason {
    Expiry,
    DeadLetter,
    Admin,
}

fn accepts(filter: Option<&dyn Filter>, reference: &MessageReference) -> bool {
    filter.map_or(true, |f| f.matches(reference.message()))
}

impl Queue {
    /// Pending and scheduled references accepted by `filter`.
    pub fn list(&self, filter: Option<&dyn Filter>) -> Vec<MessageReference> {
        let state = self.state.lock();
        state
            .pending
            .iter()
            .chain(state.scheduled.values())
            .filter(|r| accepts(filter, r))
            .cloned()
            .collect()
    }

    /// Takes a waiting reference out for the caller to acknowledge or
    /// cancel. It is tracked as delivering without a consumer.
    pub fn remove_reference_with_id(&self, message_id: u64) -> Option<MessageReference> {
        let mut state = self.state.lock();
        let reference = state.take_waiting(message_id)?;
        state.delivering.insert(
            message_id,
            Delivering {
                reference: reference.clone(),
                consumer: None,
            },
        );
        Some(reference)
    }

    pub fn get_reference(&self, message_id: u64) -> Option<MessageReference> {
        let state = self.state.lock();
        state
            .pending
            .find(message_id)
            .or_else(|| state.scheduled.values().find(|r| r.message_id() == message_id))
            .or_else(|| state.delivering.get(&message_id).map(|d| &d.reference))
            .cloned()
    }

    /// Applies `op` to each taken reference in order. `op` hands back the
    /// reference it failed on; the rest are restored here.
    fn for_each_taken<F>(&self, taken: Vec<MessageReference>, mut op: F) -> Result<usize>
    where
        F: FnMut(&Self, MessageReference) -> Result<()>,
    {
        let total = taken.len();
        let mut rest = taken.into_iter();
        let mut done = 0usize;
        while let Some(reference) = rest.next() {
            if let Err(e) = op(self, reference) {
                let remaining: Vec<MessageReference> = rest.collect();
                warn!(
                    parent: &self.span,
                    done,
                    returned = remaining.len() + 1,
                    error = %e,
                    "operation on waiting references stopped"
                );
                self.restore_waiting(remaining);
                return Err(e);
            }
            done += 1;
        }
        Ok(total)
    }

    /// Acknowledges a reference that is in no list any more, handing it
    /// back to the queue if storage fails.
    fn acknowledge_taken(&self, reference: MessageReference) -> Result<()> {
        if let Err(e) = self.post_acknowledge(&reference) {
            self.restore_waiting(vec![reference]);
            return Err(e);
        }
        Ok(())
    }

    // ───────────────────────────────────────────────────────────
    // Delete
    // ───────────────────────────────────────────────────────────

    pub fn delete_all_references(&self) -> Result<usize> {
        self.delete_matching_references(None)
    }

    pub fn delete_reference(&self, message_id: u64) -> Result<bool> {
        let taken = self.state.lock().take_waiting(message_id);
        match taken {
            Some(reference) => {
                self.acknowledge_taken(reference)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn delete_matching_references(&self, filter: Option<&dyn Filter>) -> Result<usize> {
        let taken = self
            .state
            .lock()
            .take_waiting_where(|r| accepts(filter, r));
        let count = self.for_each_taken(taken, Self::acknowledge_taken)?;
        if count > 0 {
            debug!(parent: &self.span, count, "references deleted");
        }
        Ok(count)
    }

    // ───────────────────────────────────────────────────────────
    // Expiry
    // ───────────────────────────────────────────────────────────

    pub fn expire_message(&self, message_id: u64) -> Result<bool> {
        let taken = self.state.lock().take_waiting(message_id);
        match taken {
            Some(reference) => {
                self.expire_reference(reference)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn expire_messages(&self, filter: Option<&dyn Filter>) -> Result<usize> {
        let taken = self
            .state
            .lock()
            .take_waiting_where(|r| accepts(filter, r));
        self.for_each_taken(taken, Self::expire_reference)
    }

    /// Expires every waiting reference whose expiration has passed.
    pub fn expire_expired_messages(&self) -> Result<usize> {
        let now = current_timestamp();
        let taken = self.state.lock().take_waiting_where(|r| r.is_expired(now));
        let count = self.for_each_taken(taken, Self::expire_reference)?;
        if count > 0 {
            debug!(parent: &self.span, count, "expired messages");
        }
        Ok(count)
    }

    /// Expires a reference wherever it is, typically one a consumer found
    /// expired on delivery.
    pub fn expire(&self, reference: &MessageReference) -> Result<bool> {
        let id = reference.message_id();
        let taken = {
            let mut state = self.state.lock();
            match state.delivering.remove(&id) {
                Some(d) => Some(d.reference),
                None => state.take_waiting(id),
            }
        };
        match taken {
            Some(reference) => {
                self.expire_reference(reference)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(super) fn expire_reference(&self, reference: MessageReference) -> Result<()> {
        let settings = self.settings.get_match(&self.address);
        match settings.expiry_address {
            Some(target) => self.move_reference(reference, Address::new(target), MoveReason::Expiry),
            None => {
                debug!(
                    parent: &self.span,
                    message_id = reference.message_id(),
                    "message expired with no expiry address, dropping"
                );
                self.acknowledge_taken(reference)
            }
        }
    }

    // ───────────────────────────────────────────────────────────
    // Dead letter
    // ───────────────────────────────────────────────────────────

    pub fn send_message_to_dead_letter_address(&self, message_id: u64) -> Result<bool> {
        let taken = self.state.lock().take_waiting(message_id);
        match taken {
            Some(reference) => {
                self.dead_letter_reference(reference)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Dead-letters a reference that is being delivered.
    pub fn send_to_dead_letter(&self, reference: &MessageReference) -> Result<bool> {
        let removed = self
            .state
            .lock()
            .delivering
            .remove(&reference.message_id());
        match removed {
            Some(d) => {
                if let Err(e) = self.dead_letter_reference(d.reference) {
                    // It is waiting again; other consumers may take it.
                    self.force_delivery();
                    return Err(e);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn dead_letter_reference(&self, reference: MessageReference) -> Result<()> {
        let settings = self.settings.get_match(&self.address);
        match settings.dead_letter_address {
            Some(target) => {
                self.move_reference(reference, Address::new(target), MoveReason::DeadLetter)
            }
            None => {
                warn!(
                    parent: &self.span,
                    message_id = reference.message_id(),
                    delivery_count = reference.delivery_count(),
                    "no dead letter address configured, dropping message"
                );
                self.acknowledge_taken(reference)
            }
        }
    }

    // ───────────────────────────────────────────────────────────
    // Move / priority
    // ───────────────────────────────────────────────────────────

    pub fn move_message(&self, message_id: u64, to: &Address) -> Result<bool> {
        let taken = self.state.lock().take_waiting(message_id);
        match taken {
            Some(reference) => {
                self.move_reference(reference, to.clone(), MoveReason::Admin)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn move_messages(&self, filter: Option<&dyn Filter>, to: &Address) -> Result<usize> {
        let taken = self
            .state
            .lock()
            .take_waiting_where(|r| accepts(filter, r));
        self.for_each_taken(taken, |queue, reference| {
            queue.move_reference(reference, to.clone(), MoveReason::Admin)
        })
    }

    pub fn change_message_priority(&self, message_id: u64, priority: u8) -> bool {
        let mut state = self.state.lock();
        match state.pending.remove(message_id) {
            Some(mut reference) => {
                reference.set_priority(priority);
                state.pending.push_back(reference);
                true
            }
            None => false,
        }
    }

    /// Routes a copy of the message to `to` and acknowledges the original,
    /// both in one transaction. On failure the original goes back to the
    /// queue.
    fn move_reference(
        &self,
        reference: MessageReference,
        to: Address,
        reason: MoveReason,
    ) -> Result<()> {
        let router = match self.router() {
            Some(router) => router,
            None => {
                warn!(
                    parent: &self.span,
                    message_id = reference.message_id(),
                    ?reason,
                    "no router attached, dropping message"
                );
                return self.acknowledge_taken(reference);
            }
        };

        let original = reference.message();
        let mut copy = original.copy_with_id(self.storage.generate_unique_id());
        copy.put_property(PROP_ORIGINAL_ADDRESS, original.address().as_str());
        copy.put_property(PROP_ORIGINAL_QUEUE, self.name.as_str());
        copy.put_property(PROP_ORIGINAL_MESSAGE_ID, original.id() as i64);
        copy.remove_property(PROP_SCHEDULED_DELIVERY_TIME);
        if reason == MoveReason::Expiry {
            copy.put_property(PROP_ACTUAL_EXPIRY_TIME, current_timestamp() as i64);
            copy.set_expiration(0);
        }
        copy.set_address(to.clone());

        let message_id = reference.message_id();
        let mut tx = Transaction::new(self.storage.clone());
        let mut acked = false;
        let outcome = match router.route(copy, Some(&mut tx)) {
            Ok(_) => match self.ack_in_tx(&mut tx, reference.clone(), AckSource::Detached) {
                Ok(()) => {
                    acked = true;
                    tx.commit()
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                debug!(parent: &self.span, message_id, to = %to, ?reason, "message moved");
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    warn!(parent: &self.span, error = %rollback, "rollback of move failed");
                }
                // A registered ack operation puts the reference back itself.
                if !acked {
                    self.restore_waiting(vec![reference]);
                }
                Err(e)
            }
        }
    }
}
