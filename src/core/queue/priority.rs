use std::collections::VecDeque;

use crate::core::message::MAX_PRIORITY;
use crate::core::reference::MessageReference;

const LEVELS: usize = MAX_PRIORITY as usize + 1;

/// What a delivery pass does with the reference it is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Take,
    Keep,
    Stop,
}

/// Pending references, one FIFO per priority level. Iteration goes from
/// the highest priority down.
#[derive(Debug)]
pub struct PriorityList {
    levels: [VecDeque<MessageReference>; LEVELS],
    len: usize,
}

impl Default for PriorityList {
    fn default() -> Self {
        Self {
            levels: std::array::from_fn(|_| VecDeque::new()),
            len: 0,
        }
    }
}

impl PriorityList {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_back(&mut self, reference: MessageReference) {
        self.levels[level(&reference)].push_back(reference);
        self.len += 1;
    }

    pub fn push_front(&mut self, reference: MessageReference) {
        self.levels[level(&reference)].push_front(reference);
        self.len += 1;
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageReference> {
        self.levels.iter().rev().flat_map(|l| l.iter())
    }

    pub fn find(&self, message_id: u64) -> Option<&MessageReference> {
        self.iter().find(|r| r.message_id() == message_id)
    }

    pub fn remove(&mut self, message_id: u64) -> Option<MessageReference> {
        for deque in self.levels.iter_mut().rev() {
            if let Some(idx) = deque.iter().position(|r| r.message_id() == message_id) {
                self.len -= 1;
                return deque.remove(idx);
            }
        }
        None
    }

    /// Removes every reference matching `pred`, in iteration order.
    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<MessageReference>
    where
        F: FnMut(&MessageReference) -> bool,
    {
        self.visit(|r| if pred(r) { Visit::Take } else { Visit::Keep })
    }

    pub fn drain(&mut self) -> Vec<MessageReference> {
        let mut out = Vec::with_capacity(self.len);
        for deque in self.levels.iter_mut().rev() {
            out.extend(deque.drain(..));
        }
        self.len = 0;
        out
    }

    /// Walks the list in delivery order letting `f` take, keep or stop.
    /// Returns the taken references in order.
    pub fn visit<F>(&mut self, mut f: F) -> Vec<MessageReference>
    where
        F: FnMut(&MessageReference) -> Visit,
    {
        let mut taken = Vec::new();
        'levels: for deque in self.levels.iter_mut().rev() {
            let mut i = 0;
            while i < deque.len() {
                match f(&deque[i]) {
                    Visit::Take => {
                        if let Some(r) = deque.remove(i) {
                            taken.push(r);
                        }
                    }
                    Visit::Keep => i += 1,
                    Visit::Stop => break 'levels,
                }
            }
        }
        self.len -= taken.len();
        taken
    }
}

#[inline]
fn level(reference: &MessageReference) -> usize {
    usize::from(reference.priority().min(MAX_PRIORITY))
}
