//! Policies choosing which attached consumer receives the next reference.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::consumer::{Consumer, ConsumerId, HandleStatus};
use crate::core::reference::MessageReference;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionPolicy {
    #[default]
    RoundRobin,
    /// Everything goes to the first attached consumer.
    Exclusive,
    /// Messages sharing a group id stick to one consumer.
    Grouping,
}

impl DistributionPolicy {
    pub fn create(self) -> Box<dyn Distributor> {
        match self {
            DistributionPolicy::RoundRobin => Box::<RoundRobinDistributor>::default(),
            DistributionPolicy::Exclusive => Box::<ExclusiveDistributor>::default(),
            DistributionPolicy::Grouping => Box::<GroupingDistributor>::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    Handled(ConsumerId),
    /// Every consumer is out of capacity; the delivery pass should stop.
    Busy,
    /// Nobody wants this reference; try the next one.
    NoMatch,
}

pub trait Distributor: Send + fmt::Debug {
    fn policy(&self) -> DistributionPolicy;

    fn add_consumer(&mut self, consumer: Arc<dyn Consumer>);

    fn remove_consumer(&mut self, id: ConsumerId) -> Option<Arc<dyn Consumer>>;

    fn consumers(&self) -> &[Arc<dyn Consumer>];

    fn distribute(&mut self, reference: &MessageReference) -> Distribution;

    /// Removes and returns every attached consumer.
    fn drain_consumers(&mut self) -> Vec<Arc<dyn Consumer>>;
}

fn remove_from(
    consumers: &mut Vec<Arc<dyn Consumer>>,
    id: ConsumerId,
) -> Option<Arc<dyn Consumer>> {
    let idx = consumers.iter().position(|c| c.id() == id)?;
    Some(consumers.remove(idx))
}

fn round_robin(
    consumers: &[Arc<dyn Consumer>],
    pos: &mut usize,
    reference: &MessageReference,
) -> Distribution {
    let n = consumers.len();
    if n == 0 {
        return Distribution::Busy;
    }
    let mut busy = 0;
    for _ in 0..n {
        if *pos >= n {
            *pos = 0;
        }
        let consumer = &consumers[*pos];
        *pos = (*pos + 1) % n;
        match consumer.handle(reference) {
            HandleStatus::Handled => return Distribution::Handled(consumer.id()),
            HandleStatus::Busy => busy += 1,
            HandleStatus::NoMatch => {}
        }
    }
    if busy == n {
        Distribution::Busy
    } else {
        Distribution::NoMatch
    }
}

#[derive(Debug, Default)]
pub struct RoundRobinDistributor {
    consumers: Vec<Arc<dyn Consumer>>,
    pos: usize,
}

impl Distributor for RoundRobinDistributor {
    fn policy(&self) -> DistributionPolicy {
        DistributionPolicy::RoundRobin
    }

    fn add_consumer(&mut self, consumer: Arc<dyn Consumer>) {
        self.consumers.push(consumer);
    }

    fn remove_consumer(&mut self, id: ConsumerId) -> Option<Arc<dyn Consumer>> {
        let removed = remove_from(&mut self.consumers, id);
        if self.pos >= self.consumers.len() {
            self.pos = 0;
        }
        removed
    }

    fn consumers(&self) -> &[Arc<dyn Consumer>] {
        &self.consumers
    }

    fn distribute(&mut self, reference: &MessageReference) -> Distribution {
        round_robin(&self.consumers, &mut self.pos, reference)
    }

    fn drain_consumers(&mut self) -> Vec<Arc<dyn Consumer>> {
        self.pos = 0;
        std::mem::take(&mut self.consumers)
    }
}

#[derive(Debug, Default)]
pub struct ExclusiveDistributor {
    consumers: Vec<Arc<dyn Consumer>>,
}

impl Distributor for ExclusiveDistributor {
    fn policy(&self) -> DistributionPolicy {
        DistributionPolicy::Exclusive
    }

    fn add_consumer(&mut self, consumer: Arc<dyn Consumer>) {
        self.consumers.push(consumer);
    }

    fn remove_consumer(&mut self, id: ConsumerId) -> Option<Arc<dyn Consumer>> {
        remove_from(&mut self.consumers, id)
    }

    fn consumers(&self) -> &[Arc<dyn Consumer>] {
        &self.consumers
    }

    fn distribute(&mut self, reference: &MessageReference) -> Distribution {
        match self.consumers.first() {
            None => Distribution::Busy,
            Some(consumer) => match consumer.handle(reference) {
                HandleStatus::Handled => Distribution::Handled(consumer.id()),
                HandleStatus::Busy => Distribution::Busy,
                HandleStatus::NoMatch => Distribution::NoMatch,
            },
        }
    }

    fn drain_consumers(&mut self) -> Vec<Arc<dyn Consumer>> {
        std::mem::take(&mut self.consumers)
    }
}

#[derive(Debug, Default)]
pub struct GroupingDistributor {
    consumers: Vec<Arc<dyn Consumer>>,
    pos: usize,
    groups: HashMap<String, ConsumerId>,
}

impl Distributor for GroupingDistributor {
    fn policy(&self) -> DistributionPolicy {
        DistributionPolicy::Grouping
    }

    fn add_consumer(&mut self, consumer: Arc<dyn Consumer>) {
        self.consumers.push(consumer);
    }

    fn remove_consumer(&mut self, id: ConsumerId) -> Option<Arc<dyn Consumer>> {
        let removed = remove_from(&mut self.consumers, id);
        if removed.is_some() {
            self.groups.retain(|_, owner| *owner != id);
        }
        if self.pos >= self.consumers.len() {
            self.pos = 0;
        }
        removed
    }

    fn consumers(&self) -> &[Arc<dyn Consumer>] {
        &self.consumers
    }

    fn distribute(&mut self, reference: &MessageReference) -> Distribution {
        let group = match reference.message().group_id() {
            Some(g) => g,
            None => return round_robin(&self.consumers, &mut self.pos, reference),
        };

        if let Some(owner) = self.groups.get(group).copied() {
            if let Some(consumer) = self.consumers.iter().find(|c| c.id() == owner) {
                return match consumer.handle(reference) {
                    HandleStatus::Handled => Distribution::Handled(owner),
                    HandleStatus::Busy => Distribution::Busy,
                    HandleStatus::NoMatch => Distribution::NoMatch,
                };
            }
            self.groups.remove(group);
        }

        let outcome = round_robin(&self.consumers, &mut self.pos, reference);
        if let Distribution::Handled(owner) = outcome {
            self.groups.insert(group.to_string(), owner);
        }
        outcome
    }

    fn drain_consumers(&mut self) -> Vec<Arc<dyn Consumer>> {
        self.pos = 0;
        self.groups.clear();
        std::mem::take(&mut self.consumers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::ServerMessage;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct Stub {
        id: ConsumerId,
        busy: AtomicBool,
        even_only: bool,
        seen: Mutex<Vec<u64>>,
    }

    impl Stub {
        fn new(id: ConsumerId) -> Arc<Self> {
            Arc::new(Self {
                id,
                busy: AtomicBool::new(false),
                even_only: false,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl Consumer for Stub {
        fn id(&self) -> ConsumerId {
            self.id
        }

        fn handle(&self, reference: &MessageReference) -> HandleStatus {
            if self.busy.load(Ordering::SeqCst) {
                return HandleStatus::Busy;
            }
            if self.even_only && reference.message_id() % 2 != 0 {
                return HandleStatus::NoMatch;
            }
            self.seen.lock().push(reference.message_id());
            HandleStatus::Handled
        }
    }

    fn reference(id: u64, group: Option<&str>) -> MessageReference {
        let mut message = ServerMessage::new(id, "a", Bytes::new());
        if let Some(g) = group {
            message = message.with_group_id(g);
        }
        MessageReference::new(Arc::new(message), 1)
    }

    #[test]
    fn round_robin_alternates() {
        let (a, b) = (Stub::new(1), Stub::new(2));
        let mut d = DistributionPolicy::RoundRobin.create();
        d.add_consumer(a.clone());
        d.add_consumer(b.clone());
        for id in 0..4 {
            assert!(matches!(d.distribute(&reference(id, None)), Distribution::Handled(_)));
        }
        assert_eq!(*a.seen.lock(), vec![0, 2]);
        assert_eq!(*b.seen.lock(), vec![1, 3]);
    }

    #[test]
    fn busy_only_when_every_consumer_is_busy() {
        let (a, b) = (Stub::new(1), Stub::new(2));
        let mut d = DistributionPolicy::RoundRobin.create();
        d.add_consumer(a.clone());
        d.add_consumer(b.clone());
        a.busy.store(true, Ordering::SeqCst);
        assert_eq!(d.distribute(&reference(1, None)), Distribution::Handled(2));
        b.busy.store(true, Ordering::SeqCst);
        assert_eq!(d.distribute(&reference(2, None)), Distribution::Busy);
        assert_eq!(
            DistributionPolicy::RoundRobin.create().distribute(&reference(3, None)),
            Distribution::Busy
        );
    }

    #[test]
    fn no_match_when_filtered() {
        let picky = Arc::new(Stub {
            id: 9,
            busy: AtomicBool::new(false),
            even_only: true,
            seen: Mutex::new(Vec::new()),
        });
        let mut d = DistributionPolicy::RoundRobin.create();
        d.add_consumer(picky);
        assert_eq!(d.distribute(&reference(1, None)), Distribution::NoMatch);
        assert_eq!(d.distribute(&reference(2, None)), Distribution::Handled(9));
    }

    #[test]
    fn exclusive_uses_first_consumer() {
        let (a, b) = (Stub::new(1), Stub::new(2));
        let mut d = DistributionPolicy::Exclusive.create();
        d.add_consumer(a.clone());
        d.add_consumer(b.clone());
        for id in 0..3 {
            assert_eq!(d.distribute(&reference(id, None)), Distribution::Handled(1));
        }
        assert!(b.seen.lock().is_empty());
        d.remove_consumer(1);
        assert_eq!(d.distribute(&reference(9, None)), Distribution::Handled(2));
    }

    #[test]
    fn groups_stick_to_their_consumer() {
        let (a, b) = (Stub::new(1), Stub::new(2));
        let mut d = DistributionPolicy::Grouping.create();
        d.add_consumer(a.clone());
        d.add_consumer(b.clone());
        assert_eq!(d.distribute(&reference(1, Some("g"))), Distribution::Handled(1));
        assert_eq!(d.distribute(&reference(2, None)), Distribution::Handled(2));
        assert_eq!(d.distribute(&reference(3, Some("g"))), Distribution::Handled(1));
        assert_eq!(d.distribute(&reference(4, Some("g"))), Distribution::Handled(1));

        d.remove_consumer(1);
        assert_eq!(d.distribute(&reference(5, Some("g"))), Distribution::Handled(2));
    }
}
