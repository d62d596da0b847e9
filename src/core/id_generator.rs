//! Message id generation.
//!
//! A [`MessageIdGenerator`] hands out ids from blocks reserved from an
//! [`IdBlockSource`]. Generators are shared per server id through a
//! [`GeneratorRegistry`] owned by the broker context; every
//! `get_generator` must be paired with exactly one `return_generator`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::core::error::{BrokerError, Result};

pub const BLOCK_SIZE: u64 = 256;

pub trait IdBlockSource: Send + Sync + fmt::Debug {
    /// Reserves `size` consecutive ids and returns the first one.
    fn reserve_block(&self, size: u64) -> Result<u64>;
}

#[derive(Debug)]
pub struct MessageIdGenerator {
    block_size: u64,
    source: Arc<dyn IdBlockSource>,
    // (next id, end of block exclusive)
    block: Mutex<(u64, u64)>,
}

impl MessageIdGenerator {
    pub fn new(source: Arc<dyn IdBlockSource>, block_size: u64) -> Self {
        Self {
            block_size: block_size.max(1),
            source,
            block: Mutex::new((0, 0)),
        }
    }

    pub fn next_id(&self) -> Result<u64> {
        let mut block = self.block.lock();
        if block.0 >= block.1 {
            let start = self.source.reserve_block(self.block_size)?;
            *block = (start, start + self.block_size);
        }
        let id = block.0;
        block.0 += 1;
        Ok(id)
    }
}

#[derive(Debug)]
struct Holder {
    generator: Arc<MessageIdGenerator>,
    ref_count: usize,
}

#[derive(Debug, Default)]
pub struct GeneratorRegistry {
    holders: Mutex<HashMap<String, Holder>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the generator for `server_id`, creating it on first use.
    pub fn get_generator(
        &self,
        server_id: &str,
        source: Arc<dyn IdBlockSource>,
    ) -> Arc<MessageIdGenerator> {
        let mut holders = self.holders.lock();
        let holder = holders.entry(server_id.to_string()).or_insert_with(|| {
            debug!(target: "relaymq::ids", server_id, "creating message id generator");
            Holder {
                generator: Arc::new(MessageIdGenerator::new(source, BLOCK_SIZE)),
                ref_count: 0,
            }
        });
        holder.ref_count += 1;
        holder.generator.clone()
    }

    /// Releases one use of the generator; the last release removes it.
    pub fn return_generator(&self, server_id: &str) -> Result<()> {
        let mut holders = self.holders.lock();
        let holder = holders
            .get_mut(server_id)
            .ok_or_else(|| BrokerError::GeneratorNotFound(server_id.to_string()))?;
        holder.ref_count -= 1;
        if holder.ref_count == 0 {
            holders.remove(server_id);
            debug!(target: "relaymq::ids", server_id, "released message id generator");
        }
        Ok(())
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.holders.lock().contains_key(server_id)
    }

    pub fn clear(&self) {
        self.holders.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.holders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Default)]
    struct Counter {
        next: AtomicU64,
        reservations: AtomicU64,
    }

    impl IdBlockSource for Counter {
        fn reserve_block(&self, size: u64) -> Result<u64> {
            self.reservations.fetch_add(1, Ordering::SeqCst);
            Ok(self.next.fetch_add(size, Ordering::SeqCst))
        }
    }

    #[test]
    fn ids_come_from_reserved_blocks() {
        let source = Arc::new(Counter::default());
        let generator = MessageIdGenerator::new(source.clone(), 4);
        let ids: Vec<u64> = (0..9).map(|_| generator.next_id().unwrap()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(source.reservations.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn registry_is_reference_counted() {
        let registry = GeneratorRegistry::new();
        let source: Arc<dyn IdBlockSource> = Arc::new(Counter::default());
        let first = registry.get_generator("node-a", source.clone());
        for _ in 0..3 {
            let again = registry.get_generator("node-a", source.clone());
            assert!(Arc::ptr_eq(&first, &again));
        }
        for _ in 0..3 {
            registry.return_generator("node-a").unwrap();
            assert!(registry.contains("node-a"));
        }
        registry.return_generator("node-a").unwrap();
        assert!(!registry.contains("node-a"));
        assert!(registry.is_empty());
    }

    #[test]
    fn returning_unknown_generator_fails() {
        let registry = GeneratorRegistry::new();
        assert!(matches!(
            registry.return_generator("ghost"),
            Err(BrokerError::GeneratorNotFound(id)) if id == "ghost"
        ));
    }
}
