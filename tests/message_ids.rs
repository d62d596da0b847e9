mod common;

use std::collections::HashSet;
use std::sync::Arc;

use relaymq::core::executor::DirectExecutor;
use relaymq::core::id_generator::GeneratorRegistry;
use relaymq::Broker;

use common::{init_logging, memory_config, persistent_config, start_broker};

#[test]
fn ids_keep_increasing_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start_broker(persistent_config(dir.path()));
    let first: Vec<u64> = (0..500)
        .map(|_| broker.id_generator().next_id().unwrap())
        .collect();
    let unique: HashSet<u64> = first.iter().copied().collect();
    assert_eq!(unique.len(), first.len());
    broker.stop().unwrap();

    let broker = start_broker(persistent_config(dir.path()));
    let next = broker.id_generator().next_id().unwrap();
    assert!(next > *first.iter().max().unwrap());
    assert!(broker.storage().generate_unique_id() > next);
    broker.stop().unwrap();
}

#[test]
fn brokers_with_one_server_id_share_a_generator() {
    init_logging();
    let registry = Arc::new(GeneratorRegistry::new());
    let a = Broker::start_with_registry(memory_config(), Arc::new(DirectExecutor), registry.clone())
        .unwrap();
    let b = Broker::start_with_registry(memory_config(), Arc::new(DirectExecutor), registry.clone())
        .unwrap();
    assert!(Arc::ptr_eq(a.id_generator(), b.id_generator()));
    assert_eq!(registry.len(), 1);

    let mut other = memory_config();
    other.server.server_id = "relaymq-2".to_string();
    let c = Broker::start_with_registry(other, Arc::new(DirectExecutor), registry.clone()).unwrap();
    assert_eq!(registry.len(), 2);

    a.stop().unwrap();
    assert!(registry.contains("relaymq-1"));
    b.stop().unwrap();
    c.stop().unwrap();
    assert!(registry.is_empty());
    assert!(registry.return_generator("relaymq-1").is_err());
}
