mod common;

use std::sync::Arc;

use bytes::Bytes;
use relaymq::core::address::Address;
use relaymq::core::message::ServerMessage;
use relaymq::core::queue::Queue;
use relaymq::core::session::ServerSession;
use relaymq::core::settings::AddressSettings;
use relaymq::BrokerError;

use common::{deliveries, post_office_on, session_on, FailingStorage, StorageOp};

fn durable(address: &str) -> ServerMessage {
    ServerMessage::new(0, address, Bytes::from_static(b"order")).with_durable(true)
}

/// A durable "orders" queue holding `count` durable messages.
fn orders_with(session: &ServerSession, count: usize) -> Arc<Queue> {
    let queue = session
        .create_queue("orders", "orders", None, true, false)
        .unwrap();
    session.create_producer(1, Some("orders")).unwrap();
    for _ in 0..count {
        session.send(1, durable("orders")).unwrap();
    }
    queue
}

#[test]
fn failed_cumulative_acknowledge_keeps_the_rest_delivered() {
    let storage = FailingStorage::new();
    let po = post_office_on(storage.clone(), AddressSettings::default());
    let (session, mut rx) = session_on(&po, false);
    let queue = orders_with(&session, 3);
    session.create_consumer(1, "orders", None, -1).unwrap();
    session.start();
    let ids: Vec<u64> = deliveries(&mut rx).iter().map(|d| d.1).collect();
    assert_eq!(ids.len(), 3);

    storage.fail_after(StorageOp::Acknowledge, 1);
    assert!(session.acknowledge(1, ids[2]).is_err());
    assert_eq!(storage.calls(StorageOp::Acknowledge), 1);
    assert_eq!(queue.delivering_count(), 2);

    storage.heal();
    assert_eq!(session.acknowledge(1, ids[2]).unwrap(), 2);
    assert_eq!(queue.delivering_count(), 0);
    assert_eq!(queue.message_count(), 0);
}

#[test]
fn closing_after_a_failed_acknowledge_returns_references() {
    let storage = FailingStorage::new();
    let po = post_office_on(storage.clone(), AddressSettings::default());
    let (session, mut rx) = session_on(&po, false);
    let queue = orders_with(&session, 3);
    session.create_consumer(1, "orders", None, -1).unwrap();
    session.start();
    let ids: Vec<u64> = deliveries(&mut rx).iter().map(|d| d.1).collect();

    storage.fail_after(StorageOp::Acknowledge, 0);
    assert!(session.individual_acknowledge(1, ids[1]).is_err());
    assert!(session.acknowledge(1, ids[2]).is_err());
    storage.heal();

    session.close_consumer(1).unwrap();
    assert_eq!(queue.delivering_count(), 0);
    assert_eq!(queue.message_count(), 3);
    assert!(queue.list(None).iter().all(|r| r.delivery_count() == 1));
}

#[test]
fn failed_commit_rolls_back_and_redelivers() {
    let storage = FailingStorage::new();
    let po = post_office_on(storage.clone(), AddressSettings::default());
    let (session, mut rx) = session_on(&po, true);
    let queue = orders_with(&session, 2);
    session.commit().unwrap();
    session.create_consumer(1, "orders", None, -1).unwrap();
    session.start();
    let ids: Vec<u64> = deliveries(&mut rx).iter().map(|d| d.1).collect();
    assert_eq!(ids.len(), 2);

    session.acknowledge(1, ids[1]).unwrap();
    storage.fail_after(StorageOp::Commit, 0);
    assert!(session.commit().is_err());

    let mut redelivered = deliveries(&mut rx);
    redelivered.sort();
    assert_eq!(redelivered, vec![(1, ids[0], 1), (1, ids[1], 1)]);
    assert_eq!(queue.delivering_count(), 2);

    storage.heal();
    session.acknowledge(1, ids[1]).unwrap();
    session.commit().unwrap();
    assert_eq!(queue.delivering_count(), 0);
    assert_eq!(queue.message_count(), 0);
}

#[test]
fn failed_transactional_acknowledge_forces_rollback() {
    let storage = FailingStorage::new();
    let po = post_office_on(storage.clone(), AddressSettings::default());
    let (session, mut rx) = session_on(&po, true);
    let queue = orders_with(&session, 2);
    session.commit().unwrap();
    session.create_consumer(1, "orders", None, -1).unwrap();
    session.start();
    let ids: Vec<u64> = deliveries(&mut rx).iter().map(|d| d.1).collect();

    storage.fail_after(StorageOp::AcknowledgeTransactional, 1);
    assert!(session.acknowledge(1, ids[1]).is_err());
    storage.heal();
    assert!(matches!(session.commit(), Err(BrokerError::RollbackOnly(_))));

    // The acknowledged one counts a failed attempt; the other was never acknowledged.
    let mut redelivered = deliveries(&mut rx);
    redelivered.sort();
    assert_eq!(redelivered, vec![(1, ids[0], 1), (1, ids[1], 0)]);
    assert_eq!(queue.delivering_count(), 2);
    assert_eq!(queue.message_count(), 0);
}

#[test]
fn failed_expiry_restores_references() {
    let storage = FailingStorage::new();
    let po = post_office_on(storage.clone(), AddressSettings::default());
    let (session, _rx) = session_on(&po, false);
    let queue = orders_with(&session, 3);

    storage.fail_after(StorageOp::Acknowledge, 1);
    assert!(queue.expire_messages(None).is_err());
    assert_eq!(queue.message_count(), 2);

    storage.heal();
    assert_eq!(queue.expire_messages(None).unwrap(), 2);
    assert_eq!(queue.message_count(), 0);
}

#[test]
fn failed_delete_restores_references() {
    let storage = FailingStorage::new();
    let po = post_office_on(storage.clone(), AddressSettings::default());
    let (session, _rx) = session_on(&po, false);
    let queue = orders_with(&session, 4);

    storage.fail_after(StorageOp::Acknowledge, 2);
    assert!(queue.delete_matching_references(None).is_err());
    assert_eq!(queue.message_count(), 2);
    assert_eq!(queue.delivering_count(), 0);
}

#[test]
fn failed_move_restores_references() {
    let storage = FailingStorage::new();
    let po = post_office_on(storage.clone(), AddressSettings::default());
    let (session, _rx) = session_on(&po, false);
    let archive = session
        .create_queue("archive", "archive", None, true, false)
        .unwrap();
    let queue = orders_with(&session, 3);

    storage.fail_after(StorageOp::Commit, 1);
    assert!(queue.move_messages(None, &Address::new("archive")).is_err());
    assert_eq!(archive.message_count(), 1);
    assert_eq!(queue.message_count(), 2);
    assert_eq!(queue.delivering_count(), 0);

    storage.heal();
    assert_eq!(queue.move_messages(None, &Address::new("archive")).unwrap(), 2);
    assert_eq!(archive.message_count(), 3);
    assert_eq!(queue.message_count(), 0);
}

#[test]
fn losing_a_create_race_removes_the_stored_binding() {
    let storage = FailingStorage::new();
    let po = post_office_on(storage.clone(), AddressSettings::default());
    let rival = Arc::downgrade(&po);
    storage.on_add_binding(move || {
        if let Some(po) = rival.upgrade() {
            po.create_queue("orders", "orders", None, false, false)
                .unwrap();
        }
    });

    let outcome = po.create_queue("orders", "orders", None, true, false);
    assert!(matches!(outcome, Err(BrokerError::QueueExists(_))));
    assert_eq!(storage.deleted_bindings().len(), 1);
    assert!(!po.get_queue("orders").unwrap().is_durable());
}
