mod common;

use bytes::Bytes;
use relaymq::core::message::ServerMessage;
use relaymq::core::session::SessionKind;
use relaymq::core::settings::AddressSettings;

use common::{deliveries, memory_config, open_session, start_broker};

fn message(address: &str, body: &'static [u8]) -> ServerMessage {
    ServerMessage::new(0, address, Bytes::from_static(body))
}

#[test]
fn queue_consumers_share_messages_round_robin() {
    let broker = start_broker(memory_config());
    let (session, mut rx) = open_session(&broker, SessionKind::Queue, false);

    session.create_queue("jobs", "jobs.render", None, false, false).unwrap();
    session.create_consumer(1, "jobs", None, -1).unwrap();
    session.create_consumer(2, "jobs", None, -1).unwrap();
    session.start();
    session.create_producer(10, Some("jobs.render")).unwrap();
    for _ in 0..4 {
        session.send(10, message("jobs.render", b"frame")).unwrap();
    }

    let seen = deliveries(&mut rx);
    assert_eq!(seen.len(), 4);
    assert_eq!(seen.iter().filter(|(c, _, _)| *c == 1).count(), 2);
    assert_eq!(seen.iter().filter(|(c, _, _)| *c == 2).count(), 2);

    let last = seen.iter().filter(|(c, _, _)| *c == 1).map(|(_, id, _)| *id).max().unwrap();
    assert_eq!(session.acknowledge(1, last).unwrap(), 2);
    let queue = broker.post_office().get_queue("jobs").unwrap();
    assert_eq!(queue.delivering_count(), 2);
}

#[test]
fn topic_subscribers_each_get_a_copy() {
    let broker = start_broker(memory_config());
    let (publisher, _prx) = open_session(&broker, SessionKind::Generic, false);
    let (alice, mut arx) = open_session(&broker, SessionKind::Topic, false);
    let (bob, mut brx) = open_session(&broker, SessionKind::Topic, false);

    alice.create_consumer(1, "news.#", None, -1).unwrap();
    bob.create_consumer(1, "news.sport", None, -1).unwrap();
    alice.start();
    bob.start();

    publisher.create_producer(1, None).unwrap();
    publisher.send(1, message("news.sport", b"goal")).unwrap();
    publisher.send(1, message("news.weather", b"rain")).unwrap();

    assert_eq!(deliveries(&mut arx).len(), 2);
    assert_eq!(deliveries(&mut brx).len(), 1);

    let before = broker.post_office().queues().len();
    alice.close_consumer(1).unwrap();
    assert_eq!(broker.post_office().queues().len(), before - 1);
}

#[test]
fn transacted_sends_appear_on_commit() {
    let broker = start_broker(memory_config());
    let (session, _rx) = open_session(&broker, SessionKind::Generic, true);
    session.create_queue("q", "tx.a", None, false, false).unwrap();
    session.create_producer(1, Some("tx.a")).unwrap();
    let queue = broker.post_office().get_queue("q").unwrap();

    session.send(1, message("tx.a", b"one")).unwrap();
    session.send(1, message("tx.a", b"two")).unwrap();
    assert_eq!(queue.message_count(), 0);
    session.commit().unwrap();
    assert_eq!(queue.message_count(), 2);

    session.send(1, message("tx.a", b"three")).unwrap();
    session.rollback().unwrap();
    assert_eq!(queue.message_count(), 2);
}

#[test]
fn rolled_back_acknowledgements_redeliver_then_dead_letter() {
    let mut config = memory_config();
    config.address_settings.insert(
        "orders.#".to_string(),
        AddressSettings {
            dead_letter_address: Some("dlq".to_string()),
            max_delivery_attempts: 2,
            ..AddressSettings::default()
        },
    );
    let broker = start_broker(config);
    let (admin, _arx) = open_session(&broker, SessionKind::Generic, false);
    admin.create_queue("orders", "orders.new", None, false, false).unwrap();
    admin.create_queue("dead", "dlq", None, false, false).unwrap();
    admin.create_producer(1, Some("orders.new")).unwrap();
    admin.send(1, message("orders.new", b"order")).unwrap();

    let (session, mut rx) = open_session(&broker, SessionKind::Generic, true);
    session.create_consumer(5, "orders", None, -1).unwrap();
    session.start();

    let first = deliveries(&mut rx);
    assert_eq!(first.len(), 1);
    let (_, id, count) = first[0];
    assert_eq!(count, 0);
    session.acknowledge(5, id).unwrap();
    session.rollback().unwrap();

    let second = deliveries(&mut rx);
    assert_eq!(second, vec![(5, id, 1)]);
    session.acknowledge(5, id).unwrap();
    session.rollback().unwrap();

    assert!(deliveries(&mut rx).is_empty());
    let orders = broker.post_office().get_queue("orders").unwrap();
    let dead = broker.post_office().get_queue("dead").unwrap();
    assert_eq!(orders.message_count(), 0);
    assert_eq!(dead.message_count(), 1);
}

#[test]
fn closing_a_session_returns_unacknowledged_messages() {
    let broker = start_broker(memory_config());
    let (admin, _arx) = open_session(&broker, SessionKind::Generic, false);
    admin.create_queue("q", "work", None, false, false).unwrap();
    admin.create_producer(1, Some("work")).unwrap();
    admin.send(1, message("work", b"a")).unwrap();

    let (session, mut rx) = open_session(&broker, SessionKind::Generic, false);
    session.create_consumer(1, "q", None, -1).unwrap();
    session.start();
    assert_eq!(deliveries(&mut rx).len(), 1);
    session.close().unwrap();

    let queue = broker.post_office().get_queue("q").unwrap();
    assert_eq!(queue.message_count(), 1);
    assert_eq!(queue.delivering_count(), 0);
    let waiting = queue.list(None);
    assert_eq!(waiting[0].delivery_count(), 1);
}

#[test]
fn consumer_filters_select_messages() {
    let broker = start_broker(memory_config());
    let (session, mut rx) = open_session(&broker, SessionKind::Generic, false);
    session.create_queue("q", "events", None, false, false).unwrap();
    session
        .create_consumer(1, "q", Some("kind = 'click'"), -1)
        .unwrap();
    session.start();
    session.create_producer(1, Some("events")).unwrap();
    session
        .send(1, message("events", b"x").with_property("kind", "click"))
        .unwrap();
    session
        .send(1, message("events", b"y").with_property("kind", "view"))
        .unwrap();

    assert_eq!(deliveries(&mut rx).len(), 1);
    let queue = broker.post_office().get_queue("q").unwrap();
    assert_eq!(queue.message_count(), 1);
}
