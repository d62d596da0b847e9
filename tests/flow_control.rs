mod common;

use bytes::Bytes;
use relaymq::core::message::ServerMessage;
use relaymq::core::session::SessionKind;
use relaymq::core::settings::AddressSettings;

use common::{credit_grants, deliveries, memory_config, open_session, start_broker};

/// Encodes to exactly 500 bytes on the "flow" address.
fn message() -> ServerMessage {
    let message = ServerMessage::new(0, "flow", Bytes::from(vec![7u8; 462]));
    assert_eq!(message.encode_size(), 500);
    message
}

#[test]
fn producer_credits_wait_for_room_on_the_address() {
    let mut config = memory_config();
    config.delivery.producer_window_size = 1000;
    config.address_settings.insert(
        "flow".to_string(),
        AddressSettings {
            max_size_bytes: Some(1200),
            ..AddressSettings::default()
        },
    );
    let broker = start_broker(config);
    let (producer, mut prx) = open_session(&broker, SessionKind::Generic, false);
    producer.create_queue("q", "flow", None, false, false).unwrap();
    producer.create_producer(1, Some("flow")).unwrap();
    assert_eq!(credit_grants(&mut prx), vec![(1, 1000)]);

    producer.send(1, message()).unwrap();
    producer.send(1, message()).unwrap();
    assert_eq!(credit_grants(&mut prx), vec![(1, 1000)]);

    producer.send(1, message()).unwrap();
    producer.send(1, message()).unwrap();
    assert!(credit_grants(&mut prx).is_empty());
    let controller = broker.post_office().flow_controller(&"flow".into());
    assert_eq!(controller.size(), 2000);
    assert_eq!(controller.waiting_count(), 1);
    assert!(producer.producer(1).unwrap().is_waiting());

    let (consumer, mut crx) = open_session(&broker, SessionKind::Generic, false);
    consumer.create_consumer(1, "q", None, -1).unwrap();
    consumer.start();
    let seen = deliveries(&mut crx);
    assert_eq!(seen.len(), 4);

    consumer.individual_acknowledge(1, seen[0].1).unwrap();
    assert!(credit_grants(&mut prx).is_empty());
    consumer.individual_acknowledge(1, seen[1].1).unwrap();
    assert_eq!(credit_grants(&mut prx), vec![(1, 1000)]);
    assert_eq!(controller.size(), 1000);
    assert!(!producer.producer(1).unwrap().is_waiting());
}

#[test]
fn anonymous_producers_are_not_flow_controlled() {
    let broker = start_broker(memory_config());
    let (session, mut rx) = open_session(&broker, SessionKind::Generic, false);
    session.create_producer(3, None).unwrap();
    for _ in 0..10 {
        session.send(3, message()).unwrap();
    }
    assert!(credit_grants(&mut rx).is_empty());
}

#[test]
fn consumer_window_limits_in_flight_bytes() {
    let broker = start_broker(memory_config());
    let (admin, _arx) = open_session(&broker, SessionKind::Generic, false);
    admin.create_queue("q", "flow", None, false, false).unwrap();
    admin.create_producer(1, Some("flow")).unwrap();
    for _ in 0..3 {
        admin.send(1, message()).unwrap();
    }

    let (session, mut rx) = open_session(&broker, SessionKind::Generic, false);
    session.create_consumer(1, "q", None, 600).unwrap();
    session.start();
    assert_eq!(deliveries(&mut rx).len(), 2);

    session.receive_consumer_credits(1, 1000).unwrap();
    assert_eq!(deliveries(&mut rx).len(), 1);
    let queue = broker.post_office().get_queue("q").unwrap();
    assert_eq!(queue.message_count(), 0);
    assert_eq!(queue.delivering_count(), 3);
}
