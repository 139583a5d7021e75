use super::broker::MockBroker;
use crate::connection::{make_connector, StreamFactory};
use crate::{
    AmqpProperties, Auth, Connection, ConnectionEvent, ConnectionOptions, ConnectionTuning,
    ConsumerMessage, ConsumerOptions, Delivery, Error, IoStream, QueueDeclareOptions,
};
use std::time::{Duration, Instant};

fn open_mock(broker: &MockBroker, tuning: ConnectionTuning) -> Connection {
    let redial = broker.clone();
    let factory: StreamFactory =
        Box::new(move || Ok(Box::new(redial.stream()) as Box<dyn IoStream>));
    let connector = make_connector(factory, ConnectionOptions::<Auth>::default());
    let fresh = connector().unwrap();
    Connection::start(Some(connector), fresh, tuning).unwrap()
}

fn fast_recovery() -> ConnectionTuning {
    ConnectionTuning::default()
        .continuation_timeout(Duration::from_secs(5))
        .network_recovery_interval(Duration::from_millis(20))
}

fn recv_delivery(consumer: &crate::Consumer) -> Delivery {
    match consumer
        .receiver()
        .recv_timeout(Duration::from_secs(5))
        .expect("expected a consumer message")
    {
        ConsumerMessage::Delivery(delivery) => delivery,
        other => panic!("unexpected consumer message {:?}", other),
    }
}

#[test]
fn declare_publish_confirm_and_get() {
    let broker = MockBroker::new();
    let connection = open_mock(&broker, ConnectionTuning::default());
    let channel = connection.default_channel().unwrap();

    let declared = channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                exclusive: true,
                ..QueueDeclareOptions::default()
            },
        )
        .unwrap();
    assert!(declared.queue.starts_with("amq.gen-"));

    channel.confirm_select().unwrap();
    assert_eq!(channel.next_publish_seq_no(), 1);
    // idempotent
    channel.confirm_select().unwrap();
    assert_eq!(channel.next_publish_seq_no(), 1);

    for i in 0..3 {
        channel
            .basic_publish(
                "",
                declared.queue.as_str(),
                false,
                false,
                &AmqpProperties::default(),
                format!("m{}", i),
            )
            .unwrap();
    }
    assert!(channel.wait_for_confirms().unwrap());
    assert_eq!(channel.next_publish_seq_no(), 4);

    let got = channel
        .basic_get(declared.queue.as_str(), true)
        .unwrap()
        .expect("first message present");
    assert_eq!(got.message_count, 2);
    assert_eq!(got.delivery.content(), b"m0");
    assert_eq!(
        channel
            .basic_get(declared.queue.as_str(), true)
            .unwrap()
            .unwrap()
            .delivery
            .content(),
        b"m1"
    );
    assert_eq!(
        channel
            .basic_get(declared.queue.as_str(), true)
            .unwrap()
            .unwrap()
            .delivery
            .content(),
        b"m2"
    );
    assert!(channel
        .basic_get(declared.queue.as_str(), true)
        .unwrap()
        .is_none());

    connection.close().unwrap();
}

#[test]
fn consumer_receives_deliveries_in_order() {
    let broker = MockBroker::new();
    let connection = open_mock(&broker, ConnectionTuning::default());
    let channel = connection.default_channel().unwrap();

    channel
        .queue_declare("work", QueueDeclareOptions::default())
        .unwrap();
    let consumer = channel
        .basic_consume(
            "work",
            ConsumerOptions {
                no_ack: true,
                ..ConsumerOptions::default()
            },
        )
        .unwrap();
    assert!(consumer.consumer_tag().starts_with("ctag-"));

    for i in 0..5 {
        channel
            .basic_publish(
                "",
                "work",
                false,
                false,
                &AmqpProperties::default(),
                format!("job-{}", i),
            )
            .unwrap();
    }
    for i in 0..5 {
        let delivery = recv_delivery(&consumer);
        assert_eq!(delivery.content(), format!("job-{}", i).as_bytes());
        assert_eq!(delivery.routing_key(), "work");
    }

    channel.basic_cancel(consumer.consumer_tag()).unwrap();
    connection.close().unwrap();
}

#[test]
fn backlogged_messages_flow_when_consumer_subscribes() {
    let broker = MockBroker::new();
    let connection = open_mock(&broker, ConnectionTuning::default());
    let channel = connection.default_channel().unwrap();

    channel
        .queue_declare("backlog", QueueDeclareOptions::default())
        .unwrap();
    for i in 0..3 {
        channel
            .basic_publish(
                "",
                "backlog",
                false,
                false,
                &AmqpProperties::default(),
                format!("b{}", i),
            )
            .unwrap();
    }
    let consumer = channel
        .basic_consume(
            "backlog",
            ConsumerOptions {
                no_ack: true,
                ..ConsumerOptions::default()
            },
        )
        .unwrap();
    for i in 0..3 {
        assert_eq!(
            recv_delivery(&consumer).content(),
            format!("b{}", i).as_bytes()
        );
    }
    connection.close().unwrap();
}

#[test]
fn closed_channel_rejects_operations_on_all_handles() {
    let broker = MockBroker::new();
    let connection = open_mock(&broker, ConnectionTuning::default());

    let channel = connection.open_channel(None).unwrap();
    let other_handle = channel.clone();
    channel.close().unwrap();
    assert!(matches!(
        other_handle
            .queue_declare("x", QueueDeclareOptions::default())
            .unwrap_err(),
        Error::ChannelAlreadyClosed
    ));

    connection.close().unwrap();
}

#[test]
fn network_drop_recovers_topology_and_consumers() {
    let broker = MockBroker::new();
    let connection = open_mock(&broker, fast_recovery());
    let events = connection.listen_for_events();
    let channel = connection.default_channel().unwrap();

    // an exclusive server-named queue with a consumer, publishing under
    // confirms
    let declared = channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                exclusive: true,
                ..QueueDeclareOptions::default()
            },
        )
        .unwrap();
    assert_eq!(declared.queue, "amq.gen-0");
    channel.confirm_select().unwrap();
    let consumer = channel
        .basic_consume(
            declared.queue.as_str(),
            ConsumerOptions {
                no_ack: true,
                ..ConsumerOptions::default()
            },
        )
        .unwrap();

    channel
        .basic_publish(
            "",
            declared.queue.as_str(),
            false,
            false,
            &AmqpProperties::default(),
            "before-failure",
        )
        .unwrap();
    assert!(channel.wait_for_confirms().unwrap());
    let before = recv_delivery(&consumer);
    assert_eq!(before.content(), b"before-failure");

    broker.drop_connections();

    // recovery runs in the background; wait for it to finish
    let mut saw_network_failure = false;
    let mut saw_started = false;
    let mut completed = false;
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline && !completed {
        match events.receiver().recv_timeout(Duration::from_millis(100)) {
            Ok(ConnectionEvent::NetworkFailure { .. }) => saw_network_failure = true,
            Ok(ConnectionEvent::RecoveryStarted) => saw_started = true,
            Ok(ConnectionEvent::RecoveryCompleted) => completed = true,
            Ok(_) | Err(_) => (),
        }
    }
    assert!(saw_network_failure, "no network failure event seen");
    assert!(saw_started, "no recovery-started event seen");
    assert!(completed, "recovery did not complete");

    // the pre-failure delivery tag is stale now; acking it is a warned no-op
    assert!(before.delivery_tag().is_stale(1));
    channel.basic_ack(before.delivery_tag(), false).unwrap();

    // the server-named queue came back under a fresh name and the same
    // consumer delegate follows it
    channel
        .basic_publish(
            "",
            "amq.gen-1",
            false,
            false,
            &AmqpProperties::default(),
            "after-recovery",
        )
        .unwrap();
    assert!(channel.wait_for_confirms().unwrap());
    let after = recv_delivery(&consumer);
    assert_eq!(after.content(), b"after-recovery");
    assert!(!after.delivery_tag().is_stale(1));

    connection.close().unwrap();
}

#[test]
fn clean_close_reports_closed_event() {
    let broker = MockBroker::new();
    let connection = open_mock(&broker, ConnectionTuning::default());
    let events = connection.listen_for_events();
    connection.close().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "no closed event seen");
        if let Ok(ConnectionEvent::Closed { .. }) =
            events.receiver().recv_timeout(Duration::from_millis(100))
        {
            break;
        }
    }
}
