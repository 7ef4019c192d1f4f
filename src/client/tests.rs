use super::Channel;
use crate::broker::{Broker, Declared, ExchangeKind};
use crate::config::BrokerSettings;
use crate::utils::BrokerError;

#[test]
fn test_channel_open() {
    let broker = Broker::default();
    let channel = Channel::open(&broker);
    assert!(channel.id().starts_with("channel-"));
    assert!(!channel.is_closed());
    assert_eq!(channel.prefetch(), 0);
}

#[test]
fn test_channel_prefetch_defaults_from_settings() {
    let broker = Broker::with_settings(BrokerSettings {
        default_prefetch: 3,
        ..BrokerSettings::default()
    });
    let mut channel = Channel::open(&broker);
    assert_eq!(channel.prefetch(), 3);
    channel.basic_qos(1).unwrap();
    assert_eq!(channel.prefetch(), 1);
}

#[test]
fn test_publish_to_unknown_exchange_closes_channel() {
    let broker = Broker::default();
    let mut channel = Channel::open(&broker);

    let err = channel.basic_publish("nope", "key", "hello", false).unwrap_err();
    assert_eq!(err, BrokerError::UnknownExchange("nope".to_string()));
    assert!(channel.is_closed());

    assert_eq!(
        channel.queue_declare("q", true).unwrap_err(),
        BrokerError::ChannelClosed
    );
    assert_eq!(
        channel.basic_publish("", "q", "again", false).unwrap_err(),
        BrokerError::ChannelClosed
    );
}

#[test]
fn test_routing_miss_keeps_channel_open() {
    let broker = Broker::default();
    let mut channel = Channel::open(&broker);
    channel.exchange_declare("direct_logs", ExchangeKind::Direct).unwrap();

    let published = channel.basic_publish("direct_logs", "error", "boom", false).unwrap();
    assert!(!published.is_routed());
    assert!(!channel.is_closed());
}

#[test]
fn test_close_deletes_owned_ephemeral_queues_only() {
    let broker = Broker::default();
    let mut channel = Channel::open(&broker);

    let anon = channel.queue_declare_anonymous().unwrap();
    assert!(anon.starts_with("amq.gen-"));
    channel.queue_declare("scratch", false).unwrap();
    channel.queue_declare("task_queue", true).unwrap();

    channel.close();

    assert!(matches!(broker.queue_info(&anon), Err(BrokerError::UnknownQueue(_))));
    assert!(matches!(broker.queue_info("scratch"), Err(BrokerError::UnknownQueue(_))));
    assert!(broker.queue_info("task_queue").is_ok());
}

#[test]
fn test_queue_declared_by_other_session_is_not_owned() {
    let broker = Broker::default();
    assert_eq!(broker.declare_queue("shared", false).unwrap(), Declared::Created);

    let channel = Channel::open(&broker);
    assert_eq!(
        channel.queue_declare("shared", false).unwrap(),
        Declared::AlreadyExists
    );
    drop(channel);

    assert!(broker.queue_info("shared").is_ok());
}

#[test]
fn test_close_requeues_unacked_deliveries() {
    let broker = Broker::default();
    broker.declare_queue("task_queue", true).unwrap();

    let mut channel = Channel::open(&broker);
    channel.basic_qos(1).unwrap();
    let mut consumer = channel.basic_consume("task_queue", false).unwrap();

    broker.publish("", "task_queue", "work", true).unwrap();
    let delivery = consumer.try_recv().expect("delivery");
    assert_eq!(broker.queue_info("task_queue").unwrap().unacked, 1);

    channel.close();

    let info = broker.queue_info("task_queue").unwrap();
    assert_eq!(info.unacked, 0);
    assert_eq!(info.ready, 1);
    assert_eq!(info.consumers, 0);
    assert!(consumer.is_cancelled());
    assert!(consumer.try_recv().is_none());
    assert_eq!(
        broker.ack(delivery.delivery_id).unwrap_err(),
        BrokerError::UnknownDelivery(delivery.delivery_id)
    );

    let head = broker.peek_ready("task_queue").unwrap().unwrap();
    assert_eq!(head.delivery_count, 1);
}

#[test]
fn test_basic_ack_through_channel() {
    let broker = Broker::default();
    let mut channel = Channel::open(&broker);
    channel.queue_declare("hello", false).unwrap();
    let mut consumer = channel.basic_consume("hello", false).unwrap();

    channel.basic_publish("", "hello", "Hello World!", false).unwrap();
    let delivery = consumer.try_recv().unwrap();
    assert_eq!(delivery.text(), "Hello World!");
    assert!(!delivery.redelivered);

    channel.basic_ack(&delivery).unwrap();
    assert_eq!(broker.unacked(), 0);
}
