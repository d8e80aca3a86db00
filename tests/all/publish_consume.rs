use crate::helpers::{
    get_client, get_client_settings, get_rabbitmq_settings, message_count, unique_name,
};
use burrow::amqp::configuration::ClientSettings;
use burrow::amqp::types::AMQPValue;
use burrow::consumers::{ClosureHandler, HandlerError, Incoming};
use burrow::pool::PoolError;
use burrow::publishers::{Destination, Message, PublishError};
use burrow::Client;
use burrow::topology::{DirectConsumer, DirectPublisher, DirectTopology};
use opentelemetry::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: String,
    amount: u64,
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn a_json_message_is_handled_once_and_acked() {
    // Arrange
    let client = get_client().await;
    let topology = DirectTopology::new(unique_name("ex1"), unique_name("q1"), "q1")
        .with_dead_letter(true);
    let publisher = DirectPublisher::new(client.clone(), &topology)
        .await
        .unwrap();
    let consumer = DirectConsumer::new(client.clone(), topology.clone())
        .await
        .unwrap();

    let (sender, mut received) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let subscription = consumer
        .consume_json(
            move |_cx: Context, order: OrderPlaced| {
                let sender = sender.clone();
                async move {
                    let _ = sender.send(order);
                    Ok::<_, HandlerError>(())
                }
            },
            &shutdown,
        )
        .await
        .unwrap();

    // Act
    let order = OrderPlaced {
        order_id: "o-1".into(),
        amount: 42,
    };
    publisher
        .publish_json(&Context::current(), &order)
        .await
        .unwrap();

    // Assert
    let handled = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .unwrap();
    assert_eq!(Some(order), handled);
    assert!(
        tokio::time::timeout(Duration::from_millis(500), received.recv())
            .await
            .is_err(),
        "The message was handled more than once"
    );

    shutdown.cancel();
    subscription.join().await.unwrap();
    assert_eq!(0, message_count(&client, topology.queue()).await);
    assert_eq!(
        0,
        message_count(&client, &format!("{}.dlq", topology.queue())).await
    );
    client.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn headers_and_properties_reach_the_handler() {
    let client = get_client().await;
    let topology = DirectTopology::new(unique_name("ex"), unique_name("q"), "rk");
    let publisher = DirectPublisher::new(client.clone(), &topology)
        .await
        .unwrap();
    let consumer = DirectConsumer::new(client.clone(), topology).await.unwrap();

    let (sender, mut received) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let subscription = consumer
        .consume(
            ClosureHandler(move |_cx: Context, incoming: Incoming| {
                let sender = sender.clone();
                async move {
                    let _ = sender.send(incoming);
                    Ok::<_, HandlerError>(())
                }
            }),
            &shutdown,
        )
        .await
        .unwrap();

    let message = Message::new("hello")
        .with_header("tenant", AMQPValue::LongString("acme".into()))
        .with_priority(5)
        .with_type("greeting");
    publisher
        .publish(&Context::current(), message)
        .await
        .unwrap();

    let incoming = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b"hello".to_vec(), incoming.payload);
    assert_eq!("rk", incoming.routing_key.as_str());
    assert_eq!(0, incoming.retry_count);
    assert_eq!(Some(5), *incoming.properties.priority());
    assert_eq!(
        Some("greeting"),
        incoming.properties.kind().as_ref().map(|t| t.as_str())
    );
    // Filled in by the publisher.
    assert!(incoming.properties.message_id().is_some());
    assert!(incoming.properties.timestamp().is_some());
    assert_eq!(Some(2), *incoming.properties.delivery_mode());

    subscription.stop().await.unwrap();
    client.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn mandatory_messages_without_a_route_are_rejected() {
    let client = get_client().await;
    let destination = Destination::queue(unique_name("nobody-listens")).mandatory(true);

    let outcome = client
        .publish(&Context::current(), &destination, Message::new("lost"))
        .await;

    assert!(matches!(outcome, Err(PublishError::UnroutableMessage(_))));
    client.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn stopping_a_consumer_returns_its_channel_to_the_pool() {
    let client = get_client().await;
    let queue = unique_name("q");
    let topology = DirectTopology::new(unique_name("ex"), queue.clone(), "rk");
    topology.declare(&client).await.unwrap();

    let shutdown = CancellationToken::new();
    let handler = ClosureHandler(|_cx: Context, _incoming: Incoming| async move {
        Ok::<_, HandlerError>(())
    });
    let subscription = client.consume(&queue, handler, &shutdown).await.unwrap();
    assert_eq!(queue, subscription.queue());

    shutdown.cancel();
    subscription.join().await.unwrap();

    // Every channel can be leased at the same time again.
    let mut leases = Vec::new();
    for _ in 0..crate::helpers::get_client_settings().pool_size {
        leases.push(client.channel().await.unwrap());
    }
    drop(leases);
    client.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn a_publish_on_a_busy_pool_fails_with_the_checkout_timeout() {
    let settings = ClientSettings {
        pool_size: 1,
        checkout_timeout_millis: 200,
        publish_timeout_millis: 3_000,
        ..get_client_settings()
    };
    let client = Client::connect(&get_rabbitmq_settings(), settings)
        .await
        .unwrap();
    let lease = client.channel().await.unwrap();

    let outcome = client
        .publish(
            &Context::current(),
            &Destination::queue(unique_name("q")),
            Message::new("hello"),
        )
        .await;

    match outcome {
        Err(PublishError::Pool(PoolError::ChannelTimeout(timeout))) => {
            assert_eq!(Duration::from_millis(200), timeout)
        }
        other => panic!("Expected a checkout timeout, got {other:?}"),
    }
    drop(lease);
    client.shutdown().await;
}
