use crate::helpers::{get_client, unique_name};
use burrow::consumers::{ClosureHandler, HandlerError, Incoming};
use burrow::publishers::Message;
use burrow::topology::{TopicConsumer, TopicPublisher, TopicTopology};
use opentelemetry::Context;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn topic_patterns_select_the_routing_keys_a_queue_receives() {
    // Arrange
    let client = get_client().await;
    let topology = TopicTopology::new(unique_name("customers"), unique_name("q"), ["customer.*"])
        .unwrap()
        .with_dead_letter(true);
    let publisher = TopicPublisher::new(client.clone(), &topology)
        .await
        .unwrap();
    let consumer = TopicConsumer::new(client.clone(), topology).await.unwrap();

    let (sender, mut received) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let subscription = consumer
        .consume(
            ClosureHandler(move |_cx: Context, incoming: Incoming| {
                let sender = sender.clone();
                async move {
                    let _ = sender.send(incoming.routing_key.as_str().to_owned());
                    Ok::<_, HandlerError>(())
                }
            }),
            &shutdown,
        )
        .await
        .unwrap();

    // Act
    let cx = Context::current();
    for routing_key in [
        "customer.created",
        "order.created",
        "customer.updated",
        "customer.created.extra",
    ] {
        publisher
            .publish(&cx, routing_key, Message::new(routing_key))
            .await
            .unwrap();
    }

    // Assert
    let mut routing_keys = BTreeSet::new();
    while let Ok(Some(routing_key)) =
        tokio::time::timeout(Duration::from_secs(1), received.recv()).await
    {
        routing_keys.insert(routing_key);
    }
    assert_eq!(
        BTreeSet::from(["customer.created".to_owned(), "customer.updated".to_owned()]),
        routing_keys
    );

    subscription.stop().await.unwrap();
    client.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn declaring_the_same_topology_twice_is_a_no_op() {
    let client = get_client().await;
    let topology = TopicTopology::new(unique_name("ex"), unique_name("q"), ["a.#", "b.*"])
        .unwrap()
        .with_dead_letter(true)
        .with_max_priority(10);

    topology.declare(&client).await.unwrap();
    topology.declare(&client).await.unwrap();

    client.shutdown().await;
}
