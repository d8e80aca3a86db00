use crate::helpers::{eventually, get_client, message_count, unique_name};
use burrow::consumers::{ClosureHandler, HandlerError, Incoming};
use burrow::amqp::options::ExchangeDeleteOptions;
use burrow::publishers::Message;
use burrow::topology::{dead_letter_queue, DirectConsumer, DirectPublisher, DirectTopology};
use burrow::Client;
use opentelemetry::Context;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Declare a dead-lettered direct topology and publish a single message to it.
async fn publish_one(client: &Client) -> DirectTopology {
    let topology = DirectTopology::new(unique_name("ex"), unique_name("q"), "rk")
        .with_dead_letter(true);
    let publisher = DirectPublisher::new(client.clone(), &topology)
        .await
        .unwrap();
    publisher
        .publish(&Context::current(), Message::new("payload"))
        .await
        .unwrap();
    topology
}

/// Collect the retry counts of every attempt at handling a message.
fn recording_handler(
    attempts: Arc<Mutex<Vec<u32>>>,
    outcome: fn(u32) -> Result<(), HandlerError>,
) -> ClosureHandler<impl Fn(Context, Incoming) -> std::future::Ready<Result<(), HandlerError>>> {
    ClosureHandler(move |_cx: Context, incoming: Incoming| {
        attempts.lock().unwrap().push(incoming.retry_count);
        std::future::ready(outcome(incoming.retry_count))
    })
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn transient_failures_are_retried_then_dead_lettered() {
    // Arrange
    let client = get_client().await;
    let topology = publish_one(&client).await;
    let consumer = DirectConsumer::new(client.clone(), topology.clone())
        .await
        .unwrap();
    let attempts = Arc::new(Mutex::new(Vec::new()));

    // Act
    let shutdown = CancellationToken::new();
    let handler = recording_handler(Arc::clone(&attempts), |_| {
        Err(HandlerError::transient(anyhow::anyhow!("database unavailable")))
    });
    let subscription = consumer.consume(handler, &shutdown).await.unwrap();

    // Assert
    let (sender, mut dead_lettered) = mpsc::unbounded_channel();
    let dlq_subscription = client
        .consume(
            &dead_letter_queue(topology.queue()),
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

    let dead = tokio::time::timeout(Duration::from_secs(10), dead_lettered.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b"payload".to_vec(), dead.payload);
    assert_eq!("rk", dead.routing_key.as_str());
    // max_retry is 3: one first attempt and three retries.
    assert_eq!(vec![0, 1, 2, 3], *attempts.lock().unwrap());

    shutdown.cancel();
    subscription.join().await.unwrap();
    dlq_subscription.join().await.unwrap();
    assert_eq!(0, message_count(&client, topology.queue()).await);
    client.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn fatal_failures_are_dead_lettered_without_retries() {
    let client = get_client().await;
    let topology = publish_one(&client).await;
    let consumer = DirectConsumer::new(client.clone(), topology.clone())
        .await
        .unwrap();
    let attempts = Arc::new(Mutex::new(Vec::new()));

    let shutdown = CancellationToken::new();
    let handler = recording_handler(Arc::clone(&attempts), |_| {
        Err(HandlerError::fatal(anyhow::anyhow!("malformed order")))
    });
    let subscription = consumer.consume(handler, &shutdown).await.unwrap();

    let dlq = dead_letter_queue(topology.queue());
    let (client_ref, dlq_ref) = (&client, &dlq);
    let dead_lettered =
        eventually(move || async move { message_count(client_ref, dlq_ref).await == 1 }).await;
    assert!(dead_lettered);
    assert_eq!(vec![0], *attempts.lock().unwrap());

    subscription.stop().await.unwrap();
    client.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn a_retry_that_succeeds_is_acked() {
    let client = get_client().await;
    let topology = publish_one(&client).await;
    let consumer = DirectConsumer::new(client.clone(), topology.clone())
        .await
        .unwrap();
    let attempts = Arc::new(Mutex::new(Vec::new()));

    let shutdown = CancellationToken::new();
    let handler = recording_handler(Arc::clone(&attempts), |retry_count| {
        if retry_count == 0 {
            Err(HandlerError::transient(anyhow::anyhow!("timeout")))
        } else {
            Ok(())
        }
    });
    let subscription = consumer.consume(handler, &shutdown).await.unwrap();

    let recorded = &attempts;
    assert!(eventually(move || async move { recorded.lock().unwrap().len() == 2 }).await);
    subscription.stop().await.unwrap();

    assert_eq!(vec![0, 1], *attempts.lock().unwrap());
    assert_eq!(0, message_count(&client, topology.queue()).await);
    assert_eq!(
        0,
        message_count(&client, &dead_letter_queue(topology.queue())).await
    );
    client.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn a_panicking_handler_does_not_stop_the_consumer() {
    let client = get_client().await;
    let topology = publish_one(&client).await;
    let consumer = DirectConsumer::new(client.clone(), topology.clone())
        .await
        .unwrap();
    let attempts = Arc::new(Mutex::new(Vec::new()));

    let shutdown = CancellationToken::new();
    let handler = recording_handler(Arc::clone(&attempts), |_| panic!("unexpected payload"));
    let subscription = consumer.consume(handler, &shutdown).await.unwrap();

    // Panics count as transient failures: retried, then dead-lettered.
    let dlq = dead_letter_queue(topology.queue());
    let (client_ref, dlq_ref) = (&client, &dlq);
    let dead_lettered =
        eventually(move || async move { message_count(client_ref, dlq_ref).await == 1 }).await;
    assert!(dead_lettered);
    assert_eq!(vec![0, 1, 2, 3], *attempts.lock().unwrap());
    assert!(!subscription.is_finished());

    subscription.stop().await.unwrap();
    client.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn a_failed_retry_republish_leaves_the_message_in_its_queue() {
    let client = get_client().await;
    let topology = publish_one(&client).await;
    // The message is already queued: republishing it to its exchange will now fail.
    client
        .channel()
        .await
        .unwrap()
        .exchange_delete(topology.exchange(), ExchangeDeleteOptions::default())
        .await
        .unwrap();
    let consumer = DirectConsumer::new(client.clone(), topology.clone())
        .await
        .unwrap();
    let attempts = Arc::new(Mutex::new(Vec::new()));

    let shutdown = CancellationToken::new();
    let handler = recording_handler(Arc::clone(&attempts), |_| {
        Err(HandlerError::transient(anyhow::anyhow!("database unavailable")))
    });
    let subscription = consumer.consume(handler, &shutdown).await.unwrap();

    let recorded = &attempts;
    assert!(eventually(move || async move { !recorded.lock().unwrap().is_empty() }).await);
    // The broker closes the channel on the failed publish: either the consumer stops on its
    // own or we stop it, in both cases without acking the delivery.
    shutdown.cancel();
    let _ = subscription.join().await;

    let queue = topology.queue();
    let (client_ref, queue_ref) = (&client, queue);
    assert!(eventually(move || async move { message_count(client_ref, queue_ref).await == 1 }).await);
    assert_eq!(0, message_count(&client, &dead_letter_queue(queue)).await);
    assert_eq!(0, attempts.lock().unwrap()[0]);
    client.shutdown().await;
}
