use burrow::amqp::configuration::{ClientSettings, RabbitMqSettings};
use burrow::consumers::HandlerError;
use burrow::topology::{DirectConsumer, DirectPublisher, DirectTopology};
use burrow::Client;
use opentelemetry::Context;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: u32,
    amount_cents: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Out-of-the-box parameters for the default RabbitMq Docker image.
    let settings = RabbitMqSettings::default();
    let client = Client::connect(&settings, ClientSettings::default()).await?;

    // `orders.dlx` and `orders-worker.dlq` are declared too: orders we fail to process
    // more than `max_retry` times, or that cannot be decoded, end up there.
    let topology = DirectTopology::new("orders", "orders-worker", "order.placed")
        .with_dead_letter(true);
    let publisher = DirectPublisher::new(client.clone(), &topology).await?;
    let consumer = DirectConsumer::new(client.clone(), topology).await?;

    let shutdown = CancellationToken::new();
    let subscription = consumer
        .consume_json(
            |_cx: Context, order: OrderPlaced| async move {
                if order.amount_cents == 0 {
                    // Retrying will not help: dead-letter it straight away.
                    return Err(HandlerError::fatal(anyhow::anyhow!(
                        "order {} has no amount",
                        order.order_id
                    )));
                }
                println!("Processing order {order:?}");
                Ok(())
            },
            &shutdown,
        )
        .await?;

    let cx = Context::current();
    for order_id in 0..5 {
        let order = OrderPlaced {
            order_id,
            amount_cents: u64::from(order_id) * 1_000,
        };
        publisher.publish_json(&cx, &order).await?;
    }

    // Stop on ctrl-c, or when the connection to the broker is lost for good.
    let terminated = client.terminated();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminated.cancelled() => {}
    }
    shutdown.cancel();
    subscription.join().await?;
    client.shutdown().await;
    Ok(())
}
