use burrow::amqp::configuration::{ClientSettings, RabbitMqSettings};
use burrow::amqp::options::QueueDeclareOptions;
use burrow::amqp::types::FieldTable;
use burrow::Client;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

pub fn get_rabbitmq_settings() -> RabbitMqSettings {
    RabbitMqSettings::default()
}

/// A small pool and a short retry delay, to keep the tests snappy.
pub fn get_client_settings() -> ClientSettings {
    ClientSettings {
        pool_size: 4,
        retry_delay_millis: 50,
        ..ClientSettings::default()
    }
}

pub async fn get_client() -> Client {
    Client::connect(&get_rabbitmq_settings(), get_client_settings())
        .await
        .unwrap()
}

/// Exchange and queue names must not clash across test runs.
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// Number of messages ready for delivery in `queue`.
pub async fn message_count(client: &Client, queue: &str) -> u32 {
    let channel = client.channel().await.unwrap();
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                passive: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap()
        .message_count()
}

/// Poll `condition` until it holds, giving up after 10 seconds.
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}
