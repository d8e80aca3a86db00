use crate::amqp::configuration::{ClientSettings, RabbitMqSettings};
use crate::amqp::ConnectionFactory;
use crate::consumers::{
    self, ConsumeError, Handler, HandlerError, JsonHandler, RetryPolicy, Subscription,
};
use crate::pool::{ChannelPool, PoolError, PoolSettings, PooledChannel};
use crate::publishers::{Destination, Message, PublishError, Publisher};
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Entry point to RabbitMq: a channel pool on a single connection, plus the publish and
/// consume primitives built on it.
///
/// `Client` is cheap to clone: clones share the same pool.
///
/// ```rust,no_run
/// use burrow::amqp::configuration::{ClientSettings, RabbitMqSettings};
/// use burrow::consumers::{ClosureHandler, HandlerError, Incoming};
/// use burrow::publishers::{Destination, Message};
/// use burrow::Client;
/// use opentelemetry::Context;
/// use tokio_util::sync::CancellationToken;
///
/// async fn example() -> anyhow::Result<()> {
///     let client = Client::connect(&RabbitMqSettings::default(), ClientSettings::default()).await?;
///
///     let shutdown = CancellationToken::new();
///     let subscription = client
///         .consume(
///             "q1",
///             ClosureHandler(|_cx: Context, incoming: Incoming| async move {
///                 println!("received {} bytes", incoming.payload.len());
///                 Ok::<_, HandlerError>(())
///             }),
///             &shutdown,
///         )
///         .await?;
///
///     client
///         .publish(&Context::current(), &Destination::queue("q1"), Message::new("hello"))
///         .await?;
///
///     subscription.stop().await?;
///     client.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    pool: ChannelPool,
    publisher: Publisher,
    retry_policy: RetryPolicy,
}

impl Client {
    /// Connect to the broker described by `rabbitmq` and open the channel pool.
    ///
    /// A [`PoolError::Connection`] means the broker could not be reached even after retrying
    /// with backoff: there is not much a service can do about it but exit.
    pub async fn connect(
        rabbitmq: &RabbitMqSettings,
        settings: ClientSettings,
    ) -> Result<Self, PoolError> {
        let factory = ConnectionFactory::new_from_config(rabbitmq).map_err(PoolError::Connection)?;
        let pool = ChannelPool::connect(factory, PoolSettings::from(&settings)).await?;
        Ok(Self::from_pool(pool, &settings))
    }

    /// Build a client on top of an existing pool.
    pub fn from_pool(pool: ChannelPool, settings: &ClientSettings) -> Self {
        let publisher = Publisher::builder(pool.clone())
            .publish_timeout(settings.publish_timeout())
            .build();
        Self {
            pool,
            publisher,
            retry_policy: RetryPolicy {
                max_retry: settings.max_retry,
                retry_delay: settings.retry_delay(),
                publish_timeout: settings.publish_timeout(),
            },
        }
    }

    /// Publish `message` to `destination`. See [`Publisher::publish`].
    pub async fn publish(
        &self,
        cx: &Context,
        destination: &Destination,
        message: Message,
    ) -> Result<(), PublishError> {
        self.publisher.publish(cx, destination, message).await
    }

    /// Start consuming `queue`, processing one message at a time with `handler`.
    ///
    /// The consumer holds on to a pooled channel until it stops, either because `cancel`
    /// (or [`Subscription::cancel`]) fired or because the broker closed the delivery stream.
    pub async fn consume<H: Handler>(
        &self,
        queue: &str,
        handler: H,
        cancel: &CancellationToken,
    ) -> Result<Subscription, ConsumeError> {
        consumers::start(&self.pool, queue, handler, self.retry_policy, cancel).await
    }

    /// [`Client::consume`], handing the JSON-decoded body to `f`.
    ///
    /// Messages whose body does not decode as `T` are dead-lettered without retries.
    pub async fn consume_json<T, F, Fut, E>(
        &self,
        queue: &str,
        f: F,
        cancel: &CancellationToken,
    ) -> Result<Subscription, ConsumeError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Context, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<HandlerError> + 'static,
    {
        self.consume(queue, JsonHandler::new(f), cancel).await
    }

    /// Lease a channel from the pool, e.g. to declare exchanges and queues.
    pub async fn channel(&self) -> Result<PooledChannel, PoolError> {
        self.pool.get_channel().await
    }

    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    /// Fires when the client is shut down, including when reconnecting to the broker failed
    /// for good.
    pub fn terminated(&self) -> CancellationToken {
        self.pool.terminated()
    }

    /// Close the pool and the connection. Running consumers see their delivery stream end.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
