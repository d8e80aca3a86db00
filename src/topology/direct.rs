use crate::consumers::{ConsumeError, Handler, HandlerError, Subscription};
use crate::publishers::{Destination, Message, PublishError};
use crate::topology::declare::Layout;
use crate::topology::{validate_name, validate_priority, TopologyError};
use crate::Client;
use lapin::ExchangeKind;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// A queue bound to a direct exchange with a single routing key.
///
/// Dead-lettered messages are routed to `<queue>.dlq` through `<exchange>.dlx` with the same
/// routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectTopology {
    exchange: String,
    queue: String,
    routing_key: String,
    dead_letter: bool,
    max_priority: Option<u8>,
}

impl DirectTopology {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
            dead_letter: false,
            max_priority: None,
        }
    }

    #[must_use]
    pub fn with_dead_letter(mut self, dead_letter: bool) -> Self {
        self.dead_letter = dead_letter;
        self
    }

    /// Make the queue a [priority queue](https://www.rabbitmq.com/priority.html).
    ///
    /// Queue arguments are immutable: changing this on an existing queue requires rolling a
    /// new one.
    #[must_use]
    pub fn with_max_priority(mut self, max_priority: u8) -> Self {
        self.max_priority = Some(max_priority);
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        validate_name("exchange", &self.exchange)?;
        validate_name("queue", &self.queue)?;
        validate_priority(self.max_priority)
    }

    /// Declare exchanges, queues and bindings on the broker.
    pub async fn declare(&self, client: &Client) -> Result<(), TopologyError> {
        self.validate()?;
        let channel = client.channel().await?;
        let binding_keys = [self.routing_key.as_str()];
        Layout {
            exchange: &self.exchange,
            kind: ExchangeKind::Direct,
            queue: &self.queue,
            binding_keys: &binding_keys,
            dead_letter_routing_key: Some(&self.routing_key),
            dead_letter: self.dead_letter,
            max_priority: self.max_priority,
        }
        .declare(&channel)
        .await
    }
}

/// Publishes to the exchange of a [`DirectTopology`] with its routing key.
#[derive(Clone)]
pub struct DirectPublisher {
    client: Client,
    destination: Destination,
}

impl DirectPublisher {
    /// Declare `topology` and get ready to publish on it.
    pub async fn new(client: Client, topology: &DirectTopology) -> Result<Self, TopologyError> {
        topology.declare(&client).await?;
        Ok(Self {
            client,
            destination: Destination::new(topology.exchange(), topology.routing_key())
                .mandatory(true),
        })
    }

    pub async fn publish(&self, cx: &Context, message: Message) -> Result<(), PublishError> {
        self.client.publish(cx, &self.destination, message).await
    }

    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        cx: &Context,
        body: &T,
    ) -> Result<(), PublishError> {
        let message = Message::json(body).map_err(|e| PublishError::GenericError(e.into()))?;
        self.publish(cx, message).await
    }
}

/// Consumes the queue of a [`DirectTopology`].
#[derive(Clone)]
pub struct DirectConsumer {
    client: Client,
    topology: DirectTopology,
}

impl DirectConsumer {
    /// Declare `topology` and get ready to consume from it.
    pub async fn new(client: Client, topology: DirectTopology) -> Result<Self, TopologyError> {
        topology.declare(&client).await?;
        Ok(Self { client, topology })
    }

    pub async fn consume<H: Handler>(
        &self,
        handler: H,
        cancel: &CancellationToken,
    ) -> Result<Subscription, ConsumeError> {
        self.client
            .consume(self.topology.queue(), handler, cancel)
            .await
    }

    pub async fn consume_json<T, F, Fut, E>(
        &self,
        f: F,
        cancel: &CancellationToken,
    ) -> Result<Subscription, ConsumeError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Context, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<HandlerError> + 'static,
    {
        self.client
            .consume_json(self.topology.queue(), f, cancel)
            .await
    }
}
