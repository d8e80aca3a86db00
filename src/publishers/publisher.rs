use crate::pool::{ChannelPool, PoolError};
use crate::publishers::{Destination, Message};
use crate::telemetry;
use lapin::message::BasicReturnMessage;
use lapin::options::BasicPublishOptions;
use lapin::publisher_confirm::Confirmation;
use lapin::{BasicProperties, Channel};
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{global, Context, KeyValue};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

pub(crate) const TRACER_NAME: &str = "burrow";

/// Publishes messages on channels leased from a [`ChannelPool`].
///
/// # Fault tolerance
///
/// Channels come from the pool, which reconnects to RabbitMq on its own if the connection
/// breaks. A publish attempted while reconnecting waits for a channel like any other.
#[derive(Clone)]
pub struct Publisher {
    channel_pool: ChannelPool,
    /// Covers publishing on a leased channel. Checkouts are bounded by the pool.
    timeout: Duration,
}

impl Publisher {
    /// Start building a [`Publisher`].
    pub fn builder(channel_pool: ChannelPool) -> PublisherBuilder {
        PublisherBuilder::new(channel_pool)
    }

    /// Publish `message` to `destination`.
    ///
    /// A producer span is started as a child of `cx` and its context injected in the message
    /// headers. `message_id` and `timestamp` are filled in when missing and the message is
    /// always persistent.
    #[tracing::instrument(
        name = "publish",
        skip_all,
        fields(exchange = %destination.exchange, routing_key = %destination.routing_key)
    )]
    pub async fn publish(
        &self,
        cx: &Context,
        destination: &Destination,
        message: Message,
    ) -> Result<(), PublishError> {
        let tracer = global::tracer(TRACER_NAME);
        let span = tracer
            .span_builder(format!("{} publish", span_target(destination)))
            .with_kind(SpanKind::Producer)
            .with_attributes([
                KeyValue::new("messaging.system", "rabbitmq"),
                KeyValue::new("messaging.destination.name", destination.exchange.clone()),
                KeyValue::new(
                    "messaging.rabbitmq.destination.routing_key",
                    destination.routing_key.clone(),
                ),
            ])
            .start_with_context(&tracer, cx);
        let cx = cx.with_span(span);

        let Message {
            payload,
            properties,
        } = inject_amqp_properties(message);
        let properties = telemetry::inject_context(&cx, properties);

        let outcome = match self.channel_pool.get_channel().await {
            Ok(channel) => {
                let publish_future =
                    publish_on_channel(&channel, destination, &payload, properties);
                match tokio::time::timeout(self.timeout, publish_future).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(PublishError::TimeoutError),
                }
            }
            Err(e) => Err(PublishError::Pool(e)),
        };

        let span = cx.span();
        match &outcome {
            Ok(()) => span.set_status(Status::Ok),
            Err(e) => {
                span.record_error(e);
                span.set_status(Status::error(e.to_string()));
            }
        }
        span.end();
        outcome
    }
}

/// A builder for [`Publisher`].
///
/// Use [`Publisher::builder`] as entrypoint.
pub struct PublisherBuilder {
    channel_pool: ChannelPool,
    timeout: Duration,
}

impl PublisherBuilder {
    fn new(channel_pool: ChannelPool) -> Self {
        Self {
            channel_pool,
            timeout: Duration::from_secs(3),
        }
    }

    /// Timeout applied when publishing a message on a leased channel, broker confirmation
    /// included. Defaults to 3 seconds if left unspecified.
    ///
    /// Waiting for a channel is bounded by the pool's checkout timeout instead.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Publisher {
        Publisher {
            channel_pool: self.channel_pool,
            timeout: self.timeout,
        }
    }
}

/// Error returned when trying to publish a message using [`Publisher`].
#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("Failed to acquire a healthy channel from the pool")]
    Pool(#[from] PoolError),
    #[error("Generic error encountered when interacting with the RabbitMq broker")]
    GenericError(#[source] anyhow::Error),
    #[error("The timeout threshold was reached while trying to publish the message")]
    TimeoutError,
    #[error("The message could not be routed: {0:?}")]
    UnroutableMessage(Box<BasicReturnMessage>),
    #[error("The RabbitMq broker nacked the publishing of the message: {0:?}")]
    NegativeAck(Option<Box<BasicReturnMessage>>),
}

/// Publish a payload on a RabbitMq exchange, waiting for publisher confirmation from the
/// RabbitMq broker when the channel has them enabled.
///
/// The mandatory flag tells the broker how to react if the message cannot be routed to a queue.
/// If this flag is `true`, the broker will return an unroutable message with a Return method.
/// If this flag is `false`, the broker silently drops the message.
#[tracing::instrument(
    level = "debug",
    skip(channel, payload, properties),
    fields(exchange = %destination.exchange, routing_key = %destination.routing_key)
)]
pub(crate) async fn publish_on_channel(
    channel: &Channel,
    destination: &Destination,
    payload: &[u8],
    properties: BasicProperties,
) -> Result<(), PublishError> {
    let options = BasicPublishOptions {
        mandatory: destination.mandatory,
        immediate: destination.immediate,
    };
    // Delivery mode: Non-persistent (1) or persistent (2).
    let properties = properties.with_delivery_mode(2);

    let confirm = channel
        .basic_publish(
            &destination.exchange,
            &destination.routing_key,
            options,
            payload,
            properties,
        )
        .await
        .map_err(|e| PublishError::GenericError(e.into()))?
        .await
        .map_err(|e| PublishError::GenericError(e.into()))?;

    match confirm {
        Confirmation::Ack(ack) => {
            if let Some(return_message) = ack {
                // Reply Code 312 - NO_ROUTE
                if return_message.reply_code == 312 {
                    return Err(PublishError::UnroutableMessage(return_message));
                }
            }
            Ok(())
        }
        Confirmation::Nack(nack) => Err(PublishError::NegativeAck(nack)),
        Confirmation::NotRequested => Ok(()),
    }
}

fn span_target(destination: &Destination) -> &str {
    if destination.exchange.is_empty() {
        &destination.routing_key
    } else {
        &destination.exchange
    }
}

/// Fill in `timestamp` and `message_id` unless the caller already set them.
fn inject_amqp_properties(mut message: Message) -> Message {
    let current_timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|ct| ct.as_secs());

    let props = message.properties;
    let props = if let Some(ct) = current_timestamp {
        let ts = *props.timestamp();
        props.with_timestamp(ts.unwrap_or(ct))
    } else {
        warn!("System time is before 1970");
        props
    };

    let message_id = props.message_id().clone();
    message.properties =
        props.with_message_id(message_id.unwrap_or_else(|| Uuid::new_v4().to_string().into()));

    message
}
