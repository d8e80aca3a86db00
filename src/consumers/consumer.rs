use crate::amqp::convenience::with_retry_count;
use crate::consumers::retry::{settle, RetryPolicy, Settlement};
use crate::consumers::{ConsumeError, Handler, HandlerError, Incoming};
use crate::pool::{ChannelPool, PooledChannel};
use crate::publishers::{publish_on_channel, Destination, PublishError, TRACER_NAME};
use crate::telemetry;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
};
use lapin::types::FieldTable;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{global, Context, KeyValue};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// How long a stopping consumer waits for the broker to hand back prefetched deliveries.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// A running consumer.
///
/// Dropping the handle does not stop the consumer: use [`Subscription::cancel`], the token
/// passed to [`Client::consume`](crate::Client::consume), or [`Subscription::stop`].
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), ConsumeError>>,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Ask the consumer to stop once the delivery in flight, if any, has been settled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the consumer to stop.
    ///
    /// It returns an error if the delivery stream failed, e.g. because the connection with the
    /// broker was lost.
    pub async fn join(self) -> Result<(), ConsumeError> {
        self.task.await.map_err(ConsumeError::Aborted)?
    }

    /// [`Subscription::cancel`] and [`Subscription::join`].
    pub async fn stop(self) -> Result<(), ConsumeError> {
        self.cancel();
        self.join().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("queue", &self.queue)
            .field("consumer_tag", &self.consumer_tag)
            .finish()
    }
}

/// Lease a channel for the lifetime of the consumer, register it with the broker and spawn the
/// dispatch loop.
#[tracing::instrument(name = "consumer_start", skip(pool, handler, cancel))]
pub(crate) async fn start<H: Handler>(
    pool: &ChannelPool,
    queue: &str,
    handler: H,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Subscription, ConsumeError> {
    let channel = pool
        .get_channel()
        .await
        .map_err(|source| ConsumeError::Pool {
            queue: queue.to_owned(),
            source,
        })?;
    let registration_error = |e: lapin::Error| ConsumeError::Registration {
        queue: queue.to_owned(),
        source: e.into(),
    };

    // One unacked message at a time: strict ordering per consumer.
    channel
        .basic_qos(1, BasicQosOptions { global: false })
        .await
        .map_err(registration_error)?;

    let consumer_tag = Uuid::new_v4().to_string();
    let consumer = channel
        .basic_consume(
            queue,
            &consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(registration_error)?;
    info!(%consumer_tag, "Consumer registered");

    let cancel = cancel.child_token();
    let dispatcher = Dispatcher {
        channel,
        queue: queue.to_owned(),
        consumer_tag: consumer_tag.clone(),
        handler: Arc::new(handler),
        policy,
    };
    let span = tracing::info_span!("consumer_run", queue, %consumer_tag);
    let task = tokio::spawn(dispatcher.run(consumer, cancel.clone()).instrument(span));

    Ok(Subscription {
        queue: queue.to_owned(),
        consumer_tag,
        cancel,
        task,
    })
}

struct Dispatcher<H> {
    /// Leased for the whole life of the consumer, returned to the pool on drop.
    channel: PooledChannel,
    queue: String,
    consumer_tag: String,
    handler: Arc<H>,
    policy: RetryPolicy,
}

impl<H: Handler> Dispatcher<H> {
    async fn run(
        self,
        mut consumer: lapin::Consumer,
        cancel: CancellationToken,
    ) -> Result<(), ConsumeError> {
        let result = loop {
            tokio::select! {
                // Stop before picking up anything new.
                biased;

                _ = cancel.cancelled() => {
                    info!("Consumer received a shutdown signal");
                    break Ok(());
                }

                delivery = consumer.next() => match delivery {
                    None => {
                        info!("The broker closed the delivery stream");
                        break Ok(());
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Consumer error");
                        break Err(ConsumeError::Stream(e));
                    }
                    Some(Ok(delivery)) => self.process(delivery).await,
                },
            }
        };

        if self.channel.status().connected() {
            self.deregister(consumer).await;
        }
        result
    }

    /// Cancel the broker consumer and requeue whatever it had prefetched, so that the channel
    /// goes back to the pool with no unacked delivery.
    async fn deregister(&self, mut consumer: lapin::Consumer) {
        if let Err(e) = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
        {
            warn!(error = %e, "Failed to cancel the consumer");
            return;
        }
        let drain = async {
            while let Some(Ok(delivery)) = consumer.next().await {
                nack(delivery.acker, true).await;
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            debug!("Timed out waiting for the delivery stream to end");
        }
    }

    async fn process(&self, delivery: lapin::message::Delivery) {
        let (incoming, acker) = Incoming::split(delivery, &self.queue);

        let parent_cx = telemetry::extract_context(&incoming.properties);
        let tracer = global::tracer(TRACER_NAME);
        let span = tracer
            .span_builder(format!("{} process", self.queue))
            .with_kind(SpanKind::Consumer)
            .with_attributes([
                KeyValue::new("messaging.system", "rabbitmq"),
                KeyValue::new("messaging.source.name", self.queue.clone()),
                KeyValue::new("messaging.rabbitmq.retry_count", i64::from(incoming.retry_count)),
            ])
            .start_with_context(&tracer, &parent_cx);
        let cx = parent_cx.with_span(span);

        let handler = Arc::clone(&self.handler);
        let outcome = handle_isolated(handler, cx.clone(), incoming.clone()).await;

        let span = cx.span();
        let failure = match &outcome {
            Ok(()) => {
                span.set_status(Status::Ok);
                None
            }
            Err(e) => {
                span.record_error(e);
                span.set_status(Status::error(e.to_string()));
                warn!(
                    delivery_tag = incoming.delivery_tag,
                    retry_count = incoming.retry_count,
                    error_type = %e.error_type,
                    error = ?e.inner_error,
                    "Failed to process message"
                );
                Some(e.error_type)
            }
        };

        let settlement = settle(failure, incoming.retry_count, self.policy.max_retry);
        debug!(delivery_tag = incoming.delivery_tag, ?settlement, "Settling delivery");
        self.apply(settlement, incoming, acker).await;
        span.end();
    }

    /// Terminate the delivery with the broker. `acker` is consumed: a delivery is settled once.
    async fn apply(&self, settlement: Settlement, incoming: Incoming, acker: Acker) {
        match settlement {
            Settlement::Ack => ack(acker).await,
            Settlement::DeadLetter => nack(acker, false).await,
            Settlement::Retry { next_retry_count } => {
                tokio::time::sleep(self.policy.retry_delay).await;
                let destination = Destination::new(
                    incoming.exchange.as_str(),
                    incoming.routing_key.as_str(),
                );
                let properties = with_retry_count(incoming.properties, next_retry_count);
                let republish =
                    publish_on_channel(&self.channel, &destination, &incoming.payload, properties);
                match republish_within(self.policy.publish_timeout, republish).await {
                    Ok(()) => ack(acker).await,
                    Err(e) => {
                        warn!(
                            error = ?e,
                            delivery_tag = incoming.delivery_tag,
                            "Failed to republish the message for a retry, requeueing it instead"
                        );
                        nack(acker, true).await;
                    }
                }
            }
        }
    }
}

/// A republish still unconfirmed after `timeout` counts as failed.
async fn republish_within<F>(timeout: Duration, republish: F) -> Result<(), PublishError>
where
    F: Future<Output = Result<(), PublishError>>,
{
    tokio::time::timeout(timeout, republish)
        .await
        .unwrap_or(Err(PublishError::TimeoutError))
}

/// Run the handler on its own task: a panic fails this delivery, as a transient error, instead
/// of tearing the consumer down.
async fn handle_isolated<H: Handler>(
    handler: Arc<H>,
    cx: Context,
    incoming: Incoming,
) -> Result<(), HandlerError> {
    let task = tokio::spawn(async move { handler.handle(cx, incoming).await });
    match task.await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(HandlerError::transient(anyhow::anyhow!(
            "The message handler panicked: {}",
            panic_message(e.into_panic())
        ))),
        Err(e) => Err(HandlerError::transient(e)),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_owned(),
            Err(_) => "non-string panic payload".to_owned(),
        },
    }
}

async fn ack(acker: Acker) {
    if let Err(e) = acker.ack(BasicAckOptions { multiple: false }).await {
        error!(error = %e, "Failed to ack message");
    }
}

async fn nack(acker: Acker, requeue: bool) {
    let options = BasicNackOptions {
        multiple: false,
        requeue,
    };
    if let Err(e) = acker.nack(options).await {
        error!(error = %e, requeue, "Failed to nack message");
    }
}
