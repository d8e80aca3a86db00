use crate::amqp::backoff::retry_with_backoff;
use crate::amqp::configuration::{BackoffSettings, RpcSettings};
use crate::pool::PooledChannel;
use crate::publishers::{Destination, Message};
use crate::rpc::pending::PendingCalls;
use crate::rpc::{RpcError, ERROR_FIELD};
use crate::Client;
use futures_util::StreamExt;
use lapin::options::{BasicCancelOptions, BasicConsumeOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Per-call overrides for [`RpcClient::call_with_options`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Defaults to the client's timeout.
    pub timeout: Option<Duration>,
    /// Abandon the call when cancelled.
    pub cancel: Option<CancellationToken>,
}

/// Sends requests to an [`RpcServer`](super::RpcServer) and waits for the replies.
///
/// Replies come back on an exclusive, server-named queue consumed in the background. The
/// queue lives as long as the connection: after a reconnect a new one is declared, and calls
/// in flight at that moment time out.
///
/// Cheap to clone. The reply consumer stops when the last clone is dropped.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    pending: Arc<PendingCalls>,
    reply_queue: Arc<RwLock<String>>,
    timeout: Duration,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl RpcClient {
    /// Declare the reply queue and start consuming it.
    pub async fn new(client: Client, settings: &RpcSettings) -> Result<Self, RpcError> {
        let subscription = ReplySubscription::open(&client).await?;
        let reply_queue = Arc::new(RwLock::new(subscription.queue.clone()));
        let pending = Arc::new(PendingCalls::default());
        let shutdown = client.terminated();

        let span = tracing::info_span!("rpc_reply_loop");
        tokio::spawn(
            reply_loop(
                client.clone(),
                subscription,
                Arc::clone(&pending),
                Arc::clone(&reply_queue),
                shutdown.clone(),
            )
            .instrument(span),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                pending,
                reply_queue,
                timeout: settings.timeout(),
                shutdown,
            }),
        })
    }

    /// The queue replies are currently delivered to.
    pub fn reply_queue(&self) -> String {
        self.inner
            .reply_queue
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Send `request` as JSON to `queue` and wait for the raw reply.
    pub async fn call<Req: Serialize + ?Sized>(
        &self,
        cx: &Context,
        queue: &str,
        request: &Req,
    ) -> Result<Vec<u8>, RpcError> {
        self.call_with_options(cx, queue, request, CallOptions::default())
            .await
    }

    /// [`RpcClient::call`], decoding the reply as JSON.
    pub async fn call_json<Req, Resp>(
        &self,
        cx: &Context,
        queue: &str,
        request: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let reply = self.call(cx, queue, request).await?;
        serde_json::from_slice(&reply).map_err(RpcError::Deserialization)
    }

    /// [`RpcClient::call`] with a timeout for this call only.
    pub async fn call_with_timeout<Req: Serialize + ?Sized>(
        &self,
        cx: &Context,
        queue: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Vec<u8>, RpcError> {
        let options = CallOptions {
            timeout: Some(timeout),
            cancel: None,
        };
        self.call_with_options(cx, queue, request, options).await
    }

    /// Send `request` as JSON to `queue` and wait for the reply.
    ///
    /// The timeout covers publishing the request too. A reply shaped as `{"error": "..."}`
    /// becomes [`RpcError::Application`]. The call is deregistered however it ends, including
    /// when the returned future is dropped.
    #[tracing::instrument(name = "rpc_call", skip(self, cx, request, options))]
    pub async fn call_with_options<Req: Serialize + ?Sized>(
        &self,
        cx: &Context,
        queue: &str,
        request: &Req,
        options: CallOptions,
    ) -> Result<Vec<u8>, RpcError> {
        let payload = serde_json::to_vec(request).map_err(RpcError::Serialization)?;
        let correlation_id = Uuid::new_v4().to_string();
        let (call, reply) = self.inner.pending.register(correlation_id);

        let message = Message::new(payload)
            .with_content_type("application/json")
            .with_correlation_id(call.correlation_id())
            .with_reply_to(&self.reply_queue());
        let exchange = async {
            self.inner
                .client
                .publish(cx, &Destination::queue(queue), message)
                .await?;
            reply.await.map_err(|_| RpcError::Disconnected)
        };

        let timeout = options.timeout.unwrap_or(self.inner.timeout);
        let cancel = options.cancel.unwrap_or_else(CancellationToken::new);
        let reply = race(exchange, timeout, &cancel).await;
        debug!(correlation_id = call.correlation_id(), ok = reply.is_ok(), "RPC call finished");
        parse_reply(reply?)
    }
}

/// Resolve `exchange` unless `timeout` elapses or `cancel` fires first.
async fn race<F>(
    exchange: F,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, RpcError>
where
    F: Future<Output = Result<Vec<u8>, RpcError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RpcError::Cancelled),
        outcome = tokio::time::timeout(timeout, exchange) => match outcome {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Timeout(timeout)),
        },
    }
}

/// A body made of a single string `error` field is an application error.
fn parse_reply(body: Vec<u8>) -> Result<Vec<u8>, RpcError> {
    if let Ok(serde_json::Value::Object(fields)) = serde_json::from_slice(&body) {
        if fields.len() == 1 {
            if let Some(serde_json::Value::String(message)) = fields.get(ERROR_FIELD) {
                return Err(RpcError::Application(message.clone()));
            }
        }
    }
    Ok(body)
}

/// The background consumer of the reply queue.
struct ReplySubscription {
    channel: PooledChannel,
    consumer: lapin::Consumer,
    queue: String,
    consumer_tag: String,
}

impl ReplySubscription {
    async fn open(client: &Client) -> Result<Self, RpcError> {
        let channel = client
            .channel()
            .await
            .map_err(|e| RpcError::ReplyQueue(e.into()))?;
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    passive: false,
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::ReplyQueue(e.into()))?;
        let queue = queue.name().as_str().to_owned();

        let consumer_tag = Uuid::new_v4().to_string();
        let consumer = channel
            .basic_consume(
                &queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::ReplyQueue(e.into()))?;
        info!(%queue, "Consuming RPC replies");

        Ok(Self {
            channel,
            consumer,
            queue,
            consumer_tag,
        })
    }

    /// Route replies to pending calls until the delivery stream ends.
    async fn route_replies(&mut self, pending: &PendingCalls) {
        while let Some(delivery) = self.consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    warn!(error = %e, "The RPC reply consumer failed");
                    return;
                }
            };
            let Some(correlation_id) = delivery.properties.correlation_id().clone() else {
                warn!("Dropping an RPC reply without a correlation id");
                continue;
            };
            if !pending.complete(correlation_id.as_str(), delivery.data) {
                debug!(
                    correlation_id = correlation_id.as_str(),
                    "Dropping an RPC reply nobody is waiting for"
                );
            }
        }
    }

    /// Stop consuming, so that the channel goes back to the pool clean.
    async fn close(self) {
        if self.channel.status().connected() {
            if let Err(e) = self
                .channel
                .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
                .await
            {
                debug!(error = %e, "Failed to cancel the RPC reply consumer");
            }
        }
    }
}

async fn reply_loop(
    client: Client,
    mut subscription: ReplySubscription,
    pending: Arc<PendingCalls>,
    reply_queue: Arc<RwLock<String>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = subscription.route_replies(&pending) => {}
        }

        warn!(
            queue = %subscription.queue,
            "Lost the RPC reply queue, declaring a new one"
        );
        subscription.close().await;
        let reopened = retry_with_backoff(
            "rpc_reply_subscribe",
            &BackoffSettings::default(),
            &shutdown,
            || ReplySubscription::open(&client),
        )
        .await;
        subscription = match reopened {
            Ok(subscription) => subscription,
            Err(e) => {
                if !shutdown.is_cancelled() {
                    error!(error = ?e.last_error(), "Giving up on consuming RPC replies");
                }
                return;
            }
        };
        *reply_queue.write().unwrap_or_else(PoisonError::into_inner) = subscription.queue.clone();
    }
    subscription.close().await;
}
