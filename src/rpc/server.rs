use crate::consumers::{Handler, HandlerError, Incoming, Subscription};
use crate::publishers::{Destination, Message};
use crate::rpc::{RpcError, ERROR_FIELD};
use crate::topology::declare_durable_queue;
use crate::Client;
use lapin::types::FieldTable;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Serves requests sent by [`RpcClient`](super::RpcClient)s to a durable queue.
///
/// Every request is acked whatever the handler returns: failures travel back to the caller
/// in the reply, as `{"error": "<message>"}`, and are never retried.
pub struct RpcServer {
    client: Client,
    queue: String,
}

impl RpcServer {
    /// Declare `queue` on the broker.
    pub async fn new(client: Client, queue: impl Into<String>) -> Result<Self, RpcError> {
        let queue = queue.into();
        let channel = client.channel().await.map_err(|e| RpcError::Topology(e.into()))?;
        declare_durable_queue(&channel, &queue, FieldTable::default()).await?;
        Ok(Self { client, queue })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Consume the queue, replying to each request with what `handler` returns, serialized
    /// as JSON.
    ///
    /// `handler` receives the raw request body and its headers.
    pub async fn serve<F, Fut, R, E>(
        &self,
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<Subscription, RpcError>
    where
        F: Fn(Context, Vec<u8>, FieldTable) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        let responder = Responder {
            client: self.client.clone(),
            handler,
        };
        Ok(self.client.consume(&self.queue, responder, cancel).await?)
    }

    /// [`RpcServer::serve`], decoding each request as JSON first.
    ///
    /// A request that does not decode as `Req` gets an error reply.
    pub async fn serve_json<Req, F, Fut, R, E>(
        &self,
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<Subscription, RpcError>
    where
        Req: DeserializeOwned + Send + 'static,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        let handler = std::sync::Arc::new(handler);
        self.serve(
            move |cx: Context, body: Vec<u8>, _headers: FieldTable| {
                let handler = std::sync::Arc::clone(&handler);
                async move {
                    let request: Req = serde_json::from_slice(&body).map_err(|e| {
                        format!(
                            "Failed to deserialize the request as {}: {e}",
                            std::any::type_name::<Req>()
                        )
                    })?;
                    handler(cx, request).await.map_err(|e| e.to_string())
                }
            },
            cancel,
        )
        .await
    }
}

struct Responder<F> {
    client: Client,
    handler: F,
}

#[async_trait::async_trait]
impl<F, Fut, R, E> Handler for Responder<F>
where
    F: Fn(Context, Vec<u8>, FieldTable) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Serialize + Send + 'static,
    E: Display + Send + 'static,
{
    async fn handle(&self, cx: Context, incoming: Incoming) -> Result<(), HandlerError> {
        let Some(reply_to) = incoming.properties.reply_to().clone() else {
            warn!(
                queue = %incoming.queue,
                "Dropping an RPC request without a reply_to queue"
            );
            return Ok(());
        };
        let correlation_id = incoming.properties.correlation_id().clone();
        let headers = incoming.properties.headers().clone().unwrap_or_default();

        let outcome = (self.handler)(cx.clone(), incoming.payload, headers).await;
        let body = match outcome {
            Ok(response) => serde_json::to_vec(&response)
                .map_err(|e| format!("Failed to serialize the response: {e}")),
            Err(e) => Err(e.to_string()),
        };
        let body = body.unwrap_or_else(|message| {
            warn!(%message, "RPC handler failed, replying with an error");
            error_reply(&message)
        });

        let mut reply = Message::new(body).with_content_type("application/json");
        if let Some(correlation_id) = &correlation_id {
            reply = reply.with_correlation_id(correlation_id.as_str());
        }
        if let Err(e) = self
            .client
            .publish(&cx, &Destination::from(&reply_to), reply)
            .await
        {
            error!(error = ?e, reply_to = reply_to.as_str(), "Failed to publish an RPC reply");
        }
        Ok(())
    }
}

fn error_reply(message: &str) -> Vec<u8> {
    let mut reply = serde_json::Map::new();
    reply.insert(ERROR_FIELD.to_owned(), message.into());
    serde_json::Value::Object(reply).to_string().into_bytes()
}
