//! Request/reply over RabbitMq.
//!
//! An [`RpcClient`] publishes JSON requests to a server queue, tagging each with a fresh
//! correlation id and its own reply queue. An [`RpcServer`] consumes that queue and publishes
//! the handler's output back to the reply queue, under the same correlation id.
//!
//! ```rust,no_run
//! use burrow::amqp::configuration::RpcSettings;
//! use burrow::rpc::{RpcClient, RpcServer};
//! use burrow::Client;
//! use opentelemetry::Context;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Lookup {
//!     customer_id: String,
//! }
//!
//! async fn example(client: Client) -> anyhow::Result<()> {
//!     let server = RpcServer::new(client.clone(), "customer-lookup").await?;
//!     let shutdown = CancellationToken::new();
//!     let _subscription = server
//!         .serve_json(
//!             |_cx: Context, request: Lookup| async move {
//!                 Ok::<_, String>(serde_json::json!({ "name": request.customer_id }))
//!             },
//!             &shutdown,
//!         )
//!         .await?;
//!
//!     let rpc = RpcClient::new(client, &RpcSettings::default()).await?;
//!     let reply: serde_json::Value = rpc
//!         .call_json(
//!             &Context::current(),
//!             "customer-lookup",
//!             &Lookup { customer_id: "c1".into() },
//!         )
//!         .await?;
//!     println!("{reply}");
//!     Ok(())
//! }
//! ```
mod client;
mod pending;
mod server;

use crate::consumers::ConsumeError;
use crate::publishers::PublishError;
use crate::topology::TopologyError;
use std::time::Duration;

pub use client::{CallOptions, RpcClient};
pub use server::RpcServer;

/// Name of the only field of an error reply.
pub(crate) const ERROR_FIELD: &str = "error";

#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    #[error("Failed to serialize the request")]
    Serialization(#[source] serde_json::Error),
    #[error("Failed to deserialize the reply")]
    Deserialization(#[source] serde_json::Error),
    #[error("Failed to publish the request")]
    Publish(#[from] PublishError),
    #[error("No reply within {0:?}")]
    Timeout(Duration),
    #[error("The call was cancelled")]
    Cancelled,
    /// The server handler failed, the message is the one it replied with.
    #[error("The server replied with an error: {0}")]
    Application(String),
    /// The reply consumer stopped while the call was waiting.
    #[error("The reply consumer went away")]
    Disconnected,
    #[error("Failed to set up the reply queue")]
    ReplyQueue(#[source] anyhow::Error),
    #[error("Failed to declare the request queue")]
    Topology(#[from] TopologyError),
    #[error("Failed to consume the request queue")]
    Consume(#[from] ConsumeError),
}
