//! The `Handler` trait is heavily inspired by `tide`'s approach to endpoint handlers.
use crate::consumers::{HandlerError, Incoming};
use opentelemetry::Context;
use std::future::Future;

/// Implementers of the `Handler` trait process the messages consumed from a queue.
///
/// # Scope
///
/// `handle` does not get access to the underlying RabbitMq channel.
/// The consumer takes care of acking/nacking the message with the broker according to the outcome
/// of processing (check out [`HandlerError`] for more details).
/// This decouples the low-level interactions with the message broker and the retry logic from
/// the actual business logic associated with the processing of a message.
///
/// `cx` carries the consumer span of the message, itself a child of the trace context found in
/// the message headers.
///
/// # Implementers
///
/// Most of the time you will wrap an async closure in [`ClosureHandler`] rather than
/// implementing the trait by hand.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, cx: Context, incoming: Incoming) -> Result<(), HandlerError>;
}

/// E.g. `Box<dyn Handler>`.
#[async_trait::async_trait]
impl<H> Handler for Box<H>
where
    H: Handler + ?Sized,
{
    async fn handle(&self, cx: Context, incoming: Incoming) -> Result<(), HandlerError> {
        H::handle(self, cx, incoming).await
    }
}

/// Turns an async closure into a [`Handler`].
///
/// The closure can fail with any error convertible into [`HandlerError`], e.g. `anyhow::Error`.
///
/// ```rust
/// use burrow::consumers::{ClosureHandler, HandlerError, Incoming};
/// use opentelemetry::Context;
///
/// let handler = ClosureHandler(|_cx: Context, incoming: Incoming| async move {
///     println!("{} bytes", incoming.payload.len());
///     Ok::<_, HandlerError>(())
/// });
/// ```
pub struct ClosureHandler<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut, E> Handler for ClosureHandler<F>
where
    F: Fn(Context, Incoming) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<HandlerError> + 'static,
{
    async fn handle(&self, cx: Context, incoming: Incoming) -> Result<(), HandlerError> {
        (self.0)(cx, incoming).await.map_err(Into::into)
    }
}
