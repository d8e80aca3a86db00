use crate::consumers::{Handler, HandlerError, Incoming};
use anyhow::Context as _;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;

/// A [`Handler`] receiving the JSON-decoded body of each message.
///
/// A body that cannot be decoded as `T` is a fatal error: the message is dead-lettered
/// without retries.
pub struct JsonHandler<T, F> {
    f: F,
    _body: PhantomData<fn() -> T>,
}

impl<T, F> JsonHandler<T, F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _body: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<T, F, Fut, E> Handler for JsonHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(Context, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<HandlerError> + 'static,
{
    async fn handle(&self, cx: Context, incoming: Incoming) -> Result<(), HandlerError> {
        let body: T = incoming
            .json()
            .with_context(|| {
                format!(
                    "Failed to deserialize the body of a message from `{}` as {}",
                    incoming.queue,
                    std::any::type_name::<T>()
                )
            })
            .map_err(HandlerError::fatal)?;
        (self.f)(cx, body).await.map_err(Into::into)
    }
}
