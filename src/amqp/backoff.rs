//! Exponential backoff for operations that are worth retrying, e.g. dialing the broker.
use crate::amqp::configuration::BackoffSettings;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Error returned by [`retry_with_backoff`].
#[derive(thiserror::Error, Debug)]
pub enum RetryError<E> {
    #[error("`{operation}` failed after {attempts} attempts")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: E,
    },
    #[error("`{operation}` was cancelled while waiting to retry")]
    Cancelled { operation: String },
}

impl<E> RetryError<E> {
    /// The error returned by the last attempt, if any attempt ran to completion.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Exhausted { source, .. } => Some(source),
            Self::Cancelled { .. } => None,
        }
    }
}

/// Wait before retry number `retry` (1-based): `initial * 2^(retry - 1)`, capped at `max`.
pub fn backoff_delay(settings: &BackoffSettings, retry: u32) -> Duration {
    let factor = 2u32.saturating_pow(retry.saturating_sub(1));
    settings
        .initial_backoff()
        .saturating_mul(factor)
        .min(settings.max_backoff())
}

/// Run `operation` until it succeeds, at most `settings.max_retries + 1` times.
///
/// No wait happens before the first attempt. Waits between attempts race `cancel`: if it fires
/// the function returns [`RetryError::Cancelled`] straight away.
pub async fn retry_with_backoff<T, E, F, Fut>(
    operation_name: &str,
    settings: &BackoffSettings,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        if attempt > 0 {
            let delay = backoff_delay(settings, attempt);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled {
                        operation: operation_name.to_owned(),
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt > settings.max_retries {
                    return Err(RetryError::Exhausted {
                        operation: operation_name.to_owned(),
                        attempts: attempt,
                        source: e,
                    });
                }
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = settings.max_retries + 1,
                    "{e}"
                );
            }
        }
    }
}
