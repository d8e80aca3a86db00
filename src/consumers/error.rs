use crate::pool::PoolError;
use std::fmt;

/// The error type returned by message handlers.
///
/// The [`ErrorType`] decides what happens to the message: transient failures are retried
/// (republished with an incremented `x-retry-count`) until the retry budget runs out, fatal
/// ones are dead-lettered straight away.
#[derive(Debug)]
pub struct HandlerError {
    /// The underlying error returned by the message handler.
    pub inner_error: anyhow::Error,
    pub error_type: ErrorType,
}

impl HandlerError {
    /// Processing might succeed if retried later.
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        Self {
            inner_error: error.into(),
            error_type: ErrorType::Transient,
        }
    }

    /// Processing will never succeed for this message.
    pub fn fatal(error: impl Into<anyhow::Error>) -> Self {
        Self {
            inner_error: error.into(),
            error_type: ErrorType::Fatal,
        }
    }
}

/// Errors are assumed to be transient unless stated otherwise.
impl From<anyhow::Error> for HandlerError {
    fn from(inner_error: anyhow::Error) -> Self {
        Self::transient(inner_error)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let source: &(dyn std::error::Error + 'static) = &*self.inner_error;
        Some(source)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handling of a message failed due to a {} issue: {}",
            self.error_type, self.inner_error
        )
    }
}

/// Types of failure when handling a message.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorType {
    /// Message processing might succeed if retried after a short delay.
    ///
    /// E.g. the message handler timed out calling an API it depends on.
    Transient,
    /// Message processing will never succeed, no matter how many times you retry or how long
    /// you wait.
    ///
    /// E.g. the message payload is malformed and cannot be deserialized.
    Fatal,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Error returned when starting or running a consumer.
#[derive(thiserror::Error, Debug)]
pub enum ConsumeError {
    #[error("Failed to lease a channel to consume from `{queue}`")]
    Pool {
        queue: String,
        #[source]
        source: PoolError,
    },
    #[error("Failed to register a consumer on `{queue}`")]
    Registration {
        queue: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("The delivery stream of the consumer failed")]
    Stream(#[source] lapin::Error),
    #[error("The consumer task panicked or was aborted")]
    Aborted(#[source] tokio::task::JoinError),
}
