//! What happens to a delivery once its handler returned.
use crate::consumers::ErrorType;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    /// Republishes allowed before a message is dead-lettered.
    pub max_retry: u32,
    /// Pause before each republish.
    pub retry_delay: Duration,
    /// Upper bound for a republish, broker confirmation included.
    pub publish_timeout: Duration,
}

/// How a delivery gets terminated with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    /// Processed: remove it from the queue.
    Ack,
    /// Republish a copy carrying `next_retry_count`, then ack the original.
    Retry { next_retry_count: u32 },
    /// Nack without requeueing: the broker dead-letters or discards it.
    DeadLetter,
}

/// `failure` is `None` when the handler succeeded.
pub(crate) fn settle(failure: Option<ErrorType>, retry_count: u32, max_retry: u32) -> Settlement {
    match failure {
        None => Settlement::Ack,
        Some(ErrorType::Fatal) => Settlement::DeadLetter,
        Some(ErrorType::Transient) if retry_count < max_retry => Settlement::Retry {
            next_retry_count: retry_count + 1,
        },
        Some(ErrorType::Transient) => Settlement::DeadLetter,
    }
}
