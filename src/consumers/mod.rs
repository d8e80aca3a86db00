//! Facilities to consume messages from a RabbitMq queue. Check out
//! [`Client::consume`](crate::Client::consume) as a starting point.
//!
//! Every delivery is settled exactly once, according to what the [`Handler`] returned:
//!
//! - success: ack;
//! - transient failure with `x-retry-count` below the client's `max_retry`: after a short
//!   pause the message is republished to the same exchange and routing key with the counter
//!   incremented, then the original is acked;
//! - anything else: nack without requeueing, so that the broker dead-letters (or drops) it.
pub use consumer::Subscription;
pub use error::{ConsumeError, ErrorType, HandlerError};
pub use handler::{ClosureHandler, Handler};
pub use incoming_message::Incoming;
pub use json::JsonHandler;

pub(crate) use consumer::start;
pub(crate) use retry::RetryPolicy;

mod consumer;
mod error;
mod handler;
mod incoming_message;
mod json;
mod retry;
