//! Facilities to publish messages to a RabbitMq exchange. Check out [`Publisher`] as a starting point.
mod message;
mod publisher;

pub use message::{Destination, Message};
pub(crate) use publisher::publish_on_channel;
pub(crate) use publisher::TRACER_NAME;
pub use publisher::{PublishError, Publisher, PublisherBuilder};
