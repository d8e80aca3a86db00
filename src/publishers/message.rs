use crate::amqp::convenience::set_header;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::BasicProperties;
use serde::Serialize;
use std::time::Duration;

/// An outbound message: a body plus its AMQP properties.
///
/// Built once, then only read by [`Publisher`](super::Publisher).
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Message {
    pub payload: Vec<u8>,
    pub properties: BasicProperties,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            properties: BasicProperties::default(),
        }
    }

    /// Serialize `body` to JSON and set the content type to `application/json`.
    pub fn json<T: Serialize + ?Sized>(body: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(body)?).with_content_type("application/json"))
    }

    fn props(mut self, f: impl FnOnce(BasicProperties) -> BasicProperties) -> Self {
        self.properties = f(self.properties);
        self
    }

    pub fn with_content_type(self, value: &str) -> Self {
        self.props(|p| p.with_content_type(value.into()))
    }

    /// Add a single header, keeping the ones already set.
    pub fn with_header(self, name: &str, value: impl Into<AMQPValue>) -> Self {
        let value = value.into();
        self.props(|p| set_header(p, name, value))
    }

    /// Replace all headers.
    pub fn with_headers(self, value: FieldTable) -> Self {
        self.props(|p| p.with_headers(value))
    }

    pub fn with_priority(self, value: u8) -> Self {
        self.props(|p| p.with_priority(value))
    }

    /// Per-message TTL. The broker expects it in milliseconds, as a string.
    pub fn with_expiration(self, value: Duration) -> Self {
        self.props(|p| p.with_expiration(value.as_millis().to_string().into()))
    }

    pub fn with_message_id(self, value: &str) -> Self {
        self.props(|p| p.with_message_id(value.into()))
    }

    /// Seconds since the Unix epoch.
    pub fn with_timestamp(self, value: u64) -> Self {
        self.props(|p| p.with_timestamp(value))
    }

    /// The AMQP `type` property.
    pub fn with_type(self, value: &str) -> Self {
        self.props(|p| p.with_type(value.into()))
    }

    pub fn with_reply_to(self, value: &str) -> Self {
        self.props(|p| p.with_reply_to(value.into()))
    }

    pub fn with_correlation_id(self, value: &str) -> Self {
        self.props(|p| p.with_correlation_id(value.into()))
    }
}

/// Where a message is published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    pub exchange: String,
    pub routing_key: String,
    /// Ask the broker to return the message if no queue is bound to receive it.
    ///
    /// With publisher confirms on, a returned message fails the publish with
    /// [`PublishError::UnroutableMessage`](super::PublishError::UnroutableMessage).
    pub mandatory: bool,
    /// Not supported by RabbitMq 3.0 and later, which closes the channel when it is set.
    pub immediate: bool,
}

impl Destination {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            mandatory: false,
            immediate: false,
        }
    }

    /// Straight to `queue`, through the default exchange.
    pub fn queue(queue: impl Into<String>) -> Self {
        Self::new("", queue)
    }

    #[must_use]
    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }
}

impl From<&ShortString> for Destination {
    fn from(queue: &ShortString) -> Self {
        Self::queue(queue.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{Destination, Message};
    use crate::amqp::convenience::BasicPropertiesExt;
    use lapin::types::AMQPValue;
    use std::time::Duration;

    #[test]
    fn json_messages_are_tagged_with_their_content_type() {
        let message = Message::json(&serde_json::json!({ "id": 7 })).unwrap();

        assert_eq!(br#"{"id":7}"#.to_vec(), message.payload);
        assert_eq!(
            Some("application/json"),
            message.properties.content_type().as_ref().map(|c| c.as_str())
        );
    }

    #[test]
    fn headers_accumulate() {
        let message = Message::new("hi")
            .with_header("tenant", AMQPValue::LongString("acme".into()))
            .with_header("x-retry-count", AMQPValue::LongInt(1));

        assert_eq!(
            Some("acme"),
            message.properties.get_header_str("tenant").as_deref()
        );
        assert_eq!(1, message.properties.retry_count());
    }

    #[test]
    fn expiration_is_in_milliseconds() {
        let message = Message::new("hi").with_expiration(Duration::from_secs(2));

        assert_eq!(
            Some("2000"),
            message.properties.expiration().as_ref().map(|e| e.as_str())
        );
    }

    #[test]
    fn the_message_type_is_set_on_the_properties() {
        let message = Message::new("hi").with_type("order.placed");

        assert_eq!(
            Some("order.placed"),
            message.properties.kind().as_ref().map(|t| t.as_str())
        );
    }

    #[test]
    fn queue_destinations_use_the_default_exchange() {
        let destination = Destination::queue("q1");

        assert_eq!("", destination.exchange);
        assert_eq!("q1", destination.routing_key);
        assert!(!destination.mandatory);
    }
}
