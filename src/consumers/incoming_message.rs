use crate::amqp::convenience::BasicPropertiesExt;
use amq_protocol_types::{DeliveryTag, ShortString};
use lapin::acker::Acker;
use lapin::BasicProperties;
use serde::de::DeserializeOwned;

/// A dequeued message, ready for processing.
///
/// `Incoming` is the input type of message handlers (check out
/// [`Handler`](crate::consumers::Handler)'s docs for more details).
/// It does not carry the means to ack or nack the message: the consumer settles every
/// delivery exactly once, based on what the handler returned.
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    /// The name of the queue the message was consumed from.
    pub queue: String,
    pub delivery_tag: DeliveryTag,
    /// May be an empty string if the default exchange was used.
    pub exchange: ShortString,
    pub routing_key: ShortString,
    pub redelivered: bool,
    /// Contains the properties and the headers of the message.
    pub properties: BasicProperties,
    pub payload: Vec<u8>,
    /// How many times this message was already retried, read from `x-retry-count`.
    pub retry_count: u32,
}

impl Incoming {
    /// Separate a delivery from its acker.
    pub(crate) fn split(delivery: lapin::message::Delivery, queue: &str) -> (Self, Acker) {
        let incoming = Self {
            queue: queue.to_owned(),
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            redelivered: delivery.redelivered,
            retry_count: delivery.properties.retry_count(),
            properties: delivery.properties,
            payload: delivery.data,
        };
        (incoming, delivery.acker)
    }

    /// Deserialize the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}
