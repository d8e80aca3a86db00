use crate::consumers::{ConsumeError, Handler, HandlerError, Subscription};
use crate::publishers::{Destination, Message, PublishError};
use crate::topology::declare::Layout;
use crate::topology::{validate_name, validate_priority, TopologyError};
use crate::Client;
use lapin::ExchangeKind;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

/// A validated topic binding pattern, e.g. `customer.*` or `audit.#`.
///
/// Words are separated by dots. `*` stands for exactly one word, `#` for zero or more words.
/// A wildcard must be a word on its own: `customer.cre*` is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    words: Vec<Word>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Word {
    Literal(String),
    /// `*`
    One,
    /// `#`
    Any,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, TopologyError> {
        if pattern.is_empty() {
            return Err(TopologyError::Configuration(
                "a topic pattern cannot be empty".to_owned(),
            ));
        }
        let words = pattern
            .split('.')
            .map(|word| match word {
                "*" => Ok(Word::One),
                "#" => Ok(Word::Any),
                "" => Err(TopologyError::Configuration(format!(
                    "`{pattern}` contains an empty word"
                ))),
                w if w.contains(['*', '#']) => Err(TopologyError::Configuration(format!(
                    "`{pattern}` mixes a wildcard with other characters in `{w}`"
                ))),
                w => Ok(Word::Literal(w.to_owned())),
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            raw: pattern.to_owned(),
            words,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the broker would route a message published with `routing_key` to a queue
    /// bound with this pattern.
    pub fn matches(&self, routing_key: &str) -> bool {
        let key: Vec<&str> = if routing_key.is_empty() {
            vec![]
        } else {
            routing_key.split('.').collect()
        };
        matches_words(&self.words, &key)
    }
}

fn matches_words(pattern: &[Word], key: &[&str]) -> bool {
    // matched[j]: the pattern words walked so far match the first j words of the key.
    let mut matched = vec![false; key.len() + 1];
    matched[0] = true;
    for word in pattern {
        let mut next = vec![false; key.len() + 1];
        for j in 0..=key.len() {
            next[j] = match word {
                Word::Any => matched[j] || (j > 0 && next[j - 1]),
                Word::One => j > 0 && matched[j - 1],
                Word::Literal(literal) => j > 0 && matched[j - 1] && key[j - 1] == literal.as_str(),
            };
        }
        matched = next;
    }
    matched[key.len()]
}

impl FromStr for TopicPattern {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A queue bound to a topic exchange with one or more wildcard patterns.
///
/// Dead-lettered messages keep their original routing key and reach `<queue>.dlq`, bound to
/// `<exchange>.dlx` with the same patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTopology {
    exchange: String,
    queue: String,
    patterns: Vec<TopicPattern>,
    dead_letter: bool,
    max_priority: Option<u8>,
}

impl TopicTopology {
    /// Fails with [`TopologyError::Configuration`] if any pattern is invalid or none is given.
    pub fn new<I, P>(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        patterns: I,
    ) -> Result<Self, TopologyError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| TopicPattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        if patterns.is_empty() {
            return Err(TopologyError::Configuration(
                "a topic topology needs at least one binding pattern".to_owned(),
            ));
        }
        Ok(Self {
            exchange: exchange.into(),
            queue: queue.into(),
            patterns,
            dead_letter: false,
            max_priority: None,
        })
    }

    #[must_use]
    pub fn with_dead_letter(mut self, dead_letter: bool) -> Self {
        self.dead_letter = dead_letter;
        self
    }

    /// Make the queue a [priority queue](https://www.rabbitmq.com/priority.html).
    #[must_use]
    pub fn with_max_priority(mut self, max_priority: u8) -> Self {
        self.max_priority = Some(max_priority);
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn patterns(&self) -> &[TopicPattern] {
        &self.patterns
    }

    /// Whether a message published with `routing_key` reaches the queue.
    pub fn routes(&self, routing_key: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(routing_key))
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        validate_name("exchange", &self.exchange)?;
        validate_name("queue", &self.queue)?;
        validate_priority(self.max_priority)
    }

    /// Declare exchanges, queues and bindings on the broker.
    pub async fn declare(&self, client: &Client) -> Result<(), TopologyError> {
        self.validate()?;
        let channel = client.channel().await?;
        let binding_keys: Vec<&str> = self.patterns.iter().map(TopicPattern::as_str).collect();
        Layout {
            exchange: &self.exchange,
            kind: ExchangeKind::Topic,
            queue: &self.queue,
            binding_keys: &binding_keys,
            dead_letter_routing_key: None,
            dead_letter: self.dead_letter,
            max_priority: self.max_priority,
        }
        .declare(&channel)
        .await
    }
}

/// Publishes to the exchange of a [`TopicTopology`], with a routing key per message.
#[derive(Clone)]
pub struct TopicPublisher {
    client: Client,
    exchange: String,
}

impl TopicPublisher {
    /// Declare `topology` and get ready to publish on its exchange.
    pub async fn new(client: Client, topology: &TopicTopology) -> Result<Self, TopologyError> {
        topology.declare(&client).await?;
        Ok(Self {
            client,
            exchange: topology.exchange().to_owned(),
        })
    }

    /// Messages matching no binding are dropped by the broker.
    pub async fn publish(
        &self,
        cx: &Context,
        routing_key: &str,
        message: Message,
    ) -> Result<(), PublishError> {
        let destination = Destination::new(self.exchange.as_str(), routing_key);
        self.client.publish(cx, &destination, message).await
    }

    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        cx: &Context,
        routing_key: &str,
        body: &T,
    ) -> Result<(), PublishError> {
        let message = Message::json(body).map_err(|e| PublishError::GenericError(e.into()))?;
        self.publish(cx, routing_key, message).await
    }
}

/// Consumes the queue of a [`TopicTopology`].
#[derive(Clone)]
pub struct TopicConsumer {
    client: Client,
    topology: TopicTopology,
}

impl TopicConsumer {
    /// Declare `topology` and get ready to consume from it.
    pub async fn new(client: Client, topology: TopicTopology) -> Result<Self, TopologyError> {
        topology.declare(&client).await?;
        Ok(Self { client, topology })
    }

    pub fn topology(&self) -> &TopicTopology {
        &self.topology
    }

    pub async fn consume<H: Handler>(
        &self,
        handler: H,
        cancel: &CancellationToken,
    ) -> Result<Subscription, ConsumeError> {
        self.client
            .consume(self.topology.queue(), handler, cancel)
            .await
    }

    pub async fn consume_json<T, F, Fut, E>(
        &self,
        f: F,
        cancel: &CancellationToken,
    ) -> Result<Subscription, ConsumeError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Context, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<HandlerError> + 'static,
    {
        self.client
            .consume_json(self.topology.queue(), f, cancel)
            .await
    }
}
