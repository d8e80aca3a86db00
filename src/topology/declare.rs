//! Declaration of exchanges, queues and bindings, shared by the direct and topic layouts.
use crate::topology::{dead_letter_exchange, dead_letter_queue, TopologyError};
use amq_protocol_types::{AMQPValue, FieldTable, LongString};
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::{Channel, ExchangeKind};

/// Everything needed to set up a queue fed by an exchange, with optional dead-lettering.
pub(crate) struct Layout<'a> {
    pub exchange: &'a str,
    pub kind: ExchangeKind,
    pub queue: &'a str,
    pub binding_keys: &'a [&'a str],
    /// Routing key given to dead-lettered messages. `None` keeps the original one.
    pub dead_letter_routing_key: Option<&'a str>,
    pub dead_letter: bool,
    pub max_priority: Option<u8>,
}

impl Layout<'_> {
    /// Declare the primary exchange, the dead-letter exchange and queue if enabled, then the
    /// primary queue and its bindings. Declaring the same layout twice is a no-op on the broker.
    #[tracing::instrument(
        name = "declare_topology",
        skip_all,
        fields(exchange = self.exchange, queue = self.queue)
    )]
    pub(crate) async fn declare(&self, channel: &Channel) -> Result<(), TopologyError> {
        declare_durable_exchange(channel, self.exchange, self.kind.clone()).await?;

        let mut queue_args = FieldTable::default();
        if self.dead_letter {
            let dlx = dead_letter_exchange(self.exchange);
            let dlq = dead_letter_queue(self.queue);
            declare_durable_exchange(channel, &dlx, self.kind.clone()).await?;
            declare_durable_queue(channel, &dlq, FieldTable::default()).await?;
            for key in self.binding_keys {
                bind(channel, &dlq, &dlx, key).await?;
            }

            queue_args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(LongString::from(dlx)),
            );
            if let Some(routing_key) = self.dead_letter_routing_key {
                queue_args.insert(
                    "x-dead-letter-routing-key".into(),
                    AMQPValue::LongString(LongString::from(routing_key)),
                );
            }
        }
        if let Some(priority) = self.max_priority {
            queue_args.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(priority));
        }

        declare_durable_queue(channel, self.queue, queue_args).await?;
        for key in self.binding_keys {
            bind(channel, self.queue, self.exchange, key).await?;
        }
        Ok(())
    }
}

async fn declare_durable_exchange(
    channel: &Channel,
    name: &str,
    kind: ExchangeKind,
) -> Result<(), TopologyError> {
    channel
        .exchange_declare(
            name,
            kind,
            ExchangeDeclareOptions {
                passive: false,
                durable: true,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|source| TopologyError::Declaration {
            entity: format!("exchange `{name}`"),
            source,
        })
}

pub(crate) async fn declare_durable_queue(
    channel: &Channel,
    name: &str,
    queue_args: FieldTable,
) -> Result<(), TopologyError> {
    channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                nowait: false,
            },
            queue_args,
        )
        .await
        .map_err(|source| TopologyError::Declaration {
            entity: format!("queue `{name}`"),
            source,
        })?;
    Ok(())
}

async fn bind(
    channel: &Channel,
    queue: &str,
    exchange: &str,
    routing_key: &str,
) -> Result<(), TopologyError> {
    channel
        .queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
        .map_err(|source| TopologyError::Declaration {
            entity: format!("binding `{exchange}` -> `{queue}` ({routing_key})"),
            source,
        })
}
