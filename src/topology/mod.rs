//! Ready-made exchange/queue layouts: [`DirectTopology`] and [`TopicTopology`], with the
//! publishers and consumers working on them.
//!
//! Both layouts declare a durable exchange and a durable queue bound to it. With dead-lettering
//! enabled they also declare `<exchange>.dlx`, an exchange of the same kind, and `<queue>.dlq`,
//! bound to it with the same keys: messages a consumer gives up on end up there.
//!
//! ```rust,no_run
//! use burrow::topology::{TopicConsumer, TopicPublisher, TopicTopology};
//! use burrow::Client;
//!
//! async fn example(client: Client) -> anyhow::Result<()> {
//!     let topology = TopicTopology::new("customers", "customer-emails", ["customer.*"])?
//!         .with_dead_letter(true);
//!     let publisher = TopicPublisher::new(client.clone(), &topology).await?;
//!     let consumer = TopicConsumer::new(client, topology).await?;
//!     # drop((publisher, consumer));
//!     Ok(())
//! }
//! ```
mod declare;
mod direct;
mod topic;

use crate::pool::PoolError;

pub(crate) use declare::declare_durable_queue;

pub use direct::{DirectConsumer, DirectPublisher, DirectTopology};
pub use topic::{TopicConsumer, TopicPattern, TopicPublisher, TopicTopology};

/// Name of the dead-letter exchange paired with `exchange`.
pub fn dead_letter_exchange(exchange: &str) -> String {
    format!("{exchange}.dlx")
}

/// Name of the dead-letter queue paired with `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}.dlq")
}

/// Error returned when setting up a topology.
#[derive(thiserror::Error, Debug)]
pub enum TopologyError {
    /// The layout is invalid: nothing was declared on the broker.
    #[error("Invalid topology configuration: {0}")]
    Configuration(String),
    #[error("Failed to lease a channel to declare the topology")]
    Pool(#[from] PoolError),
    #[error("Failed to declare {entity}")]
    Declaration {
        entity: String,
        #[source]
        source: lapin::Error,
    },
}

fn validate_name(what: &str, name: &str) -> Result<(), TopologyError> {
    if name.trim().is_empty() {
        return Err(TopologyError::Configuration(format!(
            "the {what} name cannot be empty"
        )));
    }
    Ok(())
}

fn validate_priority(max_priority: Option<u8>) -> Result<(), TopologyError> {
    if max_priority == Some(0) {
        return Err(TopologyError::Configuration(
            "the maximum priority of a queue must be between 1 and 255".to_owned(),
        ));
    }
    Ok(())
}
