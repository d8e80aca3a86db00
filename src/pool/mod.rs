//! A fixed-size pool of [`lapin::Channel`]s sharing one [`lapin::Connection`].
//!
//! The pool provides two key guarantees:
//! - Broken channels are discarded and replaced in the background.
//! - A broken connection is re-established with exponential backoff and the pool rebuilt on it.
//!
//! ```rust,no_run
//! use burrow::amqp::ConnectionFactory;
//! use burrow::amqp::configuration::{ClientSettings, RabbitMqSettings};
//! use burrow::pool::{ChannelPool, PoolSettings};
//!
//! async fn example() -> anyhow::Result<()> {
//!     let settings = RabbitMqSettings::default();
//!     let factory = ConnectionFactory::new_from_config(&settings)?;
//!
//!     let pool = ChannelPool::connect(factory, PoolSettings::from(&ClientSettings::default())).await?;
//!
//!     // Goes back to the pool when dropped.
//!     let channel = pool.get_channel().await?;
//!     println!("leased channel {}", channel.id());
//!     Ok(())
//! }
//! ```

mod channel;
mod error;
mod manager;

pub use channel::PooledChannel;
pub use error::PoolError;
pub use manager::{ChannelPool, PoolSettings};
