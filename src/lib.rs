//! `burrow` is a RabbitMq client built on top of [`lapin`]: a resilient channel pool, publishing
//! with confirmations and trace propagation, consumers with bounded retries and dead-lettering,
//! ready-made direct and topic topologies, and request/reply.
//!
//! [`Client`] is the best starting point to learn more about what `burrow` provides and how
//! to leverage it.
//!
//! ## Examples
//!
//! Check `demos/worker.rs` to see the library in action.

pub mod amqp;
pub mod consumers;
pub mod pool;
pub mod publishers;
pub mod rpc;
pub mod telemetry;
pub mod topology;

mod client;

pub use client::Client;
