//! # Message Queue
//!
//! Broker transport and the two broker-facing workers of a generation.
//!
//! - [`AmqpBroker`]: RabbitMQ transport used by the agent
//! - [`InMemoryBroker`]: in-process transport implementing the broker contract
//! - [`Subscriber`]: consumes the client queue bound to every subscription
//! - [`Keepalive`]: announces the client on the `keepalives` exchange

pub mod amqp;
pub mod keepalive;
pub mod memory;
pub mod subscriber;

pub use amqp::AmqpBroker;
pub use keepalive::{Keepalive, KeepalivePayload};
pub use memory::{BrokerCall, BrokerOp, InMemoryBroker, Publication, ANY_TARGET, JOURNAL_LIMIT};
pub use subscriber::Subscriber;
