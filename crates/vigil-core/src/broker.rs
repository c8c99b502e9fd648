//! Broker transport contract
//!
//! The agent only needs a small slice of a topic pub/sub broker: declaring
//! exchanges and queues, binding them, consuming a queue as a stream of
//! deliveries, publishing, and acknowledging. Every declaration must be
//! idempotent so a new generation can re-declare what the previous one left.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Broadcast to every bound queue, routing key ignored.
    Fanout,
    /// Deliver to queues bound with exactly the routing key.
    Direct,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Fanout => f.write_str("fanout"),
            ExchangeKind::Direct => f.write_str("direct"),
        }
    }
}

/// Handle returned by a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueId(String);

impl QueueId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque acknowledgement handle for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One message received from a consumed queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub delivery_tag: DeliveryTag,
    pub exchange: String,
    pub redelivered: bool,
}

/// Sequential stream of deliveries for a single consumer.
///
/// Dropping the stream cancels the consumer; anything not yet acked goes
/// back to the queue.
#[derive(Debug)]
pub struct DeliveryStream {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl DeliveryStream {
    pub fn new(rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { rx }
    }

    /// Next delivery, or `None` once the broker closed the consumer.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Stop accepting deliveries. Already buffered ones stay unacked.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker connection failed: {reason}")]
    Connection { reason: String },

    #[error("declare exchange {exchange:?} failed: {reason}")]
    Declare { exchange: String, reason: String },

    #[error("declare queue {queue:?} failed: {reason}")]
    DeclareQueue { queue: String, reason: String },

    #[error("bind {queue:?} to exchange {exchange:?} failed: {reason}")]
    Bind {
        queue: String,
        exchange: String,
        reason: String,
    },

    #[error("consume {queue:?} failed: {reason}")]
    Consume { queue: String, reason: String },

    #[error("publish to exchange {exchange:?} failed: {reason}")]
    Publish { exchange: String, reason: String },

    #[error("ack of delivery {tag} failed: {reason}")]
    Ack { tag: DeliveryTag, reason: String },

    #[error("exchange {exchange:?} already declared as {existing}, requested {requested}")]
    PreconditionFailed {
        exchange: String,
        existing: ExchangeKind,
        requested: ExchangeKind,
    },

    #[error("queue {queue:?} does not exist")]
    UnknownQueue { queue: String },

    #[error("exchange {exchange:?} does not exist")]
    UnknownExchange { exchange: String },

    #[error("queue {queue:?} already has an active consumer")]
    ConsumerBusy { queue: String },

    #[error("delivery stream for {queue:?} closed by the broker")]
    StreamClosed { queue: String },
}

/// The transport primitives the agent depends on.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    async fn declare_queue(&self, name: &str) -> Result<QueueId, BrokerError>;

    async fn bind(
        &self,
        queue: &QueueId,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn consume(
        &self,
        queue: &QueueId,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> Result<(), BrokerError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;
}

/// Consumer of deliveries taken off a subscription queue.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Handle one delivery to completion. Errors are dispatch failures: the
    /// caller logs them and drops the delivery.
    async fn handle(&self, delivery: &Delivery) -> crate::Result<()>;
}
