//! Broker abstraction for user lifecycle commands.
//!
//! A [`BrokerConnector`] opens [`ConsumerSession`]s that a
//! [`SupervisedConsumer`](consumer::SupervisedConsumer) drives: one delivery
//! at a time, acknowledged only after the [`MessageHandler`] succeeds.
//! [`CommandPublisher`] is the producing side.

use async_trait::async_trait;

pub mod consumer;
pub mod embedded;
pub mod error;
pub mod publisher;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use consumer::{ConsumerSettings, ConsumerState, ConsumerStats, SupervisedConsumer};
pub use embedded::EmbeddedBroker;
pub use error::QueueError;
pub use publisher::{RetryPolicy, RetryingPublisher};

pub type Result<T> = std::result::Result<T, QueueError>;

/// A message received from the broker and not yet settled.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned tag, unique within the session that received it
    pub tag: u64,
    /// Partition/routing key the message was published with
    pub key: String,
    pub payload: Vec<u8>,
    /// Set when the broker has handed this message out before
    pub redelivered: bool,
}

/// Opens consumer sessions against one topic for one consumer group.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Topic/group label used in logs
    fn identifier(&self) -> &str;

    /// Establish a session. Returns only once the broker has confirmed the
    /// subscription, so a returned session is ready to deliver.
    async fn connect(&self) -> Result<Box<dyn ConsumerSession>>;
}

/// A live subscription. Dropping it without settling a delivery hands that
/// delivery back to the broker for redelivery.
#[async_trait]
pub trait ConsumerSession: Send {
    /// Wait for the next delivery. `Ok(None)` means the broker ended the session.
    async fn next(&mut self) -> Result<Option<Delivery>>;

    async fn ack(&mut self, delivery: &Delivery) -> Result<()>;

    /// Return the delivery to the broker for redelivery.
    async fn nack(&mut self, delivery: &Delivery) -> Result<()>;

    async fn close(self: Box<Self>);
}

/// Processes one delivery. An error leaves the message unacknowledged.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()>;
}

/// Publishes keyed messages onto a topic.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()>;
}
