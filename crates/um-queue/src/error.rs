use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Broker connection failed: {0}")]
    Connection(String),

    #[error("Broker channel error: {0}")]
    Channel(String),

    #[error("Session closed by broker")]
    SessionClosed,

    #[error("Unknown delivery tag: {0}")]
    UnknownDelivery(u64),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("Publish to {topic} failed after {attempts} attempts: {last_error}")]
    PublishExhausted {
        topic: String,
        attempts: u32,
        last_error: String,
    },
}
