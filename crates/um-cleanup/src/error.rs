use thiserror::Error;

use um_common::CommandError;
use um_identity::IdentityError;
use um_queue::QueueError;

#[derive(Error, Debug)]
pub enum CleanupError {
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("{method} {url} failed: {source}")]
    Transport {
        method: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} {url} returned {status}: {body}")]
    Downstream {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("Unexpected response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Step '{step}' reached the loop limit of {limit} iterations")]
    LoopLimitExceeded { step: String, limit: u32 },

    #[error("Step {position} '{step}' failed: {source}")]
    StepFailed {
        step: String,
        position: usize,
        #[source]
        source: Box<CleanupError>,
    },

    #[error("Failed to publish deletion request: {0}")]
    Publish(#[from] QueueError),

    #[error("Failed to encode command: {0}")]
    Command(#[from] CommandError),
}

impl CleanupError {
    /// Name of the failed step, when the error came out of the pipeline.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            CleanupError::StepFailed { step, .. } => Some(step),
            _ => None,
        }
    }

    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            CleanupError::Transport { .. } => true,
            CleanupError::Downstream { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CleanupError>;
