use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod logging;

// ============================================================================
// User Command Wire Types
// ============================================================================

/// Prefix of the partition key used for deletion commands.
pub const DELETE_KEY_PREFIX: &str = "DELETE_";

/// Lifecycle command verb carried on the user topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    #[serde(rename = "DELETE")]
    Delete,
    /// Any verb this worker does not understand. Never produced.
    #[serde(other, skip_serializing)]
    Unknown,
}

/// The unit of work on the user topic.
///
/// Wire format: `{"command":"DELETE","id":"<userId>"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCommand {
    pub command: CommandKind,
    pub id: String,
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Malformed user command: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("User command is missing the user id")]
    MissingId,
}

impl UserCommand {
    pub fn delete(user_id: impl Into<String>) -> Self {
        Self {
            command: CommandKind::Delete,
            id: user_id.into(),
        }
    }

    /// Decode a raw message body.
    ///
    /// Unknown verbs decode successfully as [`CommandKind::Unknown`] so the
    /// caller can report them with the original payload.
    pub fn decode(payload: &[u8]) -> Result<Self, CommandError> {
        let command: UserCommand = serde_json::from_slice(payload)?;
        if command.id.trim().is_empty() {
            return Err(CommandError::MissingId);
        }
        Ok(command)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CommandError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Stable per-user key so every command for one user lands on the same
    /// partition/routing key.
    pub fn partition_key(&self) -> String {
        match self.command {
            CommandKind::Delete => format!("{}{}", DELETE_KEY_PREFIX, self.id),
            CommandKind::Unknown => self.id.clone(),
        }
    }
}
