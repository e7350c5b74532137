use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use um_common::{CommandKind, UserCommand};
use um_queue::{Delivery, MessageHandler};

use crate::orchestrator::DeletionOrchestrator;

/// Routes user-topic commands to the orchestrator.
///
/// Malformed and unknown commands are errors, so the consumer leaves them
/// unacknowledged like any other failure.
pub struct UserCommandHandler {
    orchestrator: Arc<DeletionOrchestrator>,
    debug_payloads: bool,
}

impl UserCommandHandler {
    pub fn new(orchestrator: Arc<DeletionOrchestrator>) -> Self {
        Self {
            orchestrator,
            debug_payloads: false,
        }
    }

    /// Log every raw payload at debug level.
    pub fn with_debug_payloads(mut self, enabled: bool) -> Self {
        self.debug_payloads = enabled;
        self
    }
}

#[async_trait]
impl MessageHandler for UserCommandHandler {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        if self.debug_payloads {
            debug!(
                key = %delivery.key,
                payload = %String::from_utf8_lossy(&delivery.payload),
                "Received user command"
            );
        }

        let command = UserCommand::decode(&delivery.payload)
            .with_context(|| format!("Cannot decode message with key '{}'", delivery.key))?;

        match command.command {
            CommandKind::Delete => {
                if delivery.redelivered {
                    info!(user_id = %command.id, "Retrying redelivered deletion");
                }
                self.orchestrator.delete_user(&command.id).await?;
                Ok(())
            }
            CommandKind::Unknown => {
                warn!(
                    key = %delivery.key,
                    payload = %String::from_utf8_lossy(&delivery.payload),
                    "Unknown user command"
                );
                Err(anyhow!("Unknown command for user '{}'", command.id))
            }
        }
    }
}
