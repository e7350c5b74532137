use std::sync::Arc;

use tracing::info;

use um_common::UserCommand;
use um_identity::{IdentityError, UserDirectory};
use um_queue::CommandPublisher;

use crate::error::Result;

/// Publishes deletion commands for users that exist in the identity provider.
pub struct DeletionRequester {
    directory: Arc<dyn UserDirectory>,
    publisher: Arc<dyn CommandPublisher>,
    topic: String,
}

impl DeletionRequester {
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        publisher: Arc<dyn CommandPublisher>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            publisher,
            topic: topic.into(),
        }
    }

    pub async fn request_deletion(&self, user_id: &str) -> Result<()> {
        let user = self.directory.get_user(user_id).await?;
        if user.id != user_id {
            return Err(IdentityError::UserMismatch {
                requested: user_id.to_string(),
                returned: user.id,
            }
            .into());
        }

        let command = UserCommand::delete(user_id);
        let payload = command.encode()?;
        let key = command.partition_key();
        self.publisher.publish(&self.topic, &key, &payload).await?;

        info!(user_id, topic = %self.topic, key = %key, "Deletion requested");
        Ok(())
    }
}
