//! Cascading user deletion
//!
//! Runs every configured step, in order, with one impersonation token for
//! the user. The first failing step aborts the run; later steps are not
//! attempted. Every step is idempotent, so a redelivered command simply
//! starts again from the top.

use std::sync::Arc;

use tracing::{error, info, info_span, Instrument};

use um_identity::TokenMinter;

use crate::error::{CleanupError, Result};
use crate::steps::DeletionStep;

pub struct DeletionOrchestrator {
    minter: Arc<TokenMinter>,
    steps: Vec<DeletionStep>,
}

impl DeletionOrchestrator {
    pub fn new(minter: Arc<TokenMinter>, steps: Vec<DeletionStep>) -> Self {
        Self { minter, steps }
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(DeletionStep::name).collect()
    }

    pub async fn delete_user(&self, user_id: &str) -> Result<()> {
        let span = info_span!("delete_user", user_id);
        self.run_steps(user_id).instrument(span).await
    }

    async fn run_steps(&self, user_id: &str) -> Result<()> {
        let token = self.minter.mint(user_id)?;
        info!(steps = self.steps.len(), "Deleting user");

        for (index, step) in self.steps.iter().enumerate() {
            let position = index + 1;
            let span = info_span!("step", name = step.name(), position);

            if let Err(e) = step.run(&token).instrument(span).await {
                error!(step = step.name(), position, error = %e, "Deletion step failed");
                return Err(CleanupError::StepFailed {
                    step: step.name().to_string(),
                    position,
                    source: Box::new(e),
                });
            }
        }

        info!("User deleted");
        Ok(())
    }
}
