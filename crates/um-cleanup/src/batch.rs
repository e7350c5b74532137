//! Batch draining
//!
//! A step that owns listable resources fetches a bounded page, deletes
//! what it may, and asks again until nothing deletable is left. Resources
//! that must survive (owned by someone else) stay in the listing, so the
//! offset advances past them. An iteration ceiling turns a downstream that
//! never shrinks its listing into an error instead of an endless loop.

use async_trait::async_trait;
use tracing::debug;

use um_identity::ImpersonationToken;

use crate::error::{CleanupError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchCursor {
    pub limit: usize,
    pub offset: usize,
}

/// One listing, split into ids to delete and the number of entries kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub removable: Vec<String>,
    pub retained: usize,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.removable.is_empty() && self.retained == 0
    }
}

/// A downstream collection that can be listed and deleted from.
#[async_trait]
pub trait BatchSource: Send + Sync {
    /// Listings honour the cursor. Unpaged sources return the whole set.
    fn paged(&self) -> bool;

    async fn list(&self, token: &ImpersonationToken, cursor: BatchCursor) -> Result<Batch>;

    async fn delete(&self, token: &ImpersonationToken, ids: &[String]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Draining,
    Empty,
    LoopLimitExceeded,
}

impl DrainState {
    /// State after a listing. Paged sources are done once a page comes back
    /// empty; unpaged ones as soon as nothing in the listing is deletable.
    pub fn after(paged: bool, batch: &Batch) -> Self {
        let done = if paged {
            batch.is_empty()
        } else {
            batch.removable.is_empty()
        };
        if done {
            DrainState::Empty
        } else {
            DrainState::Draining
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub iterations: u32,
    pub deleted: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchDrainer {
    batch_size: usize,
    loop_limit: u32,
}

impl BatchDrainer {
    pub fn new(batch_size: usize, loop_limit: u32) -> Self {
        Self {
            batch_size: batch_size.max(1),
            loop_limit,
        }
    }

    pub async fn drain(
        &self,
        step: &str,
        source: &dyn BatchSource,
        token: &ImpersonationToken,
    ) -> Result<DrainReport> {
        let mut cursor = BatchCursor {
            limit: self.batch_size,
            offset: 0,
        };
        let mut report = DrainReport::default();
        let mut state = DrainState::Draining;

        loop {
            match state {
                DrainState::Empty => return Ok(report),
                DrainState::LoopLimitExceeded => {
                    return Err(CleanupError::LoopLimitExceeded {
                        step: step.to_string(),
                        limit: self.loop_limit,
                    })
                }
                DrainState::Draining if report.iterations >= self.loop_limit => {
                    state = DrainState::LoopLimitExceeded;
                }
                DrainState::Draining => {
                    report.iterations += 1;
                    let batch = source.list(token, cursor).await?;
                    state = DrainState::after(source.paged(), &batch);

                    debug!(
                        step,
                        iteration = report.iterations,
                        offset = cursor.offset,
                        removable = batch.removable.len(),
                        retained = batch.retained,
                        "Listed batch"
                    );

                    if !batch.removable.is_empty() {
                        source.delete(token, &batch.removable).await?;
                        report.deleted += batch.removable.len();
                    }
                    cursor.offset += batch.retained;
                }
            }
        }
    }
}
