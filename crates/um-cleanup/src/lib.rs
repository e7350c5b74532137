//! Cascading deletion of a user across downstream services.
//!
//! [`DeletionOrchestrator`] runs an ordered list of [`DeletionStep`]s built
//! by [`standard_pipeline`]. [`UserCommandHandler`] feeds it from the user
//! topic, and [`DeletionRequester`] produces the commands.

pub mod batch;
pub mod catalogue;
pub mod client;
pub mod error;
pub mod handler;
pub mod orchestrator;
pub mod requester;
pub mod resource;
pub mod steps;

pub use batch::{Batch, BatchCursor, BatchDrainer, BatchSource, DrainReport, DrainState};
pub use catalogue::{standard_pipeline, PipelineBuilder};
pub use client::{DownstreamClient, USER_ID_HEADER};
pub use error::{CleanupError, Result};
pub use handler::UserCommandHandler;
pub use orchestrator::DeletionOrchestrator;
pub use requester::DeletionRequester;
pub use resource::{DeleteMode, ListShape, Ownership, Pagination, ResourceSource, ResourceSpec};
pub use steps::{DeletionStep, IdentityStep, ResourceDrain, SingletonDelete, StepAction};
