//! Deletion steps
//!
//! A [`DeletionStep`] is a named action run with the impersonation token of
//! the user being deleted. Three kinds exist: draining a listable resource,
//! a single DELETE call, and removal of the identity record.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use um_identity::{DeleteOutcome, ImpersonationToken, UserDirectory};

use crate::batch::{BatchDrainer, BatchSource};
use crate::client::DownstreamClient;
use crate::error::Result;

#[async_trait]
pub trait StepAction: Send + Sync {
    async fn run(&self, step: &str, token: &ImpersonationToken) -> Result<()>;
}

#[derive(Clone)]
pub struct DeletionStep {
    name: String,
    action: Arc<dyn StepAction>,
}

impl DeletionStep {
    pub fn new(name: impl Into<String>, action: impl StepAction + 'static) -> Self {
        Self {
            name: name.into(),
            action: Arc::new(action),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(&self, token: &ImpersonationToken) -> Result<()> {
        self.action.run(&self.name, token).await
    }
}

impl fmt::Debug for DeletionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeletionStep")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Lists and deletes batches until the source is drained.
pub struct ResourceDrain<S> {
    source: S,
    drainer: BatchDrainer,
}

impl<S: BatchSource> ResourceDrain<S> {
    pub fn new(source: S, drainer: BatchDrainer) -> Self {
        Self { source, drainer }
    }
}

#[async_trait]
impl<S: BatchSource> StepAction for ResourceDrain<S> {
    async fn run(&self, step: &str, token: &ImpersonationToken) -> Result<()> {
        let report = self.drainer.drain(step, &self.source, token).await?;
        info!(
            step,
            deleted = report.deleted,
            iterations = report.iterations,
            "Resources removed"
        );
        Ok(())
    }
}

/// One DELETE call. Any non-2xx answer fails the step.
pub struct SingletonDelete {
    url: SingletonUrl,
    client: DownstreamClient,
}

enum SingletonUrl {
    Fixed(String),
    /// `{prefix}/{subject}`
    Subject(String),
}

impl SingletonDelete {
    pub fn fixed(url: impl Into<String>, client: DownstreamClient) -> Self {
        Self {
            url: SingletonUrl::Fixed(url.into()),
            client,
        }
    }

    /// DELETE `{prefix}/{user id}`, the id path-escaped.
    pub fn for_subject(prefix: impl Into<String>, client: DownstreamClient) -> Self {
        Self {
            url: SingletonUrl::Subject(prefix.into().trim_end_matches('/').to_string()),
            client,
        }
    }

    pub fn url_for(&self, subject: &str) -> String {
        match &self.url {
            SingletonUrl::Fixed(url) => url.clone(),
            SingletonUrl::Subject(prefix) => {
                format!("{}/{}", prefix, urlencoding::encode(subject))
            }
        }
    }
}

#[async_trait]
impl StepAction for SingletonDelete {
    async fn run(&self, step: &str, token: &ImpersonationToken) -> Result<()> {
        let url = self.url_for(token.subject_user_id());
        self.client.delete(token, &url).await?;
        debug!(step, url = %url, "Singleton removed");
        Ok(())
    }
}

/// Removes the user from the identity provider. Runs last.
pub struct IdentityStep {
    directory: Arc<dyn UserDirectory>,
}

impl IdentityStep {
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl StepAction for IdentityStep {
    async fn run(&self, step: &str, token: &ImpersonationToken) -> Result<()> {
        let user_id = token.subject_user_id();
        match self.directory.delete_user(user_id).await? {
            DeleteOutcome::Deleted => info!(step, user_id, "Identity record removed"),
            DeleteOutcome::AlreadyAbsent => {
                info!(step, user_id, "Identity record already absent")
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn client() -> DownstreamClient {
        DownstreamClient::with_client(reqwest::Client::new(), 1, Duration::ZERO)
    }

    #[test]
    fn test_singleton_urls() {
        let fixed = SingletonDelete::fixed("http://notifier/platform-broker", client());
        assert_eq!(fixed.url_for("u1"), "http://notifier/platform-broker");

        let per_user = SingletonDelete::for_subject("http://devices/users/", client());
        assert_eq!(per_user.url_for("a b/c"), "http://devices/users/a%20b%2Fc");
    }
}
