//! Keycloak admin API client
//!
//! Calls `{url}/auth/admin/realms/{realm}/users/{id}` with the service
//! account token from a [`CredentialCache`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use um_config::KeycloakConfig;

use crate::error::{IdentityError, Result};
use crate::token::CredentialCache;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeycloakUser {
    pub id: String,
    #[serde(rename = "username", default)]
    pub name: String,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The identity provider had no such user
    AlreadyAbsent,
}

/// User records in the identity provider.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<KeycloakUser>;

    /// Remove a user. A user that does not exist counts as removed.
    async fn delete_user(&self, user_id: &str) -> Result<DeleteOutcome>;
}

pub struct KeycloakAdminClient {
    base_url: String,
    realm: String,
    http: reqwest::Client,
    credentials: Arc<CredentialCache>,
}

impl KeycloakAdminClient {
    pub fn new(
        base_url: impl Into<String>,
        realm: impl Into<String>,
        http: reqwest::Client,
        credentials: Arc<CredentialCache>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            realm: realm.into(),
            http,
            credentials,
        }
    }

    pub fn from_config(
        config: &KeycloakConfig,
        http: reqwest::Client,
        credentials: Arc<CredentialCache>,
    ) -> Self {
        Self::new(&config.url, &config.realm, http, credentials)
    }

    fn user_url(&self, user_id: &str) -> String {
        format!(
            "{}/auth/admin/realms/{}/users/{}",
            self.base_url,
            self.realm,
            urlencoding::encode(user_id)
        )
    }

    async fn send(&self, method: reqwest::Method, user_id: &str) -> Result<reqwest::Response> {
        let token = self.credentials.ensure_access().await?;
        let response = self
            .http
            .request(method, self.user_url(user_id))
            .bearer_auth(&token.access_token)
            .send()
            .await?;

        // A rejected service token is dropped so the next call re-issues it
        if response.status() == StatusCode::UNAUTHORIZED {
            self.credentials.invalidate().await;
        }
        Ok(response)
    }

    async fn api_error(response: reqwest::Response) -> IdentityError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        IdentityError::Api { status, body }
    }
}

#[async_trait]
impl UserDirectory for KeycloakAdminClient {
    async fn get_user(&self, user_id: &str) -> Result<KeycloakUser> {
        let response = self.send(reqwest::Method::GET, user_id).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(IdentityError::UserNotFound(user_id.to_string())),
            status if status.is_success() => {
                let user: KeycloakUser = response.json().await?;
                debug!(user_id, "Fetched user from identity provider");
                Ok(user)
            }
            _ => Err(Self::api_error(response).await),
        }
    }

    async fn delete_user(&self, user_id: &str) -> Result<DeleteOutcome> {
        let response = self.send(reqwest::Method::DELETE, user_id).await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                warn!(user_id, "User does not exist in identity provider, nothing to delete");
                Ok(DeleteOutcome::AlreadyAbsent)
            }
            status if status.is_success() => {
                info!(user_id, "User deleted from identity provider");
                Ok(DeleteOutcome::Deleted)
            }
            _ => Err(Self::api_error(response).await),
        }
    }
}
