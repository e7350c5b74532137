//! Service account credential cache
//!
//! Holds one access/refresh token pair for the whole process. Every read
//! re-checks expiry against the configured buffer, so callers never see an
//! expired access token. Access is serialized through a mutex, so at most
//! one grant is in flight.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use um_config::KeycloakConfig;

use crate::error::{IdentityError, Result};

/// An access token plus the refresh token issued with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccessToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_token: Option<String>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
}

impl ServiceAccessToken {
    /// Access token usable at `now` with `buffer` to spare.
    pub fn is_valid_at(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        !self.access_token.is_empty() && now < self.expires_at - buffer
    }

    /// Refresh token, if one exists and is usable at `now` with `buffer` to spare.
    pub fn usable_refresh_token(&self, now: DateTime<Utc>, buffer: Duration) -> Option<&str> {
        match (&self.refresh_token, self.refresh_expires_at) {
            (Some(token), Some(expires_at)) if !token.is_empty() && now < expires_at - buffer => {
                Some(token.as_str())
            }
            _ => None,
        }
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: f64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    refresh_expires_in: f64,
}

impl TokenResponse {
    /// Expiries count from the moment the request was sent.
    fn into_token(self, requested_at: DateTime<Utc>) -> Result<ServiceAccessToken> {
        let refresh_token = self.refresh_token.filter(|t| !t.is_empty());
        let refresh_expires_at = match refresh_token {
            Some(_) if self.refresh_expires_in > 0.0 => Some(expiry(
                requested_at,
                self.refresh_expires_in,
                "refresh_expires_in",
            )?),
            _ => None,
        };
        Ok(ServiceAccessToken {
            access_token: self.access_token,
            expires_at: expiry(requested_at, self.expires_in, "expires_in")?,
            refresh_token,
            refresh_expires_at,
        })
    }
}

/// `start + secs`, rejecting lifetimes that are not a positive, representable span.
fn expiry(start: DateTime<Utc>, secs: f64, field: &str) -> Result<DateTime<Utc>> {
    let invalid = || IdentityError::MalformedResponse(format!("invalid {}: {}", field, secs));
    if !secs.is_finite() || secs <= 0.0 || secs * 1000.0 >= i64::MAX as f64 {
        return Err(invalid());
    }
    Duration::try_milliseconds((secs * 1000.0) as i64)
        .and_then(|lifetime| start.checked_add_signed(lifetime))
        .ok_or_else(invalid)
}

#[derive(Debug, Clone)]
pub struct CredentialSettings {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub expiration_buffer: Duration,
}

impl CredentialSettings {
    pub fn from_config(config: &KeycloakConfig) -> Self {
        Self {
            token_url: Self::token_endpoint(&config.url, &config.realm),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            expiration_buffer: Duration::seconds(config.expiration_buffer_secs),
        }
    }

    pub fn token_endpoint(base_url: &str, realm: &str) -> String {
        format!(
            "{}/auth/realms/{}/protocol/openid-connect/token",
            base_url.trim_end_matches('/'),
            realm
        )
    }
}

pub struct CredentialCache {
    settings: CredentialSettings,
    http: reqwest::Client,
    cached: Mutex<Option<ServiceAccessToken>>,
}

impl CredentialCache {
    pub fn new(settings: CredentialSettings, http: reqwest::Client) -> Self {
        Self {
            settings,
            http,
            cached: Mutex::new(None),
        }
    }

    /// Start from an already issued token.
    pub fn with_token(
        settings: CredentialSettings,
        http: reqwest::Client,
        token: ServiceAccessToken,
    ) -> Self {
        Self {
            settings,
            http,
            cached: Mutex::new(Some(token)),
        }
    }

    /// Return a usable access token, refreshing or re-issuing first if needed.
    ///
    /// A failed refresh falls back to a client credentials grant. A failed
    /// client credentials grant empties the cache and returns the error.
    pub async fn ensure_access(&self) -> Result<ServiceAccessToken> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now();
        let buffer = self.settings.expiration_buffer;

        if let Some(token) = cached.as_ref() {
            if token.is_valid_at(now, buffer) {
                return Ok(token.clone());
            }

            if let Some(refresh_token) = token.usable_refresh_token(now, buffer).map(str::to_owned) {
                debug!("Refreshing service access token");
                match self.refresh_grant(&refresh_token).await {
                    Ok(fresh) => {
                        *cached = Some(fresh.clone());
                        return Ok(fresh);
                    }
                    Err(e) => {
                        warn!(error = %e, "Unable to use refresh token, requesting a new one");
                    }
                }
            }
        }

        info!("Requesting new service access token");
        match self.client_credentials_grant().await {
            Ok(fresh) => {
                *cached = Some(fresh.clone());
                Ok(fresh)
            }
            Err(e) => {
                *cached = None;
                Err(e)
            }
        }
    }

    /// Forget the cached token so the next call issues a new one.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn client_credentials_grant(&self) -> Result<ServiceAccessToken> {
        self.request_token(&[
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
            ("grant_type", "client_credentials"),
        ])
        .await
    }

    async fn refresh_grant(&self, refresh_token: &str) -> Result<ServiceAccessToken> {
        self.request_token(&[
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .await
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<ServiceAccessToken> {
        let requested_at = Utc::now();
        let response = self
            .http
            .post(&self.settings.token_url)
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IdentityError::AccessDenied {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| IdentityError::MalformedResponse(e.to_string()))?;

        let token = parsed.into_token(requested_at)?;
        if !token.is_valid_at(Utc::now(), self.settings.expiration_buffer) {
            return Err(IdentityError::MalformedResponse(format!(
                "access token expires at {} within the expiration buffer",
                token.expires_at
            )));
        }
        Ok(token)
    }
}
