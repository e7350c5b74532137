//! HTTP client for downstream services
//!
//! Every request carries the impersonation token and the `X-UserId` header
//! of the user being deleted. 429, 5xx and transport errors are retried with
//! exponential backoff up to the configured attempt count.

use std::time::Duration;

use reqwest::Method;
use serde_json::Value;
use tracing::{debug, warn};

use um_config::CleanupConfig;
use um_identity::ImpersonationToken;

use crate::error::{CleanupError, Result};

pub const USER_ID_HEADER: &str = "X-UserId";

/// Upper bound for a single pause between retries.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct DownstreamClient {
    http: reqwest::Client,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl DownstreamClient {
    pub fn new(timeout: Duration, retry_attempts: u32, retry_delay: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CleanupError::HttpClient(e.to_string()))?;
        Ok(Self::with_client(http, retry_attempts, retry_delay))
    }

    pub fn with_client(http: reqwest::Client, retry_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            http,
            retry_attempts: retry_attempts.max(1),
            retry_delay,
        }
    }

    pub fn from_config(config: &CleanupConfig) -> Result<Self> {
        Self::new(
            config.http_timeout(),
            config.http_retry_attempts,
            config.http_retry_delay(),
        )
    }

    pub async fn get_json(&self, token: &ImpersonationToken, url: &str) -> Result<Value> {
        let response = self.execute(token, Method::GET, url, None).await?;
        let body = response.bytes().await.map_err(|e| CleanupError::Transport {
            method: Method::GET.to_string(),
            url: url.to_string(),
            source: e,
        })?;
        serde_json::from_slice(&body).map_err(|e| CleanupError::InvalidResponse {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    pub async fn delete(&self, token: &ImpersonationToken, url: &str) -> Result<()> {
        self.execute(token, Method::DELETE, url, None).await?;
        Ok(())
    }

    /// DELETE with a JSON array of ids as the body.
    pub async fn delete_ids(
        &self,
        token: &ImpersonationToken,
        url: &str,
        ids: &[String],
    ) -> Result<()> {
        self.execute(token, Method::DELETE, url, Some(ids)).await?;
        Ok(())
    }

    /// Delay before `attempt` (1-based retry count), doubling each time and
    /// capped at [`MAX_RETRY_DELAY`].
    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay
            .checked_mul(1 << attempt.saturating_sub(1).min(16))
            .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
    }

    async fn execute(
        &self,
        token: &ImpersonationToken,
        method: Method,
        url: &str,
        ids: Option<&[String]>,
    ) -> Result<reqwest::Response> {
        let mut last_error = None;

        for attempt in 0..self.retry_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.backoff(attempt)).await;
            }

            let mut request = self
                .http
                .request(method.clone(), url)
                .header(reqwest::header::AUTHORIZATION, token.authorization_header())
                .header(USER_ID_HEADER, token.subject_user_id());
            if let Some(ids) = ids {
                request = request.json(ids);
            }

            let error = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(%method, url, status = response.status().as_u16(), "Downstream call succeeded");
                    return Ok(response);
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    CleanupError::Downstream {
                        method: method.to_string(),
                        url: url.to_string(),
                        status,
                        body,
                    }
                }
                Err(e) => CleanupError::Transport {
                    method: method.to_string(),
                    url: url.to_string(),
                    source: e,
                },
            };

            if !error.is_retryable() {
                return Err(error);
            }
            warn!(%method, url, attempt = attempt + 1, error = %error, "Downstream call failed");
            last_error = Some(error);
        }

        Err(last_error.unwrap_or_else(|| CleanupError::Downstream {
            method: method.to_string(),
            url: url.to_string(),
            status: 0,
            body: "no attempt made".to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let client =
            DownstreamClient::with_client(reqwest::Client::new(), 4, Duration::from_millis(100));
        assert_eq!(client.backoff(1), Duration::from_millis(100));
        assert_eq!(client.backoff(2), Duration::from_millis(200));
        assert_eq!(client.backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn test_huge_delay_is_capped() {
        let client = DownstreamClient::with_client(reqwest::Client::new(), 20, Duration::MAX);
        assert_eq!(client.backoff(1), MAX_RETRY_DELAY);
        assert_eq!(client.backoff(17), MAX_RETRY_DELAY);
    }
}
