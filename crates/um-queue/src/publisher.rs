//! Bounded retry around a [`CommandPublisher`].

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{CommandPublisher, QueueError, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Upper bound for a single send, confirmation included
    pub attempt_timeout: Duration,
    /// Pause between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            attempt_timeout: Duration::from_secs(10),
            delay: Duration::from_millis(250),
        }
    }
}

/// Retries failed sends up to `max_attempts` times and reports the last error.
pub struct RetryingPublisher<P> {
    inner: P,
    policy: RetryPolicy,
}

impl<P: CommandPublisher> RetryingPublisher<P> {
    pub fn new(inner: P, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: CommandPublisher> CommandPublisher for RetryingPublisher<P> {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        let attempts = self.policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let result = tokio::time::timeout(
                self.policy.attempt_timeout,
                self.inner.publish(topic, key, payload),
            )
            .await
            .unwrap_or_else(|_| Err(QueueError::Timeout(self.policy.attempt_timeout)));

            match result {
                Ok(()) => {
                    debug!(topic, key, attempt, "Message published");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        topic,
                        key,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Publish attempt failed"
                    );
                    last_error = Some(e);
                }
            }

            if attempt < attempts && !self.policy.delay.is_zero() {
                tokio::time::sleep(self.policy.delay).await;
            }
        }

        Err(QueueError::PublishExhausted {
            topic: topic.to_string(),
            attempts,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt made".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn failing(times: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(times),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl CommandPublisher for Flaky {
        async fn publish(&self, _topic: &str, _key: &str, _payload: &[u8]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(QueueError::Publish("broker unavailable".to_string()));
            }
            Ok(())
        }
    }

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            attempt_timeout: Duration::from_secs(1),
            delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_recovers_within_budget() {
        let publisher = RetryingPublisher::new(Flaky::failing(2), quick_policy(3));

        publisher.publish("user", "DELETE_1", b"{}").await.unwrap();
        assert_eq!(publisher.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let publisher = RetryingPublisher::new(Flaky::failing(10), quick_policy(3));

        let err = publisher.publish("user", "DELETE_1", b"{}").await.unwrap_err();
        match err {
            QueueError::PublishExhausted {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("broker unavailable"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(publisher.inner().calls.load(Ordering::SeqCst), 3);
    }

    struct Hanging;

    #[async_trait]
    impl CommandPublisher for Hanging {
        async fn publish(&self, _topic: &str, _key: &str, _payload: &[u8]) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_failure() {
        let policy = RetryPolicy {
            attempt_timeout: Duration::from_millis(20),
            ..quick_policy(2)
        };
        let publisher = RetryingPublisher::new(Hanging, policy);

        let err = publisher.publish("user", "k", b"{}").await.unwrap_err();
        assert!(matches!(err, QueueError::PublishExhausted { attempts: 2, .. }));
    }
}
