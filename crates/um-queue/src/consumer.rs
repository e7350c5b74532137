//! Supervised consumption loop.
//!
//! Connects through a [`BrokerConnector`], feeds deliveries one at a time to
//! a [`MessageHandler`] and settles each one afterwards. Failed connects and
//! lost sessions are retried on a fixed interval until shutdown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::{BrokerConnector, ConsumerSession, MessageHandler, QueueError};

/// Connection state of a [`SupervisedConsumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    /// Subscription confirmed, waiting for a delivery
    Ready,
    /// A delivery is being handled
    Consuming,
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Pause between connection attempts
    pub reconnect_interval: Duration,
    /// Pause after a handler failure before the next delivery is taken
    pub failure_backoff: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(10),
            failure_backoff: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub connect_attempts: u64,
    pub acked: u64,
    pub nacked: u64,
}

enum SessionEnd {
    Shutdown,
    Lost(QueueError),
}

pub struct SupervisedConsumer {
    connector: Arc<dyn BrokerConnector>,
    handler: Arc<dyn MessageHandler>,
    settings: ConsumerSettings,
    state_tx: watch::Sender<ConsumerState>,
    shutdown_tx: broadcast::Sender<()>,
    running: AtomicBool,
    connect_attempts: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
}

impl SupervisedConsumer {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        handler: Arc<dyn MessageHandler>,
        settings: ConsumerSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConsumerState::Disconnected);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            connector,
            handler,
            settings,
            state_tx,
            shutdown_tx,
            running: AtomicBool::new(true),
            connect_attempts: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            nacked: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            connect_attempts: self.connect_attempts.load(Ordering::SeqCst),
            acked: self.acked.load(Ordering::SeqCst),
            nacked: self.nacked.load(Ordering::SeqCst),
        }
    }

    /// Ask the loop to stop. A delivery already in the handler runs to
    /// completion; anything received but unsettled goes back to the broker.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConsumerState) {
        self.state_tx.send_replace(state);
    }

    /// Run until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let source = self.connector.identifier().to_string();

        while self.is_running() {
            self.set_state(ConsumerState::Connecting);
            let attempt = self.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(source = %source, attempt, "Connecting consumer");

            let connected = tokio::select! {
                result = self.connector.connect() => result,
                _ = shutdown_rx.recv() => break,
            };

            let end = match connected {
                Ok(session) => {
                    info!(source = %source, "Consumer subscribed");
                    self.set_state(ConsumerState::Ready);
                    self.consume(session, &mut shutdown_rx).await
                }
                Err(e) => SessionEnd::Lost(e),
            };

            self.set_state(ConsumerState::Disconnected);
            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(e) => {
                    warn!(
                        source = %source,
                        error = %e,
                        retry_in = ?self.settings.reconnect_interval,
                        "Consumer disconnected, will reconnect"
                    );
                    if !self
                        .pause(self.settings.reconnect_interval, &mut shutdown_rx)
                        .await
                    {
                        break;
                    }
                }
            }
        }

        self.set_state(ConsumerState::Disconnected);
        info!(source = %source, "Consumer stopped");
    }

    async fn consume(
        &self,
        mut session: Box<dyn ConsumerSession>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        loop {
            if !self.is_running() {
                session.close().await;
                return SessionEnd::Shutdown;
            }

            let next = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => None,
                next = session.next() => Some(next),
            };

            let Some(next) = next else {
                session.close().await;
                return SessionEnd::Shutdown;
            };

            let delivery = match next {
                Ok(Some(delivery)) => delivery,
                Ok(None) => return SessionEnd::Lost(QueueError::SessionClosed),
                Err(e) => return SessionEnd::Lost(e),
            };

            self.set_state(ConsumerState::Consuming);
            debug!(
                key = %delivery.key,
                tag = delivery.tag,
                redelivered = delivery.redelivered,
                "Handling delivery"
            );

            match self.handler.handle(&delivery).await {
                Ok(()) => {
                    if let Err(e) = session.ack(&delivery).await {
                        return SessionEnd::Lost(e);
                    }
                    self.acked.fetch_add(1, Ordering::SeqCst);
                    self.set_state(ConsumerState::Ready);
                }
                Err(e) => {
                    error!(
                        key = %delivery.key,
                        error = %format!("{:#}", e),
                        "Handler failed, returning message to broker"
                    );
                    if let Err(e) = session.nack(&delivery).await {
                        return SessionEnd::Lost(e);
                    }
                    self.nacked.fetch_add(1, Ordering::SeqCst);
                    self.set_state(ConsumerState::Ready);
                    if !self.pause(self.settings.failure_backoff, shutdown_rx).await {
                        session.close().await;
                        return SessionEnd::Shutdown;
                    }
                }
            }
        }
    }

    /// Sleep for `duration`. Returns false if shutdown was requested meanwhile.
    async fn pause(&self, duration: Duration, shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
        if duration.is_zero() {
            return self.is_running();
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_running(),
            _ = shutdown_rx.recv() => false,
        }
    }
}
