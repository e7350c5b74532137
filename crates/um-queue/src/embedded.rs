//! In-process broker for local runs and tests.
//!
//! One FIFO queue per topic. Deliveries handed to a session stay in flight
//! until settled; a session that is closed, dropped or severed gives its
//! in-flight deliveries back to the front of the queue.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::{
    BrokerConnector, CommandPublisher, ConsumerSession, Delivery, QueueError, Result,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    key: String,
    payload: Vec<u8>,
    deliveries: u32,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, VecDeque<StoredMessage>>,
    /// session id -> (tag -> (topic, message))
    in_flight: HashMap<u64, BTreeMap<u64, (String, StoredMessage)>>,
    refuse_connects: u32,
    connect_attempts: u64,
    generation: u64,
    next_session: u64,
    next_tag: u64,
}

impl BrokerState {
    fn requeue_session(&mut self, session: u64) -> usize {
        let Some(pending) = self.in_flight.remove(&session) else {
            return 0;
        };
        let count = pending.len();
        // Highest tag first so the oldest delivery ends up at the front
        for (_, (topic, message)) in pending.into_iter().rev() {
            self.topics.entry(topic).or_default().push_front(message);
        }
        count
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

/// Handle to an in-process broker. Clones share the same queues.
#[derive(Clone)]
pub struct EmbeddedBroker {
    shared: Arc<Shared>,
}

impl Default for EmbeddedBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddedBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Connector that subscribes to `topic`.
    pub fn connector(&self, topic: impl Into<String>) -> EmbeddedConnector {
        EmbeddedConnector {
            shared: self.shared.clone(),
            topic: topic.into(),
        }
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.state.lock().refuse_connects = count;
    }

    /// Drop every live session as if the broker went away. Their in-flight
    /// deliveries are requeued.
    pub fn sever_sessions(&self) {
        {
            let mut state = self.shared.state.lock();
            state.generation += 1;
            let sessions: Vec<u64> = state.in_flight.keys().copied().collect();
            for session in sessions {
                state.requeue_session(session);
            }
        }
        info!("Embedded broker severed all sessions");
        self.shared.notify.notify_waiters();
    }

    /// Messages waiting on `topic` as (key, payload), oldest first.
    pub fn pending(&self, topic: &str) -> Vec<(String, Vec<u8>)> {
        self.shared
            .state
            .lock()
            .topics
            .get(topic)
            .map(|queue| {
                queue
                    .iter()
                    .map(|m| (m.key.clone(), m.payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deliveries received by some session and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.shared
            .state
            .lock()
            .in_flight
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    pub fn connect_attempts(&self) -> u64 {
        self.shared.state.lock().connect_attempts
    }
}

#[async_trait]
impl CommandPublisher for EmbeddedBroker {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        self.shared
            .state
            .lock()
            .topics
            .entry(topic.to_string())
            .or_default()
            .push_back(StoredMessage {
                key: key.to_string(),
                payload: payload.to_vec(),
                deliveries: 0,
            });
        debug!(topic, key, "Message published to embedded broker");
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

pub struct EmbeddedConnector {
    shared: Arc<Shared>,
    topic: String,
}

#[async_trait]
impl BrokerConnector for EmbeddedConnector {
    fn identifier(&self) -> &str {
        &self.topic
    }

    async fn connect(&self) -> Result<Box<dyn ConsumerSession>> {
        let mut state = self.shared.state.lock();
        state.connect_attempts += 1;
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(QueueError::Connection(
                "embedded broker refused connection".to_string(),
            ));
        }

        state.next_session += 1;
        let id = state.next_session;
        state.in_flight.insert(id, BTreeMap::new());

        Ok(Box::new(EmbeddedSession {
            shared: self.shared.clone(),
            topic: self.topic.clone(),
            id,
            generation: state.generation,
        }))
    }
}

pub struct EmbeddedSession {
    shared: Arc<Shared>,
    topic: String,
    id: u64,
    generation: u64,
}

impl EmbeddedSession {
    fn release(&self) {
        let requeued = self.shared.state.lock().requeue_session(self.id);
        if requeued > 0 {
            debug!(session = self.id, requeued, "Requeued unsettled deliveries");
            self.shared.notify.notify_waiters();
        }
    }

    fn take_in_flight(&self, tag: u64) -> Result<(String, StoredMessage)> {
        let mut state = self.shared.state.lock();
        if state.generation != self.generation {
            return Err(QueueError::SessionClosed);
        }
        state
            .in_flight
            .get_mut(&self.id)
            .and_then(|pending| pending.remove(&tag))
            .ok_or(QueueError::UnknownDelivery(tag))
    }
}

#[async_trait]
impl ConsumerSession for EmbeddedSession {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if state.generation != self.generation {
                    return Err(QueueError::Connection(
                        "embedded broker severed the session".to_string(),
                    ));
                }

                let message = state
                    .topics
                    .get_mut(&self.topic)
                    .and_then(VecDeque::pop_front);

                if let Some(mut message) = message {
                    message.deliveries += 1;
                    state.next_tag += 1;
                    let tag = state.next_tag;
                    let delivery = Delivery {
                        tag,
                        key: message.key.clone(),
                        payload: message.payload.clone(),
                        redelivered: message.deliveries > 1,
                    };
                    state
                        .in_flight
                        .entry(self.id)
                        .or_default()
                        .insert(tag, (self.topic.clone(), message));
                    return Ok(Some(delivery));
                }
            }

            notified.await;
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        self.take_in_flight(delivery.tag)?;
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery) -> Result<()> {
        let (topic, message) = self.take_in_flight(delivery.tag)?;
        self.shared
            .state
            .lock()
            .topics
            .entry(topic)
            .or_default()
            .push_front(message);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn close(self: Box<Self>) {
        // Drop requeues whatever is still in flight
    }
}

impl Drop for EmbeddedSession {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_then_consume_in_order() {
        let broker = EmbeddedBroker::new();
        broker.publish("user", "k1", b"one").await.unwrap();
        broker.publish("user", "k2", b"two").await.unwrap();

        let mut session = broker.connector("user").connect().await.unwrap();
        let first = session.next().await.unwrap().unwrap();
        let second = session.next().await.unwrap().unwrap();

        assert_eq!(first.payload, b"one");
        assert_eq!(second.key, "k2");
        assert_eq!(broker.in_flight(), 2);

        session.ack(&first).await.unwrap();
        session.ack(&second).await.unwrap();
        assert_eq!(broker.in_flight(), 0);
        assert!(broker.pending("user").is_empty());
    }

    #[tokio::test]
    async fn test_dropped_session_requeues_in_order() {
        let broker = EmbeddedBroker::new();
        broker.publish("user", "k1", b"one").await.unwrap();
        broker.publish("user", "k2", b"two").await.unwrap();

        let mut session = broker.connector("user").connect().await.unwrap();
        session.next().await.unwrap().unwrap();
        session.next().await.unwrap().unwrap();
        drop(session);

        let pending = broker.pending("user");
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].0, "k1");

        let mut session = broker.connector("user").connect().await.unwrap();
        let again = session.next().await.unwrap().unwrap();
        assert_eq!(again.key, "k1");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_nack_puts_message_back_first() {
        let broker = EmbeddedBroker::new();
        broker.publish("user", "k1", b"one").await.unwrap();
        broker.publish("user", "k2", b"two").await.unwrap();

        let mut session = broker.connector("user").connect().await.unwrap();
        let first = session.next().await.unwrap().unwrap();
        session.nack(&first).await.unwrap();

        let again = session.next().await.unwrap().unwrap();
        assert_eq!(again.key, "k1");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_refused_connects() {
        let broker = EmbeddedBroker::new();
        broker.fail_next_connects(2);
        let connector = broker.connector("user");

        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_sever_fails_waiting_session() {
        let broker = EmbeddedBroker::new();
        let mut session = broker.connector("user").connect().await.unwrap();

        let waiter = tokio::spawn(async move { session.next().await });
        tokio::task::yield_now().await;
        broker.sever_sessions();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(QueueError::Connection(_))));
    }

    #[tokio::test]
    async fn test_ack_after_sever_is_rejected() {
        let broker = EmbeddedBroker::new();
        broker.publish("user", "k1", b"one").await.unwrap();

        let mut session = broker.connector("user").connect().await.unwrap();
        let delivery = session.next().await.unwrap().unwrap();
        broker.sever_sessions();

        assert!(session.ack(&delivery).await.is_err());
        assert_eq!(broker.pending("user").len(), 1);
    }
}
