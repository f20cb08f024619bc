//! Broker publish abstraction.
//!
//! The execution pipeline only knows [`Publisher`]; production wires in
//! [`NatsPublisher`], tests wire in [`TestPublisher`] to capture what would
//! have gone out (and to inject transport failures).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::request::short_topic;
use parking_lot::Mutex;
use uuid::Uuid;

/// Publishes a payload to a broker topic. Shared across the worker pool and
/// assumed thread-safe.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Returns a correlation id for the published message.
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        attributes: &BTreeMap<String, String>,
    ) -> anyhow::Result<String>;
}

pub struct NatsPublisher {
    client: async_nats::Client,
}

impl NatsPublisher {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Publisher for NatsPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        attributes: &BTreeMap<String, String>,
    ) -> anyhow::Result<String> {
        // Fully-qualified topic names collapse to their final segment.
        let subject = short_topic(topic).to_owned();

        if attributes.is_empty() {
            self.client.publish(subject, payload).await?;
        } else {
            let mut headers = async_nats::HeaderMap::new();
            for (name, value) in attributes {
                headers.insert(name.as_str(), value.as_str());
            }
            self.client
                .publish_with_headers(subject, headers, payload)
                .await?;
        }

        // Core NATS assigns no server-side message id; hand back a client
        // correlation id instead.
        Ok(Uuid::new_v4().to_string())
    }
}

/// A published message captured by [`TestPublisher`].
#[derive(Clone, Debug)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub attributes: BTreeMap<String, String>,
}

/// Records publishes instead of sending them, with optional failure
/// injection for exercising the backoff path.
#[derive(Default)]
pub struct TestPublisher {
    published: Mutex<Vec<PublishedMessage>>,
    fail_remaining: AtomicUsize,
}

impl TestPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` publish calls fail with a transport error.
    pub fn fail_times(&self, count: usize) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    pub fn publish_count(&self) -> usize {
        self.published.lock().len()
    }

    pub fn messages_for_topic(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Publisher for TestPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        attributes: &BTreeMap<String, String>,
    ) -> anyhow::Result<String> {
        let inject_failure = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if inject_failure {
            anyhow::bail!("injected transport failure");
        }

        self.published.lock().push(PublishedMessage {
            topic: short_topic(topic).to_owned(),
            payload,
            attributes: attributes.clone(),
        });

        Ok(Uuid::new_v4().to_string())
    }
}
