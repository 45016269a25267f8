//! Topic provisioning by handshake.
//!
//! Brokers drop messages sent to a topic before any consumer has attached.
//! Before the first real payload goes to a topic, the provisioner publishes a
//! short burst of handshake envelopes spaced by a small delay, giving a freshly
//! subscribed consumer time to attach. This is a heuristic: a consumer that
//! attaches slower than the burst still loses early messages. Peers that need
//! delivery guarantees must subscribe before anyone sends to the topic.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::envelope::{encode, Envelope};
use crate::stats::RpcStats;
use crate::Result;

#[derive(Default)]
struct TopicState {
    opened: OnceCell<()>,
}

pub struct TopicProvisioner {
    broker: Arc<dyn Broker>,
    handshake_count: u32,
    handshake_interval: Duration,
    topics: DashMap<String, Arc<TopicState>>,
    stats: Arc<RpcStats>,
}

impl TopicProvisioner {
    pub fn new(
        broker: Arc<dyn Broker>,
        handshake_count: u32,
        handshake_interval: Duration,
        stats: Arc<RpcStats>,
    ) -> Self {
        Self {
            broker,
            handshake_count,
            handshake_interval,
            topics: DashMap::new(),
            stats,
        }
    }

    /// Make sure `topic` has been warmed up by a handshake burst.
    ///
    /// Only the first call per topic pays for the burst; concurrent first
    /// callers wait on the same burst. If a handshake publish fails the topic
    /// stays unopened and the next call tries again.
    pub async fn ensure_open(&self, topic: &str) -> Result<()> {
        let state = self
            .topics
            .entry(topic.to_string())
            .or_default()
            .value()
            .clone();

        if state.opened.initialized() {
            return Ok(());
        }

        state
            .opened
            .get_or_try_init(|| self.handshake(topic))
            .await
            .map_err(|err| {
                warn!(target: "provisioner", topic = %topic, error = %err, "Handshake failed");
                err
            })?;
        Ok(())
    }

    async fn handshake(&self, topic: &str) -> Result<()> {
        let payload = encode(&Envelope::handshake(topic))?;
        debug!(target: "provisioner", topic = %topic, count = self.handshake_count, "Opening topic");
        for _ in 0..self.handshake_count {
            self.broker.publish(topic, payload.clone()).await?;
            self.stats.record_handshake_sent();
            tokio::time::sleep(self.handshake_interval).await;
        }
        info!(target: "provisioner", topic = %topic, "Topic opened");
        Ok(())
    }

    pub fn is_open(&self, topic: &str) -> bool {
        self.topics
            .get(topic)
            .map(|state| state.opened.initialized())
            .unwrap_or(false)
    }

    /// Drop the opened flag so the next `ensure_open` sends a new burst.
    pub fn forget(&self, topic: &str) -> bool {
        self.topics.remove(topic).is_some()
    }

    pub fn opened_topics(&self) -> Vec<String> {
        self.topics
            .iter()
            .filter(|entry| entry.value().opened.initialized())
            .map(|entry| entry.key().clone())
            .collect()
    }
}
