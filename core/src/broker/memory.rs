// In-process broker implementation
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Broker, MessageCallback};
use crate::Result;

/// Memory broker configuration
#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
    /// Time between a subscribe call and the subscriber receiving messages.
    /// Messages published to a topic before any consumer attached are dropped.
    pub attach_delay: Duration,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            attach_delay: Duration::from_millis(
                std::env::var("COURIER_MEMORY_ATTACH_DELAY_MS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0),
            ),
        }
    }
}

/// Per-topic delivery statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub dropped_messages: u64,
}

struct Member {
    client_id: u64,
    callback: MessageCallback,
    active_at: Instant,
}

#[derive(Default)]
struct ConsumerGroup {
    members: Vec<Member>,
    cursor: usize,
}

impl ConsumerGroup {
    // Round-robin over members that finished attaching
    fn next_active(&mut self, now: Instant) -> Option<MessageCallback> {
        let n = self.members.len();
        for _ in 0..n {
            let idx = self.cursor % n;
            self.cursor = self.cursor.wrapping_add(1);
            let member = &self.members[idx];
            if member.active_at <= now {
                return Some(Arc::clone(&member.callback));
            }
        }
        None
    }
}

struct Inner {
    // Topic -> group id -> members
    topics: DashMap<String, HashMap<String, ConsumerGroup>>,
    stats: DashMap<String, BrokerStats>,
    config: MemoryBrokerConfig,
    next_client: AtomicU64,
}

/// In-process pub/sub cluster with consumer-group semantics.
///
/// Each [`MemoryClient`] handed out by [`MemoryBroker::client`] behaves like one
/// broker connection: its subscriptions are its own and `unsubscribe` only
/// affects them.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new(config: MemoryBrokerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: DashMap::new(),
                stats: DashMap::new(),
                config,
                next_client: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new client connection to this cluster.
    pub fn client(&self) -> MemoryClient {
        let id = self.inner.next_client.fetch_add(1, Ordering::Relaxed);
        debug!(target: "broker", client_id = id, "Memory broker client connected");
        MemoryClient {
            id,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Get stats
    pub fn stats(&self, topic: &str) -> Option<BrokerStats> {
        self.inner.stats.get(topic).map(|s| s.clone())
    }

    /// Number of members in `group_id` on `topic`, attached or not.
    pub fn member_count(&self, topic: &str, group_id: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .and_then(|groups| groups.get(group_id).map(|g| g.members.len()))
            .unwrap_or(0)
    }

    /// Consumer groups currently present on `topic`.
    pub fn groups(&self, topic: &str) -> Vec<String> {
        self.inner
            .topics
            .get(topic)
            .map(|groups| groups.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerConfig::default())
    }
}

/// One connection to a [`MemoryBroker`].
pub struct MemoryClient {
    id: u64,
    inner: Arc<Inner>,
}

impl MemoryClient {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn update_stats<F>(&self, topic: &str, f: F)
    where
        F: FnOnce(&mut BrokerStats),
    {
        let mut entry = self.inner.stats.entry(topic.to_string()).or_default();
        f(entry.value_mut());
    }
}

#[async_trait]
impl Broker for MemoryClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let now = Instant::now();
        // Collect targets first so no map guard is held while callbacks run
        let targets: Vec<MessageCallback> = match self.inner.topics.get_mut(topic) {
            Some(mut groups) => groups
                .values_mut()
                .filter_map(|group| group.next_active(now))
                .collect(),
            None => Vec::new(),
        };

        let delivered = targets.len() as u64;
        self.update_stats(topic, |stats| {
            stats.total_published += 1;
            stats.total_delivered += delivered;
            if delivered == 0 {
                stats.dropped_messages += 1;
            }
        });

        if targets.is_empty() {
            warn!(target: "broker", topic = %topic, "No attached consumers, message dropped");
            return Ok(());
        }

        debug!(target: "broker", topic = %topic, groups = delivered, "Delivering message");
        for callback in targets {
            callback(topic.to_string(), payload.clone());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: &[String],
        group_id: &str,
        on_message: MessageCallback,
    ) -> Result<()> {
        let active_at = Instant::now() + self.inner.config.attach_delay;
        for topic in topics {
            let mut groups = self.inner.topics.entry(topic.clone()).or_default();
            let group = groups.entry(group_id.to_string()).or_default();
            if group.members.iter().any(|m| m.client_id == self.id) {
                debug!(target: "broker", topic = %topic, group_id = %group_id, "Client already subscribed");
                continue;
            }
            group.members.push(Member {
                client_id: self.id,
                callback: Arc::clone(&on_message),
                active_at,
            });
            info!(target: "broker", topic = %topic, group_id = %group_id, client_id = self.id, "Subscribed");
        }
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<()> {
        for topic in topics {
            if let Some(mut groups) = self.inner.topics.get_mut(topic) {
                for group in groups.values_mut() {
                    group.members.retain(|m| m.client_id != self.id);
                }
                groups.retain(|_, group| !group.members.is_empty());
            }
            info!(target: "broker", topic = %topic, client_id = self.id, "Unsubscribed");
        }
        Ok(())
    }
}
