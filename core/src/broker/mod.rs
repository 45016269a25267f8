//! Broker seam: the pub/sub client this crate is layered on.
//!
//! - `Broker`: the three operations consumed from a broker client library
//! - `MemoryBroker`: in-process cluster with consumer groups, used by tests and demos

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;

pub use memory::{BrokerStats, MemoryBroker, MemoryBrokerConfig, MemoryClient};

/// Callback invoked by the broker client for every delivered message.
///
/// Receives the topic the message arrived on and the raw payload. Implementations
/// must return quickly; the dispatcher offloads its work onto the runtime.
pub type MessageCallback = Arc<dyn Fn(String, Vec<u8>) + Send + Sync>;

/// Client-side view of a topic-addressed pub/sub broker.
///
/// Delivery is fire-and-forget. Within one consumer group a message reaches
/// exactly one subscribed member; every group receives its own copy.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish raw bytes to a topic.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Join `group_id` on each topic and deliver incoming messages to `on_message`.
    async fn subscribe(
        &self,
        topics: &[String],
        group_id: &str,
        on_message: MessageCallback,
    ) -> Result<()>;

    /// Leave the given topics.
    async fn unsubscribe(&self, topics: &[String]) -> Result<()>;
}
