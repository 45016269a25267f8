// Courier Core Library
// Request/reply RPC on top of publish/subscribe brokers

pub mod broker;
pub mod config;
pub mod correlation;
pub mod dispatcher;
pub mod envelope;
pub mod handler;
pub mod provisioner;
pub mod rpc;
pub mod stats;
pub mod telemetry;

// Export core types
pub use broker::{Broker, BrokerStats, MemoryBroker, MemoryBrokerConfig, MemoryClient, MessageCallback};
pub use config::{RpcConfig, Topology};
pub use correlation::{CorrelationTracker, ReplyWaiter};
pub use dispatcher::Dispatcher;
pub use envelope::{decode, encode, Envelope};
pub use handler::{Handler, HandlerOutcome, HandlerRegistry, HandlerResult, RequestHandler};
pub use provisioner::TopicProvisioner;
pub use rpc::RpcFacade;
pub use stats::{RpcStats, RpcStatsSnapshot};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Topic already has a handler: {0}")]
    DuplicateSubscription(String),

    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    #[error("No pending call for correlation id {0}")]
    UnresolvedCorrelation(String),

    #[error("Call {correlation_id} timed out after {timeout_ms}ms")]
    Timeout {
        correlation_id: String,
        timeout_ms: u64,
    },

    #[error("Call {0} was cancelled before a reply arrived")]
    Cancelled(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, RpcError>;
