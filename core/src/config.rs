use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::RpcError;

/// Consumer-group topology of a facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Topology {
    /// Instances share one group id; each message reaches one instance.
    /// Replies come back on a reply topic private to the calling instance.
    #[default]
    Direct,
    /// Every instance has its own group id; each message reaches all of them.
    /// The request topic doubles as the reply channel.
    Fanout,
}

impl FromStr for Topology {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Topology::Direct),
            "fanout" => Ok(Topology::Fanout),
            other => Err(RpcError::Config(format!("unknown topology: {other}"))),
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topology::Direct => f.write_str("direct"),
            Topology::Fanout => f.write_str("fanout"),
        }
    }
}

/// Facade configuration.
///
/// `Default` starts from built-in values and applies `COURIER_*` environment
/// variables when set.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Base consumer-group id (`COURIER_GROUP_ID`)
    pub group_id: String,
    /// Delivery topology (`COURIER_TOPOLOGY`)
    pub topology: Topology,
    /// Handshakes published when a topic is first used (`COURIER_HANDSHAKE_COUNT`)
    pub handshake_count: u32,
    /// Pause after each handshake (`COURIER_HANDSHAKE_INTERVAL_MS`)
    pub handshake_interval: Duration,
    /// Default wait for a reply; `None` waits forever (`COURIER_REQUEST_TIMEOUT_MS`, 0 = none)
    pub request_timeout: Option<Duration>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            group_id: std::env::var("COURIER_GROUP_ID")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "courier".to_string()),
            topology: std::env::var("COURIER_TOPOLOGY")
                .ok()
                .and_then(|v| v.parse::<Topology>().ok())
                .unwrap_or_default(),
            handshake_count: std::env::var("COURIER_HANDSHAKE_COUNT")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(5),
            handshake_interval: Duration::from_millis(
                std::env::var("COURIER_HANDSHAKE_INTERVAL_MS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(20),
            ),
            request_timeout: match std::env::var("COURIER_REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30_000)
            {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        }
    }
}

impl RpcConfig {
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_handshake(mut self, count: u32, interval: Duration) -> Self {
        self.handshake_count = count;
        self.handshake_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Rejects settings the facade cannot work with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.group_id.trim().is_empty() {
            return Err(RpcError::Config("group_id must not be empty".into()));
        }
        if self.request_timeout == Some(Duration::ZERO) {
            return Err(RpcError::Config(
                "request_timeout must be greater than 0 (use None to wait forever)".into(),
            ));
        }
        Ok(())
    }
}
