// RPC statistics
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters shared by the facade, dispatcher and provisioner.
#[derive(Debug, Default)]
pub struct RpcStats {
    requests_sent: AtomicU64,
    replies_matched: AtomicU64,
    unmatched_replies: AtomicU64,
    malformed_messages: AtomicU64,
    handshakes_sent: AtomicU64,
    handshakes_ignored: AtomicU64,
    requests_handled: AtomicU64,
    handler_failures: AtomicU64,
    replies_published: AtomicU64,
    timeouts: AtomicU64,
    unrouted_messages: AtomicU64,
}

/// Point-in-time copy of [`RpcStats`]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcStatsSnapshot {
    pub requests_sent: u64,
    pub replies_matched: u64,
    pub unmatched_replies: u64,
    pub malformed_messages: u64,
    pub handshakes_sent: u64,
    pub handshakes_ignored: u64,
    pub requests_handled: u64,
    pub handler_failures: u64,
    pub replies_published: u64,
    pub timeouts: u64,
    pub unrouted_messages: u64,
}

impl RpcStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reply_matched(&self) {
        self.replies_matched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unmatched_reply(&self) {
        self.unmatched_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handshake_sent(&self) {
        self.handshakes_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handshake_ignored(&self) {
        self.handshakes_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request_handled(&self) {
        self.requests_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reply_published(&self) {
        self.replies_published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unrouted(&self) {
        self.unrouted_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Get stats
    pub fn snapshot(&self) -> RpcStatsSnapshot {
        RpcStatsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            replies_matched: self.replies_matched.load(Ordering::Relaxed),
            unmatched_replies: self.unmatched_replies.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            handshakes_sent: self.handshakes_sent.load(Ordering::Relaxed),
            handshakes_ignored: self.handshakes_ignored.load(Ordering::Relaxed),
            requests_handled: self.requests_handled.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            replies_published: self.replies_published.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            unrouted_messages: self.unrouted_messages.load(Ordering::Relaxed),
        }
    }
}
