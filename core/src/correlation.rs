//! Correlation of replies with outstanding calls.
//!
//! ```text
//! Call:
//!   1. register() stores a PendingCall and hands out a ReplyWaiter
//!   2. request is published with the waiter's correlation id
//!   3. caller awaits ReplyWaiter::wait()
//!
//! Reply:
//!   4. dispatcher decodes a reply envelope
//!   5. resolve() removes the PendingCall and fires its oneshot
//!   6. wait() returns the reply envelope
//!
//! Timeout / cancellation:
//!   the waiter removes its own entry, so a late reply resolves nothing
//! ```
//!
//! The entry is inserted before the request leaves the process and the
//! oneshot buffers the reply, so a reply that beats the caller to `wait()` is
//! never lost.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::stats::RpcStats;
use crate::{Result, RpcError};

struct PendingCall {
    sender: oneshot::Sender<Envelope>,
    created_at: Instant,
}

/// Table of outstanding calls keyed by correlation id.
pub struct CorrelationTracker {
    pending: Arc<DashMap<String, PendingCall>>,
    stats: Arc<RpcStats>,
}

impl CorrelationTracker {
    pub fn new(stats: Arc<RpcStats>) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            stats,
        }
    }

    /// Allocate a fresh correlation id and its waiter.
    ///
    /// `timeout` bounds `ReplyWaiter::wait`; `None` waits until a reply arrives
    /// or the waiter is dropped.
    pub fn register(&self, timeout: Option<Duration>) -> ReplyWaiter {
        let (tx, rx) = oneshot::channel();
        let mut correlation_id = uuid::Uuid::new_v4().to_string();
        // Ids must be unique among outstanding calls
        while self.pending.contains_key(&correlation_id) {
            correlation_id = uuid::Uuid::new_v4().to_string();
        }
        self.pending.insert(
            correlation_id.clone(),
            PendingCall {
                sender: tx,
                created_at: Instant::now(),
            },
        );
        debug!(target: "correlation", correlation_id = %correlation_id, "Registered pending call");
        ReplyWaiter {
            correlation_id,
            receiver: Some(rx),
            timeout,
            pending: Arc::clone(&self.pending),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Hand `envelope` to the caller waiting on `correlation_id`.
    ///
    /// Returns `false` when nothing is pending under that id.
    pub fn resolve(&self, correlation_id: &str, envelope: Envelope) -> bool {
        let Some((_, call)) = self.pending.remove(correlation_id) else {
            return false;
        };
        let elapsed_ms = call.created_at.elapsed().as_secs_f64() * 1000.0;
        if call.sender.send(envelope).is_err() {
            // Waiter went away between remove and send; the reply is consumed anyway
            warn!(target: "correlation", correlation_id = %correlation_id, "Waiter dropped before reply delivery");
        } else {
            debug!(target: "correlation", correlation_id = %correlation_id, elapsed_ms, "Resolved pending call");
        }
        true
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.pending.contains_key(correlation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop every pending call; their waiters fail with `RpcError::Cancelled`.
    pub fn cancel_all(&self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        if count > 0 {
            warn!(target: "correlation", count, "Cancelled pending calls");
        }
        count
    }
}

/// Caller side of a pending call.
///
/// Dropping the waiter (for instance when the awaiting task is cancelled)
/// removes the pending entry.
pub struct ReplyWaiter {
    correlation_id: String,
    receiver: Option<oneshot::Receiver<Envelope>>,
    timeout: Option<Duration>,
    pending: Arc<DashMap<String, PendingCall>>,
    stats: Arc<RpcStats>,
}

impl ReplyWaiter {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Wait for the correlated reply.
    pub async fn wait(mut self) -> Result<Envelope> {
        let Some(mut receiver) = self.receiver.take() else {
            return Err(RpcError::Cancelled(self.correlation_id.clone()));
        };

        let received = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut receiver).await {
                Ok(received) => received,
                Err(_) => {
                    if self.pending.remove(&self.correlation_id).is_none() {
                        // resolve() already took the entry and owns the sender
                        return receiver
                            .await
                            .map_err(|_| RpcError::Cancelled(self.correlation_id.clone()));
                    }
                    self.stats.record_timeout();
                    warn!(target: "correlation", correlation_id = %self.correlation_id, timeout_ms = limit.as_millis() as u64, "Call timed out");
                    return Err(RpcError::Timeout {
                        correlation_id: self.correlation_id.clone(),
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            },
            None => receiver.await,
        };

        received.map_err(|_| RpcError::Cancelled(self.correlation_id.clone()))
    }
}

impl Drop for ReplyWaiter {
    fn drop(&mut self) {
        if self.pending.remove(&self.correlation_id).is_some() {
            debug!(target: "correlation", correlation_id = %self.correlation_id, "Pending call abandoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> CorrelationTracker {
        CorrelationTracker::new(Arc::new(RpcStats::new()))
    }

    fn reply_for(id: &str, body: &[u8]) -> Envelope {
        Envelope {
            correlation_id: id.to_string(),
            send_to: "replies".to_string(),
            body: Some(body.to_vec()),
            is_reply: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn reply_before_wait_is_not_lost() {
        let t = tracker();
        let waiter = t.register(None);
        let id = waiter.correlation_id().to_string();

        assert!(t.resolve(&id, reply_for(&id, b"early")));
        let reply = waiter.wait().await.unwrap();
        assert_eq!(reply.body.as_deref(), Some(&b"early"[..]));
        assert_eq!(t.pending_count(), 0);
    }

    #[tokio::test]
    async fn resolve_unknown_id_returns_false() {
        let t = tracker();
        assert!(!t.resolve("missing", reply_for("missing", b"x")));
    }

    #[tokio::test]
    async fn second_resolve_for_same_id_is_rejected() {
        let t = tracker();
        let waiter = t.register(None);
        let id = waiter.correlation_id().to_string();
        assert!(t.resolve(&id, reply_for(&id, b"1")));
        assert!(!t.resolve(&id, reply_for(&id, b"2")));
        assert_eq!(waiter.wait().await.unwrap().body_bytes(), b"1");
    }

    #[tokio::test]
    async fn timeout_removes_entry() {
        let t = tracker();
        let waiter = t.register(Some(Duration::from_millis(20)));
        let id = waiter.correlation_id().to_string();

        let err = waiter.wait().await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout { timeout_ms: 20, .. }));
        assert!(!t.is_pending(&id));
        assert!(!t.resolve(&id, reply_for(&id, b"late")));
        assert_eq!(t.stats.snapshot().timeouts, 1);
    }

    #[tokio::test]
    async fn reply_claimed_at_deadline_is_delivered() {
        let t = tracker();
        let waiter = t.register(Some(Duration::from_millis(20)));
        let id = waiter.correlation_id().to_string();

        // Entry already claimed by a resolver that sends only after the deadline
        let (_, call) = t.pending.remove(&id).unwrap();
        let reply = reply_for(&id, b"just in time");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            let _ = call.sender.send(reply);
        });

        let got = waiter.wait().await.unwrap();
        assert_eq!(got.body_bytes(), b"just in time");
        assert_eq!(t.stats.snapshot().timeouts, 0);
    }

    #[tokio::test]
    async fn dropped_waiter_removes_entry() {
        let t = tracker();
        let waiter = t.register(None);
        let id = waiter.correlation_id().to_string();
        assert!(t.is_pending(&id));
        drop(waiter);
        assert!(!t.is_pending(&id));
    }

    #[tokio::test]
    async fn cancelled_task_removes_entry() {
        let t = tracker();
        let waiter = t.register(None);
        let id = waiter.correlation_id().to_string();
        let task = tokio::spawn(waiter.wait());
        tokio::time::sleep(Duration::from_millis(10)).await;
        task.abort();
        let _ = task.await;
        assert!(!t.is_pending(&id));
    }

    #[tokio::test]
    async fn cancel_all_fails_waiters() {
        let t = tracker();
        let w1 = t.register(None);
        let w2 = t.register(None);
        assert_ne!(w1.correlation_id(), w2.correlation_id());
        assert_eq!(t.cancel_all(), 2);
        assert!(matches!(w1.wait().await, Err(RpcError::Cancelled(_))));
        assert!(matches!(w2.wait().await, Err(RpcError::Cancelled(_))));
    }
}
