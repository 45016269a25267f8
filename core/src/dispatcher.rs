//! Inbound message funnel.
//!
//! Every payload delivered on any subscribed topic passes through
//! [`Dispatcher::on_message`]:
//!
//! ```text
//! Receiving -> Classifying -> Replying (reply envelope resolves a pending call)
//!                          -> Routing  (request goes to the topic handler)
//!                                      -> reply published if reply_to is set
//! ```
//!
//! Decode errors, unmatched replies and handler failures are logged, counted
//! and dropped here. Nothing escapes into the broker client.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::broker::{Broker, MessageCallback};
use crate::correlation::CorrelationTracker;
use crate::envelope::{decode, encode, Envelope};
use crate::handler::{HandlerOutcome, HandlerRegistry};
use crate::provisioner::TopicProvisioner;
use crate::stats::RpcStats;
use crate::{Result, RpcError};

pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    tracker: Arc<CorrelationTracker>,
    registry: Arc<HandlerRegistry>,
    provisioner: Arc<TopicProvisioner>,
    stats: Arc<RpcStats>,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<dyn Broker>,
        tracker: Arc<CorrelationTracker>,
        registry: Arc<HandlerRegistry>,
        provisioner: Arc<TopicProvisioner>,
        stats: Arc<RpcStats>,
    ) -> Self {
        Self {
            broker,
            tracker,
            registry,
            provisioner,
            stats,
        }
    }

    /// Broker callback feeding this dispatcher.
    ///
    /// Each message is processed on its own task so a slow handler does not
    /// hold up the broker's delivery loop or other correlation lookups.
    pub fn callback(self: &Arc<Self>) -> MessageCallback {
        let dispatcher = Arc::clone(self);
        Arc::new(move |topic: String, payload: Vec<u8>| {
            let dispatcher = Arc::clone(&dispatcher);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { dispatcher.on_message(&topic, &payload).await });
                }
                Err(_) => {
                    error!(target: "dispatcher", topic = %topic, "No tokio runtime, message dropped");
                }
            }
        })
    }

    /// Process one raw payload received on `topic`.
    pub async fn on_message(&self, topic: &str, payload: &[u8]) {
        // Classifying
        let envelope = match decode(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.stats.record_malformed();
                warn!(target: "dispatcher", topic = %topic, error = %err, bytes = payload.len(), "Dropping malformed message");
                return;
            }
        };

        if envelope.is_handshake() {
            self.stats.record_handshake_ignored();
            debug!(target: "dispatcher", topic = %topic, "Handshake received");
            return;
        }

        if envelope.is_reply {
            self.on_reply(topic, envelope);
            return;
        }

        self.route(topic, envelope).await;
    }

    fn on_reply(&self, topic: &str, envelope: Envelope) {
        let correlation_id = envelope.correlation_id.clone();
        let latency_ms = chrono::Utc::now().timestamp_millis() - envelope.timestamp_ms;
        if self.tracker.resolve(&correlation_id, envelope) {
            self.stats.record_reply_matched();
            debug!(target: "dispatcher", topic = %topic, correlation_id = %correlation_id, latency_ms, "Reply matched");
        } else {
            self.stats.record_unmatched_reply();
            let err = RpcError::UnresolvedCorrelation(correlation_id);
            debug!(target: "dispatcher", topic = %topic, error = %err, "Dropping reply");
        }
    }

    // Routing
    async fn route(&self, topic: &str, request: Envelope) {
        let Some(outcome) = self.registry.dispatch(topic, &request).await else {
            self.stats.record_unrouted();
            debug!(target: "dispatcher", topic = %topic, "No handler for topic, message dropped");
            return;
        };
        self.stats.record_request_handled();

        match outcome {
            HandlerOutcome::Reply(body) => {
                let Some(reply) = request.reply(body) else {
                    debug!(target: "dispatcher", topic = %topic, "Request expects no reply");
                    return;
                };
                if let Err(err) = self.publish_reply(&reply).await {
                    warn!(target: "dispatcher", reply_to = %reply.send_to, correlation_id = %reply.correlation_id, error = %err, "Failed to publish reply");
                }
            }
            HandlerOutcome::NoReply => {
                debug!(target: "dispatcher", topic = %topic, correlation_id = %request.correlation_id, "Handler declined to reply");
            }
            HandlerOutcome::Failed(_) => {
                self.stats.record_handler_failure();
            }
        }
    }

    // Replying
    async fn publish_reply(&self, reply: &Envelope) -> Result<()> {
        self.provisioner.ensure_open(&reply.send_to).await?;
        let bytes = encode(reply)?;
        self.broker.publish(&reply.send_to, bytes).await?;
        self.stats.record_reply_published();
        debug!(target: "dispatcher", reply_to = %reply.send_to, correlation_id = %reply.correlation_id, "Reply published");
        Ok(())
    }
}
