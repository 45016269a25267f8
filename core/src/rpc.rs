use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::config::{RpcConfig, Topology};
use crate::correlation::CorrelationTracker;
use crate::dispatcher::Dispatcher;
use crate::envelope::{encode, Envelope};
use crate::handler::{Handler, HandlerRegistry};
use crate::provisioner::TopicProvisioner;
use crate::stats::{RpcStats, RpcStatsSnapshot};
use crate::{Result, RpcError};

/// Request/reply RPC over a pub/sub broker.
///
/// `RpcFacade` composes the provisioner, correlation tracker, handler registry
/// and dispatcher. All state belongs to the instance; two facades in one
/// process share nothing but the broker.
///
/// # Topologies
///
/// * `Direct` - handlers subscribe under the shared `group_id`, so each request
///   reaches one instance. Replies travel on `{group_id}.reply.{instance_id}`,
///   a topic only this instance consumes.
/// * `Fanout` - every subscription uses `{group_id}.{instance_id}`, so every
///   instance sees every message. Replies travel back on the request topic.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use courier_core::{Handler, MemoryBroker, RpcConfig, RpcFacade};
///
/// # async fn example() -> courier_core::Result<()> {
/// let cluster = MemoryBroker::default();
///
/// let server = RpcFacade::new(Arc::new(cluster.client()), RpcConfig::default())?;
/// server
///     .subscribe("jobs.run", Handler::from_fn(|_req| Ok(Some(b"ok".to_vec()))))
///     .await?;
///
/// let client = RpcFacade::new(Arc::new(cluster.client()), RpcConfig::default())?;
/// client.start().await?;
/// if let Some(reply) = client.send("jobs.run", b"{}".to_vec(), true).await? {
///     assert_eq!(reply.body_bytes(), b"ok");
/// }
/// # Ok(())
/// # }
/// ```
pub struct RpcFacade {
    broker: Arc<dyn Broker>,
    config: RpcConfig,
    instance_id: String,
    tracker: Arc<CorrelationTracker>,
    registry: Arc<HandlerRegistry>,
    provisioner: Arc<TopicProvisioner>,
    dispatcher: Arc<Dispatcher>,
    // Topic -> consumer group this instance listens with
    subscriptions: DashMap<String, String>,
    // Reply topic -> calls still waiting on it
    reply_waits: Arc<DashMap<String, usize>>,
    listen_lock: Mutex<()>,
    stats: Arc<RpcStats>,
}

impl RpcFacade {
    pub fn new(broker: Arc<dyn Broker>, config: RpcConfig) -> Result<Self> {
        config.validate()?;

        let stats = Arc::new(RpcStats::new());
        let tracker = Arc::new(CorrelationTracker::new(Arc::clone(&stats)));
        let registry = Arc::new(HandlerRegistry::new());
        let provisioner = Arc::new(TopicProvisioner::new(
            Arc::clone(&broker),
            config.handshake_count,
            config.handshake_interval,
            Arc::clone(&stats),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&broker),
            Arc::clone(&tracker),
            Arc::clone(&registry),
            Arc::clone(&provisioner),
            Arc::clone(&stats),
        ));

        let instance_id = uuid::Uuid::new_v4().simple().to_string();
        debug!(target: "rpc", instance_id = %instance_id, topology = %config.topology, group_id = %config.group_id, "Created RPC facade");

        Ok(Self {
            broker,
            config,
            instance_id,
            tracker,
            registry,
            provisioner,
            dispatcher,
            subscriptions: DashMap::new(),
            reply_waits: Arc::new(DashMap::new()),
            listen_lock: Mutex::new(()),
            stats,
        })
    }

    /// Start listening on the private reply topic (direct mode).
    ///
    /// Optional: `send` subscribes lazily, but starting early gives the reply
    /// consumer time to attach before the first call.
    pub async fn start(&self) -> Result<()> {
        if self.config.topology == Topology::Direct {
            let reply_topic = self.private_reply_topic();
            self.listen(&reply_topic, &self.instance_group()).await?;
        }
        info!(target: "rpc", instance_id = %self.instance_id, topology = %self.config.topology, "RPC facade started");
        Ok(())
    }

    /// Leave every topic and cancel all pending calls.
    pub async fn shutdown(&self) -> Result<()> {
        info!(target: "rpc", instance_id = %self.instance_id, "Shutting down RPC facade");

        let topics = self.subscribed_topics();
        if !topics.is_empty() {
            self.broker.unsubscribe(&topics).await?;
        }
        self.subscriptions.clear();
        for topic in self.registry.topics() {
            self.registry.remove(&topic);
        }
        self.tracker.cancel_all();
        Ok(())
    }

    /// Send `payload` to `topic`.
    ///
    /// With `need_reply` the call waits for the correlated reply, bounded by the
    /// configured `request_timeout`, and returns it. Otherwise it returns
    /// `None` as soon as the message is published.
    #[tracing::instrument(skip(self, payload), fields(topic = %topic, bytes = payload.len()))]
    pub async fn send(
        &self,
        topic: &str,
        payload: Vec<u8>,
        need_reply: bool,
    ) -> Result<Option<Envelope>> {
        self.send_envelope(
            Envelope::request(topic, payload),
            need_reply,
            self.config.request_timeout,
        )
        .await
    }

    /// Send a request and wait for its reply, with an explicit timeout.
    pub async fn call(
        &self,
        topic: &str,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Envelope> {
        self.request(Envelope::request(topic, payload), timeout)
            .await
    }

    /// Publish a one-way message.
    pub async fn notify(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.publish_one_way(Envelope::request(topic, payload)).await
    }

    /// Send a caller-built envelope; its metadata travels unchanged.
    ///
    /// `correlation_id`, `reply_to` and `is_reply` are managed here and
    /// overwritten when a reply is needed.
    pub async fn send_envelope(
        &self,
        envelope: Envelope,
        need_reply: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<Envelope>> {
        if need_reply {
            self.request(envelope, timeout).await.map(Some)
        } else {
            self.publish_one_way(envelope).await.map(|_| None)
        }
    }

    /// Register `handler` for `topic` and subscribe to it.
    #[tracing::instrument(skip(self, handler), fields(topic = %topic))]
    pub async fn subscribe(&self, topic: &str, handler: Handler) -> Result<()> {
        self.registry.register(topic, handler)?;

        let group = self.subscription_group();
        if let Err(err) = self.listen(topic, &group).await {
            self.registry.remove(topic);
            return Err(err);
        }
        info!(target: "rpc", topic = %topic, group_id = %group, "Subscribed handler");
        Ok(())
    }

    /// Remove the handler for `topic` and leave it at the broker.
    ///
    /// In fanout mode the topic may also carry replies to calls still in
    /// flight; the broker subscription then stays until shutdown.
    ///
    /// Returns `false` if no handler was registered.
    #[tracing::instrument(skip(self), fields(topic = %topic))]
    pub async fn unsubscribe(&self, topic: &str) -> Result<bool> {
        let removed = self.registry.remove(topic);

        let _guard = self.listen_lock.lock().await;
        let waiting = self.reply_waits.get(topic).map(|n| *n).unwrap_or(0);
        if waiting > 0 {
            debug!(target: "rpc", topic = %topic, waiting, "Topic still carries replies, keeping broker subscription");
        } else if self.subscriptions.remove(topic).is_some() {
            self.broker.unsubscribe(&[topic.to_string()]).await?;
        }
        if removed {
            info!(target: "rpc", topic = %topic, "Unsubscribed handler");
        }
        Ok(removed)
    }

    /// Topic replies to a request on `topic` are sent to.
    pub fn reply_topic_for(&self, topic: &str) -> String {
        match self.config.topology {
            Topology::Direct => self.private_reply_topic(),
            Topology::Fanout => topic.to_string(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn topology(&self) -> Topology {
        self.config.topology
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn pending_calls(&self) -> usize {
        self.tracker.pending_count()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.registry.contains(topic)
    }

    pub fn is_topic_open(&self, topic: &str) -> bool {
        self.provisioner.is_open(topic)
    }

    /// Topics this instance consumes at the broker, handlers and reply channels alike.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscriptions.iter().map(|e| e.key().clone()).collect()
    }

    /// Get stats
    pub fn stats(&self) -> RpcStatsSnapshot {
        self.stats.snapshot()
    }

    async fn request(&self, mut envelope: Envelope, timeout: Option<Duration>) -> Result<Envelope> {
        let topic = Self::destination(&envelope)?;
        let reply_topic = self.reply_topic_for(&topic);
        let _reply_wait = ReplyWait::new(Arc::clone(&self.reply_waits), &reply_topic);

        // Listen before warming the destination so the burst covers our own attach too
        self.listen(&reply_topic, &self.instance_group()).await?;
        self.provisioner.ensure_open(&topic).await?;

        let waiter = self.tracker.register(timeout);
        envelope.correlation_id = waiter.correlation_id().to_string();
        envelope.reply_to = Some(reply_topic);
        envelope.is_reply = false;

        let bytes = encode(&envelope)?;
        self.broker.publish(&topic, bytes).await.map_err(|err| {
            warn!(target: "rpc", topic = %topic, correlation_id = %envelope.correlation_id, error = %err, "Publish failed");
            err
        })?;
        self.stats.record_request_sent();
        debug!(target: "rpc", topic = %topic, correlation_id = %envelope.correlation_id, "Request published, awaiting reply");

        waiter.wait().await
    }

    async fn publish_one_way(&self, mut envelope: Envelope) -> Result<()> {
        let topic = Self::destination(&envelope)?;
        self.provisioner.ensure_open(&topic).await?;

        envelope.reply_to = None;
        envelope.is_reply = false;
        let bytes = encode(&envelope)?;
        self.broker.publish(&topic, bytes).await?;
        self.stats.record_request_sent();
        debug!(target: "rpc", topic = %topic, "One-way message published");
        Ok(())
    }

    fn destination(envelope: &Envelope) -> Result<String> {
        if envelope.send_to.is_empty() {
            return Err(RpcError::MalformedEnvelope("empty send_to".into()));
        }
        Ok(envelope.send_to.clone())
    }

    // Broker-level subscribe, once per topic
    async fn listen(&self, topic: &str, group_id: &str) -> Result<()> {
        if self.subscriptions.contains_key(topic) {
            return Ok(());
        }
        let _guard = self.listen_lock.lock().await;
        if self.subscriptions.contains_key(topic) {
            return Ok(());
        }
        self.broker
            .subscribe(&[topic.to_string()], group_id, self.dispatcher.callback())
            .await?;
        self.subscriptions
            .insert(topic.to_string(), group_id.to_string());
        debug!(target: "rpc", topic = %topic, group_id = %group_id, "Listening");
        Ok(())
    }

    fn subscription_group(&self) -> String {
        match self.config.topology {
            Topology::Direct => self.config.group_id.clone(),
            Topology::Fanout => self.instance_group(),
        }
    }

    fn instance_group(&self) -> String {
        format!("{}.{}", self.config.group_id, self.instance_id)
    }

    fn private_reply_topic(&self) -> String {
        format!("{}.reply.{}", self.config.group_id, self.instance_id)
    }
}

// Marks a reply topic as in use for the lifetime of one call
struct ReplyWait {
    waits: Arc<DashMap<String, usize>>,
    topic: String,
}

impl ReplyWait {
    fn new(waits: Arc<DashMap<String, usize>>, topic: &str) -> Self {
        *waits.entry(topic.to_string()).or_insert(0) += 1;
        Self {
            waits,
            topic: topic.to_string(),
        }
    }
}

impl Drop for ReplyWait {
    fn drop(&mut self) {
        self.waits.remove_if_mut(&self.topic, |_, count| {
            *count -= 1;
            *count == 0
        });
    }
}
