use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::envelope::Envelope;
use crate::{Result, RpcError};

/// Handler output: `Some(body)` answers the request, `None` declines to answer.
pub type HandlerResult = Result<Option<Vec<u8>>>;

/// Asynchronous request handler
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Envelope) -> HandlerResult;
}

type SyncFn = dyn Fn(&Envelope) -> HandlerResult + Send + Sync;

/// A topic handler, either a plain function or an async handler.
///
/// Both shapes are driven through [`Handler::invoke`]. Sync functions run on
/// the blocking pool, async handlers on their own task, so a slow or panicking
/// handler never stalls or unwinds the dispatch path.
#[derive(Clone)]
pub enum Handler {
    Sync(Arc<SyncFn>),
    Async(Arc<dyn RequestHandler>),
}

struct AsyncFnHandler<F>(F);

#[async_trait]
impl<F, Fut> RequestHandler for AsyncFnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, request: Envelope) -> HandlerResult {
        (self.0)(request).await
    }
}

impl Handler {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&Envelope) -> HandlerResult + Send + Sync + 'static,
    {
        Handler::Sync(Arc::new(f))
    }

    pub fn from_async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Handler::Async(Arc::new(AsyncFnHandler(f)))
    }

    pub fn from_handler(handler: Arc<dyn RequestHandler>) -> Self {
        Handler::Async(handler)
    }

    /// Run the handler and normalize its result.
    pub async fn invoke(&self, request: Envelope) -> HandlerOutcome {
        let joined = match self {
            Handler::Sync(f) => {
                let f = Arc::clone(f);
                tokio::task::spawn_blocking(move || f(&request)).await
            }
            Handler::Async(h) => {
                let h = Arc::clone(h);
                tokio::spawn(async move { h.handle(request).await }).await
            }
        };

        match joined {
            Ok(Ok(Some(body))) => HandlerOutcome::Reply(body),
            Ok(Ok(None)) => HandlerOutcome::NoReply,
            Ok(Err(err)) => HandlerOutcome::Failed(err.to_string()),
            Err(err) if err.is_panic() => HandlerOutcome::Failed("handler panicked".into()),
            Err(err) => HandlerOutcome::Failed(err.to_string()),
        }
    }
}

/// Normalized result of one handler invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Reply(Vec<u8>),
    NoReply,
    Failed(String),
}

impl HandlerOutcome {
    pub fn into_result(self) -> HandlerResult {
        match self {
            HandlerOutcome::Reply(body) => Ok(Some(body)),
            HandlerOutcome::NoReply => Ok(None),
            HandlerOutcome::Failed(reason) => Err(RpcError::HandlerFailed(reason)),
        }
    }
}

/// Topic -> handler registry, at most one handler per topic
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `topic`.
    pub fn register(&self, topic: &str, handler: Handler) -> Result<()> {
        match self.handlers.entry(topic.to_string()) {
            Entry::Occupied(_) => {
                warn!(target: "handler_registry", topic = %topic, "Topic already has a handler");
                Err(RpcError::DuplicateSubscription(topic.to_string()))
            }
            Entry::Vacant(slot) => {
                slot.insert(handler);
                info!(target: "handler_registry", topic = %topic, "Registered handler");
                Ok(())
            }
        }
    }

    pub fn remove(&self, topic: &str) -> bool {
        self.handlers.remove(topic).is_some()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.handlers.contains_key(topic)
    }

    pub fn topics(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    /// Invoke the handler registered for `topic`.
    ///
    /// Returns `None` when no handler is registered.
    pub async fn dispatch(&self, topic: &str, request: &Envelope) -> Option<HandlerOutcome> {
        let handler = self.handlers.get(topic).map(|h| h.value().clone())?;

        let start_time = Instant::now();
        let outcome = handler.invoke(request.clone()).await;
        let elapsed_ms = start_time.elapsed().as_secs_f64() * 1000.0;

        match &outcome {
            HandlerOutcome::Failed(reason) => {
                warn!(target: "handler_registry", topic = %topic, correlation_id = %request.correlation_id, error = %reason, "Handler failed");
            }
            _ => {
                debug!(target: "handler_registry", topic = %topic, correlation_id = %request.correlation_id, elapsed_ms, "Handler completed");
            }
        }
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: &[u8]) -> Envelope {
        Envelope::request("svc", body.to_vec()).with_correlation_id("c-1")
    }

    struct Upper;

    #[async_trait]
    impl RequestHandler for Upper {
        async fn handle(&self, request: Envelope) -> HandlerResult {
            Ok(Some(request.body_bytes().to_ascii_uppercase()))
        }
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = HandlerRegistry::new();
        registry
            .register("svc", Handler::from_fn(|_| Ok(None)))
            .unwrap();
        let err = registry
            .register("svc", Handler::from_fn(|_| Ok(None)))
            .unwrap_err();
        assert!(matches!(err, RpcError::DuplicateSubscription(t) if t == "svc"));

        assert!(registry.remove("svc"));
        assert!(registry
            .register("svc", Handler::from_fn(|_| Ok(None)))
            .is_ok());
    }

    #[tokio::test]
    async fn sync_and_async_shapes_dispatch_uniformly() {
        let registry = HandlerRegistry::new();
        registry
            .register(
                "sync",
                Handler::from_fn(|req| Ok(Some(req.body_bytes().to_vec()))),
            )
            .unwrap();
        registry
            .register(
                "async",
                Handler::from_async_fn(|req: Envelope| async move {
                    let mut body = req.body_bytes().to_vec();
                    body.push(b'!');
                    Ok(Some(body))
                }),
            )
            .unwrap();
        registry
            .register("trait", Handler::from_handler(Arc::new(Upper)))
            .unwrap();

        assert_eq!(
            registry.dispatch("sync", &request(b"a")).await,
            Some(HandlerOutcome::Reply(b"a".to_vec()))
        );
        assert_eq!(
            registry.dispatch("async", &request(b"a")).await,
            Some(HandlerOutcome::Reply(b"a!".to_vec()))
        );
        assert_eq!(
            registry.dispatch("trait", &request(b"abc")).await,
            Some(HandlerOutcome::Reply(b"ABC".to_vec()))
        );
    }

    #[tokio::test]
    async fn unknown_topic_dispatches_nothing() {
        let registry = HandlerRegistry::new();
        assert!(registry.dispatch("nobody", &request(b"x")).await.is_none());
    }

    #[tokio::test]
    async fn errors_and_panics_become_failures() {
        let registry = HandlerRegistry::new();
        registry
            .register(
                "err",
                Handler::from_fn(|_| Err(RpcError::HandlerFailed("boom".into()))),
            )
            .unwrap();
        registry
            .register("panic", Handler::from_fn(|_| panic!("handler bug")))
            .unwrap();
        registry
            .register(
                "async-panic",
                Handler::from_async_fn(|_req: Envelope| async move {
                    if true {
                        panic!("async handler bug");
                    }
                    Ok(None)
                }),
            )
            .unwrap();

        for topic in ["err", "panic", "async-panic"] {
            let outcome = registry.dispatch(topic, &request(b"x")).await.unwrap();
            assert!(matches!(outcome, HandlerOutcome::Failed(_)), "{topic}");
            assert!(matches!(
                outcome.into_result(),
                Err(RpcError::HandlerFailed(_))
            ));
        }
    }

    #[tokio::test]
    async fn declined_request_has_no_reply() {
        let registry = HandlerRegistry::new();
        registry
            .register("quiet", Handler::from_fn(|_| Ok(None)))
            .unwrap();
        assert_eq!(
            registry.dispatch("quiet", &request(b"x")).await,
            Some(HandlerOutcome::NoReply)
        );
    }
}
