use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_core::envelope::encode;
use courier_core::{
    Broker, CorrelationTracker, Dispatcher, Envelope, Handler, HandlerRegistry, MemoryBroker,
    MemoryBrokerConfig, RpcStats, TopicProvisioner,
};

struct Harness {
    cluster: MemoryBroker,
    tracker: Arc<CorrelationTracker>,
    registry: Arc<HandlerRegistry>,
    stats: Arc<RpcStats>,
    dispatcher: Arc<Dispatcher>,
}

fn harness() -> Harness {
    let cluster = MemoryBroker::new(MemoryBrokerConfig {
        attach_delay: Duration::ZERO,
    });
    let broker: Arc<dyn Broker> = Arc::new(cluster.client());
    let stats = Arc::new(RpcStats::new());
    let tracker = Arc::new(CorrelationTracker::new(Arc::clone(&stats)));
    let registry = Arc::new(HandlerRegistry::new());
    let provisioner = Arc::new(TopicProvisioner::new(
        Arc::clone(&broker),
        1,
        Duration::from_millis(1),
        Arc::clone(&stats),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        broker,
        Arc::clone(&tracker),
        Arc::clone(&registry),
        provisioner,
        Arc::clone(&stats),
    ));
    Harness {
        cluster,
        tracker,
        registry,
        stats,
        dispatcher,
    }
}

fn counting(hits: &Arc<AtomicUsize>) -> Handler {
    let hits = Arc::clone(hits);
    Handler::from_fn(move |_| {
        hits.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    })
}

#[tokio::test]
async fn malformed_messages_do_not_disturb_the_stream() {
    let h = harness();
    let hits = Arc::new(AtomicUsize::new(0));
    h.registry.register("feed", counting(&hits)).unwrap();

    for i in 0..12u8 {
        let payload = if i % 3 == 2 {
            b"{ definitely not an envelope".to_vec()
        } else {
            encode(&Envelope::request("feed", vec![i])).unwrap()
        };
        h.dispatcher.on_message("feed", &payload).await;
    }

    assert_eq!(hits.load(Ordering::SeqCst), 8);
    let stats = h.stats.snapshot();
    assert_eq!(stats.malformed_messages, 4);
    assert_eq!(stats.requests_handled, 8);
}

#[tokio::test]
async fn reply_resolves_waiter_and_skips_handlers() {
    let h = harness();
    let hits = Arc::new(AtomicUsize::new(0));
    h.registry.register("shared", counting(&hits)).unwrap();

    let waiter = h.tracker.register(Some(Duration::from_secs(1)));
    let reply = Envelope {
        correlation_id: waiter.correlation_id().to_string(),
        send_to: "shared".into(),
        body: Some(b"answer".to_vec()),
        is_reply: true,
        ..Default::default()
    };
    h.dispatcher
        .on_message("shared", &encode(&reply).unwrap())
        .await;

    let got = waiter.wait().await.unwrap();
    assert_eq!(got.body_bytes(), b"answer");
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(h.stats.snapshot().replies_matched, 1);
}

#[tokio::test]
async fn request_sharing_a_pending_id_is_routed_not_resolved() {
    let h = harness();
    let hits = Arc::new(AtomicUsize::new(0));
    h.registry.register("shared", counting(&hits)).unwrap();

    // A request echoing our own outgoing call must not complete it
    let waiter = h.tracker.register(None);
    let request = Envelope::request("shared", b"q".to_vec())
        .with_correlation_id(waiter.correlation_id());
    h.dispatcher
        .on_message("shared", &encode(&request).unwrap())
        .await;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(h.tracker.is_pending(waiter.correlation_id()));
}

#[tokio::test]
async fn handshakes_and_unrouted_topics_are_dropped() {
    let h = harness();
    let hits = Arc::new(AtomicUsize::new(0));
    h.registry.register("jobs", counting(&hits)).unwrap();

    h.dispatcher
        .on_message("jobs", &encode(&Envelope::handshake("jobs")).unwrap())
        .await;
    h.dispatcher
        .on_message(
            "elsewhere",
            &encode(&Envelope::request("elsewhere", b"x".to_vec())).unwrap(),
        )
        .await;

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    let stats = h.stats.snapshot();
    assert_eq!(stats.handshakes_ignored, 1);
    assert_eq!(stats.unrouted_messages, 1);
}

#[tokio::test]
async fn handler_reply_is_published_to_reply_to() {
    let h = harness();
    h.registry
        .register(
            "upper",
            Handler::from_fn(|req| Ok(Some(req.body_bytes().to_ascii_uppercase()))),
        )
        .unwrap();

    // Observe the reply topic with a second client
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let observer = h.cluster.client();
    observer
        .subscribe(
            &["callers.reply.1".to_string()],
            "observer",
            Arc::new(move |_topic: String, payload: Vec<u8>| sink.lock().unwrap().push(payload)),
        )
        .await
        .unwrap();

    let request = Envelope::request("upper", b"abc".to_vec())
        .with_correlation_id("c-7")
        .with_reply_to("callers.reply.1");
    h.dispatcher
        .on_message("upper", &encode(&request).unwrap())
        .await;

    let payloads = seen.lock().unwrap().clone();
    let replies: Vec<Envelope> = payloads
        .iter()
        .map(|p| courier_core::decode(p).unwrap())
        .filter(|e| !e.is_handshake())
        .collect();
    assert_eq!(replies.len(), 1);
    assert!(replies[0].is_reply);
    assert_eq!(replies[0].correlation_id, "c-7");
    assert_eq!(replies[0].body_bytes(), b"ABC");
    assert_eq!(h.stats.snapshot().replies_published, 1);
}

#[tokio::test]
async fn callback_processes_messages_off_the_broker_loop() {
    let h = harness();
    let hits = Arc::new(AtomicUsize::new(0));
    h.registry.register("jobs", counting(&hits)).unwrap();

    let callback = h.dispatcher.callback();
    for _ in 0..3 {
        callback(
            "jobs".to_string(),
            encode(&Envelope::request("jobs", b"x".to_vec())).unwrap(),
        );
    }

    for _ in 0..100 {
        if hits.load(Ordering::SeqCst) == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}
