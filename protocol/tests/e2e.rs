//! End-to-end integration tests for the Conduit job-event transport.
//!
//! Every test runs real libp2p nodes on loopback with OS-assigned ports:
//! TCP, Noise, Yamux and gossipsub all the way down. Gossip meshes take a
//! heartbeat or two to form, so publishers retry until the receiver has
//! something; assertions are about what arrived, never about timing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use parking_lot::Mutex;

use conduit_protocol::config::{TransportConfig, JOB_EVENT_TOPIC};
use conduit_protocol::identity::NodeIdentity;
use conduit_protocol::model::{JobEvent, JobEventType};
use conduit_protocol::network::{
    envelope, GossipNetwork, JobEventHandler, Libp2pTransport, NextError, PeerSet, Transport,
    TransportError, TransportState,
};
use conduit_protocol::telemetry::{TracingObserver, TransportObserver};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

const WAIT: Duration = Duration::from_secs(20);

#[derive(Default)]
struct CountingObserver {
    decode_failures: AtomicUsize,
    rejected: AtomicUsize,
    delivered: AtomicUsize,
    listen_failed: AtomicUsize,
}

impl TransportObserver for CountingObserver {
    fn decode_failed(&self, _source: &libp2p::PeerId, _error: &envelope::EnvelopeError) {
        self.decode_failures.fetch_add(1, Ordering::SeqCst);
    }

    fn sender_rejected(&self, _source: &libp2p::PeerId) {
        self.rejected.fetch_add(1, Ordering::SeqCst);
    }

    fn event_delivered(&self, _event: &JobEvent, _subscribers: usize, _elapsed: Duration) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
    }

    fn listen_failed(&self, _error: &NextError) {
        self.listen_failed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Everything a handler saw: the event and the trace id it was called with.
type Seen = Arc<Mutex<Vec<(JobEvent, TraceId)>>>;

fn recorder(seen: Seen) -> Arc<dyn JobEventHandler> {
    Arc::new(move |cx: Context, event: JobEvent| {
        let seen = seen.clone();
        async move {
            let trace_id = cx.span().span_context().trace_id();
            seen.lock().push((event, trace_id));
        }
    })
}

async fn node(peers: Vec<String>, observer: Arc<dyn TransportObserver>) -> Libp2pTransport {
    let identity = NodeIdentity::generate().expect("identity");
    let config = TransportConfig::local().with_peers(peers);
    Libp2pTransport::new(identity, config, observer)
        .await
        .expect("transport")
}

/// A dialable `/ip4/127.0.0.1/tcp/<port>/p2p/<id>` address for `t`.
async fn dial_addr(t: &Libp2pTransport) -> String {
    let addr = t
        .listen_addrs()
        .await
        .expect("listen addrs")
        .into_iter()
        .next()
        .expect("at least one listen address");
    format!("{addr}/p2p/{}", t.host_id())
}

/// Runs `attempt` every 250ms until `done` holds or [`WAIT`] runs out.
async fn retry_until<A, F, D>(mut attempt: A, done: D)
where
    A: FnMut(usize) -> F,
    F: std::future::Future<Output = ()>,
    D: Fn() -> bool,
{
    tokio::time::timeout(WAIT, async {
        let mut round = 0;
        while !done() {
            attempt(round).await;
            round += 1;
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn remote_span() -> SpanContext {
    SpanContext::new(
        TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
        SpanId::from_hex("00f067aa0ba902b7").unwrap(),
        TraceFlags::SAMPLED,
        true,
        TraceState::default(),
    )
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn event_travels_between_two_nodes() {
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    let seen_a: Seen = Arc::default();
    let a = node(vec![], Arc::new(TracingObserver)).await;
    a.subscribe(recorder(seen_a.clone()));
    a.start().await.unwrap();

    let seen_b: Seen = Arc::default();
    let b = node(vec![dial_addr(&a).await], Arc::new(TracingObserver)).await;
    b.subscribe(recorder(seen_b.clone()));
    b.start().await.unwrap();

    let b_key = b.public_key();
    let cx = Context::new().with_remote_span_context(remote_span());
    retry_until(
        |round| {
            let b = b.clone();
            let cx = cx.clone();
            async move {
                let event = JobEvent::new(JobEventType::Bid, "job-e2e")
                    .with_source_node(b.host_id())
                    .with_shard(round as u32);
                b.publish_with_context(&cx, event).await.unwrap();
            }
        },
        || {
            seen_a
                .lock()
                .iter()
                .any(|(e, _)| e.sender_public_key == b_key)
        },
    )
    .await;

    let seen = seen_a.lock().clone();
    let (event, trace_id) = seen
        .iter()
        .find(|(e, _)| e.sender_public_key == b_key)
        .unwrap();
    assert_eq!(event.job_id, "job-e2e");
    assert_eq!(event.event_name, JobEventType::Bid);
    assert_eq!(event.source_node_id, b.host_id());
    assert_eq!(*trace_id, remote_span().trace_id());

    // The publisher sees its own events too.
    assert!(seen_b.lock().iter().all(|(e, _)| e.sender_public_key == b_key));
    assert!(!seen_b.lock().is_empty());

    b.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nodes_exchange_encrypted_payload_using_gossiped_key() {
    let seen_a: Seen = Arc::default();
    let a = node(vec![], Arc::new(TracingObserver)).await;
    a.subscribe(recorder(seen_a.clone()));
    a.start().await.unwrap();

    let b = node(vec![dial_addr(&a).await], Arc::new(TracingObserver)).await;
    b.subscribe(recorder(Arc::default()));
    b.start().await.unwrap();

    let b_host = b.host_id();
    retry_until(
        |_| {
            let b = b.clone();
            async move {
                let event = JobEvent::new(JobEventType::ResultsProposed, "job-secret")
                    .with_source_node(b.host_id());
                b.publish(event).await.unwrap();
            }
        },
        || seen_a.lock().iter().any(|(e, _)| e.source_node_id == b_host),
    )
    .await;

    // A only knows B's key from the event it received.
    let b_key = seen_a
        .lock()
        .iter()
        .find(|(e, _)| e.source_node_id == b_host)
        .map(|(e, _)| e.sender_public_key.clone())
        .unwrap();

    let ciphertext = a.encrypt(b"proposal: 0xdeadbeef", &b_key).unwrap();
    assert_eq!(b.decrypt(&ciphertext).unwrap(), b"proposal: 0xdeadbeef");
    assert!(matches!(
        a.decrypt(&ciphertext),
        Err(TransportError::Crypto(_))
    ));

    b.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn undecodable_and_forged_messages_never_reach_handlers_as_sent() {
    let observer = Arc::new(CountingObserver::default());
    let seen_a: Seen = Arc::default();
    let a = node(vec![], observer.clone()).await;
    a.subscribe(recorder(seen_a.clone()));
    a.start().await.unwrap();

    // A bare overlay node, free to put anything on the wire.
    let raw_identity = NodeIdentity::generate().unwrap();
    let raw = GossipNetwork::spawn(&raw_identity, &TransportConfig::local())
        .await
        .unwrap();
    raw.connect(&PeerSet::parse(&[dial_addr(&a).await]).unwrap())
        .await
        .unwrap();
    let topic = raw.join(JOB_EVENT_TOPIC).await.unwrap();
    let wire = &topic;

    retry_until(
        move |round| {
            let data = format!("garbage #{round}").into_bytes();
            async move { wire.publish(data).await.unwrap() }
        },
        || observer.decode_failures.load(Ordering::SeqCst) > 0,
    )
    .await;
    assert!(seen_a.lock().is_empty());

    let forged_key = NodeIdentity::generate().unwrap().public_key_bytes();
    let forged = &forged_key;
    retry_until(
        move |round| {
            let mut event = JobEvent::new(JobEventType::BidAccepted, "job-forged")
                .with_shard(round as u32);
            event.sender_public_key = forged.clone();
            let data = envelope::encode(&event, Default::default()).unwrap();
            async move { wire.publish(data).await.unwrap() }
        },
        || {
            observer.delivered.load(Ordering::SeqCst) > 0
                || observer.rejected.load(Ordering::SeqCst) > 0
        },
    )
    .await;

    // Either the key was overridden with the one the overlay vouches for, or
    // the message was dropped. Never delivered with the forged key.
    let raw_key = raw_identity.public_key_bytes();
    for (event, _) in seen_a.lock().iter() {
        assert_eq!(event.sender_public_key, raw_key);
    }

    topic.close().await;
    raw.shutdown().await;
    a.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relayed_event_is_attributed_to_its_publisher() {
    let observer = Arc::new(CountingObserver::default());
    let seen_a: Seen = Arc::default();
    let a = node(vec![], observer.clone()).await;
    a.subscribe(recorder(seen_a.clone()));
    a.start().await.unwrap();

    let b = node(vec![dial_addr(&a).await], Arc::new(TracingObserver)).await;
    b.subscribe(recorder(Arc::default()));
    b.start().await.unwrap();

    // C is connected to B only and leaves its key out of the event, so A can
    // learn it from nothing but the signed gossip message B forwards.
    let c_identity = NodeIdentity::generate().unwrap();
    let c = GossipNetwork::spawn(&c_identity, &TransportConfig::local())
        .await
        .unwrap();
    c.connect(&PeerSet::parse(&[dial_addr(&b).await]).unwrap())
        .await
        .unwrap();
    let topic = c.join(JOB_EVENT_TOPIC).await.unwrap();
    let wire = &topic;

    retry_until(
        move |round| {
            let event =
                JobEvent::new(JobEventType::Bid, "job-relayed").with_shard(round as u32);
            let data = envelope::encode(&event, Default::default()).unwrap();
            async move { wire.publish(data).await.unwrap() }
        },
        || seen_a.lock().iter().any(|(e, _)| e.job_id == "job-relayed"),
    )
    .await;

    let c_key = c_identity.public_key_bytes();
    assert!(seen_a
        .lock()
        .iter()
        .filter(|(e, _)| e.job_id == "job-relayed")
        .all(|(e, _)| e.sender_public_key == c_key));
    assert_eq!(observer.rejected.load(Ordering::SeqCst), 0);

    let c_id = c.local_peer_id();
    let a_peers = a.peers().await.unwrap();
    assert!(a_peers.values().flatten().all(|p| *p != c_id));

    topic.close().await;
    c.shutdown().await;
    b.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_without_handlers_never_joins_the_network() {
    let a = node(vec![], Arc::new(TracingObserver)).await;
    a.subscribe(recorder(Arc::default()));
    a.start().await.unwrap();

    let lonely = node(vec![dial_addr(&a).await], Arc::new(TracingObserver)).await;
    let err = lonely.start().await.unwrap_err();
    assert!(matches!(err, TransportError::Configuration(_)));
    assert_eq!(lonely.state(), TransportState::Configuring);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let lonely_id = lonely.local_peer_id();
    let peers = a.peers().await.unwrap();
    assert!(peers.values().flatten().all(|p| *p != lonely_id));

    lonely.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_bad_peer_address_fails_before_any_dial() {
    let a = node(vec![], Arc::new(TracingObserver)).await;
    a.subscribe(recorder(Arc::default()));
    a.start().await.unwrap();

    let config = TransportConfig::local()
        .with_peers([dial_addr(&a).await, "/ip4/127.0.0.1/tcp/9/p2p/garbage".to_string()]);
    let result =
        Libp2pTransport::new(NodeIdentity::generate().unwrap(), config, Arc::new(TracingObserver))
            .await;
    assert!(matches!(result, Err(TransportError::Address(_))));

    a.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_bootstrap_peer_fails_start() {
    let missing = format!("/ip4/127.0.0.1/tcp/1/p2p/{}", libp2p::PeerId::random());
    let t = node(vec![missing], Arc::new(TracingObserver)).await;
    t.subscribe(recorder(Arc::default()));

    assert!(matches!(t.start().await, Err(TransportError::Connect(_))));
    assert_eq!(t.state(), TransportState::Configuring);
    t.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_shutdown_lets_in_flight_dispatch_finish() {
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let observer = Arc::new(CountingObserver::default());
    let t = node(vec![], observer.clone()).await;
    {
        let started = started.clone();
        let finished = finished.clone();
        t.subscribe(Arc::new(move |_cx: Context, _event: JobEvent| {
            let started = started.clone();
            let finished = finished.clone();
            async move {
                started.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                finished.store(true, Ordering::SeqCst);
            }
        }));
    }
    t.start().await.unwrap();
    t.publish(JobEvent::new(JobEventType::Running, "job-slow"))
        .await
        .unwrap();

    tokio::time::timeout(WAIT, async {
        while !started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let shutdowns: Vec<_> = (0..4)
        .map(|_| {
            let t = t.clone();
            tokio::spawn(async move { t.shutdown().await })
        })
        .collect();
    for result in futures::future::join_all(shutdowns).await {
        result.unwrap().unwrap();
    }
    assert_eq!(t.state(), TransportState::Stopped);

    tokio::time::timeout(WAIT, async {
        while !finished.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("in-flight handler was abandoned");

    // Shutdown stops the listen loop on purpose; that is not a failure.
    assert_eq!(observer.listen_failed.load(Ordering::SeqCst), 0);

    assert!(matches!(
        t.publish(JobEvent::new(JobEventType::Running, "job-late")).await,
        Err(TransportError::InvalidState(TransportState::Stopped))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn persisted_identity_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let config = TransportConfig {
        key_dir: dir.path().to_path_buf(),
        port,
        ..TransportConfig::local()
    };

    let first = Libp2pTransport::from_config(config.clone(), Arc::new(TracingObserver))
        .await
        .unwrap();
    let first_id = first.host_id();
    first.shutdown().await.unwrap();

    let second = Libp2pTransport::from_config(config, Arc::new(TracingObserver))
        .await
        .unwrap();
    assert_eq!(second.host_id(), first_id);
    second.shutdown().await.unwrap();
}
