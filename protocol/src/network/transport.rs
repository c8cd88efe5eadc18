//! # Transport Facade
//!
//! [`Libp2pTransport`] ties the pieces together: identity, bootstrap peers,
//! the gossip channel, the envelope codec, latency monitoring and local
//! dispatch. It is what the rest of a node talks to, through the
//! [`Transport`] trait.
//!
//! ## Lifecycle
//!
//! ```text
//!   Configuring ──start()──> Running ──shutdown()──> Stopped
//!        │                                             ^
//!        └──────────────────shutdown()─────────────────┘
//! ```
//!
//! Handlers are registered while `Configuring`. `start` refuses to run
//! without at least one of them and never dials a peer in that case.
//!
//! ## Inbound path
//!
//! One listen task reads the subscription. Every message gets its own task:
//! decode, authenticate the sender key, classify latency, then fan out to a
//! snapshot of the registered handlers and wait for all of them. Slow
//! handlers on one message never hold up the next.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use libp2p::{Multiaddr, PeerId};
use opentelemetry::Context;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::crypto::{self, OaepError};
use crate::identity::{KeyError, KeyStore, NodeIdentity};
use crate::model::JobEvent;
use crate::network::dispatch::{
    authenticate_sender, dispatch, JobEventHandler, SubscriberRegistry,
};
use crate::network::envelope::{self, EnvelopeError};
use crate::network::gossip::{
    ConnectError, GossipError, GossipMessage, GossipNetwork, GossipTopic, NextError, Subscription,
};
use crate::network::latency::{latency_between, LatencyThresholds};
use crate::network::peers::{AddressError, PeerSet};
use crate::telemetry::{trace_context, TransportObserver};

// ---------------------------------------------------------------------------
// Errors & State
// ---------------------------------------------------------------------------

/// Errors surfaced by a [`Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport was wired up wrong. Fix the calling code.
    #[error("transport misconfigured: {0}")]
    Configuration(String),

    #[error("operation not allowed while transport is {0}")]
    InvalidState(TransportState),

    #[error("node key error: {0}")]
    Key(#[from] KeyError),

    #[error("bad peer address: {0}")]
    Address(#[from] AddressError),

    #[error("bootstrap connection failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("gossip error: {0}")]
    Gossip(#[from] GossipError),

    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("point-to-point crypto error: {0}")]
    Crypto(#[from] OaepError),
}

/// Where a transport is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Configuring,
    Running,
    Stopped,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuring => write!(f, "configuring"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// A job-event transport: broadcast, local fan-out and point-to-point
/// encryption between nodes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// This node's id on the network.
    fn host_id(&self) -> String;

    /// Protobuf encoding of this node's public key; what other nodes pass
    /// to [`Transport::encrypt`] to reach us.
    fn public_key(&self) -> Vec<u8>;

    /// Registers a local consumer of job events.
    fn subscribe(&self, handler: Arc<dyn JobEventHandler>);

    /// Connects to the bootstrap peers and starts delivering events.
    async fn start(&self) -> Result<(), TransportError>;

    /// Stops delivery and releases network resources. Idempotent.
    async fn shutdown(&self) -> Result<(), TransportError>;

    /// Broadcasts `event` under the caller's current trace context.
    async fn publish(&self, event: JobEvent) -> Result<(), TransportError> {
        let cx = Context::current();
        self.publish_with_context(&cx, event).await
    }

    /// Broadcasts `event`, propagating `cx` to every receiver.
    async fn publish_with_context(&self, cx: &Context, event: JobEvent)
        -> Result<(), TransportError>;

    /// Encrypts `data` so only the holder of `recipient_key` can read it.
    fn encrypt(&self, data: &[u8], recipient_key: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Decrypts a payload encrypted for this node.
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Peers known to be subscribed to each topic.
    async fn peers(&self) -> Result<HashMap<String, Vec<PeerId>>, TransportError>;
}

// ---------------------------------------------------------------------------
// Libp2pTransport
// ---------------------------------------------------------------------------

/// The gossipsub-backed transport. Cheap to clone; clones share one node.
#[derive(Clone)]
pub struct Libp2pTransport {
    inner: Arc<Inner>,
}

struct Inner {
    identity: NodeIdentity,
    config: TransportConfig,
    bootstrap: PeerSet,
    network: GossipNetwork,
    topic: GossipTopic,
    subscription: Mutex<Option<Subscription>>,
    registry: SubscriberRegistry,
    observer: Arc<dyn TransportObserver>,
    state: Mutex<TransportState>,
    cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Libp2pTransport {
    /// Builds a transport around an existing identity.
    ///
    /// The peer list is parsed up front; a single bad address fails here,
    /// before anything is dialled. The overlay starts listening and joins
    /// the job-event topic, but no peer is contacted until
    /// [`Transport::start`].
    pub async fn new(
        identity: NodeIdentity,
        config: TransportConfig,
        observer: Arc<dyn TransportObserver>,
    ) -> Result<Self, TransportError> {
        let bootstrap = PeerSet::parse(&config.peers)?;

        let network = GossipNetwork::spawn(&identity, &config).await?;
        let topic = match network.join(config.topic.clone()).await {
            Ok(topic) => topic,
            Err(e) => {
                network.shutdown().await;
                return Err(e.into());
            }
        };
        let subscription = topic.subscribe()?;

        debug!(
            peer = %identity.peer_id(),
            topic = %config.topic,
            bootstrap_peers = bootstrap.len(),
            "transport configured"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                identity,
                config,
                bootstrap,
                network,
                topic,
                subscription: Mutex::new(Some(subscription)),
                registry: SubscriberRegistry::new(),
                observer,
                state: Mutex::new(TransportState::Configuring),
                cancel: CancellationToken::new(),
                listener: Mutex::new(None),
            }),
        })
    }

    /// Builds a transport whose identity is loaded from (or created in) the
    /// configured key directory, keyed by the listening port.
    ///
    /// Port 0 is rejected: every OS-assigned-port node would resolve the same
    /// `private_key.0` and end up with one shared `PeerId`. Use
    /// [`Libp2pTransport::new`] with a fresh identity for ephemeral nodes.
    pub async fn from_config(
        config: TransportConfig,
        observer: Arc<dyn TransportObserver>,
    ) -> Result<Self, TransportError> {
        if config.port == 0 {
            return Err(TransportError::Configuration(
                "a persisted identity needs a fixed port; port 0 would share one key".to_string(),
            ));
        }
        let identity = KeyStore::new(config.key_dir.clone()).load_or_create(&config.key_ref())?;
        Self::new(identity, config, observer).await
    }

    pub fn state(&self) -> TransportState {
        *self.inner.state.lock()
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.inner.identity.peer_id()
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.inner.identity
    }

    /// Addresses the overlay listens on, without the `/p2p` suffix.
    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>, TransportError> {
        Ok(self.inner.network.listen_addrs().await?)
    }
}

#[async_trait]
impl Transport for Libp2pTransport {
    fn host_id(&self) -> String {
        self.inner.identity.peer_id().to_string()
    }

    fn public_key(&self) -> Vec<u8> {
        self.inner.identity.public_key_bytes()
    }

    fn subscribe(&self, handler: Arc<dyn JobEventHandler>) {
        self.inner.registry.register(handler);
    }

    async fn start(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if *state != TransportState::Configuring {
                return Err(TransportError::InvalidState(*state));
            }
            if inner.registry.is_empty() {
                return Err(TransportError::Configuration(
                    "start called with no job event handlers registered".to_string(),
                ));
            }
            *state = TransportState::Running;
        }

        if let Err(e) = inner.network.connect(&inner.bootstrap).await {
            let mut state = inner.state.lock();
            if *state == TransportState::Running {
                *state = TransportState::Configuring;
            }
            return Err(e.into());
        }
        for peer in &inner.bootstrap {
            inner.observer.peer_connected(&peer.peer_id, &peer.addrs);
        }

        let subscription = inner.subscription.lock().take();
        let Some(subscription) = subscription else {
            return Err(TransportError::InvalidState(self.state()));
        };
        let listener = tokio::spawn(inner.clone().listen(subscription));
        *inner.listener.lock() = Some(listener);

        info!(
            peer = %inner.identity.peer_id(),
            peers = inner.bootstrap.len(),
            handlers = inner.registry.len(),
            "transport started"
        );
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if *state == TransportState::Stopped {
                return Ok(());
            }
            *state = TransportState::Stopped;
        }

        inner.cancel.cancel();
        inner.topic.close().await;

        let listener = inner.listener.lock().take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                warn!(error = %e, "listen task failed");
            }
        }

        inner.network.shutdown().await;
        inner.observer.shutdown(&inner.identity.peer_id());
        Ok(())
    }

    async fn publish_with_context(
        &self,
        cx: &Context,
        mut event: JobEvent,
    ) -> Result<(), TransportError> {
        let inner = &self.inner;
        let state = *inner.state.lock();
        if state == TransportState::Stopped {
            return Err(TransportError::InvalidState(state));
        }

        event.sender_public_key = inner.identity.public_key_bytes();
        let bytes = envelope::encode(&event, trace_context::inject(cx))?;
        let len = bytes.len();

        inner.topic.publish(bytes).await?;
        inner.observer.event_published(&event, len);
        Ok(())
    }

    fn encrypt(&self, data: &[u8], recipient_key: &[u8]) -> Result<Vec<u8>, TransportError> {
        Ok(crypto::encrypt(data, recipient_key)?)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        Ok(crypto::decrypt(data, &self.inner.identity)?)
    }

    async fn peers(&self) -> Result<HashMap<String, Vec<PeerId>>, TransportError> {
        Ok(self.inner.network.peers().await?)
    }
}

impl Inner {
    async fn listen(self: Arc<Self>, mut subscription: Subscription) {
        loop {
            match subscription.next(&self.cancel).await {
                Ok(message) => {
                    let inner = self.clone();
                    tokio::spawn(async move { inner.process_message(message).await });
                }
                Err(NextError::Cancelled) => {
                    trace!("listen loop cancelled");
                    return;
                }
                Err(e) => {
                    if self.cancel.is_cancelled() {
                        trace!("listen loop stopped during shutdown");
                    } else {
                        self.observer.listen_failed(&e);
                    }
                    return;
                }
            }
        }
    }

    async fn process_message(&self, message: GossipMessage) {
        deliver_message(
            message,
            self.identity.peer_id(),
            &self.config.latency,
            &self.registry,
            self.observer.as_ref(),
        )
        .await;
    }
}

/// The inbound path of one message: decode, authenticate the sender key,
/// classify latency, fan out and wait for every handler.
pub(crate) async fn deliver_message(
    message: GossipMessage,
    local: PeerId,
    thresholds: &LatencyThresholds,
    registry: &SubscriberRegistry,
    observer: &dyn TransportObserver,
) {
    let envelope = match envelope::decode(&message.data) {
        Ok(envelope) => envelope,
        Err(e) => {
            observer.decode_failed(&message.source, &e);
            return;
        }
    };

    let mut event = envelope.job_event;
    let Some(sender_key) = authenticate_sender(
        &message.source,
        message.source_key.as_deref(),
        &event.sender_public_key,
    ) else {
        observer.sender_rejected(&message.source);
        return;
    };
    event.sender_public_key = sender_key;

    let latency = latency_between(envelope.sent_time, Utc::now());
    observer.message_received(&local, &event, latency, thresholds.classify_delay(latency));

    let cx = trace_context::extract(&envelope.trace_data);
    let handlers = registry.snapshot_all();
    let subscribers = handlers.len();
    let started = Instant::now();
    dispatch(handlers, cx, event.clone()).await;
    observer.event_delivered(&event, subscribers, started.elapsed());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobEventType;
    use crate::telemetry::TracingObserver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn transport(config: TransportConfig) -> Libp2pTransport {
        let identity = NodeIdentity::generate().unwrap();
        Libp2pTransport::new(identity, config, Arc::new(TracingObserver))
            .await
            .unwrap()
    }

    fn noop_handler() -> Arc<dyn JobEventHandler> {
        Arc::new(|_cx: Context, _event: JobEvent| async {})
    }

    #[tokio::test]
    async fn from_config_refuses_an_ephemeral_port() {
        let dir = tempfile::tempdir().unwrap();
        let config = TransportConfig {
            key_dir: dir.path().to_path_buf(),
            ..TransportConfig::local()
        };

        let err = Libp2pTransport::from_config(config, Arc::new(TracingObserver))
            .await
            .err()
            .expect("port 0 must be rejected");
        assert!(matches!(err, TransportError::Configuration(_)));
        assert!(!dir.path().join("private_key.0").exists());
    }

    #[tokio::test]
    async fn start_without_handlers_is_a_configuration_error() {
        // The peer is unreachable: a dial attempt would surface as Connect.
        let peer = format!("/ip4/127.0.0.1/tcp/1/p2p/{}", PeerId::random());
        let t = transport(TransportConfig::local().with_peers([peer])).await;

        let err = t.start().await.unwrap_err();
        assert!(matches!(err, TransportError::Configuration(_)));
        assert_eq!(t.state(), TransportState::Configuring);

        t.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn bad_peer_address_fails_construction() {
        let identity = NodeIdentity::generate().unwrap();
        let config = TransportConfig::local().with_peers(["/ip4/127.0.0.1/tcp/1"]);
        let result = Libp2pTransport::new(identity, config, Arc::new(TracingObserver)).await;
        assert!(matches!(result, Err(TransportError::Address(_))));
    }

    #[tokio::test]
    async fn state_machine_transitions() {
        let t = transport(TransportConfig::local()).await;
        t.subscribe(noop_handler());

        t.start().await.unwrap();
        assert_eq!(t.state(), TransportState::Running);
        assert!(matches!(
            t.start().await,
            Err(TransportError::InvalidState(TransportState::Running))
        ));

        t.shutdown().await.unwrap();
        t.shutdown().await.unwrap();
        assert_eq!(t.state(), TransportState::Stopped);
        assert!(matches!(
            t.start().await,
            Err(TransportError::InvalidState(TransportState::Stopped))
        ));
        assert!(matches!(
            t.publish(JobEvent::new(JobEventType::Created, "late")).await,
            Err(TransportError::InvalidState(TransportState::Stopped))
        ));
    }

    #[tokio::test]
    async fn own_events_reach_local_handlers_with_own_key() {
        let t = transport(TransportConfig::local()).await;
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));
        {
            let received = received.clone();
            let count = count.clone();
            t.subscribe(Arc::new(move |_cx: Context, event: JobEvent| {
                let received = received.clone();
                let count = count.clone();
                async move {
                    received.lock().push(event);
                    count.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        t.start().await.unwrap();

        let mut event = JobEvent::new(JobEventType::Created, "job-loop");
        event.sender_public_key = b"forged".to_vec();
        t.publish(event).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while count.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let received = received.lock().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].job_id, "job-loop");
        assert_eq!(received[0].sender_public_key, t.public_key());

        t.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn encrypt_to_self_round_trips() {
        let t = transport(TransportConfig::local()).await;
        let ciphertext = t.encrypt(b"deal terms", &t.public_key()).unwrap();
        assert_eq!(t.decrypt(&ciphertext).unwrap(), b"deal terms");
        assert!(matches!(
            t.encrypt(b"x", b"not a key"),
            Err(TransportError::Crypto(OaepError::KeyFormat(_)))
        ));
        t.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn host_id_matches_identity() {
        let t = transport(TransportConfig::local()).await;
        assert_eq!(t.host_id(), t.local_peer_id().to_string());
        t.shutdown().await.unwrap();
    }
}
