//! # In-Process Transport
//!
//! A [`Transport`] for several nodes living in one process: tests,
//! simulations and single-binary development clusters. Nodes attached to the
//! same [`InProcessNetwork`] see each other's events exactly as they would
//! over gossip: same envelope, same sender authentication, same fan-out. Only
//! the overlay is replaced, by a broadcast channel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use libp2p::PeerId;
use opentelemetry::Context;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::{DEFAULT_INBOUND_BUFFER, JOB_EVENT_TOPIC};
use crate::crypto;
use crate::identity::NodeIdentity;
use crate::model::JobEvent;
use crate::network::dispatch::{JobEventHandler, SubscriberRegistry};
use crate::network::envelope;
use crate::network::gossip::GossipMessage;
use crate::network::latency::LatencyThresholds;
use crate::network::transport::{deliver_message, Transport, TransportError, TransportState};
use crate::telemetry::{trace_context, TransportObserver};

/// The shared medium in-process nodes attach to.
#[derive(Clone)]
pub struct InProcessNetwork {
    bus: broadcast::Sender<GossipMessage>,
    members: Arc<RwLock<Vec<PeerId>>>,
}

impl Default for InProcessNetwork {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_INBOUND_BUFFER)
    }
}

impl InProcessNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A network whose slowest member may lag `capacity` messages behind
    /// before it starts losing them.
    pub fn with_capacity(capacity: usize) -> Self {
        let (bus, _) = broadcast::channel(capacity.max(1));
        Self {
            bus,
            members: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Peer ids of every attached transport that has not shut down.
    pub fn members(&self) -> Vec<PeerId> {
        self.members.read().clone()
    }
}

/// A transport attached to an [`InProcessNetwork`].
#[derive(Clone)]
pub struct InProcessTransport {
    inner: Arc<Inner>,
}

struct Inner {
    identity: NodeIdentity,
    network: InProcessNetwork,
    inbound: Mutex<Option<broadcast::Receiver<GossipMessage>>>,
    registry: SubscriberRegistry,
    observer: Arc<dyn TransportObserver>,
    latency: LatencyThresholds,
    state: Mutex<TransportState>,
    cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl InProcessTransport {
    /// Attaches a new node to `network`. Events published from this point
    /// on are buffered for it until it starts.
    pub fn new(
        identity: NodeIdentity,
        network: &InProcessNetwork,
        observer: Arc<dyn TransportObserver>,
    ) -> Self {
        Self::with_latency(identity, network, observer, LatencyThresholds::default())
    }

    /// Like [`InProcessTransport::new`], classifying received events with
    /// custom latency thresholds.
    pub fn with_latency(
        identity: NodeIdentity,
        network: &InProcessNetwork,
        observer: Arc<dyn TransportObserver>,
        latency: LatencyThresholds,
    ) -> Self {
        let inbound = network.bus.subscribe();
        network.members.write().push(identity.peer_id());

        Self {
            inner: Arc::new(Inner {
                identity,
                network: network.clone(),
                inbound: Mutex::new(Some(inbound)),
                registry: SubscriberRegistry::new(),
                observer,
                latency,
                state: Mutex::new(TransportState::Configuring),
                cancel: CancellationToken::new(),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> TransportState {
        *self.inner.state.lock()
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.inner.identity.peer_id()
    }
}

#[async_trait]
impl Transport for InProcessTransport {
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

        let inbound = inner.inbound.lock().take();
        let Some(inbound) = inbound else {
            return Err(TransportError::InvalidState(self.state()));
        };
        let listener = tokio::spawn(inner.clone().listen(inbound));
        *inner.listener.lock() = Some(listener);

        debug!(peer = %inner.identity.peer_id(), "in-process transport started");
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
        let local = inner.identity.peer_id();
        inner.network.members.write().retain(|peer| *peer != local);
        drop(inner.inbound.lock().take());

        let listener = inner.listener.lock().take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                warn!(error = %e, "in-process listen task failed");
            }
        }

        inner.observer.shutdown(&local);
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

        let public_key = inner.identity.public_key_bytes();
        event.sender_public_key = public_key.clone();
        let data = envelope::encode(&event, trace_context::inject(cx))?;
        let len = data.len();

        let message = GossipMessage {
            source: inner.identity.peer_id(),
            source_key: Some(public_key),
            data,
        };
        if inner.network.bus.send(message).is_err() {
            trace!("no in-process listeners, event dropped");
        }
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
        let local = self.inner.identity.peer_id();
        let others = self
            .inner
            .network
            .members()
            .into_iter()
            .filter(|peer| *peer != local)
            .collect();
        Ok(HashMap::from([(JOB_EVENT_TOPIC.to_string(), others)]))
    }
}

impl Inner {
    async fn listen(self: Arc<Self>, mut inbound: broadcast::Receiver<GossipMessage>) {
        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                received = inbound.recv() => received,
            };

            match received {
                Ok(message) => {
                    let inner = self.clone();
                    tokio::spawn(async move {
                        deliver_message(
                            message,
                            inner.identity.peer_id(),
                            &inner.latency,
                            &inner.registry,
                            inner.observer.as_ref(),
                        )
                        .await
                    });
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "in-process listener fell behind, events dropped");
                }
                Err(RecvError::Closed) => return,
            }
        }
    }
}
