//! # Gossip Channel
//!
//! The libp2p side of the transport. A single driver task owns the
//! [`Swarm`]; everything else talks to it through a command channel with
//! `oneshot` replies, so no lock ever guards the swarm.
//!
//! ```text
//!  GossipNetwork ──┐                       ┌──> Subscription (per topic)
//!  GossipTopic   ──┼── mpsc<Command> ──> driver ── bounded mpsc<GossipMessage>
//!                  │                       │
//!                  └── oneshot replies <───┘
//! ```
//!
//! ## Overlay
//!
//! TCP + Noise + Yamux, gossipsub with signed messages and strict validation,
//! peer exchange and peer scoring, plus identify so the driver learns the
//! public key of every directly connected peer. Publishers that are only
//! reachable through a relay are covered by the key every signed message
//! carries, recorded as it arrives. Message ids are the BLAKE3 hash of the
//! payload.
//!
//! ## Delivery
//!
//! Every member receives every message on a topic it joined, its own
//! included: a publish is looped back to the local subscription. Inbound
//! messages go through a bounded buffer; if the listener falls behind, new
//! messages are dropped with a warning.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic, MessageId, PublishError, TopicHash};
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{DialError, NetworkBehaviour, SwarmEvent};
use libp2p::{identify, noise, tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{
    TransportConfig, COMMAND_CHANNEL_CAPACITY, GOSSIP_DUPLICATE_CACHE_TIME,
    GOSSIP_MAX_TRANSMIT_SIZE, IDENTIFY_PROTOCOL_VERSION, IDLE_CONNECTION_TIMEOUT,
    PEER_SCORE_FAST_DECAY, PEER_SCORE_SLOW_DECAY, SIGNED_KEY_CACHE_CAPACITY,
};
use crate::identity::NodeIdentity;
use crate::network::dispatch::key_matches_peer;
use crate::network::peers::{PeerAddr, PeerSet};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from building or operating the gossip overlay.
#[derive(Debug, Error)]
pub enum GossipError {
    #[error("failed to build libp2p transport: {0}")]
    Transport(String),

    #[error("failed to build network behaviour: {0}")]
    Behaviour(String),

    #[error("failed to listen: {0}")]
    Listen(String),

    #[error("no listen address was bound in time")]
    ListenTimeout,

    #[error("topic {0:?} is already joined")]
    AlreadyJoined(String),

    #[error("topic {0:?} already has a subscription")]
    AlreadySubscribed(String),

    #[error("failed to subscribe to {topic:?}: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("failed to publish to {topic:?}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("topic {0:?} is closed")]
    TopicClosed(String),

    #[error("gossip driver has stopped")]
    DriverStopped,
}

/// A bootstrap peer could not be reached.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to dial {peer}: {reason}")]
    Dial { peer: PeerId, reason: String },

    #[error("timed out after {after:?} connecting to {peer}")]
    Timeout { peer: PeerId, after: Duration },

    #[error("gossip driver has stopped")]
    DriverStopped,
}

/// Why [`Subscription::next`] returned without a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NextError {
    /// The caller's cancellation token fired. A clean exit.
    #[error("subscription cancelled")]
    Cancelled,

    /// The topic was closed or the driver stopped. No more messages will
    /// ever arrive.
    #[error("subscription closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Messages & Commands
// ---------------------------------------------------------------------------

/// One message received on a topic.
#[derive(Debug, Clone)]
pub struct GossipMessage {
    /// Originating peer, as verified by the gossipsub message signature.
    pub source: PeerId,
    /// Protobuf public key of `source`, when the driver has learned it
    /// through identify or from a signed message of that peer (or it is this
    /// node's own message).
    pub source_key: Option<Vec<u8>>,
    pub data: Vec<u8>,
}

enum Command {
    Dial {
        peer: PeerAddr,
        reply: oneshot::Sender<Result<(), ConnectError>>,
    },
    Join {
        topic: String,
        buffer: usize,
        reply: oneshot::Sender<Result<mpsc::Receiver<GossipMessage>, GossipError>>,
    },
    Leave {
        topic: String,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), GossipError>>,
    },
    /// A caller stopped waiting for a dial to `peer`.
    CancelDial {
        peer: PeerId,
    },
    Peers {
        reply: oneshot::Sender<HashMap<String, Vec<PeerId>>>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ---------------------------------------------------------------------------
// Behaviour
// ---------------------------------------------------------------------------

/// Records the public key that signed gossip messages carry for publishers
/// whose `PeerId` cannot inline it (RSA). Payloads pass through unchanged.
///
/// Runs before gossipsub checks the signature, so a key is only kept when it
/// hashes to the claimed source: a forged message can never plant a key for
/// someone else.
#[derive(Clone, Default)]
struct SignedKeyCapture {
    keys: Arc<Mutex<HashMap<PeerId, Vec<u8>>>>,
}

impl SignedKeyCapture {
    fn get(&self, peer: &PeerId) -> Option<Vec<u8>> {
        self.keys.lock().get(peer).cloned()
    }

    fn record(&self, peer: PeerId, key: &[u8]) {
        if !key_matches_peer(key, &peer) {
            return;
        }
        let mut keys = self.keys.lock();
        if !keys.contains_key(&peer) && keys.len() >= SIGNED_KEY_CACHE_CAPACITY {
            let evicted = keys.keys().next().copied();
            if let Some(evicted) = evicted {
                keys.remove(&evicted);
            }
        }
        keys.insert(peer, key.to_vec());
    }
}

impl gossipsub::DataTransform for SignedKeyCapture {
    fn inbound_transform(
        &self,
        raw: gossipsub::RawMessage,
    ) -> Result<gossipsub::Message, io::Error> {
        if let (Some(source), Some(key)) = (raw.source, raw.key.as_deref()) {
            self.record(source, key);
        }
        Ok(gossipsub::Message {
            source: raw.source,
            data: raw.data,
            sequence_number: raw.sequence_number,
            topic: raw.topic,
        })
    }

    fn outbound_transform(&self, _topic: &TopicHash, data: Vec<u8>) -> Result<Vec<u8>, io::Error> {
        Ok(data)
    }
}

#[derive(NetworkBehaviour)]
struct ConduitBehaviour {
    gossipsub: gossipsub::Behaviour<SignedKeyCapture>,
    identify: identify::Behaviour,
}

impl ConduitBehaviour {
    fn new(
        key: &Keypair,
        config: &TransportConfig,
        signed_keys: SignedKeyCapture,
    ) -> Result<Self, GossipError> {
        let identify = identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL_VERSION.to_string(),
            key.public(),
        ));

        Ok(Self {
            gossipsub: build_gossipsub(key, config, signed_keys)?,
            identify,
        })
    }
}

fn build_gossipsub(
    key: &Keypair,
    config: &TransportConfig,
    signed_keys: SignedKeyCapture,
) -> Result<gossipsub::Behaviour<SignedKeyCapture>, GossipError> {
    let mut builder = gossipsub::ConfigBuilder::default();
    builder
        .validation_mode(gossipsub::ValidationMode::Strict)
        .heartbeat_interval(config.heartbeat_interval)
        .duplicate_cache_time(GOSSIP_DUPLICATE_CACHE_TIME)
        .max_transmit_size(GOSSIP_MAX_TRANSMIT_SIZE)
        .do_px()
        .message_id_fn(|message| {
            MessageId::from(blake3::hash(&message.data).to_hex().to_string())
        });

    let gossip_config = builder
        .build()
        .map_err(|e| GossipError::Behaviour(format!("gossipsub config: {e:?}")))?;

    let mut behaviour = gossipsub::Behaviour::new_with_transform(
        gossipsub::MessageAuthenticity::Signed(key.clone()),
        gossip_config,
        None,
        signed_keys,
    )
    .map_err(|e| GossipError::Behaviour(format!("gossipsub: {e}")))?;

    behaviour
        .with_peer_score(
            build_peer_score_params(&config.topic),
            build_peer_score_thresholds(config.peer_gate_threshold),
        )
        .map_err(|e| GossipError::Behaviour(format!("peer score: {e}")))?;

    Ok(behaviour)
}

/// Misbehaving peers are penalised quickly and forgiven slowly: behaviour
/// penalties fade over [`PEER_SCORE_FAST_DECAY`], invalid deliveries over
/// [`PEER_SCORE_SLOW_DECAY`].
fn build_peer_score_params(topic: &str) -> gossipsub::PeerScoreParams {
    let mut params = gossipsub::PeerScoreParams::default();
    params.behaviour_penalty_weight = -1.0;
    params.behaviour_penalty_threshold = 1.0;
    params.behaviour_penalty_decay = gossipsub::score_parameter_decay(PEER_SCORE_FAST_DECAY);

    let mut topic_params = gossipsub::TopicScoreParams::default();
    // Job events are sparse; a quiet mesh peer is not a misbehaving one.
    topic_params.mesh_message_deliveries_weight = 0.0;
    topic_params.mesh_failure_penalty_weight = 0.0;
    topic_params.invalid_message_deliveries_weight = -10.0;
    topic_params.invalid_message_deliveries_decay =
        gossipsub::score_parameter_decay(PEER_SCORE_SLOW_DECAY);
    params
        .topics
        .insert(IdentTopic::new(topic.to_string()).hash(), topic_params);
    params
}

fn build_peer_score_thresholds(gate: f64) -> gossipsub::PeerScoreThresholds {
    let gate = gate.min(0.0);
    gossipsub::PeerScoreThresholds {
        gossip_threshold: gate,
        publish_threshold: gate * 2.0,
        graylist_threshold: gate * 3.0,
        accept_px_threshold: 10.0,
        opportunistic_graft_threshold: 5.0,
    }
}

// ---------------------------------------------------------------------------
// GossipNetwork
// ---------------------------------------------------------------------------

/// Handle to the running overlay. Dropping it does not stop the driver;
/// call [`GossipNetwork::shutdown`].
pub struct GossipNetwork {
    local_peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    driver: Mutex<Option<JoinHandle<()>>>,
    connect_timeout: Duration,
    inbound_buffer: usize,
}

impl GossipNetwork {
    /// Builds the swarm, binds the listen address and starts the driver.
    ///
    /// Returns once the first listen address is bound, so the node is
    /// reachable as soon as this resolves.
    pub async fn spawn(
        identity: &NodeIdentity,
        config: &TransportConfig,
    ) -> Result<Self, GossipError> {
        let signed_keys = SignedKeyCapture::default();
        let capture = signed_keys.clone();
        let mut swarm = SwarmBuilder::with_existing_identity(identity.keypair().clone())
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| GossipError::Transport(e.to_string()))?
            .with_behaviour(move |key| {
                ConduitBehaviour::new(key, config, capture)
                    .map_err(|e| Box::<dyn std::error::Error + Send + Sync>::from(e))
            })
            .map_err(|e| GossipError::Behaviour(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
            .build();

        let listen_addr = Multiaddr::from(config.listen_host).with(Protocol::Tcp(config.port));
        swarm
            .listen_on(listen_addr.clone())
            .map_err(|e| GossipError::Listen(format!("{listen_addr}: {e}")))?;

        let bound = tokio::time::timeout(config.connect_timeout, first_listen_addr(&mut swarm))
            .await
            .map_err(|_| GossipError::ListenTimeout)??;

        let local_peer_id = *swarm.local_peer_id();
        info!(peer = %local_peer_id, addr = %bound, "gossip overlay listening");

        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let driver = Driver {
            swarm,
            local_key: identity.public_key_bytes(),
            topics: HashMap::new(),
            known_keys: HashMap::new(),
            signed_keys,
            pending_dials: HashMap::new(),
        };
        let handle = tokio::spawn(driver.run(command_rx));

        Ok(Self {
            local_peer_id,
            commands,
            driver: Mutex::new(Some(handle)),
            connect_timeout: config.connect_timeout,
            inbound_buffer: config.inbound_buffer.max(1),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Connects to every peer in `peers`, one after another. The first
    /// failure aborts the rest; already connected peers succeed at once.
    pub async fn connect(&self, peers: &PeerSet) -> Result<(), ConnectError> {
        for peer in peers {
            let peer_id = peer.peer_id;
            let (reply, rx) = oneshot::channel();
            self.commands
                .send(Command::Dial {
                    peer: peer.clone(),
                    reply,
                })
                .await
                .map_err(|_| ConnectError::DriverStopped)?;

            let outcome = tokio::time::timeout(self.connect_timeout, rx).await;
            match outcome {
                Ok(Ok(result)) => result?,
                Ok(Err(_)) => return Err(ConnectError::DriverStopped),
                Err(_) => {
                    // The reply receiver is gone; let the driver forget it.
                    let _ = self
                        .commands
                        .send(Command::CancelDial { peer: peer_id })
                        .await;
                    return Err(ConnectError::Timeout {
                        peer: peer_id,
                        after: self.connect_timeout,
                    })
                }
            }
        }
        Ok(())
    }

    /// Joins `topic`, subscribing this node to it in the overlay.
    pub async fn join(&self, topic: impl Into<String>) -> Result<GossipTopic, GossipError> {
        let name = topic.into();
        let inbound = request(&self.commands, |reply| Command::Join {
            topic: name.clone(),
            buffer: self.inbound_buffer,
            reply,
        })
        .await??;

        debug!(topic = %name, "joined gossip topic");
        Ok(GossipTopic {
            name,
            commands: self.commands.clone(),
            inbound: Mutex::new(Some(inbound)),
            closed: AtomicBool::new(false),
        })
    }

    /// Peers known to be subscribed to each topic. Every topic this node
    /// joined is listed, with an empty list while nobody else is on it.
    pub async fn peers(&self) -> Result<HashMap<String, Vec<PeerId>>, GossipError> {
        request(&self.commands, |reply| Command::Peers { reply }).await
    }

    /// Every address the swarm currently listens on.
    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>, GossipError> {
        request(&self.commands, |reply| Command::ListenAddrs { reply }).await
    }

    /// Stops the driver and closes every connection. Safe to call more
    /// than once.
    pub async fn shutdown(&self) {
        let handle = self.driver.lock().take();
        let Some(handle) = handle else {
            return;
        };

        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = handle.await {
            warn!(error = %e, "gossip driver task failed");
        }
    }
}

async fn first_listen_addr(
    swarm: &mut Swarm<ConduitBehaviour>,
) -> Result<Multiaddr, GossipError> {
    loop {
        match swarm.select_next_some().await {
            SwarmEvent::NewListenAddr { address, .. } => return Ok(address),
            SwarmEvent::ListenerError { error, .. } => {
                return Err(GossipError::Listen(error.to_string()))
            }
            SwarmEvent::ListenerClosed {
                reason: Err(error), ..
            } => return Err(GossipError::Listen(error.to_string())),
            other => trace!(?other, "swarm event before listening"),
        }
    }
}

async fn request<T>(
    commands: &mpsc::Sender<Command>,
    command: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> Result<T, GossipError> {
    let (reply, rx) = oneshot::channel();
    commands
        .send(command(reply))
        .await
        .map_err(|_| GossipError::DriverStopped)?;
    rx.await.map_err(|_| GossipError::DriverStopped)
}

// ---------------------------------------------------------------------------
// GossipTopic & Subscription
// ---------------------------------------------------------------------------

/// A joined topic. Publishing is open to any number of callers; exactly one
/// [`Subscription`] can be taken from it.
pub struct GossipTopic {
    name: String,
    commands: mpsc::Sender<Command>,
    inbound: Mutex<Option<mpsc::Receiver<GossipMessage>>>,
    closed: AtomicBool,
}

impl GossipTopic {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Broadcasts `data` to every member of the topic, this node included.
    ///
    /// Having no remote peers yet is not an error: the first node of a
    /// cluster publishes into the void until others join.
    pub async fn publish(&self, data: Vec<u8>) -> Result<(), GossipError> {
        if self.is_closed() {
            return Err(GossipError::TopicClosed(self.name.clone()));
        }
        request(&self.commands, |reply| Command::Publish {
            topic: self.name.clone(),
            data,
            reply,
        })
        .await?
    }

    /// Takes the receiving side of the topic. Only the first call succeeds.
    pub fn subscribe(&self) -> Result<Subscription, GossipError> {
        if self.is_closed() {
            return Err(GossipError::TopicClosed(self.name.clone()));
        }
        let inbound = self
            .inbound
            .lock()
            .take()
            .ok_or_else(|| GossipError::AlreadySubscribed(self.name.clone()))?;
        Ok(Subscription {
            topic: self.name.clone(),
            inbound,
        })
    }

    /// Leaves the topic. A pending [`Subscription::next`] returns
    /// [`NextError::Closed`]; later publishes fail.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // The driver may already be gone during shutdown; nothing to leave then.
        let _ = self
            .commands
            .send(Command::Leave {
                topic: self.name.clone(),
            })
            .await;
        debug!(topic = %self.name, "left gossip topic");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// The receiving side of a topic.
pub struct Subscription {
    topic: String,
    inbound: mpsc::Receiver<GossipMessage>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next message. Cancellation takes priority over a
    /// message that is already buffered.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<GossipMessage, NextError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NextError::Cancelled),
            message = self.inbound.recv() => message.ok_or(NextError::Closed),
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

struct Driver {
    swarm: Swarm<ConduitBehaviour>,
    /// Protobuf public key of this node, attached to looped-back messages.
    local_key: Vec<u8>,
    topics: HashMap<TopicHash, mpsc::Sender<GossipMessage>>,
    /// Public keys learned through identify, by peer.
    known_keys: HashMap<PeerId, Vec<u8>>,
    /// Public keys taken from signed messages, shared with the gossipsub
    /// inbound transform.
    signed_keys: SignedKeyCapture,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), ConnectError>>>>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
            }
        }

        for (peer, waiters) in self.pending_dials.drain() {
            trace!(%peer, waiters = waiters.len(), "abandoning pending dial");
        }
        debug!(peer = %self.swarm.local_peer_id(), "gossip driver stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial { peer, reply } => self.dial(peer, reply),
            Command::Join {
                topic,
                buffer,
                reply,
            } => {
                let _ = reply.send(self.join(topic, buffer));
            }
            Command::Leave { topic } => self.leave(&topic),
            Command::CancelDial { peer } => {
                prune_abandoned_dials(&mut self.pending_dials, &peer);
            }
            Command::Publish { topic, data, reply } => {
                let _ = reply.send(self.publish(topic, data));
            }
            Command::Peers { reply } => {
                let mut peers: HashMap<String, Vec<PeerId>> = self
                    .topics
                    .keys()
                    .map(|topic| (topic.as_str().to_string(), Vec::new()))
                    .collect();
                for (peer, topics) in self.swarm.behaviour().gossipsub.all_peers() {
                    for topic in topics {
                        peers.entry(topic.as_str().to_string()).or_default().push(*peer);
                    }
                }
                let _ = reply.send(peers);
            }
            Command::ListenAddrs { reply } => {
                let _ = reply.send(self.swarm.listeners().cloned().collect());
            }
            Command::Shutdown { reply } => {
                // Handled by the run loop.
                let _ = reply.send(());
            }
        }
    }

    fn dial(&mut self, peer: PeerAddr, reply: oneshot::Sender<Result<(), ConnectError>>) {
        let peer_id = peer.peer_id;
        if self.swarm.is_connected(&peer_id) {
            let _ = reply.send(Ok(()));
            return;
        }

        prune_abandoned_dials(&mut self.pending_dials, &peer_id);
        let opts = DialOpts::peer_id(peer_id).addresses(peer.addrs).build();
        match self.swarm.dial(opts) {
            Ok(()) | Err(DialError::DialPeerConditionFalse(_)) => {
                self.pending_dials.entry(peer_id).or_default().push(reply);
            }
            Err(e) => {
                let _ = reply.send(Err(ConnectError::Dial {
                    peer: peer_id,
                    reason: e.to_string(),
                }));
            }
        }
    }

    fn join(
        &mut self,
        topic: String,
        buffer: usize,
    ) -> Result<mpsc::Receiver<GossipMessage>, GossipError> {
        let ident = IdentTopic::new(topic.clone());
        if self.topics.contains_key(&ident.hash()) {
            return Err(GossipError::AlreadyJoined(topic));
        }

        self.swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&ident)
            .map_err(|e| GossipError::Subscribe {
                topic: topic.clone(),
                reason: format!("{e:?}"),
            })?;

        let (tx, rx) = mpsc::channel(buffer);
        self.topics.insert(ident.hash(), tx);
        Ok(rx)
    }

    fn leave(&mut self, topic: &str) {
        let ident = IdentTopic::new(topic.to_string());
        self.topics.remove(&ident.hash());
        if let Err(e) = self.swarm.behaviour_mut().gossipsub.unsubscribe(&ident) {
            debug!(topic, error = %e, "gossipsub unsubscribe failed");
        }
    }

    fn publish(&mut self, topic: String, data: Vec<u8>) -> Result<(), GossipError> {
        let ident = IdentTopic::new(topic.clone());
        let loopback = self.topics.contains_key(&ident.hash()).then(|| data.clone());

        match self.swarm.behaviour_mut().gossipsub.publish(ident.clone(), data) {
            Ok(_) => {}
            Err(PublishError::InsufficientPeers) => {
                debug!(topic = %topic, "no gossip peers yet, message stays local");
            }
            Err(e) => {
                return Err(GossipError::Publish {
                    topic,
                    reason: e.to_string(),
                })
            }
        }

        if let Some(data) = loopback {
            let message = GossipMessage {
                source: *self.swarm.local_peer_id(),
                source_key: Some(self.local_key.clone()),
                data,
            };
            self.deliver(&ident.hash(), message);
        }
        Ok(())
    }

    fn deliver(&mut self, topic: &TopicHash, message: GossipMessage) {
        let Some(inbound) = self.topics.get(topic) else {
            trace!(topic = %topic, "message for a topic we left");
            return;
        };

        match inbound.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                warn!(
                    topic = %topic,
                    source = %message.source,
                    "inbound gossip buffer full, dropping message"
                );
            }
            Err(TrySendError::Closed(_)) => {
                trace!(topic = %topic, "subscription dropped, discarding message");
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<ConduitBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "new listen address");
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                debug!(peer = %peer_id, addr = %endpoint.get_remote_address(), "connection established");
                for waiter in self.pending_dials.remove(&peer_id).unwrap_or_default() {
                    let _ = waiter.send(Ok(()));
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                debug!(peer = %peer_id, error = %error, "outgoing connection failed");
                if self.swarm.is_connected(&peer_id) {
                    // Another address got through.
                    return;
                }
                for waiter in self.pending_dials.remove(&peer_id).unwrap_or_default() {
                    let _ = waiter.send(Err(ConnectError::Dial {
                        peer: peer_id,
                        reason: error.to_string(),
                    }));
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                cause,
                ..
            } => {
                debug!(peer = %peer_id, ?cause, "connection closed");
                if num_established == 0 {
                    self.known_keys.remove(&peer_id);
                }
            }
            SwarmEvent::Behaviour(ConduitBehaviourEvent::Gossipsub(event)) => {
                self.handle_gossipsub_event(event);
            }
            SwarmEvent::Behaviour(ConduitBehaviourEvent::Identify(
                identify::Event::Received { peer_id, info, .. },
            )) => {
                trace!(peer = %peer_id, agent = %info.agent_version, "identified peer");
                self.known_keys
                    .insert(peer_id, info.public_key.encode_protobuf());
            }
            other => trace!(?other, "swarm event ignored"),
        }
    }

    fn handle_gossipsub_event(&mut self, event: gossipsub::Event) {
        match event {
            gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            } => {
                let Some(source) = message.source else {
                    debug!(via = %propagation_source, "dropping unsigned gossip message");
                    return;
                };
                let source_key = self
                    .known_keys
                    .get(&source)
                    .cloned()
                    .or_else(|| self.signed_keys.get(&source));
                let delivered = GossipMessage {
                    source,
                    source_key,
                    data: message.data,
                };
                self.deliver(&message.topic, delivered);
            }
            gossipsub::Event::Subscribed { peer_id, topic } => {
                debug!(peer = %peer_id, topic = %topic, "peer subscribed");
            }
            gossipsub::Event::Unsubscribed { peer_id, topic } => {
                debug!(peer = %peer_id, topic = %topic, "peer unsubscribed");
            }
            other => trace!(?other, "gossipsub event ignored"),
        }
    }
}

/// Drops dial waiters for `peer` whose caller has given up.
fn prune_abandoned_dials(
    pending: &mut HashMap<PeerId, Vec<oneshot::Sender<Result<(), ConnectError>>>>,
    peer: &PeerId,
) {
    if let Some(waiters) = pending.get_mut(peer) {
        waiters.retain(|waiter| !waiter.is_closed());
        if waiters.is_empty() {
            pending.remove(peer);
        }
    }
}
