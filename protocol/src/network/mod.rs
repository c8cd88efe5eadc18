//! # Network Module
//!
//! The job-event transport: everything between a `JobEvent` handed to
//! `publish` on one node and the handlers registered on every other node.
//!
//! ## Architecture
//!
//! ```text
//! peers.rs      Bootstrap peer list parsing (all-or-nothing)
//! gossip.rs     libp2p swarm driver, gossipsub topics, subscriptions
//! envelope.rs   Wire envelope: sent time + event + trace context
//! latency.rs    End-to-end latency classification
//! dispatch.rs   Handler registry and per-message fan-out
//! transport.rs  The Transport trait and the libp2p-backed facade
//! inprocess.rs  Transport over an in-memory broadcast bus
//! ```
//!
//! ## Design Decisions
//!
//! - The swarm is owned by a single driver task. Callers never lock it;
//!   they send commands and await `oneshot` replies.
//! - Every inbound message is processed on its own task, and every handler
//!   runs on its own task inside that. One slow consumer delays only the
//!   message it is working on.
//! - The sender key attached to a delivered event is always the one the
//!   overlay can vouch for, never what the sender wrote into the event.
//! - Nothing is retried. Callers decide what a failed publish or connect
//!   means for them.

pub mod dispatch;
pub mod envelope;
pub mod gossip;
pub mod inprocess;
pub mod latency;
pub mod peers;
pub mod transport;

pub use dispatch::{
    authenticate_sender, dispatch, inline_public_key, JobEventHandler, SubscriberRegistry,
};
pub use envelope::{Envelope, EnvelopeError};
pub use gossip::{
    ConnectError, GossipError, GossipMessage, GossipNetwork, GossipTopic, NextError, Subscription,
};
pub use inprocess::{InProcessNetwork, InProcessTransport};
pub use latency::{LatencyClass, LatencyThresholds};
pub use peers::{AddressError, PeerAddr, PeerSet};
pub use transport::{Libp2pTransport, Transport, TransportError, TransportState};
