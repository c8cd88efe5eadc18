// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Conduit Protocol
//!
//! Conduit nodes advertise capacity, accept jobs and report every step of a
//! job's life to the rest of the cluster. This crate is the part that does
//! the reporting: it gossips job events to every node, hands them to the
//! local schedulers, executors and verifiers that care, and lets two nodes
//! exchange small secrets without anyone in between reading them.
//!
//! ## Architecture
//!
//! - **config**: Constants and the runtime `TransportConfig`.
//! - **model**: `JobEvent`, the record everyone passes around.
//! - **identity**: RSA node identities and their on-disk key store.
//! - **crypto**: RSA-OAEP point-to-point encryption between node keys.
//! - **network**: Gossip overlay, envelopes, dispatch and the transports.
//! - **telemetry**: Observer hooks, Prometheus metrics, trace propagation.
//!
//! ## Guarantees (and their absence)
//!
//! 1. Every node that is connected when an event is published sees it once.
//! 2. No ordering across events. No replay for nodes that join late.
//! 3. Every local handler sees every event a node receives, exactly once.
//! 4. The sender key on a delivered event is authenticated by the overlay.

pub mod config;
pub mod crypto;
pub mod identity;
pub mod model;
pub mod network;
pub mod telemetry;

pub use config::TransportConfig;
pub use identity::{KeyStore, NodeIdentity};
pub use model::{JobEvent, JobEventType};
pub use network::{
    InProcessNetwork, InProcessTransport, JobEventHandler, Libp2pTransport, Transport,
    TransportError,
};
pub use telemetry::{TracingObserver, TransportMetrics, TransportObserver};
