//! # Transport Configuration & Constants
//!
//! Every tunable of the job-event transport lives here. The constants carry
//! the values every deployment has run with so far; [`TransportConfig`]
//! carries the runtime copy that a node can override.
//!
//! Changing the topic name or the wire format constants splits the cluster:
//! nodes only interoperate when they agree on both.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::latency::LatencyThresholds;

// ---------------------------------------------------------------------------
// Wire Contract
// ---------------------------------------------------------------------------

/// The single gossip topic every node joins. Publishing and receiving job
/// events both happen here; there are no per-job topics.
pub const JOB_EVENT_TOPIC: &str = "conduit-job-event";

/// Protocol string advertised through libp2p identify.
pub const IDENTIFY_PROTOCOL_VERSION: &str = "/conduit/0.1.0";

/// Crate version, reported by the node binary.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Networking
// ---------------------------------------------------------------------------

/// Default libp2p listening port.
pub const DEFAULT_P2P_PORT: u16 = 1235;

/// Default port for the Prometheus metrics endpoint of the node binary.
pub const DEFAULT_METRICS_PORT: u16 = 2112;

/// How long `connect` waits for a single bootstrap peer before giving up.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connections with no active streams are closed after this long.
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Capacity of the command channel into the swarm driver.
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Inbound gossip messages buffered between the swarm driver and the listen
/// loop. Overflow is dropped: gossip is best-effort anyway.
pub const DEFAULT_INBOUND_BUFFER: usize = 1024;

// ---------------------------------------------------------------------------
// Gossipsub
// ---------------------------------------------------------------------------

/// Gossipsub heartbeat interval.
pub const GOSSIP_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(700);

/// Largest envelope the overlay will carry. Job specs can be chunky.
pub const GOSSIP_MAX_TRANSMIT_SIZE: usize = 1024 * 1024;

/// Publisher keys remembered from signed gossip messages. One entry per
/// publisher; beyond this an arbitrary entry makes room.
pub const SIGNED_KEY_CACHE_CAPACITY: usize = 4096;

/// Seen-message cache lifetime for duplicate suppression.
pub const GOSSIP_DUPLICATE_CACHE_TIME: Duration = Duration::from_secs(60);

/// Time for a peer's behaviour penalty to decay to 1% of its value.
pub const PEER_SCORE_FAST_DECAY: Duration = Duration::from_secs(2 * 60);

/// Time for a peer's invalid-message counter to decay to 1% of its value.
pub const PEER_SCORE_SLOW_DECAY: Duration = Duration::from_secs(10 * 60);

/// Score below which a peer no longer receives gossip from us.
pub const PEER_GATE_THRESHOLD: f64 = -33.0;

// ---------------------------------------------------------------------------
// Latency Monitoring
// ---------------------------------------------------------------------------

/// Above this end-to-end delay a message counts as high latency.
pub const HIGH_LATENCY_THRESHOLD: Duration = Duration::from_millis(50);

/// Above this end-to-end delay a message counts as very high latency.
pub const VERY_HIGH_LATENCY_THRESHOLD: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// RSA modulus size for node identities. libp2p refuses anything below 2048.
pub const RSA_KEY_BITS: usize = 2048;

/// Directory (under the home directory) where node keys are stored.
pub const DEFAULT_KEY_DIR_NAME: &str = ".conduit";

/// Returns the key file reference for a node listening on `port`.
///
/// Each port gets its own identity so several nodes can share one machine.
pub fn key_ref_for_port(port: u16) -> String {
    format!("private_key.{port}")
}

/// Resolves the default key directory: `$HOME/.conduit`, or `./.conduit`
/// when no home directory is set.
pub fn default_key_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_KEY_DIR_NAME)
}

// ---------------------------------------------------------------------------
// Runtime Configuration
// ---------------------------------------------------------------------------

/// Runtime configuration of a single transport instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Interface to listen on.
    pub listen_host: IpAddr,
    /// TCP port to listen on. Zero picks a free port (tests).
    pub port: u16,
    /// Bootstrap peers as multiaddrs ending in `/p2p/<peer-id>`. Empty
    /// strings are ignored; an empty list makes this a seed node.
    pub peers: Vec<String>,
    /// Gossip topic for job events.
    pub topic: String,
    /// Where node keys live.
    pub key_dir: PathBuf,
    /// Latency classification thresholds.
    pub latency: LatencyThresholds,
    /// Per-peer connect timeout during bootstrap.
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
    /// Gossipsub heartbeat interval.
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,
    /// Peer-score threshold below which gossip to a peer stops.
    pub peer_gate_threshold: f64,
    /// Inbound message buffer between the swarm and the listen loop.
    pub inbound_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_P2P_PORT,
            peers: Vec::new(),
            topic: JOB_EVENT_TOPIC.to_string(),
            key_dir: default_key_dir(),
            latency: LatencyThresholds::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: GOSSIP_HEARTBEAT_INTERVAL,
            peer_gate_threshold: PEER_GATE_THRESHOLD,
            inbound_buffer: DEFAULT_INBOUND_BUFFER,
        }
    }
}

impl TransportConfig {
    /// Loopback configuration on an OS-assigned port. Handy for tests and
    /// single-machine clusters.
    pub fn local() -> Self {
        Self {
            listen_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..Self::default()
        }
    }

    /// Builder-style peer list override.
    pub fn with_peers<I, S>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.peers = peers.into_iter().map(Into::into).collect();
        self
    }

    /// The key reference this configuration resolves its identity from.
    ///
    /// Only meaningful for a fixed port: with port 0 every node maps to
    /// `private_key.0`.
    pub fn key_ref(&self) -> String {
        key_ref_for_port(self.port)
    }
}

/// Serde helper storing durations as integer milliseconds.
pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ref_is_derived_from_port() {
        assert_eq!(key_ref_for_port(1235), "private_key.1235");
        let config = TransportConfig {
            port: 4001,
            ..TransportConfig::default()
        };
        assert_eq!(config.key_ref(), "private_key.4001");
    }

    #[test]
    fn thresholds_are_ordered() {
        assert!(HIGH_LATENCY_THRESHOLD < VERY_HIGH_LATENCY_THRESHOLD);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: TransportConfig =
            serde_json::from_str(r#"{"port": 9000, "connect_timeout": 250}"#).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.topic, JOB_EVENT_TOPIC);
        assert!(config.peers.is_empty());
    }

    #[test]
    fn with_peers_replaces_list() {
        let config = TransportConfig::local().with_peers(["/ip4/127.0.0.1/tcp/1"]);
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.port, 0);
    }
}
