//! # Job Events
//!
//! A [`JobEvent`] describes one state change of one job shard: created, bid
//! on, accepted, running, results proposed, and so on. Events are JSON on
//! the wire with Go-style field names (`JobID`, `SourceNodeID`, ...) so that
//! every node in a mixed cluster reads the same document.
//!
//! Domain payloads (`Spec`, `Deal`, `VerificationProposal`, ...) are kept in
//! [`JobEvent::payload`] as raw JSON. The transport never interprets them,
//! and fields it does not know about survive a decode/encode cycle intact.

use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// Event Type
// ---------------------------------------------------------------------------

/// Lifecycle step a [`JobEvent`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobEventType {
    /// The requester node created a job.
    Created,
    /// The job deal (concurrency, confidence) changed.
    DealUpdated,
    /// A compute node offered to run a shard.
    Bid,
    /// The requester accepted a bid.
    BidAccepted,
    /// The requester rejected a bid.
    BidRejected,
    /// The compute node withdrew its bid.
    BidCancelled,
    /// A compute node started executing a shard.
    Running,
    /// Execution failed.
    Error,
    /// A compute node proposed results for verification.
    ResultsProposed,
    /// The verifier accepted the proposed results.
    ResultsAccepted,
    /// The verifier rejected the proposed results.
    ResultsRejected,
    /// Results were published to storage.
    ResultsPublished,
    /// Anything this build does not recognise. Newer peers may emit event
    /// names we have never heard of; they still travel through the transport.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for JobEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Job Event
// ---------------------------------------------------------------------------

/// One job lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(rename = "JobID", default)]
    pub job_id: String,

    #[serde(rename = "ShardIndex", default)]
    pub shard_index: u32,

    /// The client that submitted the job.
    #[serde(rename = "ClientID", default)]
    pub client_id: String,

    /// Node that claims to have produced this event. Informational only:
    /// relays forward messages they did not author, and nothing binds this
    /// string to a key. Use [`JobEvent::sender_public_key`] for identity.
    #[serde(rename = "SourceNodeID", default)]
    pub source_node_id: String,

    /// Node the event is aimed at, when there is one (bid accepted, ...).
    #[serde(rename = "TargetNodeID", default)]
    pub target_node_id: String,

    #[serde(rename = "EventName")]
    pub event_name: JobEventType,

    #[serde(rename = "Status", default, skip_serializing_if = "String::is_empty")]
    pub status: String,

    #[serde(rename = "EventTime")]
    pub event_time: DateTime<Utc>,

    /// Protobuf-encoded libp2p public key of the authenticated sender.
    /// Populated by the receiving transport; whatever the sender wrote here
    /// is replaced before subscribers see the event.
    #[serde(rename = "SenderPublicKey", default, with = "base64_bytes")]
    pub sender_public_key: Vec<u8>,

    /// Domain-specific fields the transport does not interpret.
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl JobEvent {
    /// Creates an event with the given name and an `EventTime` of now.
    pub fn new(event_name: JobEventType, job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            shard_index: 0,
            client_id: String::new(),
            source_node_id: String::new(),
            target_node_id: String::new(),
            event_name,
            status: String::new(),
            event_time: Utc::now(),
            sender_public_key: Vec::new(),
            payload: serde_json::Map::new(),
        }
    }

    pub fn with_source_node(mut self, node_id: impl Into<String>) -> Self {
        self.source_node_id = node_id.into();
        self
    }

    pub fn with_target_node(mut self, node_id: impl Into<String>) -> Self {
        self.target_node_id = node_id.into();
        self
    }

    pub fn with_shard(mut self, shard_index: u32) -> Self {
        self.shard_index = shard_index;
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    /// Attaches a domain payload field, e.g. `Spec` or `Deal`.
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Short form of the source node id for log lines.
    pub fn short_source(&self) -> &str {
        short_id(&self.source_node_id)
    }
}

/// First eight characters of an identifier, or the whole thing if shorter.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Byte fields travel as standard base64 strings, like every JSON encoder
/// of `[]byte` does. `null` decodes as empty.
mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(s) => general_purpose::STANDARD
                .decode(s.as_bytes())
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
