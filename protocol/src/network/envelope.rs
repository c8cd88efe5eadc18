//! # Envelope Codec
//!
//! Every job event on the wire is wrapped in an [`Envelope`] that adds the
//! send time (for latency monitoring) and the trace propagation data (so the
//! receiving node's spans join the sender's trace).
//!
//! ## Wire format
//!
//! ```text
//! {
//!   "sent_time":  "2026-03-01T12:00:00.123456789Z",
//!   "job_event":  { "JobID": "...", "EventName": "Bid", ... },
//!   "trace_data": { "traceparent": "00-...-...-01" }
//! }
//! ```
//!
//! This JSON document is the only bit-exact contract between nodes: the
//! overlay forwards opaque bytes. Field names must not change.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::model::JobEvent;

/// Errors from encoding or decoding envelopes.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed envelope: {0}")]
    Decode(#[source] serde_json::Error),
}

/// The wire wrapper around a [`JobEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Wall-clock time the sender published at. Never modified in transit.
    pub sent_time: DateTime<Utc>,
    /// The event itself.
    pub job_event: JobEvent,
    /// Trace propagation carrier. Opaque to everything but the propagator.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub trace_data: HashMap<String, String>,
}

/// Wraps `event` in an envelope stamped with the current time and serialises it.
pub fn encode(
    event: &JobEvent,
    trace_data: HashMap<String, String>,
) -> Result<Vec<u8>, EnvelopeError> {
    #[derive(Serialize)]
    struct EnvelopeRef<'a> {
        sent_time: DateTime<Utc>,
        job_event: &'a JobEvent,
        trace_data: HashMap<String, String>,
    }

    serde_json::to_vec(&EnvelopeRef {
        sent_time: Utc::now(),
        job_event: event,
        trace_data,
    })
    .map_err(EnvelopeError::Encode)
}

/// Parses an envelope received from the overlay.
///
/// A failure here means one bad message, never a broken transport: callers
/// log it and move on to the next message.
pub fn decode(bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
    serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}
