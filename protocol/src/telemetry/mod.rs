//! # Telemetry
//!
//! The transport reports what happens to it through a [`TransportObserver`]
//! handed in at construction, instead of logging from deep inside network
//! code. Two implementations ship with the crate:
//!
//! - [`TracingObserver`]: structured `tracing` events. The default.
//! - [`TransportMetrics`]: Prometheus counters and a latency histogram,
//!   which also forwards to a `TracingObserver` so logs are not lost.
//!
//! [`trace_context`] carries OpenTelemetry context across the wire.

pub mod metrics;
pub mod trace_context;

use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use tracing::{debug, error, info, trace, warn};

use crate::model::job_event::short_id;
use crate::model::JobEvent;
use crate::network::envelope::EnvelopeError;
use crate::network::gossip::NextError;
use crate::network::latency::LatencyClass;

pub use metrics::TransportMetrics;

/// Observability hooks called by the transport.
///
/// Every method has an empty default so implementations only override what
/// they care about. Calls happen on the transport's own tasks; keep them
/// cheap and never block.
pub trait TransportObserver: Send + Sync + 'static {
    /// A bootstrap peer connection was established.
    fn peer_connected(&self, _peer: &PeerId, _addrs: &[Multiaddr]) {}

    /// An envelope arrived and decoded. `latency` is measured from the
    /// sender's `sent_time`.
    fn message_received(
        &self,
        _local: &PeerId,
        _event: &JobEvent,
        _latency: Duration,
        _class: LatencyClass,
    ) {
    }

    /// An inbound message could not be decoded and was dropped.
    fn decode_failed(&self, _source: &PeerId, _error: &EnvelopeError) {}

    /// An inbound message's sender key could not be authenticated and the
    /// message was dropped.
    fn sender_rejected(&self, _source: &PeerId) {}

    /// An event was handed to the overlay.
    fn event_published(&self, _event: &JobEvent, _bytes: usize) {}

    /// Every subscriber has returned for one event.
    fn event_delivered(&self, _event: &JobEvent, _subscribers: usize, _elapsed: Duration) {}

    /// The listen loop stopped for a reason other than cancellation.
    fn listen_failed(&self, _error: &NextError) {}

    /// The transport shut down.
    fn shutdown(&self, _local: &PeerId) {}
}

/// Logs transport activity through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl TransportObserver for TracingObserver {
    fn peer_connected(&self, peer: &PeerId, addrs: &[Multiaddr]) {
        debug!(peer = %peer, addrs = ?addrs, "connected to bootstrap peer");
    }

    fn message_received(
        &self,
        local: &PeerId,
        event: &JobEvent,
        latency: Duration,
        class: LatencyClass,
    ) {
        let local = local.to_string();
        let source = event.short_source();
        let local = short_id(&local);
        let latency_ms = latency.as_millis() as u64;

        match class {
            LatencyClass::VeryHigh => warn!(
                source,
                local,
                latency_ms,
                event = %event.event_name,
                "very high message latency"
            ),
            LatencyClass::High => warn!(
                source,
                local,
                latency_ms,
                event = %event.event_name,
                "high message latency"
            ),
            LatencyClass::Normal => trace!(
                source,
                local,
                latency_ms,
                event = %event.event_name,
                "message latency"
            ),
        }
    }

    fn decode_failed(&self, source: &PeerId, error: &EnvelopeError) {
        error!(peer = %source, %error, "dropping undecodable job event");
    }

    fn sender_rejected(&self, source: &PeerId) {
        warn!(peer = %source, "dropping job event with unauthenticated sender key");
    }

    fn event_published(&self, event: &JobEvent, bytes: usize) {
        trace!(event = %event.event_name, job_id = %event.job_id, bytes, "published job event");
    }

    fn event_delivered(&self, event: &JobEvent, subscribers: usize, elapsed: Duration) {
        trace!(
            event = %event.event_name,
            job_id = %event.job_id,
            subscribers,
            elapsed_ms = elapsed.as_millis() as u64,
            "job event delivered"
        );
    }

    fn listen_failed(&self, error: &NextError) {
        error!(%error, "job event subscription failed, node stops receiving events");
    }

    fn shutdown(&self, local: &PeerId) {
        info!(peer = %local, "transport stopped");
    }
}
