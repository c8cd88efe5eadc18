//! # Prometheus Metrics
//!
//! Transport metrics, registered in a dedicated [`prometheus::Registry`]
//! with the `conduit` namespace so they never collide with whatever else
//! the hosting process registers globally.

use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::model::JobEvent;
use crate::network::envelope::EnvelopeError;
use crate::network::gossip::NextError;
use crate::network::latency::LatencyClass;
use crate::telemetry::{TracingObserver, TransportObserver};

/// Prometheus handles for one transport.
///
/// Clone-friendly: prometheus handles are reference counted.
#[derive(Clone)]
pub struct TransportMetrics {
    registry: Registry,
    logger: TracingObserver,
    /// Events handed to the overlay.
    pub events_published_total: IntCounter,
    /// Envelopes received and decoded.
    pub events_received_total: IntCounter,
    /// Events whose fan-out to local subscribers completed.
    pub events_delivered_total: IntCounter,
    /// Inbound messages dropped as undecodable.
    pub decode_failures_total: IntCounter,
    /// Inbound messages dropped because the sender key did not check out.
    pub rejected_senders_total: IntCounter,
    /// Bootstrap connections established.
    pub peers_connected_total: IntCounter,
    /// Received messages above the high-latency threshold, by class.
    pub high_latency_messages_total: IntCounterVec,
    /// End-to-end message latency in seconds.
    pub message_latency_seconds: Histogram,
    /// Time for all subscribers to finish with one event, in seconds.
    pub delivery_seconds: Histogram,
}

impl TransportMetrics {
    /// Creates and registers all metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("conduit".into()), None)?;

        let events_published_total = IntCounter::new(
            "events_published_total",
            "Total number of job events published to the gossip overlay",
        )?;
        registry.register(Box::new(events_published_total.clone()))?;

        let events_received_total = IntCounter::new(
            "events_received_total",
            "Total number of job events received and decoded",
        )?;
        registry.register(Box::new(events_received_total.clone()))?;

        let events_delivered_total = IntCounter::new(
            "events_delivered_total",
            "Total number of job events delivered to all local subscribers",
        )?;
        registry.register(Box::new(events_delivered_total.clone()))?;

        let decode_failures_total = IntCounter::new(
            "decode_failures_total",
            "Total number of inbound messages dropped because they did not decode",
        )?;
        registry.register(Box::new(decode_failures_total.clone()))?;

        let rejected_senders_total = IntCounter::new(
            "rejected_senders_total",
            "Total number of inbound messages dropped because the sender key was not authenticated",
        )?;
        registry.register(Box::new(rejected_senders_total.clone()))?;

        let peers_connected_total = IntCounter::new(
            "peers_connected_total",
            "Total number of bootstrap peer connections established",
        )?;
        registry.register(Box::new(peers_connected_total.clone()))?;

        let high_latency_messages_total = IntCounterVec::new(
            Opts::new(
                "high_latency_messages_total",
                "Received job events that exceeded a latency threshold",
            ),
            &["class"],
        )?;
        registry.register(Box::new(high_latency_messages_total.clone()))?;

        let message_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "message_latency_seconds",
                "Delay between an envelope's sent_time and its arrival, in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
        )?;
        registry.register(Box::new(message_latency_seconds.clone()))?;

        let delivery_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "delivery_seconds",
                "Time for every local subscriber to finish with one event, in seconds",
            )
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;
        registry.register(Box::new(delivery_seconds.clone()))?;

        Ok(Self {
            registry,
            logger: TracingObserver,
            events_published_total,
            events_received_total,
            events_delivered_total,
            decode_failures_total,
            rejected_senders_total,
            peers_connected_total,
            high_latency_messages_total,
            message_latency_seconds,
            delivery_seconds,
        })
    }

    /// The registry holding these metrics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl TransportObserver for TransportMetrics {
    fn peer_connected(&self, peer: &PeerId, addrs: &[Multiaddr]) {
        self.peers_connected_total.inc();
        self.logger.peer_connected(peer, addrs);
    }

    fn message_received(
        &self,
        local: &PeerId,
        event: &JobEvent,
        latency: Duration,
        class: LatencyClass,
    ) {
        self.events_received_total.inc();
        self.message_latency_seconds.observe(latency.as_secs_f64());
        if class != LatencyClass::Normal {
            self.high_latency_messages_total
                .with_label_values(&[class.as_str()])
                .inc();
        }
        self.logger.message_received(local, event, latency, class);
    }

    fn decode_failed(&self, source: &PeerId, error: &EnvelopeError) {
        self.decode_failures_total.inc();
        self.logger.decode_failed(source, error);
    }

    fn sender_rejected(&self, source: &PeerId) {
        self.rejected_senders_total.inc();
        self.logger.sender_rejected(source);
    }

    fn event_published(&self, event: &JobEvent, bytes: usize) {
        self.events_published_total.inc();
        self.logger.event_published(event, bytes);
    }

    fn event_delivered(&self, event: &JobEvent, subscribers: usize, elapsed: Duration) {
        self.events_delivered_total.inc();
        self.delivery_seconds.observe(elapsed.as_secs_f64());
        self.logger.event_delivered(event, subscribers, elapsed);
    }

    fn listen_failed(&self, error: &NextError) {
        self.logger.listen_failed(error);
    }

    fn shutdown(&self, local: &PeerId) {
        self.logger.shutdown(local);
    }
}
