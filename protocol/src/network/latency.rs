//! # Latency Monitor
//!
//! Classifies the delay between an envelope's `sent_time` and its arrival.
//! The classification is pure; whoever calls it decides whether a slow
//! message is worth a warning, a metric, or nothing.
//!
//! Delays are compared in whole milliseconds with strict `>`, so a message
//! that took exactly the threshold is still in the lower class.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{HIGH_LATENCY_THRESHOLD, VERY_HIGH_LATENCY_THRESHOLD};

/// How late a message arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LatencyClass {
    Normal,
    High,
    VeryHigh,
}

impl LatencyClass {
    /// Stable label for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
            Self::VeryHigh => "very_high",
        }
    }
}

/// Threshold pair used by [`LatencyThresholds::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyThresholds {
    #[serde(with = "crate::config::duration_millis")]
    pub high: Duration,
    #[serde(with = "crate::config::duration_millis")]
    pub very_high: Duration,
}

impl Default for LatencyThresholds {
    fn default() -> Self {
        Self {
            high: HIGH_LATENCY_THRESHOLD,
            very_high: VERY_HIGH_LATENCY_THRESHOLD,
        }
    }
}

impl LatencyThresholds {
    /// Classifies the delay between `sent` and `received`.
    pub fn classify(&self, sent: DateTime<Utc>, received: DateTime<Utc>) -> LatencyClass {
        self.classify_delay(latency_between(sent, received))
    }

    /// Classifies an already measured delay.
    pub fn classify_delay(&self, delay: Duration) -> LatencyClass {
        let millis = delay.as_millis();
        if millis > self.very_high.as_millis() {
            LatencyClass::VeryHigh
        } else if millis > self.high.as_millis() {
            LatencyClass::High
        } else {
            LatencyClass::Normal
        }
    }
}

/// Delay from `sent` to `received`. Clocks drift; a message that appears to
/// arrive before it was sent counts as instantaneous.
pub fn latency_between(sent: DateTime<Utc>, received: DateTime<Utc>) -> Duration {
    (received - sent).to_std().unwrap_or(Duration::ZERO)
}

/// [`LatencyThresholds::classify`] with the default thresholds.
pub fn classify(sent: DateTime<Utc>, received: DateTime<Utc>) -> LatencyClass {
    LatencyThresholds::default().classify(sent, received)
}
