//! Trace context propagation across the overlay.
//!
//! Uses whichever text-map propagator is installed globally. The library
//! never installs one itself; until the host process does, the envelope's
//! `trace_data` is simply empty.

use std::collections::HashMap;

use opentelemetry::{global, Context};

/// Serialises `cx` into a carrier suitable for `Envelope::trace_data`.
pub fn inject(cx: &Context) -> HashMap<String, String> {
    let mut carrier = HashMap::new();
    global::get_text_map_propagator(|propagator| propagator.inject_context(cx, &mut carrier));
    carrier
}

/// Rebuilds the sender's context from a received carrier. An empty or
/// unrecognised carrier yields an empty context.
pub fn extract(carrier: &HashMap<String, String>) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(carrier))
}
