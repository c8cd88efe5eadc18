//! # Domain Model
//!
//! The records the transport carries. The transport itself only looks at a
//! handful of fields (event name and source node for logging, sender public
//! key for authentication); everything else belongs to the schedulers,
//! executors and verifiers that subscribe to the event stream.

pub mod job_event;

pub use job_event::{JobEvent, JobEventType};
