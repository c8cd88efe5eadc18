//! # Event Dispatcher
//!
//! Local fan-out of received job events. Each registered
//! [`JobEventHandler`] gets its own task per event; [`dispatch`] returns only
//! once every one of them has finished with it.
//!
//! Registration takes the write lock, dispatch takes a snapshot under the
//! read lock and releases it before any handler runs, so a handler is free to
//! register further handlers without deadlocking. Those only see later
//! events.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use libp2p::identity::PublicKey;
use libp2p::PeerId;
use opentelemetry::Context;
use parking_lot::RwLock;
use tracing::{error, trace};

use crate::model::JobEvent;

/// A local consumer of job events (scheduler, executor, verifier, ...).
///
/// Implemented for any `Fn(Context, JobEvent) -> impl Future<Output = ()>`,
/// so plain async closures can be registered directly.
#[async_trait]
pub trait JobEventHandler: Send + Sync + 'static {
    async fn handle_job_event(&self, cx: Context, event: JobEvent);
}

#[async_trait]
impl<F, Fut> JobEventHandler for F
where
    F: Fn(Context, JobEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle_job_event(&self, cx: Context, event: JobEvent) {
        (self)(cx, event).await
    }
}

/// The ordered set of local handlers.
#[derive(Default)]
pub struct SubscriberRegistry {
    handlers: RwLock<Vec<Arc<dyn JobEventHandler>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler. Safe to call concurrently with dispatch.
    pub fn register(&self, handler: Arc<dyn JobEventHandler>) {
        self.handlers.write().push(handler);
    }

    /// A consistent copy of the current handler list, in registration order.
    pub fn snapshot_all(&self) -> Vec<Arc<dyn JobEventHandler>> {
        self.handlers.read().clone()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

/// Runs every handler on its own task with a copy of `event` and waits for
/// all of them. A panicking handler is logged and does not affect the
/// others.
///
/// Returns how many handlers returned normally.
pub async fn dispatch(
    handlers: Vec<Arc<dyn JobEventHandler>>,
    cx: Context,
    event: JobEvent,
) -> usize {
    let tasks = handlers.into_iter().map(|handler| {
        let cx = cx.clone();
        let event = event.clone();
        tokio::spawn(async move { handler.handle_job_event(cx, event).await })
    });

    let mut completed = 0;
    for result in futures::future::join_all(tasks).await {
        match result {
            Ok(()) => completed += 1,
            Err(e) if e.is_panic() => {
                error!(
                    job_id = %event.job_id,
                    event = %event.event_name,
                    "job event handler panicked"
                );
            }
            Err(e) => trace!(error = %e, "job event handler task cancelled"),
        }
    }
    completed
}

/// Picks the public key to attribute a message to.
///
/// Candidates are tried in order:
///
/// 1. the key the overlay learned for the signature-verified `source`
///    (identify exchange or the signed gossip message itself),
/// 2. the key inlined in `source` (ed25519 and other short keys),
/// 3. the key the sender embedded in the event.
///
/// A candidate is only accepted if it hashes to `source`. `None` means the
/// sender cannot be authenticated and the message must be dropped.
pub fn authenticate_sender(
    source: &PeerId,
    known_key: Option<&[u8]>,
    embedded_key: &[u8],
) -> Option<Vec<u8>> {
    let inline = inline_public_key(source);
    known_key
        .into_iter()
        .chain(inline.as_deref())
        .chain(std::iter::once(embedded_key))
        .find(|candidate| key_matches_peer(candidate, source))
        .map(<[u8]>::to_vec)
}

/// The protobuf-encoded public key carried inside `peer` itself.
///
/// Peer ids of keys up to 42 bytes use the identity multihash, so the id is
/// the key. RSA ids are a SHA-256 digest and yield `None`.
pub fn inline_public_key(peer: &PeerId) -> Option<Vec<u8>> {
    const IDENTITY_CODE: u8 = 0x00;

    match peer.to_bytes().as_slice() {
        [IDENTITY_CODE, len, key @ ..] if usize::from(*len) == key.len() => {
            key_matches_peer(key, peer).then(|| key.to_vec())
        }
        _ => None,
    }
}

/// Whether `key` decodes to a public key whose peer id is `peer`.
pub(crate) fn key_matches_peer(key: &[u8], peer: &PeerId) -> bool {
    PublicKey::try_decode_protobuf(key)
        .map(|key| key.to_peer_id() == *peer)
        .unwrap_or(false)
}
