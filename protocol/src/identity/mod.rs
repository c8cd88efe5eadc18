//! # Identity Module
//!
//! Every Conduit node is identified by an RSA keypair. The same key material
//! serves two purposes:
//!
//! 1. **Network identity**: the libp2p `PeerId` is derived from the public
//!    key, Noise handshakes and gossipsub message signatures use it.
//! 2. **Point-to-point encryption**: other nodes encrypt secrets to our
//!    public key (see [`crate::crypto::oaep`]), only we can decrypt them.
//!
//! Keys are persisted per listening port by [`KeyStore`], so a node that
//! restarts on the same port comes back with the same `PeerId`.
//!
//! ## Design Decisions
//!
//! - RSA rather than Ed25519: Ed25519 keys cannot encrypt, and we want one
//!   key per node, not a signing key plus a separately distributed
//!   encryption key.
//! - PKCS#8 PEM on disk. libp2p cannot serialise RSA private keys itself,
//!   and PEM is what every operator tool understands.

pub mod keys;
pub mod store;

pub use keys::{KeyError, NodeIdentity};
pub use store::KeyStore;
