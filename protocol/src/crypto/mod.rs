//! # Cryptographic Primitives for Conduit
//!
//! Only one primitive lives here: addressed, single-payload encryption to a
//! peer's network identity. Broadcast traffic is authenticated by gossipsub
//! signatures and is not encrypted at all; anything secret a node needs to
//! hand to one specific peer (credentials for a job's storage, say) goes
//! through [`oaep`] instead.
//!
//! We don't roll our own. RSA-OAEP comes from the RustCrypto `rsa` crate,
//! the hash from `sha2`.

pub mod oaep;

pub use oaep::{decrypt, encrypt, max_plaintext_len, KeyFormatError, OaepError};
