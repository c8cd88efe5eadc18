//! # RSA-OAEP Point-to-Point Encryption
//!
//! Encrypts a payload to a peer identified by its libp2p public key, and
//! decrypts payloads addressed to this node.
//!
//! ## Key handling
//!
//! Recipients are addressed by the protobuf encoding of their libp2p public
//! key, exactly the bytes carried in `JobEvent::sender_public_key`. The RSA
//! key inside is an X.509 `SubjectPublicKeyInfo`, which we hand to the `rsa`
//! crate. Keys of any other family (Ed25519, secp256k1, ...) are rejected
//! with [`KeyFormatError::WrongFamily`].
//!
//! ## Limits
//!
//! OAEP with SHA-512 on a 2048-bit modulus fits at most
//! `256 - 2 * 64 - 2 = 126` bytes of plaintext. Larger payloads fail with
//! [`OaepError::Encrypt`]; callers wanting to move more should encrypt a
//! symmetric key instead.

use libp2p::identity::PublicKey;
use rand::rngs::OsRng;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPublicKey};
use sha2::Sha512;
use thiserror::Error;

use crate::identity::NodeIdentity;

/// SHA-512 digest size, the OAEP hash.
const OAEP_HASH_LEN: usize = 64;

/// The recipient key could not be used.
#[derive(Debug, Error)]
pub enum KeyFormatError {
    #[error("public key bytes are not a libp2p protobuf key")]
    Undecodable,

    #[error("public key is not an RSA key")]
    WrongFamily,

    #[error("RSA public key is malformed")]
    Malformed,
}

/// Errors from the point-to-point encryption API.
///
/// Encryption and decryption failures are intentionally opaque: whether a
/// ciphertext was tampered with or addressed to someone else is none of a
/// caller's business, only that it failed.
#[derive(Debug, Error)]
pub enum OaepError {
    #[error(transparent)]
    KeyFormat(#[from] KeyFormatError),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed -- wrong key or corrupted ciphertext")]
    Decrypt,
}

/// Encrypts `plaintext` so that only the holder of `recipient_key` can read it.
///
/// `recipient_key` is a protobuf-encoded libp2p public key.
///
/// # Example
///
/// ```
/// use conduit_protocol::crypto::{decrypt, encrypt};
/// use conduit_protocol::identity::NodeIdentity;
///
/// let bob = NodeIdentity::generate().unwrap();
/// let sealed = encrypt(b"s3 secret", &bob.public_key_bytes()).unwrap();
/// assert_eq!(decrypt(&sealed, &bob).unwrap(), b"s3 secret");
/// ```
pub fn encrypt(plaintext: &[u8], recipient_key: &[u8]) -> Result<Vec<u8>, OaepError> {
    let public_key = rsa_public_key(recipient_key)?;
    public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha512>(), plaintext)
        .map_err(|_| OaepError::Encrypt)
}

/// Decrypts a payload produced by [`encrypt`] for this node.
pub fn decrypt(ciphertext: &[u8], identity: &NodeIdentity) -> Result<Vec<u8>, OaepError> {
    identity
        .rsa_private_key()
        .decrypt(Oaep::new::<Sha512>(), ciphertext)
        .map_err(|_| OaepError::Decrypt)
}

/// Largest plaintext [`encrypt`] accepts for `recipient_key`.
pub fn max_plaintext_len(recipient_key: &[u8]) -> Result<usize, KeyFormatError> {
    let public_key = rsa_public_key(recipient_key)?;
    Ok(public_key.size().saturating_sub(2 * OAEP_HASH_LEN + 2))
}

fn rsa_public_key(encoded: &[u8]) -> Result<RsaPublicKey, KeyFormatError> {
    let public_key =
        PublicKey::try_decode_protobuf(encoded).map_err(|_| KeyFormatError::Undecodable)?;
    let rsa_key = public_key
        .try_into_rsa()
        .map_err(|_| KeyFormatError::WrongFamily)?;
    RsaPublicKey::from_public_key_der(&rsa_key.encode_x509())
        .map_err(|_| KeyFormatError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let bob = NodeIdentity::generate().unwrap();
        let secret = b"ipfs api token: 0xfeedface";

        let sealed = encrypt(secret, &bob.public_key_bytes()).unwrap();
        assert_ne!(sealed.as_slice(), secret.as_slice());
        assert_eq!(decrypt(&sealed, &bob).unwrap(), secret);
    }

    #[test]
    fn empty_payload_roundtrip() {
        let bob = NodeIdentity::generate().unwrap();
        let sealed = encrypt(b"", &bob.public_key_bytes()).unwrap();
        assert!(decrypt(&sealed, &bob).unwrap().is_empty());
    }

    #[test]
    fn wrong_private_key_fails() {
        let bob = NodeIdentity::generate().unwrap();
        let eve = NodeIdentity::generate().unwrap();

        let sealed = encrypt(b"for bob only", &bob.public_key_bytes()).unwrap();
        assert!(matches!(decrypt(&sealed, &eve), Err(OaepError::Decrypt)));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let bob = NodeIdentity::generate().unwrap();
        let mut sealed = encrypt(b"payload", &bob.public_key_bytes()).unwrap();
        sealed[10] ^= 0xff;
        assert!(matches!(decrypt(&sealed, &bob), Err(OaepError::Decrypt)));
    }

    #[test]
    fn encryption_is_randomised() {
        let bob = NodeIdentity::generate().unwrap();
        let a = encrypt(b"same", &bob.public_key_bytes()).unwrap();
        let b = encrypt(b"same", &bob.public_key_bytes()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn payload_limit_is_enforced() {
        let bob = NodeIdentity::generate().unwrap();
        let key = bob.public_key_bytes();
        let limit = max_plaintext_len(&key).unwrap();
        assert_eq!(limit, 126);

        assert!(encrypt(&vec![7u8; limit], &key).is_ok());
        assert!(matches!(
            encrypt(&vec![7u8; limit + 1], &key),
            Err(OaepError::Encrypt)
        ));
    }

    #[test]
    fn garbage_key_is_key_format_error() {
        let err = encrypt(b"x", &[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            OaepError::KeyFormat(KeyFormatError::Undecodable)
        ));
    }

    #[test]
    fn non_rsa_key_is_wrong_family() {
        let ed25519 = Keypair::generate_ed25519();
        let err = encrypt(b"x", &ed25519.public().encode_protobuf()).unwrap_err();
        assert!(matches!(
            err,
            OaepError::KeyFormat(KeyFormatError::WrongFamily)
        ));
    }
}
