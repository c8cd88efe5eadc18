//! # Bootstrap Peers
//!
//! Parsing of the configured peer list. Parsing is all-or-nothing: the
//! transport refuses to dial anyone while a single configured address is
//! broken, so a typo in one entry never leaves a node half-connected.

use std::fmt;

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use thiserror::Error;

/// A configured peer address that could not be used.
#[derive(Debug, Error)]
pub enum AddressError {
    #[error("invalid multiaddr {address:?}: {reason}")]
    Invalid { address: String, reason: String },

    #[error("multiaddr {0:?} has no /p2p/<peer-id> component")]
    MissingPeerId(String),
}

/// One bootstrap peer and every address it was configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub peer_id: PeerId,
    /// Transport addresses with the trailing `/p2p` component removed.
    pub addrs: Vec<Multiaddr>,
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.peer_id)?;
        for addr in &self.addrs {
            write!(f, " {addr}")?;
        }
        Ok(())
    }
}

/// The parsed, immutable bootstrap list. Addresses that share a peer id are
/// grouped under one [`PeerAddr`], in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSet {
    peers: Vec<PeerAddr>,
}

impl PeerSet {
    /// Parses every non-empty entry of `addresses`. The first bad entry
    /// fails the whole set.
    pub fn parse<S: AsRef<str>>(addresses: &[S]) -> Result<Self, AddressError> {
        let mut peers: Vec<PeerAddr> = Vec::new();

        for raw in addresses.iter().map(AsRef::as_ref) {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }

            let (peer_id, addr) = parse_peer_addr(raw)?;
            match peers.iter_mut().find(|p| p.peer_id == peer_id) {
                Some(existing) => {
                    if !existing.addrs.contains(&addr) {
                        existing.addrs.push(addr);
                    }
                }
                None => peers.push(PeerAddr {
                    peer_id,
                    addrs: vec![addr],
                }),
            }
        }

        Ok(Self { peers })
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerAddr> {
        self.peers.iter()
    }
}

impl<'a> IntoIterator for &'a PeerSet {
    type Item = &'a PeerAddr;
    type IntoIter = std::slice::Iter<'a, PeerAddr>;

    fn into_iter(self) -> Self::IntoIter {
        self.peers.iter()
    }
}

/// Splits `/ip4/.../tcp/.../p2p/<id>` into the peer id and the transport
/// part of the address.
fn parse_peer_addr(raw: &str) -> Result<(PeerId, Multiaddr), AddressError> {
    let mut addr: Multiaddr = raw.parse().map_err(|e: libp2p::multiaddr::Error| {
        AddressError::Invalid {
            address: raw.to_string(),
            reason: e.to_string(),
        }
    })?;

    match addr.pop() {
        Some(Protocol::P2p(peer_id)) => Ok((peer_id, addr)),
        _ => Err(AddressError::MissingPeerId(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16, peer: &PeerId) -> String {
        format!("/ip4/127.0.0.1/tcp/{port}/p2p/{peer}")
    }

    #[test]
    fn parses_and_strips_p2p_component() {
        let peer = PeerId::random();
        let set = PeerSet::parse(&[addr(4001, &peer)]).unwrap();

        let parsed: Vec<_> = set.iter().collect();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].peer_id, peer);
        assert_eq!(
            parsed[0].addrs,
            vec!["/ip4/127.0.0.1/tcp/4001".parse::<Multiaddr>().unwrap()]
        );
    }

    #[test]
    fn empty_entries_are_skipped() {
        let peer = PeerId::random();
        let set = PeerSet::parse(&["".to_string(), "  ".to_string(), addr(1, &peer)]).unwrap();
        assert_eq!(set.len(), 1);

        let empty = PeerSet::parse::<String>(&[]).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn addresses_of_one_peer_are_grouped() {
        let a = PeerId::random();
        let b = PeerId::random();
        let set = PeerSet::parse(&[addr(1, &a), addr(2, &b), addr(3, &a), addr(1, &a)]).unwrap();

        let parsed: Vec<_> = set.iter().collect();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].peer_id, a);
        assert_eq!(parsed[0].addrs.len(), 2);
        assert_eq!(parsed[1].peer_id, b);
    }

    #[test]
    fn one_bad_entry_fails_everything() {
        let peer = PeerId::random();
        let result = PeerSet::parse(&[addr(1, &peer), "not-a-multiaddr".to_string()]);
        assert!(matches!(result, Err(AddressError::Invalid { .. })));
    }

    #[test]
    fn missing_peer_id_is_rejected() {
        let result = PeerSet::parse(&["/ip4/127.0.0.1/tcp/4001"]);
        assert!(matches!(result, Err(AddressError::MissingPeerId(_))));
    }
}
