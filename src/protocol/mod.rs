//! The peer protocol engine (L1): handshake framing, version negotiation,
//! v2 message framing, and (optionally) encrypted transport.
//!
//! Everything downstream of a completed handshake — piece selection,
//! bitfield bookkeeping, block request pipelining — belongs to the external
//! piece manager this crate forwards events to; this module only gets a
//! connection from bytes on the wire to a negotiated, validated stream.

pub mod extension;
pub mod handshake;
pub mod mse;
pub mod v2_messages;

use std::net::SocketAddr;

/// A peer's address plus the optional 20 byte id it discloses during
/// handshake. Equality for deduplication purposes uses only the address.
#[derive(Clone, Copy, Debug)]
pub struct PeerIdentity {
    pub addr: SocketAddr,
    pub peer_id: Option<crate::PeerId>,
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}
impl Eq for PeerIdentity {}

impl std::hash::Hash for PeerIdentity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

/// The negotiated protocol version of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    V1,
    V2,
    Hybrid,
}

impl ProtocolVersion {
    /// Priority used when more than one version is mutually acceptable:
    /// `HYBRID > V2 > V1`.
    fn priority(self) -> u8 {
        match self {
            ProtocolVersion::Hybrid => 2,
            ProtocolVersion::V2 => 1,
            ProtocolVersion::V1 => 0,
        }
    }
}

/// Returns the highest-priority protocol version that is both advertised by
/// the peer and present in `supported`, per the compatibility table in
/// the handshake negotiation rules:
///
/// - a HYBRID peer is compatible with any version we support
/// - a V1 peer is compatible with `{V1, HYBRID}`
/// - a V2 peer is compatible with `{V2, HYBRID}`
pub fn negotiate_version(
    peer_version: ProtocolVersion,
    supported: &[ProtocolVersion],
) -> Option<ProtocolVersion> {
    let candidates: &[ProtocolVersion] = match peer_version {
        ProtocolVersion::Hybrid => &[
            ProtocolVersion::Hybrid,
            ProtocolVersion::V2,
            ProtocolVersion::V1,
        ],
        ProtocolVersion::V1 => &[ProtocolVersion::Hybrid, ProtocolVersion::V1],
        ProtocolVersion::V2 => &[ProtocolVersion::V2, ProtocolVersion::Hybrid],
    };
    candidates
        .iter()
        .filter(|v| supported.contains(v))
        .max_by_key(|v| v.priority())
        .copied()
}

/// The lifecycle of a single peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Initiated,
    Connecting,
    Handshaking,
    Active,
    Disconnected,
}

/// Info hashes a session expects from a peer, whichever apply to the
/// torrent's kind (v1-only, v2-only, or hybrid).
#[derive(Clone, Copy, Debug, Default)]
pub struct ExpectedInfoHash {
    pub v1: Option<[u8; 20]>,
    pub v2: Option<[u8; 32]>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_priority_is_hybrid_then_v2_then_v1() {
        let all = [
            ProtocolVersion::Hybrid,
            ProtocolVersion::V2,
            ProtocolVersion::V1,
        ];
        assert_eq!(
            negotiate_version(ProtocolVersion::Hybrid, &all),
            Some(ProtocolVersion::Hybrid)
        );
    }

    #[test]
    fn v1_peer_prefers_hybrid_over_v1_when_both_supported() {
        let supported = [ProtocolVersion::Hybrid, ProtocolVersion::V1];
        assert_eq!(
            negotiate_version(ProtocolVersion::V1, &supported),
            Some(ProtocolVersion::Hybrid)
        );
    }

    #[test]
    fn v2_client_rejects_v1_peer() {
        let supported = [ProtocolVersion::V2];
        assert_eq!(negotiate_version(ProtocolVersion::V1, &supported), None);
    }

    #[test]
    fn v2_peer_prefers_v2_over_hybrid() {
        let supported = [ProtocolVersion::Hybrid, ProtocolVersion::V2];
        assert_eq!(
            negotiate_version(ProtocolVersion::V2, &supported),
            Some(ProtocolVersion::V2)
        );
    }
}
