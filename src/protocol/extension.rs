//! BEP 10 extension protocol envelope, the ut_pex (BEP 11) wire payload, and
//! the v1-to-v2 upgrade message carried over it.
//!
//! Generic extension messages are BitTorrent message id 20 (not to be
//! confused with the v2 `PieceLayerRequest`, which only applies once the
//! connection has negotiated the v2 framing; the two never coexist on the
//! same wire because negotiation picks exactly one).

use std::net::{Ipv4Addr, SocketAddrV4};

use serde_bytes::ByteBuf;
use serde_derive::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::protocol::handshake::V2_UPGRADE_EXTENSION_ID;
use crate::PeerId;

/// Discriminates an added-peers ut_pex message from a dropped-peers one.
pub const UT_PEX_DISCRIMINATOR_DROPPED: u8 = 0;
pub const UT_PEX_DISCRIMINATOR_ADDED: u8 = 1;

/// Encodes a list of IPv4 peers into the compact 6-bytes-per-peer format
/// used by ut_pex.
pub fn encode_compact_peers(peers: &[SocketAddrV4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(peers.len() * 6);
    for peer in peers {
        out.extend_from_slice(&peer.ip().octets());
        out.extend_from_slice(&peer.port().to_be_bytes());
    }
    out
}

pub fn decode_compact_peers(data: &[u8]) -> Result<Vec<SocketAddrV4>, ProtocolError> {
    if data.len() % 6 != 0 {
        return Err(ProtocolError::LengthMismatch {
            declared: data.len() as u32,
            actual: data.len() as u32,
        });
    }
    Ok(data
        .chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect())
}

/// Builds the payload of a single ut_pex extension message: the locally
/// negotiated ut_pex extension id, a discriminator byte, and the
/// concatenated compact peer records.
pub fn build_ut_pex_message(ut_pex_id: u8, added: bool, peers: &[SocketAddrV4]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + peers.len() * 6);
    payload.push(ut_pex_id);
    payload.push(if added {
        UT_PEX_DISCRIMINATOR_ADDED
    } else {
        UT_PEX_DISCRIMINATOR_DROPPED
    });
    payload.extend_from_slice(&encode_compact_peers(peers));
    payload
}

pub fn parse_ut_pex_message(payload: &[u8]) -> Result<(u8, bool, Vec<SocketAddrV4>), ProtocolError> {
    if payload.len() < 2 {
        return Err(ProtocolError::LengthMismatch {
            declared: payload.len() as u32,
            actual: 2,
        });
    }
    let ut_pex_id = payload[0];
    let added = payload[1] == UT_PEX_DISCRIMINATOR_ADDED;
    let peers = decode_compact_peers(&payload[2..])?;
    Ok((ut_pex_id, added, peers))
}

/// The bencoded body of the `ut_v2_upgrade` extension message sent when
/// attempting to upgrade a v1 connection to v2 after noticing the peer
/// advertised BEP 10 extension protocol support.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct V2UpgradeRequest {
    pub info_hash_v2: ByteBuf,
    pub peer_id: ByteBuf,
    pub version: String,
}

impl V2UpgradeRequest {
    pub fn new(info_hash_v2: [u8; 32], peer_id: PeerId) -> Self {
        Self {
            info_hash_v2: ByteBuf::from(info_hash_v2.to_vec()),
            peer_id: ByteBuf::from(peer_id.to_vec()),
            version: "2.0".to_string(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_bencode::to_bytes(self)
            .map_err(|_| ProtocolError::InvalidMessageId(V2_UPGRADE_EXTENSION_ID))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_bencode::from_bytes(bytes)
            .map_err(|_| ProtocolError::InvalidMessageId(V2_UPGRADE_EXTENSION_ID))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_peer_list_round_trips() {
        let peers = vec![
            SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6881),
            SocketAddrV4::new(Ipv4Addr::new(5, 6, 7, 8), 51413),
        ];
        let encoded = encode_compact_peers(&peers);
        assert_eq!(encoded.len(), 12);
        assert_eq!(decode_compact_peers(&encoded).unwrap(), peers);
    }

    #[test]
    fn ut_pex_message_round_trips_discriminator() {
        let peers = vec![SocketAddrV4::new(Ipv4Addr::new(9, 9, 9, 9), 1)];
        let added = build_ut_pex_message(5, true, &peers);
        let (id, is_added, decoded) = parse_ut_pex_message(&added).unwrap();
        assert_eq!(id, 5);
        assert!(is_added);
        assert_eq!(decoded, peers);

        let dropped = build_ut_pex_message(5, false, &peers);
        let (_, is_added, _) = parse_ut_pex_message(&dropped).unwrap();
        assert!(!is_added);
    }

    #[test]
    fn v2_upgrade_request_round_trips_through_bencode() {
        let req = V2UpgradeRequest::new([1u8; 32], [2u8; 20]);
        let encoded = req.encode().unwrap();
        let decoded = V2UpgradeRequest::decode(&encoded).unwrap();
        assert_eq!(decoded, req);
    }
}
