//! Handshake framing and version negotiation.
//!
//! `<len=19><"BitTorrent protocol"><8 reserved bytes><info_hash(es)><peer_id>`
//!
//! Bit 0 of the first reserved byte signals v2 capability (BEP 52); bit 4 of
//! the sixth reserved byte signals BEP 10 extension protocol support.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::HandshakeError,
    protocol::{ExpectedInfoHash, ProtocolVersion},
    PeerId,
};

pub const PROTOCOL_STRING: &str = "BitTorrent protocol";
pub const PSTRLEN: u8 = 19;

const V2_BIT_BYTE: usize = 0;
const V2_BIT_MASK: u8 = 0x01;
const EXTENSION_BIT_BYTE: usize = 5;
const EXTENSION_BIT_MASK: u8 = 0x10;

/// Extension message id used for the (implementation-defined) v1-to-v2
/// upgrade handshake. The wire format does not depend on the specific value;
/// this crate fixes it to match the id the reference implementation picked.
pub const V2_UPGRADE_EXTENSION_ID: u8 = 1;

/// A parsed handshake. Which of `info_hash_v1`/`info_hash_v2` are populated
/// depends on which of the three wire sizes (68/80/100 bytes) was received.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash_v1: Option<[u8; 20]>,
    pub info_hash_v2: Option<[u8; 32]>,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn supports_v2(&self) -> bool {
        self.reserved[V2_BIT_BYTE] & V2_BIT_MASK != 0
    }

    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[EXTENSION_BIT_BYTE] & EXTENSION_BIT_MASK != 0
    }

    fn new_reserved(v2: bool, extension_protocol: bool) -> [u8; 8] {
        let mut reserved = [0u8; 8];
        if v2 {
            reserved[V2_BIT_BYTE] |= V2_BIT_MASK;
        }
        if extension_protocol {
            reserved[EXTENSION_BIT_BYTE] |= EXTENSION_BIT_MASK;
        }
        reserved
    }

    /// Builds a plain v1 handshake (68 bytes on the wire).
    pub fn new_v1(info_hash_v1: [u8; 20], peer_id: PeerId, extension_protocol: bool) -> Self {
        Self {
            reserved: Self::new_reserved(false, extension_protocol),
            info_hash_v1: Some(info_hash_v1),
            info_hash_v2: None,
            peer_id,
        }
    }

    /// Builds a plain v2 handshake (80 bytes on the wire).
    pub fn new_v2(info_hash_v2: [u8; 32], peer_id: PeerId, extension_protocol: bool) -> Self {
        Self {
            reserved: Self::new_reserved(true, extension_protocol),
            info_hash_v1: None,
            info_hash_v2: Some(info_hash_v2),
            peer_id,
        }
    }

    /// Builds a hybrid handshake. When `extended` is true both hashes are
    /// sent (100 bytes); otherwise only the v1 hash is sent with the v2 bit
    /// set (68 bytes), per the standard hybrid compatibility form.
    pub fn new_hybrid(
        info_hash_v1: [u8; 20],
        info_hash_v2: [u8; 32],
        peer_id: PeerId,
        extended: bool,
        extension_protocol: bool,
    ) -> Self {
        Self {
            reserved: Self::new_reserved(true, extension_protocol),
            info_hash_v1: Some(info_hash_v1),
            info_hash_v2: if extended { Some(info_hash_v2) } else { None },
            peer_id,
        }
    }

    /// The size in bytes this handshake will occupy on the wire.
    pub fn wire_len(&self) -> usize {
        let header = 1 + PROTOCOL_STRING.len() + 8;
        let hashes = match (self.info_hash_v1.is_some(), self.info_hash_v2.is_some()) {
            (true, true) => 20 + 32,
            (true, false) => 20,
            (false, true) => 32,
            (false, false) => 0,
        };
        header + hashes + 20
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.wire_len());
        buf.put_u8(PSTRLEN);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&self.reserved);
        if let Some(v1) = self.info_hash_v1 {
            buf.put_slice(&v1);
        }
        if let Some(v2) = self.info_hash_v2 {
            buf.put_slice(&v2);
        }
        buf.put_slice(&self.peer_id);
    }
}

/// Reads the length byte, validates the protocol string, and classifies the
/// handshake by total length:
///
/// - 68 bytes, v2 bit clear -> V1
/// - 68 bytes, v2 bit set   -> HYBRID (v1 hash only)
/// - 80 bytes               -> V2
/// - 100 bytes               -> HYBRID (both hashes)
/// - anything else          -> `HandshakeError::InvalidSize`
/// - fewer than 68 bytes    -> `HandshakeError::TooShort`
pub fn classify_and_parse(
    buf: &[u8],
) -> Result<(Handshake, ProtocolVersion), HandshakeError> {
    if buf.len() < 68 {
        return Err(HandshakeError::TooShort);
    }
    if buf[0] != PSTRLEN || &buf[1..20] != PROTOCOL_STRING.as_bytes() {
        return Err(HandshakeError::InvalidProtocol);
    }
    let mut reserved = [0u8; 8];
    reserved.copy_from_slice(&buf[20..28]);
    let v2_bit = reserved[V2_BIT_BYTE] & V2_BIT_MASK != 0;

    match buf.len() {
        68 => {
            let mut v1_hash = [0u8; 20];
            v1_hash.copy_from_slice(&buf[28..48]);
            let mut peer_id = [0u8; 20];
            peer_id.copy_from_slice(&buf[48..68]);
            let version = if v2_bit {
                ProtocolVersion::Hybrid
            } else {
                ProtocolVersion::V1
            };
            Ok((
                Handshake {
                    reserved,
                    info_hash_v1: Some(v1_hash),
                    info_hash_v2: None,
                    peer_id,
                },
                version,
            ))
        }
        80 => {
            let mut v2_hash = [0u8; 32];
            v2_hash.copy_from_slice(&buf[28..60]);
            let mut peer_id = [0u8; 20];
            peer_id.copy_from_slice(&buf[60..80]);
            Ok((
                Handshake {
                    reserved,
                    info_hash_v1: None,
                    info_hash_v2: Some(v2_hash),
                    peer_id,
                },
                ProtocolVersion::V2,
            ))
        }
        100 => {
            let mut v1_hash = [0u8; 20];
            v1_hash.copy_from_slice(&buf[28..48]);
            let mut v2_hash = [0u8; 32];
            v2_hash.copy_from_slice(&buf[48..80]);
            let mut peer_id = [0u8; 20];
            peer_id.copy_from_slice(&buf[80..100]);
            Ok((
                Handshake {
                    reserved,
                    info_hash_v1: Some(v1_hash),
                    info_hash_v2: Some(v2_hash),
                    peer_id,
                },
                ProtocolVersion::Hybrid,
            ))
        }
        _ => Err(HandshakeError::InvalidSize),
    }
}

/// Validates that the handshake's hash(es) relevant to the negotiated
/// version match what the receiver expected, byte for byte.
pub fn validate_info_hash(
    handshake: &Handshake,
    expected: &ExpectedInfoHash,
    negotiated: ProtocolVersion,
) -> Result<(), HandshakeError> {
    let check_v1 = |got: Option<[u8; 20]>| -> Result<(), HandshakeError> {
        match (got, expected.v1) {
            (Some(got), Some(want)) if got == want => Ok(()),
            (_, None) => Ok(()),
            _ => Err(HandshakeError::HashMismatch),
        }
    };
    let check_v2 = |got: Option<[u8; 32]>| -> Result<(), HandshakeError> {
        match (got, expected.v2) {
            (Some(got), Some(want)) if got == want => Ok(()),
            (_, None) => Ok(()),
            _ => Err(HandshakeError::HashMismatch),
        }
    };

    match negotiated {
        ProtocolVersion::V1 => check_v1(handshake.info_hash_v1),
        ProtocolVersion::V2 => check_v2(handshake.info_hash_v2),
        ProtocolVersion::Hybrid => {
            check_v1(handshake.info_hash_v1)?;
            if handshake.info_hash_v2.is_some() {
                check_v2(handshake.info_hash_v2)?;
            }
            Ok(())
        }
    }
}

/// Frames handshakes on the wire. Since the handshake carries no explicit
/// length prefix, the codec is told at construction time whether it should
/// wait for the extended (100 byte) hybrid form or stop at the standard
/// (68/80 byte) form, mirroring what the local side itself sent or is
/// willing to accept.
pub struct HandshakeCodec {
    expect_extended_hybrid: bool,
}

impl HandshakeCodec {
    pub fn new(expect_extended_hybrid: bool) -> Self {
        Self {
            expect_extended_hybrid,
        }
    }
}

impl Decoder for HandshakeCodec {
    type Item = (Handshake, ProtocolVersion);
    type Error = HandshakeError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 28 {
            return Ok(None);
        }
        if buf[0] != PSTRLEN {
            return Err(HandshakeError::InvalidProtocol);
        }
        if &buf[1..20] != PROTOCOL_STRING.as_bytes() {
            return Err(HandshakeError::InvalidProtocol);
        }
        let v2_bit = buf[20 + V2_BIT_BYTE] & V2_BIT_MASK != 0;
        let needed = if !v2_bit {
            68
        } else if self.expect_extended_hybrid {
            100
        } else {
            80
        };
        if buf.len() < needed {
            return Ok(None);
        }
        let frame = buf.split_to(needed);
        let (handshake, version) = classify_and_parse(&frame)?;
        Ok(Some((handshake, version)))
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = HandshakeError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_id(byte: u8) -> PeerId {
        [byte; 20]
    }

    #[test]
    fn v1_handshake_round_trips() {
        let hs = Handshake::new_v1([1u8; 20], peer_id(2), false);
        assert_eq!(hs.wire_len(), 68);
        let mut buf = BytesMut::new();
        hs.encode_into(&mut buf);
        let (parsed, version) = classify_and_parse(&buf).unwrap();
        assert_eq!(version, ProtocolVersion::V1);
        assert_eq!(parsed, hs);
    }

    #[test]
    fn v2_handshake_round_trips() {
        let hs = Handshake::new_v2([3u8; 32], peer_id(4), true);
        assert_eq!(hs.wire_len(), 80);
        let mut buf = BytesMut::new();
        hs.encode_into(&mut buf);
        let (parsed, version) = classify_and_parse(&buf).unwrap();
        assert_eq!(version, ProtocolVersion::V2);
        assert_eq!(parsed, hs);
        assert!(parsed.supports_extension_protocol());
    }

    #[test]
    fn hybrid_extended_handshake_round_trips() {
        let hs = Handshake::new_hybrid([5u8; 20], [6u8; 32], peer_id(7), true, false);
        assert_eq!(hs.wire_len(), 100);
        let mut buf = BytesMut::new();
        hs.encode_into(&mut buf);
        let (parsed, version) = classify_and_parse(&buf).unwrap();
        assert_eq!(version, ProtocolVersion::Hybrid);
        assert_eq!(parsed, hs);
    }

    #[test]
    fn hybrid_standard_handshake_is_68_bytes() {
        let hs = Handshake::new_hybrid([5u8; 20], [6u8; 32], peer_id(7), false, false);
        assert_eq!(hs.wire_len(), 68);
        let mut buf = BytesMut::new();
        hs.encode_into(&mut buf);
        let (_, version) = classify_and_parse(&buf).unwrap();
        assert_eq!(version, ProtocolVersion::Hybrid);
    }

    #[test]
    fn handshake_of_67_bytes_is_too_short() {
        let buf = vec![0u8; 67];
        assert_eq!(classify_and_parse(&buf), Err(HandshakeError::TooShort));
    }

    #[test]
    fn handshake_of_69_bytes_is_invalid_size() {
        let mut buf = vec![0u8; 69];
        buf[0] = PSTRLEN;
        buf[1..20].copy_from_slice(PROTOCOL_STRING.as_bytes());
        assert_eq!(classify_and_parse(&buf), Err(HandshakeError::InvalidSize));
    }

    #[test]
    fn v1_peer_v2_client_has_no_compatible_version() {
        let buf_hs = {
            let mut b = vec![0u8; 68];
            b[0] = PSTRLEN;
            b[1..20].copy_from_slice(PROTOCOL_STRING.as_bytes());
            b[28..48].copy_from_slice(&[9u8; 20]);
            b[48..68].copy_from_slice(&[10u8; 20]);
            b
        };
        let (_, peer_version) = classify_and_parse(&buf_hs).unwrap();
        assert_eq!(peer_version, ProtocolVersion::V1);
        let negotiated =
            crate::protocol::negotiate_version(peer_version, &[ProtocolVersion::V2]);
        assert_eq!(negotiated, None);
    }

    #[test]
    fn hybrid_peer_hybrid_client_validates_v1_hash() {
        let mut buf = vec![0u8; 68];
        buf[0] = PSTRLEN;
        buf[1..20].copy_from_slice(PROTOCOL_STRING.as_bytes());
        buf[20] = V2_BIT_MASK;
        buf[28..48].copy_from_slice(&[11u8; 20]);
        buf[48..68].copy_from_slice(&[12u8; 20]);

        let (handshake, peer_version) = classify_and_parse(&buf).unwrap();
        assert_eq!(peer_version, ProtocolVersion::Hybrid);
        let negotiated =
            crate::protocol::negotiate_version(peer_version, &[ProtocolVersion::Hybrid]).unwrap();
        assert_eq!(negotiated, ProtocolVersion::Hybrid);

        let expected = ExpectedInfoHash {
            v1: Some([11u8; 20]),
            v2: None,
        };
        assert!(validate_info_hash(&handshake, &expected, negotiated).is_ok());
    }

    #[test]
    fn hash_mismatch_is_rejected() {
        let hs = Handshake::new_v1([1u8; 20], peer_id(2), false);
        let expected = ExpectedInfoHash {
            v1: Some([0xffu8; 20]),
            v2: None,
        };
        assert_eq!(
            validate_info_hash(&hs, &expected, ProtocolVersion::V1),
            Err(HandshakeError::HashMismatch)
        );
    }
}
