//! BEP 52 v2 extension messages: piece layer and file tree exchange.
//!
//! Every message is framed as `<u32 length><u8 id><payload>`, the same outer
//! framing the rest of the wire protocol uses. `length` counts the id byte
//! plus the payload.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

pub const PIECE_LAYER_REQUEST_ID: u8 = 20;
pub const PIECE_LAYER_RESPONSE_ID: u8 = 21;
pub const FILE_TREE_REQUEST_ID: u8 = 22;
pub const FILE_TREE_RESPONSE_ID: u8 = 23;

const SHA256_LEN: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PieceLayerRequest {
    pieces_root: [u8; 32],
}

impl PieceLayerRequest {
    /// Rejects a malformed `pieces_root` at construction time rather than
    /// only at decode time.
    pub fn new(pieces_root: &[u8]) -> Result<Self, ProtocolError> {
        if pieces_root.len() != SHA256_LEN {
            return Err(ProtocolError::InvalidPiecesRoot(pieces_root.len()));
        }
        let mut root = [0u8; 32];
        root.copy_from_slice(pieces_root);
        Ok(Self { pieces_root: root })
    }

    pub fn pieces_root(&self) -> &[u8; 32] {
        &self.pieces_root
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PieceLayerResponse {
    pieces_root: [u8; 32],
    piece_hashes: Vec<[u8; 32]>,
}

impl PieceLayerResponse {
    pub fn new(pieces_root: &[u8], piece_hashes: Vec<[u8; 32]>) -> Result<Self, ProtocolError> {
        if pieces_root.len() != SHA256_LEN {
            return Err(ProtocolError::InvalidPiecesRoot(pieces_root.len()));
        }
        let mut root = [0u8; 32];
        root.copy_from_slice(pieces_root);
        Ok(Self {
            pieces_root: root,
            piece_hashes,
        })
    }

    pub fn pieces_root(&self) -> &[u8; 32] {
        &self.pieces_root
    }

    pub fn piece_hashes(&self) -> &[[u8; 32]] {
        &self.piece_hashes
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileTreeRequest;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileTreeResponse {
    body: Vec<u8>,
}

impl FileTreeResponse {
    /// Rejects an empty body at construction time, not only at decode time.
    pub fn new(body: Vec<u8>) -> Result<Self, ProtocolError> {
        if body.is_empty() {
            return Err(ProtocolError::EmptyFileTree);
        }
        Ok(Self { body })
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum V2Message {
    PieceLayerRequest(PieceLayerRequest),
    PieceLayerResponse(PieceLayerResponse),
    FileTreeRequest(FileTreeRequest),
    FileTreeResponse(FileTreeResponse),
}

impl V2Message {
    pub fn id(&self) -> u8 {
        match self {
            V2Message::PieceLayerRequest(_) => PIECE_LAYER_REQUEST_ID,
            V2Message::PieceLayerResponse(_) => PIECE_LAYER_RESPONSE_ID,
            V2Message::FileTreeRequest(_) => FILE_TREE_REQUEST_ID,
            V2Message::FileTreeResponse(_) => FILE_TREE_RESPONSE_ID,
        }
    }

    fn payload_len(&self) -> u32 {
        (match self {
            V2Message::PieceLayerRequest(_) => SHA256_LEN,
            V2Message::PieceLayerResponse(r) => SHA256_LEN + r.piece_hashes.len() * SHA256_LEN,
            V2Message::FileTreeRequest(_) => 0,
            V2Message::FileTreeResponse(r) => r.body.len(),
        }) as u32
    }
}

/// Framing codec for the four v2 message types. The outer length prefix
/// counts the id byte plus payload, matching the rest of the wire protocol.
pub struct V2MessageCodec;

impl Decoder for V2MessageCodec {
    type Item = V2Message;
    type Error = ProtocolError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let declared_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let frame_len = 4 + declared_len as usize;
        if buf.len() < frame_len {
            return Ok(None);
        }

        buf.advance(4);
        let mut frame = buf.split_to(declared_len as usize);
        if frame.is_empty() {
            return Err(ProtocolError::LengthMismatch {
                declared: declared_len,
                actual: 0,
            });
        }
        let id = frame.get_u8();
        let payload = frame;

        let msg = match id {
            PIECE_LAYER_REQUEST_ID => {
                if payload.len() != SHA256_LEN {
                    return Err(ProtocolError::LengthMismatch {
                        declared: declared_len,
                        actual: payload.len() as u32 + 1,
                    });
                }
                V2Message::PieceLayerRequest(PieceLayerRequest::new(&payload)?)
            }
            PIECE_LAYER_RESPONSE_ID => {
                if payload.len() < SHA256_LEN {
                    return Err(ProtocolError::InvalidPiecesRoot(payload.len()));
                }
                let (root, hashes) = payload.split_at(SHA256_LEN);
                if hashes.len() % SHA256_LEN != 0 {
                    return Err(ProtocolError::InvalidHashListLength(hashes.len()));
                }
                let piece_hashes = hashes
                    .chunks_exact(SHA256_LEN)
                    .map(|c| {
                        let mut h = [0u8; 32];
                        h.copy_from_slice(c);
                        h
                    })
                    .collect();
                V2Message::PieceLayerResponse(PieceLayerResponse::new(root, piece_hashes)?)
            }
            FILE_TREE_REQUEST_ID => {
                if !payload.is_empty() {
                    return Err(ProtocolError::LengthMismatch {
                        declared: declared_len,
                        actual: payload.len() as u32 + 1,
                    });
                }
                V2Message::FileTreeRequest(FileTreeRequest)
            }
            FILE_TREE_RESPONSE_ID => {
                V2Message::FileTreeResponse(FileTreeResponse::new(payload.to_vec())?)
            }
            other => return Err(ProtocolError::InvalidMessageId(other)),
        };

        Ok(Some(msg))
    }
}

impl Encoder<V2Message> for V2MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: V2Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = item.payload_len();
        dst.reserve(4 + 1 + payload_len as usize);
        dst.put_u32(1 + payload_len);
        dst.put_u8(item.id());
        match item {
            V2Message::PieceLayerRequest(r) => dst.put_slice(&r.pieces_root),
            V2Message::PieceLayerResponse(r) => {
                dst.put_slice(&r.pieces_root);
                for hash in &r.piece_hashes {
                    dst.put_slice(hash);
                }
            }
            V2Message::FileTreeRequest(_) => {}
            V2Message::FileTreeResponse(r) => dst.put_slice(&r.body),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_decode(msg: V2Message) -> V2Message {
        let mut codec = V2MessageCodec;
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn piece_layer_request_round_trips() {
        let msg = V2Message::PieceLayerRequest(PieceLayerRequest::new(&[7u8; 32]).unwrap());
        assert_eq!(encode_decode(msg.clone()), msg);
    }

    #[test]
    fn piece_layer_response_round_trips_with_multiple_hashes() {
        let hashes = vec![[1u8; 32], [2u8; 32], [3u8; 32]];
        let msg = V2Message::PieceLayerResponse(
            PieceLayerResponse::new(&[0u8; 32], hashes).unwrap(),
        );
        assert_eq!(encode_decode(msg.clone()), msg);
    }

    #[test]
    fn file_tree_response_round_trips() {
        let msg =
            V2Message::FileTreeResponse(FileTreeResponse::new(b"bencoded-tree".to_vec()).unwrap());
        assert_eq!(encode_decode(msg.clone()), msg);
    }

    #[test]
    fn file_tree_request_round_trips() {
        let msg = V2Message::FileTreeRequest(FileTreeRequest);
        assert_eq!(encode_decode(msg.clone()), msg);
    }

    #[test]
    fn piece_layer_request_rejects_31_byte_root_at_construction() {
        assert_eq!(
            PieceLayerRequest::new(&[0u8; 31]),
            Err(ProtocolError::InvalidPiecesRoot(31))
        );
    }

    #[test]
    fn file_tree_response_rejects_empty_body_at_construction() {
        assert_eq!(
            FileTreeResponse::new(Vec::new()),
            Err(ProtocolError::EmptyFileTree)
        );
    }

    #[test]
    fn piece_layer_response_with_non_multiple_of_32_hash_payload_fails_decode() {
        let mut buf = BytesMut::new();
        let total_payload = SHA256_LEN + 10; // not a multiple of 32 after the root
        buf.put_u32((1 + total_payload) as u32);
        buf.put_u8(PIECE_LAYER_RESPONSE_ID);
        buf.put_slice(&[0u8; SHA256_LEN]);
        buf.put_slice(&[0u8; 10]);

        let mut codec = V2MessageCodec;
        assert_eq!(
            codec.decode(&mut buf),
            Err(ProtocolError::InvalidHashListLength(10))
        );
    }

    #[test]
    fn unknown_message_id_fails_decode() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(99);
        let mut codec = V2MessageCodec;
        assert_eq!(codec.decode(&mut buf), Err(ProtocolError::InvalidMessageId(99)));
    }
}
