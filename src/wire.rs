//! Peer wire protocol framing.
//!
//! The 68-byte handshake and the length-prefixed message stream are framed
//! by two codecs; the connection starts with [`HandshakeCodec`] and is
//! re-framed with [`PeerCodec`] once the handshake is validated. Message
//! semantics live in the peer module; this file only maps bytes to and
//! from [`Message`] values.

use crate::error::BtError;
use crate::metainfo::InfoHash;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Fixed protocol string from BEP-3.
pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// REQUEST/PIECE granularity.
pub const BLOCK_SIZE: u32 = 16_384;

/// Messages above this length prefix are treated as a protocol violation.
pub const MAX_MESSAGE_LEN: u32 = 0x100000;

/// Reserved-byte advertisement: byte 7 bit 0x04 = Fast Extension (BEP-6),
/// byte 5 bit 0x10 = Extension Protocol (BEP-10).
const RESERVED_FAST: (usize, u8) = (7, 0x04);
const RESERVED_EXT: (usize, u8) = (5, 0x10);

pub const MSG_CHOKE: u8 = 0x00;
pub const MSG_UNCHOKE: u8 = 0x01;
pub const MSG_INTERESTED: u8 = 0x02;
pub const MSG_NOT_INTERESTED: u8 = 0x03;
pub const MSG_HAVE: u8 = 0x04;
pub const MSG_BITFIELD: u8 = 0x05;
pub const MSG_REQUEST: u8 = 0x06;
pub const MSG_PIECE: u8 = 0x07;
pub const MSG_CANCEL: u8 = 0x08;
pub const MSG_HAVE_ALL: u8 = 0x0e;
pub const MSG_HAVE_NONE: u8 = 0x0f;
pub const MSG_REJECT: u8 = 0x10;
pub const MSG_ALLOWED_FAST: u8 = 0x11;
pub const MSG_EXTENSION: u8 = 0x14;

/// The 68-byte connection preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub fast_ext: bool,
    pub ext_prot: bool,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: [u8; 20]) -> Self {
        Handshake {
            info_hash,
            peer_id,
            fast_ext: true,
            ext_prot: true,
        }
    }
}

/// Codec for the handshake phase. Decoding waits for the full 68 bytes.
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = BtError;

    fn encode(&mut self, hs: Handshake, dst: &mut BytesMut) -> Result<(), BtError> {
        dst.reserve(68);
        dst.put_u8(19);
        dst.put_slice(PROTOCOL);
        let mut reserved = [0u8; 8];
        if hs.fast_ext {
            reserved[RESERVED_FAST.0] |= RESERVED_FAST.1;
        }
        if hs.ext_prot {
            reserved[RESERVED_EXT.0] |= RESERVED_EXT.1;
        }
        dst.put_slice(&reserved);
        dst.put_slice(hs.info_hash.as_bytes());
        dst.put_slice(&hs.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = BtError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>, BtError> {
        if src.len() < 68 {
            return Ok(None);
        }
        let msg = src.split_to(68);
        if msg[0] != 19 || &msg[1..20] != PROTOCOL {
            return Err(BtError::WrongProtocol);
        }
        let reserved = &msg[20..28];
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&msg[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&msg[48..68]);
        Ok(Some(Handshake {
            info_hash: InfoHash(info_hash),
            peer_id,
            fast_ext: reserved[RESERVED_FAST.0] & RESERVED_FAST.1 != 0,
            ext_prot: reserved[RESERVED_EXT.0] & RESERVED_EXT.1 != 0,
        }))
    }
}

/// One framed peer message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request {
        piece: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        piece: u32,
        begin: u32,
        data: Bytes,
    },
    Cancel {
        piece: u32,
        begin: u32,
        length: u32,
    },
    HaveAll,
    HaveNone,
    Reject {
        piece: u32,
        begin: u32,
        length: u32,
    },
    AllowedFast(u32),
    /// BEP-10 message: extension message id plus raw payload (bencoded
    /// header, possibly followed by binary data).
    Extension {
        ext_id: u8,
        payload: Bytes,
    },
    /// Ids the engine does not act on (e.g. PORT); kept so the dispatch
    /// can log and move on instead of failing the connection.
    Unknown(u8),
}

/// Codec for the post-handshake message stream.
pub struct PeerCodec;

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = BtError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, BtError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if len > MAX_MESSAGE_LEN {
            return Err(BtError::OversizedMessage(len));
        }
        if src.len() < 4 + len as usize {
            src.reserve(4 + len as usize - src.len());
            return Ok(None);
        }
        src.advance(4);
        if len == 0 {
            return Ok(Some(Message::KeepAlive));
        }
        let mut body = src.split_to(len as usize).freeze();
        let msgid = body.get_u8();
        Ok(Some(parse_body(msgid, body)?))
    }
}

fn parse_body(msgid: u8, mut body: Bytes) -> Result<Message, BtError> {
    let need = |n: usize, what: &str| -> Result<(), BtError> {
        if body.len() != n {
            Err(BtError::MalformedMessage(format!(
                "{what} body is {} bytes, expected {n}",
                body.len()
            )))
        } else {
            Ok(())
        }
    };

    let msg = match msgid {
        MSG_CHOKE => Message::Choke,
        MSG_UNCHOKE => Message::Unchoke,
        MSG_INTERESTED => Message::Interested,
        MSG_NOT_INTERESTED => Message::NotInterested,
        MSG_HAVE => {
            need(4, "have")?;
            Message::Have(body.get_u32())
        }
        MSG_BITFIELD => Message::Bitfield(body),
        MSG_REQUEST => {
            need(12, "request")?;
            Message::Request {
                piece: body.get_u32(),
                begin: body.get_u32(),
                length: body.get_u32(),
            }
        }
        MSG_PIECE => {
            if body.len() < 8 {
                return Err(BtError::MalformedMessage("short piece header".into()));
            }
            Message::Piece {
                piece: body.get_u32(),
                begin: body.get_u32(),
                data: body,
            }
        }
        MSG_CANCEL => {
            need(12, "cancel")?;
            Message::Cancel {
                piece: body.get_u32(),
                begin: body.get_u32(),
                length: body.get_u32(),
            }
        }
        MSG_HAVE_ALL => Message::HaveAll,
        MSG_HAVE_NONE => Message::HaveNone,
        MSG_REJECT => {
            need(12, "reject")?;
            Message::Reject {
                piece: body.get_u32(),
                begin: body.get_u32(),
                length: body.get_u32(),
            }
        }
        MSG_ALLOWED_FAST => {
            need(4, "allowed_fast")?;
            Message::AllowedFast(body.get_u32())
        }
        MSG_EXTENSION => {
            if body.is_empty() {
                return Err(BtError::MalformedMessage("empty extension message".into()));
            }
            Message::Extension {
                ext_id: body.get_u8(),
                payload: body,
            }
        }
        other => Message::Unknown(other),
    };
    Ok(msg)
}

impl Encoder<Message> for PeerCodec {
    type Error = BtError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), BtError> {
        match msg {
            Message::KeepAlive => dst.put_u32(0),
            Message::Choke => put_header(dst, 1, MSG_CHOKE),
            Message::Unchoke => put_header(dst, 1, MSG_UNCHOKE),
            Message::Interested => put_header(dst, 1, MSG_INTERESTED),
            Message::NotInterested => put_header(dst, 1, MSG_NOT_INTERESTED),
            Message::Have(piece) => {
                put_header(dst, 5, MSG_HAVE);
                dst.put_u32(piece);
            }
            Message::Bitfield(bits) => {
                put_header(dst, 1 + bits.len() as u32, MSG_BITFIELD);
                dst.put_slice(&bits);
            }
            Message::Request {
                piece,
                begin,
                length,
            } => put_triple(dst, MSG_REQUEST, piece, begin, length),
            Message::Piece { piece, begin, data } => {
                put_header(dst, 9 + data.len() as u32, MSG_PIECE);
                dst.put_u32(piece);
                dst.put_u32(begin);
                dst.put_slice(&data);
            }
            Message::Cancel {
                piece,
                begin,
                length,
            } => put_triple(dst, MSG_CANCEL, piece, begin, length),
            Message::HaveAll => put_header(dst, 1, MSG_HAVE_ALL),
            Message::HaveNone => put_header(dst, 1, MSG_HAVE_NONE),
            Message::Reject {
                piece,
                begin,
                length,
            } => put_triple(dst, MSG_REJECT, piece, begin, length),
            Message::AllowedFast(piece) => {
                put_header(dst, 5, MSG_ALLOWED_FAST);
                dst.put_u32(piece);
            }
            Message::Extension { ext_id, payload } => {
                put_header(dst, 2 + payload.len() as u32, MSG_EXTENSION);
                dst.put_u8(ext_id);
                dst.put_slice(&payload);
            }
            Message::Unknown(id) => put_header(dst, 1, id),
        }
        Ok(())
    }
}

fn put_header(dst: &mut BytesMut, len: u32, msgid: u8) {
    dst.reserve(4 + len as usize);
    dst.put_u32(len);
    dst.put_u8(msgid);
}

fn put_triple(dst: &mut BytesMut, msgid: u8, piece: u32, begin: u32, length: u32) {
    put_header(dst, 13, msgid);
    dst.put_u32(piece);
    dst.put_u32(begin);
    dst.put_u32(length);
}

/// Number of bytes a bitfield for `num_pieces` pieces occupies.
pub fn bitfield_len(num_pieces: u32) -> usize {
    (num_pieces as usize + 7) / 8
}

/// Test whether `piece` is set in a wire-format bitfield (MSB first).
pub fn bitfield_get(bits: &[u8], piece: u32) -> bool {
    let idx = piece as usize;
    idx / 8 < bits.len() && bits[idx / 8] & (0x80 >> (idx & 7)) != 0
}

/// Set `piece` in a wire-format bitfield.
pub fn bitfield_set(bits: &mut [u8], piece: u32) {
    let idx = piece as usize;
    if idx / 8 < bits.len() {
        bits[idx / 8] |= 0x80 >> (idx & 7);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) -> Message {
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        PeerCodec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_handshake_roundtrip() {
        let hs = Handshake::new(InfoHash([0xaa; 20]), [0x42; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(hs.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), 68);
        assert_eq!(buf[25], 0x10); // extension protocol bit
        assert_eq!(buf[27], 0x04); // fast extension bit
        let back = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(back, hs);
    }

    #[test]
    fn test_handshake_needs_full_preamble() {
        let mut buf = BytesMut::from(&[19u8; 40][..]);
        assert!(HandshakeCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_handshake_wrong_magic() {
        let mut buf = BytesMut::zeroed(68);
        buf[0] = 19;
        buf[1..20].copy_from_slice(b"BitTorrent protocoX");
        assert!(matches!(
            HandshakeCodec.decode(&mut buf),
            Err(BtError::WrongProtocol)
        ));
    }

    #[test]
    fn test_message_roundtrips() {
        assert_eq!(roundtrip(Message::KeepAlive), Message::KeepAlive);
        assert_eq!(roundtrip(Message::Unchoke), Message::Unchoke);
        assert_eq!(roundtrip(Message::Have(7)), Message::Have(7));
        let req = Message::Request {
            piece: 3,
            begin: 16384,
            length: 16384,
        };
        assert_eq!(roundtrip(req.clone()), req);
        let piece = Message::Piece {
            piece: 3,
            begin: 16384,
            data: Bytes::from_static(b"hello"),
        };
        assert_eq!(roundtrip(piece.clone()), piece);
        let ext = Message::Extension {
            ext_id: 2,
            payload: Bytes::from_static(b"d1:ai1ee"),
        };
        assert_eq!(roundtrip(ext.clone()), ext);
        assert_eq!(roundtrip(Message::HaveAll), Message::HaveAll);
    }

    #[test]
    fn test_request_wire_bytes() {
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(
                Message::Request {
                    piece: 1,
                    begin: 2,
                    length: 3,
                },
                &mut buf,
            )
            .unwrap();
        assert_eq!(
            &buf[..],
            &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]
        );
    }

    #[test]
    fn test_partial_frames_wait() {
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(Message::Have(1), &mut buf)
            .unwrap();
        let full = buf.clone();

        let mut partial = BytesMut::from(&full[..6]);
        assert!(PeerCodec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[6..]);
        assert_eq!(
            PeerCodec.decode(&mut partial).unwrap().unwrap(),
            Message::Have(1)
        );
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MESSAGE_LEN + 1);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(BtError::OversizedMessage(_))
        ));
    }

    #[test]
    fn test_malformed_bodies_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(MSG_HAVE);
        buf.put_slice(&[0, 1]);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(BtError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_unknown_id_is_not_fatal() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(0x09); // PORT
        buf.put_slice(&[0x1a, 0xe1]);
        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap().unwrap(),
            Message::Unknown(0x09)
        );
    }

    #[test]
    fn test_bitfield_bit_order() {
        let mut bits = vec![0u8; bitfield_len(10)];
        bitfield_set(&mut bits, 0);
        bitfield_set(&mut bits, 9);
        assert_eq!(bits, vec![0x80, 0x40]);
        assert!(bitfield_get(&bits, 0));
        assert!(bitfield_get(&bits, 9));
        assert!(!bitfield_get(&bits, 1));
        assert!(!bitfield_get(&bits, 100));
    }
}
