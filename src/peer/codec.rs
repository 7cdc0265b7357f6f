//! The wire codecs for the two framings used on a peer connection: the fixed
//! 68-byte handshake that opens the connection, and the length-prefixed
//! message stream that follows it.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{bitfield::Bitfield, error::PeerError, BlockInfo, PeerId, PieceIndex, Sha1Hash};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The maximum size we allow a single peer message's length prefix to
/// declare, to keep a misbehaving or malicious peer from making us buffer an
/// unbounded amount of memory. Pieces are chunked into 16 KiB blocks, so this
/// leaves ample headroom.
const MAX_MESSAGE_LEN: u32 = 1 << 20;

/// The BitTorrent handshake, the first message exchanged on a peer
/// connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    /// The protocol string, always `PROTOCOL_STRING`, but kept around after
    /// parsing for a `debug_assert` at the call site.
    pub prot: [u8; 19],
    /// Reserved bytes used to advertise protocol extensions. We don't
    /// support any, so we always send and ignore all-zero reserved bytes.
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self {
            prot: *b"BitTorrent protocol",
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = PeerError;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<(), Self::Error> {
        buf.reserve(68);
        buf.put_u8(19);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        let prot_len = buf[0] as usize;
        if prot_len != 19 {
            return Err(PeerError::Protocol(format!(
                "invalid protocol string length: {}",
                prot_len
            )));
        }

        // 1 (prot_len) + 19 (prot) + 8 (reserved) + 20 (info_hash) + 20 (peer_id)
        let full_len = 1 + prot_len + 8 + 20 + 20;
        if buf.len() < full_len {
            buf.reserve(full_len - buf.len());
            return Ok(None);
        }

        let mut buf = buf.split_to(full_len);
        buf.advance(1);

        let mut prot = [0; 19];
        prot.copy_from_slice(&buf[0..19]);
        if &prot[..] != PROTOCOL_STRING.as_bytes() {
            return Err(PeerError::Protocol(format!(
                "invalid protocol string: {:?}",
                prot
            )));
        }
        buf.advance(19);

        let mut reserved = [0; 8];
        reserved.copy_from_slice(&buf[0..8]);
        buf.advance(8);

        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&buf[0..20]);
        buf.advance(20);

        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&buf[0..20]);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The numeric message ids, per the protocol (BEP 3), plus `Port`, used to
/// advertise a DHT node's UDP port (BEP 5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Port = 9,
}

impl MessageId {
    fn from_u8(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Choke),
            1 => Some(Self::Unchoke),
            2 => Some(Self::Interested),
            3 => Some(Self::NotInterested),
            4 => Some(Self::Have),
            5 => Some(Self::Bitfield),
            6 => Some(Self::Request),
            7 => Some(Self::Block),
            8 => Some(Self::Cancel),
            9 => Some(Self::Port),
            _ => None,
        }
    }
}

/// A peer-wire protocol message.
#[derive(Debug)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    /// Advertises the sender's DHT node listening port.
    Port(u16),
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::Port(_) => Some(MessageId::Port),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = PeerError;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(msg.id().expect("non-keepalive message has an id") as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.to_bytes();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Message::Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }

            let msg_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
            if msg_len == 0 {
                // a keep alive message, there is nothing further to decode
                buf.advance(4);
                return Ok(Some(Message::KeepAlive));
            }

            if msg_len > MAX_MESSAGE_LEN {
                return Err(PeerError::Protocol(format!(
                    "message length {} exceeds maximum of {}",
                    msg_len, MAX_MESSAGE_LEN
                )));
            }

            if buf.len() < 4 + msg_len as usize {
                buf.reserve(4 + msg_len as usize - buf.len());
                return Ok(None);
            }

            buf.advance(4);
            let mut msg_bytes = buf.split_to(msg_len as usize);
            let id = msg_bytes.get_u8();
            let id = MessageId::from_u8(id)
                .ok_or_else(|| PeerError::UnknownMessageId(id))?;

            let msg = match id {
                MessageId::Choke => Message::Choke,
                MessageId::Unchoke => Message::Unchoke,
                MessageId::Interested => Message::Interested,
                MessageId::NotInterested => Message::NotInterested,
                MessageId::Have => {
                    if msg_bytes.len() < 4 {
                        return Err(PeerError::Protocol("have message too short".into()));
                    }
                    Message::Have {
                        piece_index: msg_bytes.get_u32() as PieceIndex,
                    }
                }
                MessageId::Bitfield => Message::Bitfield(Bitfield::from_bytes(&msg_bytes)),
                MessageId::Request => {
                    if msg_bytes.len() < 12 {
                        return Err(PeerError::Protocol("request message too short".into()));
                    }
                    Message::Request(BlockInfo {
                        piece_index: msg_bytes.get_u32() as PieceIndex,
                        offset: msg_bytes.get_u32(),
                        len: msg_bytes.get_u32(),
                    })
                }
                MessageId::Block => {
                    if msg_bytes.len() < 8 {
                        return Err(PeerError::Protocol("block message too short".into()));
                    }
                    let piece_index = msg_bytes.get_u32() as PieceIndex;
                    let offset = msg_bytes.get_u32();
                    Message::Block {
                        piece_index,
                        offset,
                        data: msg_bytes.to_vec(),
                    }
                }
                MessageId::Cancel => {
                    if msg_bytes.len() < 12 {
                        return Err(PeerError::Protocol("cancel message too short".into()));
                    }
                    Message::Cancel(BlockInfo {
                        piece_index: msg_bytes.get_u32() as PieceIndex,
                        offset: msg_bytes.get_u32(),
                        len: msg_bytes.get_u32(),
                    })
                }
                MessageId::Port => {
                    if msg_bytes.len() < 2 {
                        return Err(PeerError::Protocol("port message too short".into()));
                    }
                    Message::Port(msg_bytes.get_u16())
                }
            };

            return Ok(Some(msg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), 68);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.info_hash, [1; 20]);
        assert_eq!(decoded.peer_id, [2; 20]);
    }

    #[test]
    fn handshake_decode_waits_for_a_full_frame() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        let mut partial = buf.split_to(30);
        assert!(HandshakeCodec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn rejects_a_bad_protocol_string_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(18);
        buf.extend_from_slice(&[0; 80]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn keep_alive_round_trips() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(buf.len(), 4);
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(msg, Message::KeepAlive));
    }

    #[test]
    fn choke_family_round_trips() {
        for msg in [
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
        ] {
            let mut buf = BytesMut::new();
            let id = msg.id();
            PeerCodec.encode(msg, &mut buf).unwrap();
            let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.id(), id);
        }
    }

    #[test]
    fn have_round_trips() {
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(Message::Have { piece_index: 42 }, &mut buf)
            .unwrap();
        match PeerCodec.decode(&mut buf).unwrap().unwrap() {
            Message::Have { piece_index } => assert_eq!(piece_index, 42),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn bitfield_round_trips() {
        let mut bitfield = Bitfield::new(20);
        bitfield.insert(0);
        bitfield.insert(19);
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(Message::Bitfield(bitfield.clone()), &mut buf)
            .unwrap();
        match PeerCodec.decode(&mut buf).unwrap().unwrap() {
            Message::Bitfield(mut decoded) => {
                decoded.adjust_size(20);
                assert_eq!(decoded, bitfield);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn request_and_cancel_round_trip() {
        let block = BlockInfo {
            piece_index: 3,
            offset: 16384,
            len: 16384,
        };
        for (msg, is_cancel) in [
            (Message::Request(block), false),
            (Message::Cancel(block), true),
        ] {
            let mut buf = BytesMut::new();
            PeerCodec.encode(msg, &mut buf).unwrap();
            match PeerCodec.decode(&mut buf).unwrap().unwrap() {
                Message::Request(decoded) if !is_cancel => assert_eq!(decoded, block),
                Message::Cancel(decoded) if is_cancel => assert_eq!(decoded, block),
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    #[test]
    fn block_round_trips() {
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(
                Message::Block {
                    piece_index: 1,
                    offset: 0,
                    data: vec![1, 2, 3, 4],
                },
                &mut buf,
            )
            .unwrap();
        match PeerCodec.decode(&mut buf).unwrap().unwrap() {
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                assert_eq!(piece_index, 1);
                assert_eq!(offset, 0);
                assert_eq!(data, vec![1, 2, 3, 4]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn port_round_trips() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Port(6881), &mut buf).unwrap();
        match PeerCodec.decode(&mut buf).unwrap().unwrap() {
            Message::Port(port) => assert_eq!(port, 6881),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn decode_waits_for_full_message_before_returning() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Choke, &mut buf).unwrap();
        let mut partial = buf.split_to(2);
        assert!(PeerCodec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn rejects_an_unknown_message_id() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(200);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_an_oversized_length_prefix() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MESSAGE_LEN + 1);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }
}
