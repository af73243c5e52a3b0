//! Wire messages and the incremental length-prefixed framing codec.
//!
//! Dispatched messages are a tagged `Message` variant carrying exactly the
//! typed payload of each id, rather than the raw `(id, Vec<u8>)` pairs an
//! unpack-on-every-read style would produce.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::PeerIoError;

/// Frames larger than this are rejected outright; far above any legitimate
/// block-carrying PIECE message.
pub const MAX_MESSAGE_LENGTH: usize = 1 << 17;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield { bits: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have { .. } => Some(4),
            Message::Bitfield { .. } => Some(5),
            Message::Request { .. } => Some(6),
            Message::Piece { .. } => Some(7),
            Message::Cancel { .. } => Some(8),
        }
    }
}

/// Incremental length-prefixed parser: `[4-byte BE length][id][payload]`.
/// Holds no state across calls beyond what `tokio_util::codec::Framed`
/// itself buffers; `bytes_needed` is recomputed from the buffered length
/// prefix each time rather than stored, since `Framed` always replays from
/// the start of the buffer.
#[derive(Debug, Default)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = PeerIoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, PeerIoError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes(src[0..4].try_into().unwrap()) as usize;
        if length == 0 {
            src.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        if length > MAX_MESSAGE_LENGTH {
            return Err(PeerIoError::FrameTooLarge(length));
        }
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut payload = src.split_to(length);
        let id = payload[0];
        let rest = payload.split_off(1);

        let message = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                if rest.len() != 4 {
                    return Err(PeerIoError::MalformedPayload(id));
                }
                Message::Have {
                    index: u32::from_be_bytes(rest[0..4].try_into().unwrap()),
                }
            }
            5 => Message::Bitfield { bits: rest.to_vec() },
            6 => parse_index_begin_length(id, &rest).map(|(index, begin, length)| Message::Request {
                index,
                begin,
                length,
            })?,
            7 => {
                if rest.len() < 8 {
                    return Err(PeerIoError::MalformedPayload(id));
                }
                Message::Piece {
                    index: u32::from_be_bytes(rest[0..4].try_into().unwrap()),
                    begin: u32::from_be_bytes(rest[4..8].try_into().unwrap()),
                    block: rest[8..].to_vec(),
                }
            }
            8 => parse_index_begin_length(id, &rest).map(|(index, begin, length)| Message::Cancel {
                index,
                begin,
                length,
            })?,
            other => return Err(PeerIoError::UnknownMessageId(other)),
        };
        Ok(Some(message))
    }
}

fn parse_index_begin_length(id: u8, rest: &[u8]) -> Result<(u32, u32, u32), PeerIoError> {
    if rest.len() != 12 {
        return Err(PeerIoError::MalformedPayload(id));
    }
    Ok((
        u32::from_be_bytes(rest[0..4].try_into().unwrap()),
        u32::from_be_bytes(rest[4..8].try_into().unwrap()),
        u32::from_be_bytes(rest[8..12].try_into().unwrap()),
    ))
}

impl Encoder<Message> for MessageCodec {
    type Error = PeerIoError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), PeerIoError> {
        let id = match item.id() {
            None => {
                dst.put_u32(0);
                return Ok(());
            }
            Some(id) => id,
        };

        let payload_len = 1 + match &item {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 0,
            Message::Have { .. } => 4,
            Message::Bitfield { bits } => bits.len(),
            Message::Request { .. } | Message::Cancel { .. } => 12,
            Message::Piece { block, .. } => 8 + block.len(),
            Message::KeepAlive => unreachable!(),
        };

        dst.put_u32(payload_len as u32);
        dst.put_u8(id);
        match item {
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::KeepAlive => {}
            Message::Have { index } => dst.put_u32(index),
            Message::Bitfield { bits } => dst.put_slice(&bits),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                dst.put_u32(index);
                dst.put_u32(begin);
                dst.put_u32(length);
            }
            Message::Piece { index, begin, block } => {
                dst.put_u32(index);
                dst.put_u32(begin);
                dst.put_slice(&block);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) -> Message {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn round_trips_every_message_kind() {
        assert_eq!(round_trip(Message::KeepAlive), Message::KeepAlive);
        assert_eq!(round_trip(Message::Choke), Message::Choke);
        assert_eq!(round_trip(Message::Unchoke), Message::Unchoke);
        assert_eq!(round_trip(Message::Interested), Message::Interested);
        assert_eq!(round_trip(Message::NotInterested), Message::NotInterested);
        assert_eq!(
            round_trip(Message::Have { index: 42 }),
            Message::Have { index: 42 }
        );
        assert_eq!(
            round_trip(Message::Bitfield { bits: vec![0xFF, 0x00] }),
            Message::Bitfield { bits: vec![0xFF, 0x00] }
        );
        assert_eq!(
            round_trip(Message::Request { index: 1, begin: 2, length: 3 }),
            Message::Request { index: 1, begin: 2, length: 3 }
        );
        assert_eq!(
            round_trip(Message::Piece { index: 1, begin: 0, block: vec![1, 2, 3] }),
            Message::Piece { index: 1, begin: 0, block: vec![1, 2, 3] }
        );
        assert_eq!(
            round_trip(Message::Cancel { index: 1, begin: 2, length: 3 }),
            Message::Cancel { index: 1, begin: 2, length: 3 }
        );
    }

    #[test]
    fn handles_partial_reads() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Message::Have { index: 7 }, &mut buf)
            .unwrap();
        let whole = buf.split();

        let mut partial = BytesMut::new();
        partial.extend_from_slice(&whole[0..3]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        partial.extend_from_slice(&whole[3..]);
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(Message::Have { index: 7 })
        );
    }

    #[test]
    fn handles_multiple_messages_in_one_read() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::Choke, &mut buf).unwrap();
        codec.encode(Message::Unchoke, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Choke));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Unchoke));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_MESSAGE_LENGTH + 1) as u32);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn incremental_parser_matches_one_shot_for_arbitrary_splits() {
        let mut encoder = MessageCodec;
        let mut whole = BytesMut::new();
        let messages = vec![
            Message::Interested,
            Message::Bitfield { bits: vec![0b1010_0000] },
            Message::Request { index: 0, begin: 0, length: 16384 },
            Message::KeepAlive,
            Message::Piece { index: 0, begin: 0, block: vec![9; 16] },
        ];
        for m in messages.clone() {
            encoder.encode(m, &mut whole).unwrap();
        }

        // Split at every byte boundary and feed incrementally; the decoded
        // stream must match decoding the whole buffer at once.
        for split_at in 0..whole.len() {
            let mut decoder = MessageCodec;
            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();
            buf.extend_from_slice(&whole[..split_at]);
            while let Some(m) = decoder.decode(&mut buf).unwrap() {
                decoded.push(m);
            }
            buf.extend_from_slice(&whole[split_at..]);
            while let Some(m) = decoder.decode(&mut buf).unwrap() {
                decoded.push(m);
            }
            assert_eq!(decoded, messages);
        }
    }
}
