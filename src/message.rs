//! # Peer Wire Messages
//!
//! Every message after the handshake follows the same frame:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length prefix**: 4 bytes (big-endian u32), counts the ID and payload
//! - **Message ID**: 1 byte
//! - **Payload**: `length - 1` bytes
//!
//! A length of 0 is a keep-alive and carries neither ID nor payload.
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | none |
//! | 1 | UNCHOKE | none |
//! | 2 | INTERESTED | none |
//! | 3 | NOT INTERESTED | none |
//! | 4 | HAVE | piece index (u32) |
//! | 5 | BITFIELD | packed piece availability |
//! | 6 | REQUEST | index, begin, length (u32 each) |
//! | 7 | PIECE | index, begin (u32 each), block bytes |
//! | 8 | CANCEL | index, begin, length (u32 each) |

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::connection::PeerError;

type MessageId = u8;
type MessagePayload = Vec<u8>;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
#[allow(dead_code)]
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
#[allow(dead_code)]
pub const MESSAGE_CANCEL: MessageId = 8;
/// Internal marker for a zero-length keep-alive frame.
pub const MESSAGE_KEEPALIVE: MessageId = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub payload: MessagePayload,
}

impl Message {
    /// A message without payload.
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    pub fn new_with_payload(id: MessageId, payload: MessagePayload) -> Self {
        Message { id, payload }
    }

    /// Builds a REQUEST for one block of a piece.
    pub fn request(index: u32, begin: u32, length: u32) -> Self {
        let mut payload = Vec::with_capacity(12);
        // writes into a Vec cannot fail
        let _ = payload.write_u32::<BigEndian>(index);
        let _ = payload.write_u32::<BigEndian>(begin);
        let _ = payload.write_u32::<BigEndian>(length);
        Message::new_with_payload(MESSAGE_REQUEST, payload)
    }

    /// Serializes the frame, length prefix included.
    pub fn serialize(&self) -> Vec<u8> {
        let message_len = 1 + self.payload.len();

        let mut serialized = Vec::with_capacity(4 + message_len);
        let _ = serialized.write_u32::<BigEndian>(message_len as u32);
        serialized.push(self.id);
        serialized.extend_from_slice(&self.payload);

        serialized
    }

    /// Extracts the piece index from a HAVE payload.
    pub fn parse_have(&self) -> Result<u32, PeerError> {
        if self.id != MESSAGE_HAVE || self.payload.len() != 4 {
            return Err(PeerError::Protocol("invalid HAVE message"));
        }

        let mut cursor = Cursor::new(&self.payload[..]);
        cursor
            .read_u32::<BigEndian>()
            .map_err(|_| PeerError::Protocol("invalid HAVE message"))
    }

    /// Splits a PIECE payload into `(index, begin, block)`.
    pub fn parse_piece(&self) -> Result<(u32, u32, &[u8]), PeerError> {
        if self.id != MESSAGE_PIECE || self.payload.len() < 8 {
            return Err(PeerError::Protocol("invalid PIECE message"));
        }

        let mut cursor = Cursor::new(&self.payload[..8]);
        let index = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| PeerError::Protocol("invalid PIECE message"))?;
        let begin = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| PeerError::Protocol("invalid PIECE message"))?;

        Ok((index, begin, &self.payload[8..]))
    }
}

/// Rebuilds a message from the bytes following the length prefix.
pub fn deserialize_message(buf: &[u8]) -> Result<Message, PeerError> {
    let (&id, payload) = buf
        .split_first()
        .ok_or(PeerError::Protocol("empty message frame"))?;

    Ok(Message::new_with_payload(id, payload.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_without_payload() {
        let message = Message::new(MESSAGE_INTERESTED);
        assert_eq!(message.serialize(), vec![0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_serialize_request() {
        let message = Message::request(1, 16384, 16384);
        assert_eq!(
            message.serialize(),
            vec![
                0, 0, 0, 13, // length
                6, // id
                0, 0, 0, 1, // index
                0, 0, 0x40, 0, // begin
                0, 0, 0x40, 0, // length
            ]
        );
    }

    #[test]
    fn test_serialize_deserialize_round_trip() {
        let message = Message::new_with_payload(MESSAGE_BITFIELD, vec![0xf0, 0x01]);
        let encoded = message.serialize();

        // the reader strips the length prefix before deserializing
        let decoded = deserialize_message(&encoded[4..]).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_parse_have() {
        let message = Message::new_with_payload(MESSAGE_HAVE, vec![0, 0, 0, 7]);
        assert_eq!(message.parse_have().unwrap(), 7);

        let bad = Message::new_with_payload(MESSAGE_HAVE, vec![0, 0, 7]);
        assert!(bad.parse_have().is_err());
    }

    #[test]
    fn test_parse_piece() {
        let mut payload = vec![0, 0, 0, 2, 0, 0, 0x40, 0];
        payload.extend_from_slice(b"block data");
        let message = Message::new_with_payload(MESSAGE_PIECE, payload);

        let (index, begin, block) = message.parse_piece().unwrap();
        assert_eq!(index, 2);
        assert_eq!(begin, 16384);
        assert_eq!(block, b"block data");
    }

    #[test]
    fn test_parse_piece_too_short() {
        let message = Message::new_with_payload(MESSAGE_PIECE, vec![0, 0, 0, 1]);
        assert!(message.parse_piece().is_err());
    }
}
