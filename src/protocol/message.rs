//! BitTorrent protocol messages
//!
//! Defines the length-prefixed messages exchanged after the handshake.
//! Bitfields carry one byte per piece rather than packed bits.

use bytes::{Buf, BufMut, BytesMut};
use tracing::{error, trace};

use crate::error::{Result, TorrentError};

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = TorrentError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            _ => Err(TorrentError::protocol_error_with_source(
                "Unknown message ID",
                format!("value: {}", value),
            )),
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    /// Any id this client does not speak; ignored by dispatch
    Unknown { id: u8, payload: Vec<u8> },
}

impl Message {
    /// Get the message ID (returns None for KeepAlive and unknown ids)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::KeepAlive | Message::Unknown { .. } => None,
        }
    }

    /// Get the message length (excluding the length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Unknown { payload, .. } => 1 + payload.len() as u32,
        }
    }

    /// Integer fields in wire order
    pub fn ints(&self) -> Vec<u32> {
        match self {
            Message::Have { piece_index } => vec![*piece_index],
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                vec![*index, *begin, *length]
            }
            Message::Piece { index, begin, .. } => vec![*index, *begin],
            _ => Vec::new(),
        }
    }

    /// Raw byte contents, for messages that carry them
    pub fn contents(&self) -> Option<&[u8]> {
        match self {
            Message::Bitfield { bitfield } => Some(bitfield),
            Message::Piece { block, .. } => Some(block),
            Message::Unknown { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());

        match self {
            Message::KeepAlive => {}
            Message::Choke => buf.put_u8(MessageId::Choke as u8),
            Message::Unchoke => buf.put_u8(MessageId::Unchoke as u8),
            Message::Interested => buf.put_u8(MessageId::Interested as u8),
            Message::NotInterested => buf.put_u8(MessageId::NotInterested as u8),
            Message::Have { piece_index } => {
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(*piece_index);
            }
            Message::Bitfield { bitfield } => {
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bitfield);
            }
            Message::Request { index, begin, length } => {
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Cancel { index, begin, length } => {
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Unknown { id, payload } => {
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }

        trace!("Message serialized: {} bytes", buf.len());
        buf.to_vec()
    }

    /// Deserialize a message from bytes (including length prefix); the
    /// prefix must match the number of bytes that follow
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            error!("Message too short for length prefix: {} bytes", data.len());
            return Err(TorrentError::protocol_error("Message too short for length prefix"));
        }
        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let body = &data[4..];
        if body.len() != length {
            error!("Length prefix {} does not match {} payload bytes", length, body.len());
            return Err(TorrentError::protocol_error_with_source(
                "Inconsistent message length",
                format!("prefix {}, payload {}", length, body.len()),
            ));
        }
        Self::from_frame(body)
    }

    /// Decode a frame body: everything after the length prefix
    pub fn from_frame(body: &[u8]) -> Result<Self> {
        let mut buf = body;
        if buf.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = buf.get_u8();
        let message_id = match MessageId::try_from(id) {
            Ok(message_id) => message_id,
            Err(_) => {
                trace!("Passing through message with unknown id {}", id);
                return Ok(Message::Unknown { id, payload: buf.to_vec() });
            }
        };

        let expect = |name: &str, needed: usize, exact: bool, remaining: usize| -> Result<()> {
            if remaining < needed || (exact && remaining != needed) {
                error!("{} message has {} payload bytes, expected {}", name, remaining, needed);
                return Err(TorrentError::protocol_error_with_source(
                    format!("Malformed {} message", name),
                    format!("expected {} bytes, got {}", needed, remaining),
                ));
            }
            Ok(())
        };

        let message = match message_id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                expect("Have", 4, true, buf.remaining())?;
                Message::Have { piece_index: buf.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: buf.to_vec() },
            MessageId::Request => {
                expect("Request", 12, true, buf.remaining())?;
                Message::Request {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                }
            }
            MessageId::Piece => {
                expect("Piece", 8, false, buf.remaining())?;
                let index = buf.get_u32();
                let begin = buf.get_u32();
                Message::Piece { index, begin, block: buf.to_vec() }
            }
            MessageId::Cancel => {
                expect("Cancel", 12, true, buf.remaining())?;
                Message::Cancel {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                }
            }
        };
        trace!("Decoded {:?}", message.message_id());
        Ok(message)
    }
}
