//! Wire protocol utilities
//!
//! Handshake exchange over a stream plus length-prefixed framing over a
//! receive buffer. Frames are cut from the buffer only once complete, so a
//! read that times out half way never loses bytes.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::handshake::HANDSHAKE_LEN;
use super::{Handshake, Message};
use crate::error::{Result, TorrentError};

/// Upper bound for a single frame; larger prefixes are treated as corrupt
pub const MAX_FRAME_LEN: usize = 1 << 22;

/// WireProtocol trait for protocol utilities
pub trait WireProtocol {
    /// Write a message to the stream
    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()>;

    /// Read a handshake from the stream
    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake>;

    /// Write a handshake to the stream
    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()>;
}

/// Default implementation of WireProtocol
#[derive(Debug, Default, Clone, Copy)]
pub struct BitTorrentWire;

impl WireProtocol for BitTorrentWire {
    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()> {
        writer.write_all(&message.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader.read_exact(&mut buf).await?;
        Handshake::deserialize(&buf)
    }

    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()> {
        writer.write_all(&handshake.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Cut one complete frame body off the front of `buf`.
///
/// Returns `Ok(None)` while the frame is incomplete; an empty body is a
/// keep-alive.
pub fn read_frame(buf: &mut BytesMut) -> Result<Option<Vec<u8>>> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length > MAX_FRAME_LEN {
        return Err(TorrentError::protocol_error_with_source(
            "Frame too large",
            format!("{} bytes", length),
        ));
    }

    if buf.len() < 4 + length {
        return Ok(None);
    }

    let frame = buf[4..4 + length].to_vec();
    buf.advance(4 + length);
    Ok(Some(frame))
}

/// Append a length-prefixed frame to the buffer
pub fn write_frame(buf: &mut BytesMut, body: &[u8]) {
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_frame() {
        let mut buf = BytesMut::new();
        write_frame(&mut buf, b"hello");

        let result = read_frame(&mut buf).unwrap().unwrap();
        assert_eq!(result, b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_read_frame_incomplete() {
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_slice(b"hello");

        assert!(read_frame(&mut buf).unwrap().is_none());
        // Nothing consumed
        assert_eq!(buf.len(), 9);
    }

    #[test]
    fn test_read_frame_keepalive() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        assert_eq!(read_frame(&mut buf).unwrap(), Some(vec![]));
    }

    #[test]
    fn test_read_frame_rejects_oversized() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        assert!(read_frame(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_handshake_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let mut wire = BitTorrentWire;
        let sent = Handshake::new([7u8; 20], [8u8; 20]);
        wire.write_handshake(&mut client, &sent).await.unwrap();
        let received = wire.read_handshake(&mut server).await.unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_message_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let mut wire = BitTorrentWire;
        wire.write_message(&mut client, &Message::Have { piece_index: 3 }).await.unwrap();

        let mut buf = BytesMut::new();
        server.read_buf(&mut buf).await.unwrap();
        let frame = read_frame(&mut buf).unwrap().unwrap();
        assert_eq!(Message::from_frame(&frame).unwrap(), Message::Have { piece_index: 3 });
    }
}
