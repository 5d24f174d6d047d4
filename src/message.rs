//! # Peer Wire Messages
//!
//! Framing for everything that follows the handshake. Every message starts
//! with a 4-byte big-endian length prefix:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! A zero length prefix is a keep-alive and carries neither ID nor payload.
//!
//! | ID | Name | Payload |
//! |----|------------|---------------------------|
//! | 0 | CHOKE | none |
//! | 1 | UNCHOKE | none |
//! | 2 | INTERESTED | none |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | piece availability bits |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block bytes |
//!
//! All multi-byte integers are big-endian. The reader consumes exactly one
//! frame per call and blocks until the whole frame has arrived; a stream
//! that ends inside a frame is a hard error for the session that owns it.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

use std::io::{self, Read};

pub type MessageId = u8;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;

/// Sanity bound on a frame's declared length. The largest frame a peer has
/// a reason to send is a piece message of one 16 KiB block; a bitfield for
/// an enormous torrent still fits comfortably below this.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// One framed message: an ID and its raw payload.
#[derive(Debug)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a message without a payload.
    ///
    /// # Arguments
    ///
    /// * `id` - The type of the message.
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a message with a payload.
    ///
    /// # Arguments
    ///
    /// * `id` - The type of the message.
    /// * `payload` - The content of the message, without the id byte.
    pub fn with_payload(id: MessageId, payload: Vec<u8>) -> Self {
        Message { id, payload }
    }

    pub fn interested() -> Self {
        Message::new(MESSAGE_INTERESTED)
    }

    pub fn have(index: u32) -> Self {
        Message::with_payload(MESSAGE_HAVE, index.to_be_bytes().to_vec())
    }

    /// Ask for a block of a piece.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based piece index.
    /// * `begin` - Zero-based byte offset within the piece.
    /// * `length` - Number of bytes wanted, at most 16 KiB.
    pub fn request(index: u32, begin: u32, length: u32) -> Self {
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(&length.to_be_bytes());
        Message::with_payload(MESSAGE_REQUEST, payload)
    }

    /// Encode with the length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let length = 1 + self.payload.len() as u32;
        let mut buf = Vec::with_capacity(4 + length as usize);
        buf.extend_from_slice(&length.to_be_bytes());
        buf.push(self.id);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Read one frame, blocking until it is complete.
///
/// # Returns
///
/// The decoded message, or `None` for a keep-alive.
///
/// # Errors
///
/// Returns an error if the read fails, the stream ends inside the frame,
/// or the declared length exceeds the frame limit.
pub fn read_frame(reader: &mut impl Read) -> io::Result<Option<Message>> {
    let length = reader.read_u32::<BigEndian>()? as usize;
    if length == 0 {
        return Ok(None);
    }
    if length > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {length} bytes exceeds the frame limit"),
        ));
    }

    let mut buf = vec![0; length];
    reader.read_exact(&mut buf)?;

    Ok(Some(Message {
        id: buf[0],
        payload: buf[1..].to_vec(),
    }))
}

/// Split a piece payload into its index, begin offset and block bytes.
///
/// # Arguments
///
/// * `payload` - The payload of a piece message, without the id byte.
///
/// # Errors
///
/// Returns an error if the payload is too short to hold the 8-byte
/// header.
pub fn parse_piece(payload: &[u8]) -> Result<(u32, u32, &[u8])> {
    if payload.len() < 8 {
        return Err(anyhow!("piece payload shorter than its header"));
    }

    let mut cursor = io::Cursor::new(&payload[..8]);
    let index = cursor.read_u32::<BigEndian>()?;
    let begin = cursor.read_u32::<BigEndian>()?;

    Ok((index, begin, &payload[8..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_has_the_wire_layout() {
        let bytes = Message::request(1, 16384, 4096).encode();
        assert_eq!(
            bytes,
            vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 64, 0, 0, 0, 16, 0]
        );
    }

    #[test]
    fn have_and_interested_layouts() {
        assert_eq!(Message::have(9).encode(), vec![0, 0, 0, 5, 4, 0, 0, 0, 9]);
        assert_eq!(Message::interested().encode(), vec![0, 0, 0, 1, 2]);
    }

    #[test]
    fn keep_alive_reads_as_none() {
        let mut cursor = io::Cursor::new(vec![0u8; 4]);
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn frames_round_trip_through_the_reader() {
        let mut bytes = Message::request(3, 0, 16384).encode();
        bytes.extend_from_slice(&Message::have(3).encode());

        let mut cursor = io::Cursor::new(bytes);
        let first = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(first.id, MESSAGE_REQUEST);
        assert_eq!(first.payload.len(), 12);
        let second = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(second.id, MESSAGE_HAVE);
        assert_eq!(second.payload, 3u32.to_be_bytes());
    }

    #[test]
    fn eof_mid_frame_is_an_error() {
        // The prefix promises 13 bytes but the stream ends after 2.
        let mut cursor = io::Cursor::new(vec![0, 0, 0, 13, 6, 0]);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut cursor = io::Cursor::new(vec![0xff, 0xff, 0xff, 0xff]);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn piece_payloads_split_into_header_and_block() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&7u32.to_be_bytes());
        payload.extend_from_slice(&16384u32.to_be_bytes());
        payload.extend_from_slice(b"block-bytes");

        let (index, begin, block) = parse_piece(&payload).unwrap();
        assert_eq!((index, begin), (7, 16384));
        assert_eq!(block, &b"block-bytes"[..]);

        assert!(parse_piece(&payload[..7]).is_err());
    }
}
