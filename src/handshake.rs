//! # Peer Handshake
//!
//! The handshake is the first thing exchanged on every peer connection and
//! has a fixed 68-byte layout:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte, always 19
//! - **pstr**: the literal protocol string "BitTorrent protocol"
//! - **reserved**: 8 bytes, all zeros on send, ignored on receive
//! - **info_hash**: 20 bytes identifying the swarm
//! - **peer_id**: 20 bytes identifying the peer
//!
//! The reserved bytes are where clients announce protocol extensions; this
//! client supports none and leaves them zeroed.

use thiserror::Error;

use crate::metainfo::Sha1Digest;

const PROTOCOL_ID: &[u8; 19] = b"BitTorrent protocol";

/// Length of an encoded handshake in bytes.
pub const HANDSHAKE_LEN: usize = 68;

/// A 20-byte identifier a client presents to trackers and peers.
pub type PeerId = [u8; 20];

/// A received handshake that could not be parsed.
#[derive(Debug, Error)]
#[error("invalid handshake: {0}")]
pub struct InvalidHandshake(&'static str);

/// The fields of a handshake message, local or remote.
pub struct Handshake {
    pub info_hash: Sha1Digest,
    pub peer_id: PeerId,
}

impl Handshake {
    /// Build a handshake carrying our identity.
    ///
    /// # Arguments
    ///
    /// * `info_hash` - The 20-byte SHA-1 hash of the info dictionary.
    /// * `peer_id` - The 20-byte identity of this client.
    pub fn new(info_hash: Sha1Digest, peer_id: PeerId) -> Self {
        Handshake { info_hash, peer_id }
    }

    /// Encode into the fixed wire layout.
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_ID.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_ID);
        // Bytes 20..28 are the reserved block and stay zero.
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parse a received handshake. The protocol string must match; the
    /// reserved bytes are ignored.
    ///
    /// # Arguments
    ///
    /// * `buf` - The 68 bytes read from the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer does not open with the standard
    /// protocol string.
    pub fn decode(buf: &[u8; HANDSHAKE_LEN]) -> Result<Handshake, InvalidHandshake> {
        if buf[0] as usize != PROTOCOL_ID.len() {
            return Err(InvalidHandshake("unexpected protocol string length"));
        }
        if buf[1..20] != PROTOCOL_ID[..] {
            return Err(InvalidHandshake("unexpected protocol string"));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Handshake { info_hash, peer_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_the_fixed_layout() {
        let bytes = Handshake::new([1; 20], [2; 20]).encode();
        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], &b"BitTorrent protocol"[..]);
        assert_eq!(&bytes[20..28], &[0u8; 8][..]);
        assert_eq!(&bytes[28..48], &[1u8; 20][..]);
        assert_eq!(&bytes[48..68], &[2u8; 20][..]);
    }

    #[test]
    fn decode_round_trips() {
        let bytes = Handshake::new([3; 20], [4; 20]).encode();
        let decoded = Handshake::decode(&bytes).unwrap();
        assert_eq!(decoded.info_hash, [3; 20]);
        assert_eq!(decoded.peer_id, [4; 20]);
    }

    #[test]
    fn foreign_protocol_strings_are_rejected() {
        let mut bytes = Handshake::new([3; 20], [4; 20]).encode();
        bytes[1] = b'X';
        assert!(Handshake::decode(&bytes).is_err());

        let mut bytes = Handshake::new([3; 20], [4; 20]).encode();
        bytes[0] = 18;
        assert!(Handshake::decode(&bytes).is_err());
    }
}
