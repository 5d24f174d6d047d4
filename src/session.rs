//! # Peer Session
//!
//! One session owns one TCP conversation with one peer. After connecting it
//! walks a small state machine:
//!
//! ```text
//! connecting -> handshaken -> waiting-unchoke -> downloading
//! ```
//!
//! The handshake exchange moves it past connecting, an interested message
//! goes out immediately after, and the peer's unchoke opens the download.
//!
//! Once unchoked, the session pulls piece indices from its inbox, fetches
//! each piece as a run of sequential block requests, verifies the SHA-1
//! digest, and reports the outcome on the shared event channel. The inbox
//! closing is the signal to shut down.
//!
//! Failure handling is deliberately blunt: any I/O or protocol error kills
//! the session. It reports a failure for the piece it was holding and a
//! final disconnect event so the coordinator can reassign everything the
//! session still had queued. Only a hash mismatch is survivable, since the
//! connection itself is still in a known-good state at that point.

use boring::sha::Sha1;
use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use crate::handshake::{Handshake, PeerId, HANDSHAKE_LEN};
use crate::message::{
    self, Message, MESSAGE_BITFIELD, MESSAGE_CHOKE, MESSAGE_HAVE, MESSAGE_PIECE, MESSAGE_UNCHOKE,
};
use crate::metainfo::Metainfo;
use crate::tracker::PeerEndpoint;

// Largest block requested from a peer (16KB)
const BLOCK_SIZE_MAX: u32 = 16384;

// TCP connect deadline
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// Per-read and per-write deadline on an established connection
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors scoped to one peer conversation. These never reach the download
/// caller directly; the coordinator sees them inside failure events.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not connect to peer: {0}")]
    Connect(io::Error),
    #[error("peer i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("peer protocol violation: {0}")]
    Protocol(String),
    #[error("piece hash mismatch")]
    HashMismatch,
}

impl SessionError {
    /// A hash mismatch leaves the connection usable; everything else ends
    /// the session.
    fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::HashMismatch)
    }
}

/// What a session reports back to the coordinator.
pub enum PeerEvent {
    /// Piece downloaded and verified.
    Verified {
        peer: usize,
        index: u32,
        data: Vec<u8>,
    },
    /// Piece attempt failed; the piece needs another attempt.
    Failed {
        peer: usize,
        index: u32,
        reason: SessionError,
    },
    /// The session ended and will produce no further events.
    Disconnected { peer: usize },
}

/// Protocol position of one peer conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connecting,
    Handshaken,
    WaitingUnchoke,
    Downloading,
    Failed,
    Closed,
}

/// Manages the download conversation with a single peer.
pub struct PeerSession {
    /// Coordinator slot of this session, echoed in every event
    slot: usize,
    /// Address of the remote peer
    endpoint: PeerEndpoint,
    /// Our 20-byte identity, sent in the handshake
    peer_id: PeerId,
    /// Shared torrent description
    metainfo: Arc<Metainfo>,
    /// Piece indices assigned by the coordinator
    inbox: Receiver<u32>,
    /// Outcomes reported to the coordinator
    events: Sender<PeerEvent>,
    state: SessionState,
}

impl PeerSession {
    /// Creates a session bound to a single peer.
    ///
    /// Nothing touches the network yet; the connection is only opened when
    /// the session starts running.
    ///
    /// # Arguments
    ///
    /// * `slot` - Coordinator slot of this session, echoed in every event.
    /// * `endpoint` - IP address and port of the remote peer.
    /// * `peer_id` - Our 20-byte identity, sent in the handshake.
    /// * `metainfo` - Shared torrent description with the piece digests.
    /// * `inbox` - Channel the coordinator assigns piece indices through.
    /// * `events` - Channel outcomes are reported through.
    pub fn new(
        slot: usize,
        endpoint: PeerEndpoint,
        peer_id: PeerId,
        metainfo: Arc<Metainfo>,
        inbox: Receiver<u32>,
        events: Sender<PeerEvent>,
    ) -> PeerSession {
        PeerSession {
            slot,
            endpoint,
            peer_id,
            metainfo,
            inbox,
            events,
            state: SessionState::Connecting,
        }
    }

    /// Drive the session to completion. Every outcome is reported through
    /// the event channel; nothing is returned.
    pub fn run(mut self) {
        let mut conn = match self.establish() {
            Ok(conn) => conn,
            Err(e) => {
                debug!("peer {}: {}", self.endpoint, e);
                self.state = SessionState::Failed;
                let _ = self.events.send(PeerEvent::Disconnected { peer: self.slot });
                return;
            }
        };

        self.state = SessionState::Downloading;
        while let Ok(index) = self.inbox.recv() {
            match self.download_piece(&mut conn, index) {
                Ok(data) => {
                    // Best-effort availability announcement; a failed have
                    // must not invalidate a verified piece.
                    let _ = conn.write_all(&Message::have(index).encode());

                    let event = PeerEvent::Verified {
                        peer: self.slot,
                        index,
                        data,
                    };
                    if self.events.send(event).is_err() {
                        break;
                    }
                }
                Err(reason) => {
                    warn!("peer {}: piece {} failed: {}", self.endpoint, index, reason);
                    let fatal = reason.is_fatal();
                    let event = PeerEvent::Failed {
                        peer: self.slot,
                        index,
                        reason,
                    };
                    if self.events.send(event).is_err() {
                        break;
                    }
                    if fatal {
                        self.state = SessionState::Failed;
                        let _ = self.events.send(PeerEvent::Disconnected { peer: self.slot });
                        return;
                    }
                }
            }
        }

        self.state = SessionState::Closed;
        debug!(
            "peer {}: inbox closed, session done ({:?})",
            self.endpoint, self.state
        );
    }

    /// Connect and bring the conversation to the downloading state.
    ///
    /// # Returns
    ///
    /// The established, unchoked connection, ready for block requests.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The TCP connection cannot be opened within the deadline
    /// - The handshake exchange fails or names a foreign swarm
    /// - The peer never unchokes us within the read timeout
    fn establish(&mut self) -> Result<TcpStream, SessionError> {
        let addr = SocketAddr::from((self.endpoint.ip, self.endpoint.port));
        let mut conn =
            TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(SessionError::Connect)?;
        conn.set_read_timeout(Some(IO_TIMEOUT))?;
        conn.set_write_timeout(Some(IO_TIMEOUT))?;

        self.exchange_handshake(&mut conn)?;
        self.state = SessionState::Handshaken;
        debug!("peer {}: handshake complete", self.endpoint);

        conn.write_all(&Message::interested().encode())?;
        self.state = SessionState::WaitingUnchoke;

        self.wait_unchoke(&mut conn)?;
        debug!("peer {}: unchoked", self.endpoint);

        Ok(conn)
    }

    /// Send our handshake and check the 68-byte reply. The peer must be in
    /// the same swarm: a foreign info hash ends the session.
    ///
    /// # Arguments
    ///
    /// * `conn` - The freshly opened connection to the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply cannot be read in full, does not carry
    /// the protocol string, or advertises a different info hash.
    fn exchange_handshake(&self, conn: &mut TcpStream) -> Result<(), SessionError> {
        let handshake = Handshake::new(self.metainfo.info_hash, self.peer_id);
        conn.write_all(&handshake.encode())?;

        let mut reply = [0u8; HANDSHAKE_LEN];
        conn.read_exact(&mut reply)?;

        let reply =
            Handshake::decode(&reply).map_err(|e| SessionError::Protocol(e.to_string()))?;
        if reply.info_hash != self.metainfo.info_hash {
            return Err(SessionError::Protocol(
                "handshake info hash does not match".into(),
            ));
        }

        Ok(())
    }

    /// Discard traffic until the peer unchokes us. Keep-alives, chokes and
    /// every other id leave us waiting; the read timeout bounds the wait.
    fn wait_unchoke(&self, conn: &mut TcpStream) -> Result<(), SessionError> {
        loop {
            match message::read_frame(conn)? {
                None => continue,
                Some(msg) if msg.id == MESSAGE_UNCHOKE => return Ok(()),
                Some(msg) => {
                    debug!(
                        "peer {}: ignoring message {} before unchoke",
                        self.endpoint, msg.id
                    );
                }
            }
        }
    }

    /// Fetch and verify one piece: sequential block requests, exactly one
    /// piece response per request, then a digest check.
    ///
    /// # Arguments
    ///
    /// * `conn` - The established connection to download through.
    /// * `index` - Zero-based index of the piece to fetch.
    ///
    /// # Returns
    ///
    /// The verified piece payload, exactly as long as the metainfo says
    /// this piece is.
    ///
    /// # Errors
    ///
    /// Returns an error if any block request or response fails, or if the
    /// assembled bytes do not hash to the expected digest.
    fn download_piece(&self, conn: &mut TcpStream, index: u32) -> Result<Vec<u8>, SessionError> {
        let piece_length = self.metainfo.piece_length_at(index);
        let mut data: Vec<u8> = Vec::with_capacity(piece_length as usize);

        let mut begin = 0;
        while begin < piece_length {
            let length = BLOCK_SIZE_MAX.min(piece_length - begin);
            conn.write_all(&Message::request(index, begin, length).encode())?;

            let block = self.read_block(conn, index, begin, length)?;
            data.extend_from_slice(&block);
            begin += length;
        }

        let mut hasher = Sha1::new();
        hasher.update(&data);
        if hasher.finish() != self.metainfo.piece_hashes[index as usize] {
            return Err(SessionError::HashMismatch);
        }

        debug!(
            "peer {}: piece {} verified ({} bytes)",
            self.endpoint,
            index,
            data.len()
        );

        Ok(data)
    }

    /// Read the response to the one outstanding request. Bare control
    /// frames in between are discarded; anything else that is not the
    /// matching piece message is a protocol violation.
    ///
    /// # Arguments
    ///
    /// * `conn` - The established connection being read.
    /// * `index` - Piece index the outstanding request named.
    /// * `begin` - Byte offset the outstanding request named.
    /// * `length` - Block length the outstanding request named.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream fails or ends mid-frame, or if the
    /// peer answers with anything but the requested block.
    fn read_block(
        &self,
        conn: &mut TcpStream,
        index: u32,
        begin: u32,
        length: u32,
    ) -> Result<Vec<u8>, SessionError> {
        loop {
            let msg = match message::read_frame(conn)? {
                None => continue, // keep-alive
                Some(msg) => msg,
            };

            match msg.id {
                MESSAGE_PIECE => {
                    let (got_index, got_begin, block) = message::parse_piece(&msg.payload)
                        .map_err(|e| SessionError::Protocol(e.to_string()))?;
                    if got_index != index || got_begin != begin {
                        return Err(SessionError::Protocol(format!(
                            "expected block {}+{}, peer sent {}+{}",
                            index, begin, got_index, got_begin
                        )));
                    }
                    if block.len() != length as usize {
                        return Err(SessionError::Protocol(format!(
                            "expected {} block bytes, peer sent {}",
                            length,
                            block.len()
                        )));
                    }
                    return Ok(block.to_vec());
                }
                MESSAGE_CHOKE | MESSAGE_UNCHOKE | MESSAGE_HAVE | MESSAGE_BITFIELD => {
                    debug!(
                        "peer {}: ignoring message {} mid-piece",
                        self.endpoint, msg.id
                    );
                }
                other => {
                    return Err(SessionError::Protocol(format!(
                        "unexpected message id {} while downloading",
                        other
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_a_hash_mismatch_keeps_the_session() {
        assert!(!SessionError::HashMismatch.is_fatal());
        assert!(SessionError::Protocol("x".into()).is_fatal());
        assert!(SessionError::Io(io::Error::new(io::ErrorKind::Other, "x")).is_fatal());
    }
}
