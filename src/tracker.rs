//! # Tracker Client
//!
//! Peer discovery over HTTP. The announce request carries the info hash,
//! our peer id and transfer counters as query parameters; the response is a
//! bencoded dictionary with a refresh interval and a compact peer list of
//! 6-byte records:
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! Both fields are in network byte order. A tracker may answer with a
//! `failure reason` string instead of peers; such answers are skipped and
//! the next tracker in the list is tried.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_bencode::de;
use serde_bytes::ByteBuf;
use url::Url;

use std::collections::HashSet;
use std::fmt;
use std::io::Cursor;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::handshake::PeerId;
use crate::metainfo::Metainfo;

const PEER_RECORD_SIZE: usize = 6;
const TRACKER_TIMEOUT_SECS: u64 = 15;

/// Address of a remote peer as reported by a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerEndpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// BencodeTracker structure.
#[derive(Debug, Deserialize, Serialize)]
struct BencodeTracker {
    // Human-readable refusal; mutually exclusive with peers
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    // Interval time to refresh the list of peers in seconds
    #[serde(default)]
    interval: u32,
    // Compact peer records
    #[serde(default)]
    peers: ByteBuf,
}

/// Generate a random 20-byte peer id, stable for one download.
pub fn generate_peer_id() -> PeerId {
    let mut peer_id = [0u8; 20];
    rand::thread_rng().fill(&mut peer_id[..]);
    peer_id
}

/// Query the metainfo's trackers in order until one returns a usable peer
/// list.
///
/// # Arguments
///
/// * `metainfo` - The torrent whose swarm is being joined.
/// * `peer_id` - Our 20-byte identity, percent-encoded into the query.
/// * `port` - Port number reported to the tracker as ours.
///
/// # Returns
///
/// The deduplicated peer endpoints from the first tracker that produced
/// any.
///
/// # Errors
///
/// Returns an error if no tracker in the list yields peers; individual
/// tracker failures are logged and skipped.
pub fn announce(metainfo: &Metainfo, peer_id: &PeerId, port: u16) -> Result<Vec<PeerEndpoint>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(TRACKER_TIMEOUT_SECS))
        .build()?;

    let mut peers: Vec<PeerEndpoint> = Vec::new();
    for tracker in &metainfo.trackers {
        let url = match build_tracker_url(
            tracker,
            &metainfo.info_hash,
            peer_id,
            port,
            metainfo.total_length,
        ) {
            Ok(url) => url,
            Err(e) => {
                warn!("skipping tracker {}: {}", tracker, e);
                continue;
            }
        };

        let response = match client.get(&url).send().and_then(|r| r.bytes()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("tracker {} did not answer: {}", tracker, e);
                continue;
            }
        };

        let decoded: BencodeTracker = match de::from_bytes(&response) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("tracker {} sent an undecodable response: {}", tracker, e);
                continue;
            }
        };
        if let Some(reason) = decoded.failure_reason {
            warn!("tracker {} refused the announce: {}", tracker, reason);
            continue;
        }

        debug!(
            "tracker {} answered, refresh interval {}s",
            tracker, decoded.interval
        );
        match decode_compact_peers(&decoded.peers) {
            Ok(mut found) => peers.append(&mut found),
            Err(e) => warn!("tracker {} sent an invalid peer list: {}", tracker, e),
        }
        if !peers.is_empty() {
            break;
        }
    }

    if peers.is_empty() {
        return Err(anyhow!("could not get peers from any tracker"));
    }

    // Deduplicate by endpoint, keeping first-seen order.
    let mut seen = HashSet::new();
    peers.retain(|peer| seen.insert(*peer));

    Ok(peers)
}

/// Build an announce URL with the binary fields percent-encoded.
///
/// # Arguments
///
/// * `announce` - The tracker URL from the torrent.
/// * `info_hash` - The 20-byte SHA-1 hash of the info dictionary.
/// * `peer_id` - The 20-byte identity of this client.
/// * `port` - Port number that the client reports as listening on.
/// * `left` - Bytes still wanted, here always the full payload size.
///
/// # Errors
///
/// Returns an error if the announce entry is not a parseable URL.
fn build_tracker_url(
    announce: &str,
    info_hash: &[u8],
    peer_id: &[u8],
    port: u16,
    left: u64,
) -> Result<String> {
    /// Each byte is encoded as %XX where XX is its hexadecimal value.
    fn percent_encode_binary(data: &[u8]) -> String {
        const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
        let mut encoded = String::with_capacity(data.len() * 3);

        for &byte in data {
            encoded.push('%');
            encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
            encoded.push(HEX_DIGITS[(byte & 0x0f) as usize] as char);
        }

        encoded
    }

    // Parse first so malformed announce entries are skipped early
    let base_url = match Url::parse(announce) {
        Ok(url) => url,
        Err(_) => return Err(anyhow!("could not parse tracker url")),
    };

    // Build the query by hand: binary info_hash and peer_id bytes must be
    // escaped as-is, not treated as text
    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1&event=started",
        percent_encode_binary(info_hash),
        percent_encode_binary(peer_id),
        port,
        left
    );

    let mut url = base_url.to_string();
    if url.contains('?') {
        url.push('&');
    } else {
        url.push('?');
    }
    url.push_str(&query);

    Ok(url)
}

/// Decode a compact peer list.
///
/// # Arguments
///
/// * `bytes` - The tracker's peers blob, a run of 6-byte records.
///
/// # Returns
///
/// One endpoint per record, in tracker order.
///
/// # Errors
///
/// Returns an error if the blob is not a whole number of records.
pub fn decode_compact_peers(bytes: &[u8]) -> Result<Vec<PeerEndpoint>> {
    if !bytes.len().is_multiple_of(PEER_RECORD_SIZE) {
        return Err(anyhow!("received invalid peers from tracker"));
    }

    let mut peers = Vec::with_capacity(bytes.len() / PEER_RECORD_SIZE);
    for record in bytes.chunks_exact(PEER_RECORD_SIZE) {
        // Read peer IP address
        let ip = Ipv4Addr::new(record[0], record[1], record[2], record[3]);

        // Read peer port
        let mut cursor = Cursor::new(&record[4..6]);
        let port = cursor.read_u16::<BigEndian>()?;

        peers.push(PeerEndpoint { ip, port });
    }

    Ok(peers)
}
