//! # Download Coordination
//!
//! Glues the pieces together: one `Download` value owns the metainfo, the
//! peer list and the local identity. Running it spawns one session thread
//! per peer, lets the scheduler distribute the pieces, and finally writes
//! the verified payload to disk in index order. The output file is only
//! created once every piece has verified, so a failed download never
//! leaves a partial file behind.

use crossbeam_channel::{bounded, unbounded};

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;

use crate::error::DownloadError;
use crate::handshake::PeerId;
use crate::metainfo::Metainfo;
use crate::scheduler::{Scheduler, INBOX_CAPACITY};
use crate::session::PeerSession;
use crate::tracker::PeerEndpoint;

/// One download: metainfo, swarm endpoints and the local identity.
pub struct Download {
    metainfo: Arc<Metainfo>,
    peers: Vec<PeerEndpoint>,
    peer_id: PeerId,
}

impl Download {
    /// Validate the inputs and assemble a download.
    ///
    /// # Arguments
    ///
    /// * `metainfo` - The parsed torrent description.
    /// * `peers` - Endpoints to open sessions against. May be empty, in
    ///   which case running the download fails cleanly.
    /// * `peer_id` - The 20-byte identity announced to every peer.
    ///
    /// # Returns
    ///
    /// A download ready to run.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMetainfo` if the metainfo fails its structural
    /// invariants or describes a multi-file layout.
    pub fn new(
        metainfo: Metainfo,
        peers: Vec<PeerEndpoint>,
        peer_id: PeerId,
    ) -> Result<Download, DownloadError> {
        metainfo.validate()?;
        if metainfo.files.is_some() {
            return Err(DownloadError::InvalidMetainfo(
                "multi-file torrents are not supported".into(),
            ));
        }

        Ok(Download {
            metainfo: Arc::new(metainfo),
            peers,
            peer_id,
        })
    }

    /// Download every piece and write the verified payload to `output`.
    ///
    /// # Arguments
    ///
    /// * `output` - Path of the file to create. Truncated if it exists,
    ///   and only created once the whole payload has verified.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No peer could deliver some piece (`NoProgress`)
    /// - Creating, writing or flushing the output file fails (`OutputIo`)
    pub fn run(&self, output: &Path) -> Result<(), DownloadError> {
        info!(
            "downloading {:?} ({} pieces, {} peers)",
            self.metainfo.name,
            self.metainfo.num_pieces(),
            self.peers.len()
        );

        let (event_tx, event_rx) = unbounded();
        let mut inboxes = Vec::with_capacity(self.peers.len());
        for (slot, endpoint) in self.peers.iter().enumerate() {
            let (inbox_tx, inbox_rx) = bounded(INBOX_CAPACITY);
            let session = PeerSession::new(
                slot,
                *endpoint,
                self.peer_id,
                self.metainfo.clone(),
                inbox_rx,
                event_tx.clone(),
            );
            thread::spawn(move || session.run());
            inboxes.push(inbox_tx);
        }
        // The sessions now hold the only event senders, so the channel
        // disconnecting means every session is gone.
        drop(event_tx);

        let pieces = Scheduler::new(self.metainfo.clone(), inboxes, event_rx).run()?;
        write_pieces(output, &pieces)?;

        info!("saved {:?}", output);
        Ok(())
    }
}

/// Write verified pieces to `path` in strict index order.
///
/// # Arguments
///
/// * `path` - Output file, created or truncated.
/// * `pieces` - The payloads, one per piece, already in index order.
///
/// # Errors
///
/// Returns an error if the file cannot be created or any write or the
/// final flush fails.
fn write_pieces(path: &Path, pieces: &[Vec<u8>]) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    for piece in pieces {
        writer.write_all(piece)?;
    }
    writer.flush()
}
