//! # Piece Scheduler
//!
//! The coordinator of a download. It owns the master piece state and is the
//! only thing that mutates it:
//!
//! - **pending**: pieces not yet handed to any peer, in dispatch order
//! - **in_flight**: pieces handed out and awaiting a result
//! - **done**: verified payloads, kept until write-out
//!
//! The loop alternates two phases. The fill phase pushes the head of
//! `pending` into any peer inbox with free capacity, without blocking. The
//! collect phase blocks on the event channel: verified pieces move to
//! `done`, failed pieces return to the tail of `pending`, and a session
//! that terminates implicitly fails every piece it still held, queued or
//! drawn. The loop ends when both `pending` and `in_flight` are empty, and
//! closing the inboxes is what tells the sessions to wind down.
//!
//! A piece that keeps failing is not retried forever: after a fixed number
//! of failed attempts the download is declared stuck.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use indicatif::{ProgressBar, ProgressStyle};

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::error::DownloadError;
use crate::metainfo::Metainfo;
use crate::session::PeerEvent;

/// Outstanding piece assignments a peer inbox may hold.
pub const INBOX_CAPACITY: usize = 5;

// Failed attempts granted to a piece before the download is declared stuck
const MAX_PIECE_ATTEMPTS: u32 = 5;

/// Central coordinator: dispatches piece indices to peer inboxes and folds
/// the resulting events back into the master state.
pub struct Scheduler {
    metainfo: Arc<Metainfo>,
    /// Pieces not yet handed to any peer.
    pending: VecDeque<u32>,
    /// Pieces handed out without a result yet.
    in_flight: HashSet<u32>,
    /// Verified payloads, indexed by piece.
    done: Vec<Option<Vec<u8>>>,
    /// Which in-flight pieces each peer currently holds.
    assigned: Vec<BTreeSet<u32>>,
    /// Work inboxes; a slot is cleared once its session terminates.
    inboxes: Vec<Option<Sender<u32>>>,
    /// Failed attempts per piece.
    attempts: HashMap<u32, u32>,
    /// Peer that most recently failed a piece, avoided on redispatch.
    last_failed: HashMap<u32, usize>,
    events: Receiver<PeerEvent>,
}

impl Scheduler {
    /// Creates a scheduler with every piece pending.
    ///
    /// # Arguments
    ///
    /// * `metainfo` - Shared torrent description; sets the piece count.
    /// * `inboxes` - One bounded work channel per peer session, in
    ///   registered order.
    /// * `events` - The shared channel all sessions report through.
    pub fn new(
        metainfo: Arc<Metainfo>,
        inboxes: Vec<Sender<u32>>,
        events: Receiver<PeerEvent>,
    ) -> Scheduler {
        let num_pieces = metainfo.num_pieces();

        Scheduler {
            pending: (0..num_pieces).collect(),
            in_flight: HashSet::new(),
            done: vec![None; num_pieces as usize],
            assigned: vec![BTreeSet::new(); inboxes.len()],
            inboxes: inboxes.into_iter().map(Some).collect(),
            attempts: HashMap::new(),
            last_failed: HashMap::new(),
            metainfo,
            events,
        }
    }

    /// Run the dispatch loop to completion.
    ///
    /// # Returns
    ///
    /// The verified piece payloads in index order, once every piece has
    /// been delivered by some peer.
    ///
    /// # Errors
    ///
    /// Returns `NoProgress` if every session terminates while pieces are
    /// still owed, or if a piece exhausts its attempt budget.
    pub fn run(mut self) -> Result<Vec<Vec<u8>>, DownloadError> {
        let progress = ProgressBar::new(self.metainfo.total_length);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")
                .unwrap()
                .progress_chars("#>-"),
        );

        while !self.pending.is_empty() || !self.in_flight.is_empty() {
            self.fill();

            let event = match self.events.recv() {
                Ok(event) => event,
                // Every session is gone; nothing outstanding can complete.
                Err(_) => return Err(self.stalled()),
            };
            self.handle(event, &progress)?;
        }
        progress.finish();

        // Closing the inboxes is the shutdown signal to the sessions.
        self.inboxes.clear();

        let mut pieces = Vec::with_capacity(self.done.len());
        for (index, slot) in self.done.into_iter().enumerate() {
            match slot {
                Some(data) => pieces.push(data),
                None => return Err(DownloadError::NoProgress {
                    piece: index as u32,
                }),
            }
        }

        Ok(pieces)
    }

    /// Hand out the head of `pending` while some inbox can take it.
    fn fill(&mut self) {
        while let Some(&index) = self.pending.front() {
            if !self.try_dispatch(index) {
                break;
            }
            self.pending.pop_front();
            self.in_flight.insert(index);
        }
    }

    /// Non-blocking dispatch of one piece: peers in registered order,
    /// preferring one that has not just failed this piece.
    ///
    /// # Arguments
    ///
    /// * `index` - The piece to hand out.
    ///
    /// # Returns
    ///
    /// `true` if some inbox accepted the piece, `false` if every live
    /// inbox is full.
    fn try_dispatch(&mut self, index: u32) -> bool {
        let avoid = self.last_failed.get(&index).copied();
        let order = (0..self.inboxes.len())
            .filter(|&peer| Some(peer) != avoid)
            .chain(avoid);

        for peer in order {
            let Some(inbox) = &self.inboxes[peer] else {
                continue;
            };
            match inbox.try_send(index) {
                Ok(()) => {
                    self.assigned[peer].insert(index);
                    return true;
                }
                Err(TrySendError::Full(_)) => continue,
                // The session died; cleanup happens when its disconnect
                // event is drained.
                Err(TrySendError::Disconnected(_)) => continue,
            }
        }

        false
    }

    fn handle(&mut self, event: PeerEvent, progress: &ProgressBar) -> Result<(), DownloadError> {
        match event {
            PeerEvent::Verified { peer, index, data } => {
                if !self.in_flight.remove(&index) {
                    warn!("discarding result for piece {} that was never dispatched", index);
                    return Ok(());
                }
                self.assigned[peer].remove(&index);

                let slot = &mut self.done[index as usize];
                if slot.is_some() {
                    warn!("piece {} verified twice, keeping the first copy", index);
                    return Ok(());
                }
                *slot = Some(data);

                progress.inc(self.metainfo.piece_length_at(index) as u64);
                info!(
                    "piece {} done, {} outstanding",
                    index,
                    self.pending.len() + self.in_flight.len()
                );
            }
            PeerEvent::Failed { peer, index, reason } => {
                if !self.in_flight.remove(&index) {
                    warn!("discarding failure for piece {} that was never dispatched", index);
                    return Ok(());
                }
                self.assigned[peer].remove(&index);

                info!("piece {} requeued after failure on peer {}: {}", index, peer, reason);
                self.requeue(index, peer, true)?;
            }
            PeerEvent::Disconnected { peer } => {
                self.inboxes[peer] = None;

                // Everything the session held, drawn or still queued in its
                // inbox, goes back to pending.
                let orphaned = std::mem::take(&mut self.assigned[peer]);
                for index in orphaned {
                    self.in_flight.remove(&index);
                    self.requeue(index, peer, false)?;
                }

                debug!(
                    "peer {} gone, {} peers remain",
                    peer,
                    self.inboxes.iter().flatten().count()
                );
            }
        }

        Ok(())
    }

    /// Return a piece to the dispatch queue.
    ///
    /// # Arguments
    ///
    /// * `index` - The piece going back to pending.
    /// * `peer` - The peer it just came back from, avoided next time.
    /// * `count_attempt` - Whether this counts against the piece's attempt
    ///   budget. Orphans of a dead session were never rejected, so they
    ///   do not count.
    ///
    /// # Errors
    ///
    /// Returns `NoProgress` once the piece has failed too many times.
    fn requeue(&mut self, index: u32, peer: usize, count_attempt: bool) -> Result<(), DownloadError> {
        if count_attempt {
            let attempts = self.attempts.entry(index).or_insert(0);
            *attempts += 1;
            if *attempts >= MAX_PIECE_ATTEMPTS {
                return Err(DownloadError::NoProgress { piece: index });
            }
        }

        self.last_failed.insert(index, peer);
        self.pending.push_back(index);

        Ok(())
    }

    /// The first piece nothing can deliver anymore.
    fn stalled(&self) -> DownloadError {
        let piece = self
            .pending
            .front()
            .copied()
            .or_else(|| self.in_flight.iter().min().copied())
            .unwrap_or(0);

        DownloadError::NoProgress { piece }
    }
}
