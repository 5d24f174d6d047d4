//! # Degu BitTorrent Client
//!
//! A command-line BitTorrent download client written in Rust.
//!
//! ## Features
//!
//! - Core BitTorrent peer wire protocol
//! - Multitracker (announce-list) support
//! - Multi-peer concurrent downloading with automatic piece reassignment
//! - Piece verification with SHA-1 hashing
//! - Progress tracking with a visual progress bar
//!
//! ## Usage
//!
//! ```bash
//! degu <torrent_file>
//! degu <torrent_file> -o <output_file>
//! ```
//!
//! ## Architecture
//!
//! - **Main thread**: parses arguments, loads the torrent, queries the
//!   trackers, runs the piece scheduler
//! - **Session threads**: one per peer, each owning a single TCP
//!   conversation
//! - **Channels**: bounded per-peer work inboxes and a shared result
//!   channel tie the two together

#[macro_use]
extern crate log;

mod download;
mod error;
mod handshake;
mod message;
mod metainfo;
mod scheduler;
mod session;
mod tracker;

use std::path::{Path, PathBuf};
use std::process;

use anyhow::{anyhow, Result};
use clap::Parser;

use download::Download;
use metainfo::Metainfo;

// Port advertised to trackers
const PORT: u16 = 6881;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A multi-peer BitTorrent download client, written in Rust."
)]
struct Args {
    /// Path to the .torrent file
    torrent: String,

    /// Output filename (defaults to name from torrent)
    #[arg(short = 'o', long)]
    output: Option<String>,
}

/// Derive a safe output filename from the untrusted metainfo name.
///
/// # Arguments
///
/// * `name` - The name field of the torrent, as chosen by whoever made it.
///
/// # Returns
///
/// A filename that cannot escape the working directory. Names that are
/// blank after neutralizing separators fall back to `"download"`.
fn output_filename(name: &str) -> String {
    // A torrent can name itself "../.." just as easily as "debian.iso";
    // separators become underscores so the name stays a plain file.
    match name.replace(['/', '\\'], "_") {
        name if name.trim().is_empty() => String::from("download"),
        name => name,
    }
}

fn run(args: Args) -> Result<()> {
    // Check if torrent file exists
    if !Path::new(&args.torrent).exists() {
        return Err(anyhow!("could not find torrent file: {}", args.torrent));
    }

    // Parse and validate torrent metadata
    let metainfo = Metainfo::open(Path::new(&args.torrent))?;

    // Determine output filename
    let output = args
        .output
        .unwrap_or_else(|| output_filename(&metainfo.name));
    let output_path = PathBuf::from(&output);

    // Discover peers
    let peer_id = tracker::generate_peer_id();
    let peers = tracker::announce(&metainfo, &peer_id, PORT)?;
    info!("found {} peers", peers.len());

    // Download torrent
    let download = Download::new(metainfo, peers, peer_id)?;
    download.run(&output_path)?;

    println!("Saved in \"{}\".", output);

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {}", error);
        process::exit(1);
    }
}
