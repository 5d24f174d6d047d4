//! # Download Error Taxonomy
//!
//! Failures that surface to the caller of a download. Everything scoped to
//! a single peer conversation stays internal: the scheduler retries those,
//! and they only become visible here as `NoProgress` once every avenue for
//! a piece is exhausted.

use thiserror::Error;

/// Terminal failures of a download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The metainfo failed a structural invariant and cannot describe a
    /// downloadable payload.
    #[error("invalid metainfo: {0}")]
    InvalidMetainfo(String),

    /// A piece could not be delivered by any peer.
    #[error("no peer could deliver piece {piece}")]
    NoProgress { piece: u32 },

    /// Creating, writing or flushing the output file failed.
    #[error("could not write output file: {0}")]
    OutputIo(#[from] std::io::Error),
}
