//! # Torrent Metainfo
//!
//! Parsing and validation of the `.torrent` descriptor.
//!
//! A torrent file is a bencoded dictionary:
//!
//! - **announce** / **announce-list**: tracker URLs for peer discovery
//! - **info**: the file description, hashed to identify the swarm
//!   - **pieces**: concatenated 20-byte SHA-1 digests, one per piece
//!   - **piece length**: nominal size of each piece in bytes
//!   - **length**: total payload size (single-file torrents)
//!   - **files**: per-file length and path (multi-file torrents)
//!   - **name**: suggested output filename
//!
//! The info hash is the SHA-1 digest of the bencoded `info` dictionary and
//! is used unchanged in both the tracker query and the peer handshake.
//! Multi-file layouts are parsed and kept, but the download engine only
//! assembles single-file payloads.

use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use boring::sha::Sha1;

use crate::error::DownloadError;

/// Size of a SHA-1 digest in bytes.
pub const SHA1_HASH_SIZE: usize = 20;

/// A 20-byte SHA-1 digest.
pub type Sha1Digest = [u8; SHA1_HASH_SIZE];

/// Parsed, validated contents of a `.torrent` descriptor.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// Tracker URLs, flattened from `announce` and `announce-list`.
    pub trackers: Vec<String>,
    /// Suggested output filename.
    pub name: String,
    /// Nominal piece size in bytes.
    pub piece_length: u32,
    /// One digest per piece, in piece order.
    pub piece_hashes: Vec<Sha1Digest>,
    /// Total payload size in bytes.
    pub total_length: u64,
    /// Multi-file layout, preserved as parsed. `None` for single-file.
    pub files: Option<Vec<FileSpan>>,
    /// SHA-1 of the bencoded info dictionary.
    pub info_hash: Sha1Digest,
}

/// One entry of a multi-file layout.
#[derive(Debug, Clone)]
pub struct FileSpan {
    pub length: u64,
    pub path: Vec<String>,
}

/// BencodeFile structure.
#[derive(Deserialize, Serialize)]
struct BencodeFile {
    length: u64,
    path: Vec<String>,
}

/// BencodeInfo structure.
#[derive(Deserialize, Serialize)]
struct BencodeInfo {
    // Concatenation of all pieces 20-byte SHA-1 hashes
    #[serde(rename = "pieces")]
    pieces: ByteBuf,
    // Size of each piece in bytes
    #[serde(rename = "piece length")]
    piece_length: u32,
    // Size of the payload in bytes, absent for multi-file torrents
    #[serde(rename = "length", default, skip_serializing_if = "Option::is_none")]
    length: Option<u64>,
    // Suggested filename where to save the file
    #[serde(rename = "name")]
    name: String,
    // Multi-file layout, absent for single-file torrents
    #[serde(rename = "files", default, skip_serializing_if = "Option::is_none")]
    files: Option<Vec<BencodeFile>>,
}

/// BencodeTorrent structure.
#[derive(Deserialize, Serialize)]
struct BencodeTorrent {
    // URL of the tracker
    #[serde(default)]
    announce: String,
    // Tiers of tracker URLs
    #[serde(rename = "announce-list", default)]
    announce_list: Vec<Vec<String>>,
    // Informations about the payload
    info: BencodeInfo,
}

impl BencodeInfo {
    /// Hash the bencoded info dictionary to uniquely identify the swarm.
    fn hash(&self) -> Result<Sha1Digest, DownloadError> {
        let buf = ser::to_bytes(self).map_err(|e| {
            DownloadError::InvalidMetainfo(format!("could not encode info dictionary: {e}"))
        })?;

        let mut hasher = Sha1::new();
        hasher.update(&buf);
        Ok(hasher.finish())
    }

    /// Split the concatenated digest blob into per-piece hashes.
    fn split_piece_hashes(&self) -> Result<Vec<Sha1Digest>, DownloadError> {
        if !self.pieces.len().is_multiple_of(SHA1_HASH_SIZE) {
            return Err(DownloadError::InvalidMetainfo(
                "piece digests are not a multiple of 20 bytes".into(),
            ));
        }

        let mut hashes = Vec::with_capacity(self.pieces.len() / SHA1_HASH_SIZE);
        for chunk in self.pieces.chunks_exact(SHA1_HASH_SIZE) {
            let mut hash = [0u8; SHA1_HASH_SIZE];
            hash.copy_from_slice(chunk);
            hashes.push(hash);
        }

        Ok(hashes)
    }
}

impl Metainfo {
    /// Read and parse a torrent file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the .torrent file.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMetainfo` if the file cannot be read or its
    /// contents fail to parse or validate.
    pub fn open(path: &Path) -> Result<Metainfo, DownloadError> {
        let buf = fs::read(path)
            .map_err(|e| DownloadError::InvalidMetainfo(format!("could not read torrent: {e}")))?;
        Metainfo::from_bytes(&buf)
    }

    /// Parse a bencoded torrent descriptor.
    ///
    /// # Arguments
    ///
    /// * `buf` - The raw bytes of a .torrent file.
    ///
    /// # Returns
    ///
    /// A validated metainfo with the info hash and per-piece digests
    /// already derived.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMetainfo` if the bencode is malformed, no tracker
    /// is named, the payload size is missing, or validation fails.
    pub fn from_bytes(buf: &[u8]) -> Result<Metainfo, DownloadError> {
        let bencode: BencodeTorrent = de::from_bytes(buf)
            .map_err(|e| DownloadError::InvalidMetainfo(format!("could not decode torrent: {e}")))?;

        // Flatten announce-list tiers and the plain announce URL into one
        // deduplicated tracker list, tiers first.
        let mut trackers: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for url in bencode
            .announce_list
            .iter()
            .flatten()
            .chain(std::iter::once(&bencode.announce))
        {
            if !url.is_empty() && seen.insert(url.clone()) {
                trackers.push(url.clone());
            }
        }
        if trackers.is_empty() {
            return Err(DownloadError::InvalidMetainfo(
                "torrent has no announce or announce-list".into(),
            ));
        }

        let info_hash = bencode.info.hash()?;
        let piece_hashes = bencode.info.split_piece_hashes()?;
        let total_length = match (bencode.info.length, &bencode.info.files) {
            (Some(length), _) => length,
            (None, Some(files)) => files.iter().map(|file| file.length).sum(),
            (None, None) => {
                return Err(DownloadError::InvalidMetainfo(
                    "torrent has neither length nor files".into(),
                ))
            }
        };
        let files = bencode.info.files.map(|files| {
            files
                .into_iter()
                .map(|file| FileSpan {
                    length: file.length,
                    path: file.path,
                })
                .collect()
        });

        let metainfo = Metainfo {
            trackers,
            name: bencode.info.name,
            piece_length: bencode.info.piece_length,
            piece_hashes,
            total_length,
            files,
            info_hash,
        };
        metainfo.validate()?;

        Ok(metainfo)
    }

    /// Check the structural invariants a usable metainfo must satisfy.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMetainfo` if the piece length or total length is
    /// zero, or if the digest count does not cover the payload exactly.
    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.piece_length == 0 {
            return Err(DownloadError::InvalidMetainfo(
                "piece length must be positive".into(),
            ));
        }
        if self.total_length == 0 {
            return Err(DownloadError::InvalidMetainfo(
                "total length must be positive".into(),
            ));
        }

        let expected = self.total_length.div_ceil(self.piece_length as u64);
        if expected != self.piece_hashes.len() as u64 {
            return Err(DownloadError::InvalidMetainfo(format!(
                "expected {} piece hashes, found {}",
                expected,
                self.piece_hashes.len()
            )));
        }

        Ok(())
    }

    /// Number of pieces in the payload.
    pub fn num_pieces(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Length of piece `index`. Only the last piece may be shorter than the
    /// nominal piece length, and it is never empty.
    ///
    /// # Arguments
    ///
    /// * `index` - The piece index.
    pub fn piece_length_at(&self, index: u32) -> u32 {
        let begin = index as u64 * self.piece_length as u64;
        let end = (begin + self.piece_length as u64).min(self.total_length);

        (end - begin) as u32
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn bencoded_torrent(piece_length: u32, length: u64, num_pieces: usize) -> Vec<u8> {
        let torrent = BencodeTorrent {
            announce: "http://tracker.example/announce".into(),
            announce_list: vec![],
            info: BencodeInfo {
                pieces: ByteBuf::from(vec![7u8; num_pieces * SHA1_HASH_SIZE]),
                piece_length,
                length: Some(length),
                name: "example.bin".into(),
                files: None,
            },
        };
        ser::to_bytes(&torrent).unwrap()
    }

    #[test]
    fn parses_a_single_file_torrent() {
        let metainfo = Metainfo::from_bytes(&bencoded_torrent(8, 12, 2)).unwrap();
        assert_eq!(metainfo.name, "example.bin");
        assert_eq!(metainfo.piece_length, 8);
        assert_eq!(metainfo.total_length, 12);
        assert_eq!(metainfo.num_pieces(), 2);
        assert_eq!(
            metainfo.trackers,
            vec!["http://tracker.example/announce".to_string()]
        );
        assert!(metainfo.files.is_none());
    }

    #[test]
    fn last_piece_is_the_remainder() {
        let metainfo = Metainfo::from_bytes(&bencoded_torrent(8, 12, 2)).unwrap();
        assert_eq!(metainfo.piece_length_at(0), 8);
        assert_eq!(metainfo.piece_length_at(1), 4);
    }

    #[test]
    fn exact_multiple_keeps_a_full_last_piece() {
        let metainfo = Metainfo::from_bytes(&bencoded_torrent(8, 16, 2)).unwrap();
        assert_eq!(metainfo.piece_length_at(1), 8);
    }

    #[test]
    fn piece_count_mismatch_is_invalid() {
        assert!(matches!(
            Metainfo::from_bytes(&bencoded_torrent(8, 12, 3)),
            Err(DownloadError::InvalidMetainfo(_))
        ));
        assert!(matches!(
            Metainfo::from_bytes(&bencoded_torrent(8, 32, 2)),
            Err(DownloadError::InvalidMetainfo(_))
        ));
    }

    #[test]
    fn ragged_piece_digest_blob_is_invalid() {
        let torrent = BencodeTorrent {
            announce: "http://tracker.example/announce".into(),
            announce_list: vec![],
            info: BencodeInfo {
                pieces: ByteBuf::from(vec![7u8; SHA1_HASH_SIZE + 1]),
                piece_length: 8,
                length: Some(12),
                name: "example.bin".into(),
                files: None,
            },
        };
        assert!(matches!(
            Metainfo::from_bytes(&ser::to_bytes(&torrent).unwrap()),
            Err(DownloadError::InvalidMetainfo(_))
        ));
    }

    #[test]
    fn info_hash_is_stable_and_content_sensitive() {
        let a = Metainfo::from_bytes(&bencoded_torrent(8, 12, 2)).unwrap();
        let b = Metainfo::from_bytes(&bencoded_torrent(8, 12, 2)).unwrap();
        let c = Metainfo::from_bytes(&bencoded_torrent(8, 16, 2)).unwrap();
        assert_eq!(a.info_hash, b.info_hash);
        assert_ne!(a.info_hash, c.info_hash);
    }

    #[test]
    fn multi_file_layout_is_preserved() {
        let torrent = BencodeTorrent {
            announce: "http://tracker.example/announce".into(),
            announce_list: vec![],
            info: BencodeInfo {
                pieces: ByteBuf::from(vec![7u8; SHA1_HASH_SIZE]),
                piece_length: 16,
                length: None,
                name: "dir".into(),
                files: Some(vec![
                    BencodeFile {
                        length: 10,
                        path: vec!["a".into()],
                    },
                    BencodeFile {
                        length: 6,
                        path: vec!["sub".into(), "b".into()],
                    },
                ]),
            },
        };
        let metainfo = Metainfo::from_bytes(&ser::to_bytes(&torrent).unwrap()).unwrap();
        assert_eq!(metainfo.total_length, 16);
        let files = metainfo.files.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].path, vec!["sub".to_string(), "b".to_string()]);
    }

    #[test]
    fn announce_list_tiers_are_flattened_and_deduplicated() {
        let torrent = BencodeTorrent {
            announce: "http://one.example/announce".into(),
            announce_list: vec![
                vec![
                    "http://one.example/announce".into(),
                    "http://two.example/announce".into(),
                ],
                vec!["http://three.example/announce".into()],
            ],
            info: BencodeInfo {
                pieces: ByteBuf::from(vec![7u8; SHA1_HASH_SIZE]),
                piece_length: 16,
                length: Some(16),
                name: "example.bin".into(),
                files: None,
            },
        };
        let metainfo = Metainfo::from_bytes(&ser::to_bytes(&torrent).unwrap()).unwrap();
        assert_eq!(
            metainfo.trackers,
            vec![
                "http://one.example/announce".to_string(),
                "http://two.example/announce".to_string(),
                "http://three.example/announce".to_string(),
            ]
        );
    }
}
