//! Metainfo file structure and parsing.
//!
//! A .torrent descriptor is a bencoded dictionary with a top-level
//! `announce` URL and an `info` dictionary describing a single file: its
//! name, total length, piece length, and the concatenated 20-byte SHA-1
//! digests of every piece.
use crate::bencode::BencodeValue;
use crate::torrent::info_hash;
use crate::torrent::TorrentError;
use crate::torrent::TorrentResult;

use std::collections::BTreeMap;
use std::path::Path;

/// Number of bytes in one SHA-1 digest inside the `pieces` string.
const PIECE_HASH_SIZE: usize = 20;

/// Immutable description of one torrent, as loaded from a .torrent file.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Metainfo {
    /// Tracker announce URL.
    pub announce: String,
    /// Suggested file name; also the backing file name on disk.
    pub name: String,
    /// Total file length in bytes.
    pub length: u64,
    /// Length of every piece except possibly the last.
    pub piece_length: u32,
    /// One SHA-1 digest per piece, in piece-index order.
    pub piece_hashes: Vec<[u8; 20]>,
    /// SHA-1 of the bencoded `info` dictionary; identifies the swarm.
    pub info_hash: [u8; 20],
}

/// Splits the concatenated `pieces` string into individual 20-byte digests.
/// The order corresponds directly to the piece index.
fn parse_pieces(pieces_bytes: &[u8]) -> TorrentResult<Vec<[u8; 20]>> {
    if pieces_bytes.is_empty() || pieces_bytes.len() % PIECE_HASH_SIZE != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }
    let hashes = pieces_bytes
        .chunks_exact(PIECE_HASH_SIZE)
        .map(|chunk| {
            let mut hash = [0u8; PIECE_HASH_SIZE];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect();
    Ok(hashes)
}

fn take_string(
    dict: &mut BTreeMap<Vec<u8>, BencodeValue>,
    key: &str,
) -> TorrentResult<String> {
    match dict.remove(key.as_bytes()) {
        Some(BencodeValue::String(s)) => String::from_utf8(s).map_err(|e| {
            TorrentError::InvalidFormat(format!("{} is not UTF-8: {}", key, e))
        }),
        _ => Err(TorrentError::MissingField(key.to_string())),
    }
}

fn take_integer(dict: &mut BTreeMap<Vec<u8>, BencodeValue>, key: &str) -> TorrentResult<i64> {
    match dict.remove(key.as_bytes()) {
        Some(BencodeValue::Integer(i)) => Ok(i),
        _ => Err(TorrentError::MissingField(key.to_string())),
    }
}

impl Metainfo {
    /// Reads and parses a .torrent file from disk.
    pub fn load(path: &Path) -> TorrentResult<Metainfo> {
        let data = std::fs::read(path)?;
        let decoded = crate::bencode::decode(&data)?;
        Self::parse(decoded)
    }

    /// Parses an already-decoded descriptor.
    ///
    /// Required keys: `announce` (string) and `info` (dict); inside info:
    /// `name` (string), `length` (integer > 0), `piece length` (integer > 0),
    /// and `pieces` (byte string, length a non-zero multiple of 20). The
    /// piece geometry must cover the file length exactly, with only the last
    /// piece allowed to be short.
    #[tracing::instrument(skip(data), level = "debug")]
    pub fn parse(data: BencodeValue) -> TorrentResult<Metainfo> {
        let mut root = match data {
            BencodeValue::Dict(d) => d,
            _ => {
                return Err(TorrentError::InvalidFormat(
                    "root is not a dictionary".to_string(),
                ));
            }
        };

        let announce = take_string(&mut root, "announce")?;

        let mut info = match root.remove(b"info".as_slice()) {
            Some(BencodeValue::Dict(d)) => d,
            Some(_) => {
                return Err(TorrentError::InvalidFormat(
                    "info is not a dictionary".to_string(),
                ));
            }
            None => return Err(TorrentError::MissingField("info".to_string())),
        };

        // hash the info dictionary before the field extraction below
        // consumes it
        let info_hash = info_hash::calculate_info_hash(&info)?;

        let name = take_string(&mut info, "name")?;

        let length = take_integer(&mut info, "length")?;
        if length <= 0 {
            return Err(TorrentError::InvalidFormat(format!(
                "length must be positive, got {}",
                length
            )));
        }
        let length = length as u64;

        let piece_length = take_integer(&mut info, "piece length")?;
        if piece_length <= 0 || piece_length > i64::from(u32::MAX) {
            return Err(TorrentError::InvalidFormat(format!(
                "piece length out of range: {}",
                piece_length
            )));
        }
        let piece_length = piece_length as u32;

        let piece_hashes = match info.remove(b"pieces".as_slice()) {
            Some(BencodeValue::String(s)) => parse_pieces(&s)?,
            _ => return Err(TorrentError::MissingField("pieces".to_string())),
        };

        let pieces = piece_hashes.len();
        let full = u64::from(piece_length) * pieces as u64;
        let all_but_last = u64::from(piece_length) * (pieces as u64 - 1);
        if length > full || length <= all_but_last {
            return Err(TorrentError::InvalidGeometry {
                length,
                pieces,
                piece_length,
            });
        }

        Ok(Metainfo {
            announce,
            name,
            length,
            piece_length,
            piece_hashes,
            info_hash,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Size of piece `index` in bytes. Every piece has `piece_length` bytes
    /// except the last, which covers whatever remains of the file.
    pub fn piece_size(&self, index: usize) -> u32 {
        if index + 1 == self.num_pieces() {
            (self.length - (self.num_pieces() as u64 - 1) * u64::from(self.piece_length)) as u32
        } else {
            self.piece_length
        }
    }

    /// Logs the metadata banner shown at client startup.
    pub fn log_summary(&self) {
        tracing::info!(
            name = %self.name,
            size = self.length,
            piece_length = self.piece_length,
            pieces = self.num_pieces(),
            tracker = %self.announce,
            info_hash = %hex::encode(self.info_hash),
            "loaded torrent metadata"
        );
    }
}
