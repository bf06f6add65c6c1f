//! Torrent metainfo parsing and error handling.
//!
//! This module provides the [`file::Metainfo`] type and the errors produced
//! while loading and validating a .torrent descriptor.
use thiserror::Error;

pub mod file;
pub mod info_hash;

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("missing or invalid field: {0}")]
    MissingField(String),

    #[error("pieces hash length is not a multiple of 20")]
    InvalidPiecesHashLength,

    #[error("file length {length} does not fit {pieces} pieces of {piece_length} bytes")]
    InvalidGeometry {
        length: u64,
        pieces: usize,
        piece_length: u32,
    },
}

/// Result type for torrent operations derived from `std::result`
pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
