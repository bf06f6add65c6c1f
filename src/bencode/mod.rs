use std::collections::BTreeMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

pub use decoder::decode;
pub use encoder::encode;

/// A bencode value, the self-describing format used by torrent metainfo
/// files and tracker responses.
///
/// Four kinds exist:
///
/// 1. `String(Vec<u8>)`: a raw byte string ("4:spam" becomes `String(b"spam")`).
///    Not UTF-8 validated, piece hashes are arbitrary bytes.
/// 2. `Integer(i64)`: "i42e" becomes `Integer(42)`.
/// 3. `List(Vec<BencodeValue>)`: "l4:spami42ee" becomes a two-element list.
/// 4. `Dict(BTreeMap<Vec<u8>, BencodeValue>)`: "d3:foo3:bare" maps `b"foo"`
///    to `String(b"bar")`.
///
/// Dictionaries use an ordered map so that re-encoding a decoded value emits
/// keys in ascending byte order. Re-encoding a canonically encoded info
/// dictionary therefore reproduces its source bytes, which is what the
/// info-hash is computed over.
#[derive(Debug, PartialEq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

/// Errors produced by the decoder and encoder. Decode errors carry the byte
/// offset at which the input stopped making sense.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("invalid bencode at byte {offset}: {reason}")]
    InvalidFormat { offset: usize, reason: &'static str },

    #[error("invalid integer at byte {0}")]
    InvalidInteger(usize),

    #[error("invalid string length at byte {0}")]
    InvalidStringLength(usize),

    #[error("duplicate dictionary key at byte {0}")]
    DuplicateKey(usize),

    #[error("unexpected end of input at byte {0}")]
    UnexpectedEoi(usize),

    #[error("trailing bytes after value at byte {0}")]
    TrailingBytes(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
