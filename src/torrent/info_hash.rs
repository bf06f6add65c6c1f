use crate::bencode;
use crate::bencode::BencodeValue;
use crate::torrent::TorrentResult;
use sha1::Digest;
use sha1::Sha1;
use std::collections::BTreeMap;

/// Calculates the SHA-1 hash of a bencode-encoded info dictionary.
///
/// The dictionary is re-encoded with keys in ascending byte order, which
/// matches the canonical encoding torrents are produced with, so the digest
/// equals the one computed over the byte range of `info` in the source file.
/// This 20-byte value identifies the swarm: it is exchanged in every
/// handshake and sent to the tracker on every announce.
pub fn calculate_info_hash(info_dict: &BTreeMap<Vec<u8>, BencodeValue>) -> TorrentResult<[u8; 20]> {
    let mut buffer = Vec::new();
    bencode::encode(&mut buffer, &BencodeValue::Dict(info_dict.clone()))?;

    let mut hasher = Sha1::new();
    hasher.update(&buffer);

    let result = hasher.finalize();
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&result[..]);

    Ok(info_hash)
}
