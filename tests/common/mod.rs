use sha1::{Digest, Sha1};
use swarmbit::torrent::file::Metainfo;

/// Builds a single-file metainfo whose pieces are exactly `contents`.
pub fn meta_for(name: &str, contents: &[&[u8]], piece_length: u32) -> Metainfo {
    Metainfo {
        announce: "http://127.0.0.1:1/announce".to_string(),
        name: name.to_string(),
        length: contents.iter().map(|c| c.len() as u64).sum(),
        piece_length,
        piece_hashes: contents.iter().map(|c| Sha1::digest(c).into()).collect(),
        info_hash: [0xab; 20],
    }
}
