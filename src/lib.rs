//! Library root for swarmbit.
//!
//! Re-exports the core modules: bencode codec, metainfo parsing, piece
//! storage, the peer wire protocol, the swarm coordinator, and the tracker
//! client/server pair.
pub mod bencode;
pub mod peer;
pub mod piece;
pub mod swarm;
pub mod torrent;
pub mod tracker;
