//! Piece storage and bookkeeping.
//!
//! [`PieceStore`] is the one piece of state shared between peer sessions. It
//! owns the backing file and tracks, for every piece index, whether the
//! piece is owned, being downloaded, or missing. Sessions never touch the
//! file or the bitmaps directly; everything goes through the methods here.
use crate::torrent::file::Metainfo;

use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Bitmaps guarded by the state lock. A piece is never both owned and in
/// progress: `reserve_next` sets `in_progress`, `mark_complete` trades it
/// for `owned`, `mark_abandoned` clears it.
struct BitState {
    owned: Vec<bool>,
    in_progress: Vec<bool>,
}

pub struct PieceStore {
    piece_hashes: Vec<[u8; 20]>,
    piece_length: u32,
    total_length: u64,
    path: PathBuf,
    state: Mutex<BitState>,
    file: Mutex<File>,
}

impl PieceStore {
    /// Opens (creating if absent) the backing file named by the metainfo
    /// inside `dir` and reconstructs piece state from its contents: every
    /// piece that reads back and hashes correctly is owned, everything else
    /// starts missing.
    pub fn open(meta: &Metainfo, dir: &Path) -> io::Result<PieceStore> {
        let path = dir.join(&meta.name);
        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let pieces = meta.num_pieces();
        let store = PieceStore {
            piece_hashes: meta.piece_hashes.clone(),
            piece_length: meta.piece_length,
            total_length: meta.length,
            path,
            state: Mutex::new(BitState {
                owned: vec![false; pieces],
                in_progress: vec![false; pieces],
            }),
            file: Mutex::new(file),
        };

        if existed {
            tracing::info!(path = %store.path.display(), "file available locally, verifying pieces");
            store.rehash();
            let have = store.bitfield().iter().filter(|b| **b).count();
            tracing::info!(have, total = pieces, "verified local pieces");
        } else {
            tracing::info!(path = %store.path.display(), "no local file, starting as leecher");
        }

        Ok(store)
    }

    /// Re-verifies every piece against its digest. Unreadable or mismatching
    /// pieces stay missing.
    fn rehash(&self) {
        for index in 0..self.total_pieces() {
            match self.read_piece(index) {
                Ok(data) if self.verify(index, &data) => {
                    self.state.lock().owned[index as usize] = true;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(index, error = %e, "piece unreadable during startup verification");
                }
            }
        }
    }

    /// Compares SHA-1 of `data` against the stored digest for `index`.
    /// Pure: no locks, no state change.
    pub fn verify(&self, index: u32, data: &[u8]) -> bool {
        let digest: [u8; 20] = Sha1::digest(data).into();
        self.piece_hashes.get(index as usize) == Some(&digest)
    }

    pub fn have(&self, index: u32) -> bool {
        let state = self.state.lock();
        state.owned.get(index as usize).copied().unwrap_or(false)
    }

    /// Reserves the lowest piece that is neither owned nor already being
    /// downloaded, marking it in progress. The whole scan happens under the
    /// state lock, so two sessions can never reserve the same index.
    pub fn reserve_next(&self) -> Option<u32> {
        let mut state = self.state.lock();
        for i in 0..state.owned.len() {
            if !state.owned[i] && !state.in_progress[i] {
                state.in_progress[i] = true;
                return Some(i as u32);
            }
        }
        None
    }

    /// Marks a verified, written piece as owned. Owned pieces stay owned for
    /// the life of the process.
    pub fn mark_complete(&self, index: u32) {
        let mut state = self.state.lock();
        if let Some(i) = state.owned.get_mut(index as usize) {
            *i = true;
        }
        if let Some(i) = state.in_progress.get_mut(index as usize) {
            *i = false;
        }
    }

    /// Releases a reservation without granting ownership, so another session
    /// can pick the piece up again.
    pub fn mark_abandoned(&self, index: u32) {
        let mut state = self.state.lock();
        if let Some(i) = state.in_progress.get_mut(index as usize) {
            *i = false;
        }
    }

    /// Snapshot of the owned bitmap.
    pub fn bitfield(&self) -> Vec<bool> {
        self.state.lock().owned.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().owned.iter().all(|b| *b)
    }

    /// Bytes still missing: full pieces for every missing index, except the
    /// last piece which only counts its actual size.
    pub fn bytes_left(&self) -> u64 {
        let state = self.state.lock();
        let missing = state.owned.iter().filter(|o| !**o).count() as u64;
        if missing == 0 {
            return 0;
        }
        let last_missing = !state.owned[state.owned.len() - 1];
        if last_missing {
            (missing - 1) * u64::from(self.piece_length) + u64::from(self.last_piece_size())
        } else {
            missing * u64::from(self.piece_length)
        }
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn total_pieces(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Size of piece `index`; only the final piece may be short.
    pub fn piece_size(&self, index: u32) -> u32 {
        if index + 1 == self.total_pieces() {
            self.last_piece_size()
        } else {
            self.piece_length
        }
    }

    fn last_piece_size(&self) -> u32 {
        let full = u64::from(self.total_pieces() - 1) * u64::from(self.piece_length);
        (self.total_length - full) as u32
    }

    /// Writes a full piece at its offset and flushes before returning, so
    /// that a later `mark_complete` never races a partially written piece.
    pub fn write_piece(&self, index: u32, data: &[u8]) -> io::Result<()> {
        let offset = u64::from(index) * u64::from(self.piece_length);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()
    }

    /// Reads the full piece at `index`; the final piece comes back short.
    pub fn read_piece(&self, index: u32) -> io::Result<Vec<u8>> {
        let offset = u64::from(index) * u64::from(self.piece_length);
        let mut data = vec![0u8; self.piece_size(index) as usize];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut data)?;
        drop(file);
        Ok(data)
    }
}
