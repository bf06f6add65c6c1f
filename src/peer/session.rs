//! Per-connection session state machine.
//!
//! One session runs per peer, in its own task, and is the only place where
//! protocol state (choke/interest flags, the remote bitfield, the current
//! reservation) lives. All piece state goes through the shared
//! [`PieceStore`]; nothing here outlives the connection.
use crate::peer::handshake::Handshake;
use crate::peer::message::{pack_bitfield, read_message, unpack_bitfield, Message};
use crate::peer::PeerError;
use crate::peer::PeerResult;
use crate::piece::PieceStore;

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Bound on the whole handshake exchange so a silent peer cannot hold a
/// session open forever.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PeerSession<S> {
    stream: S,
    /// Peer address (or a placeholder for inbound peers), for logging only.
    label: String,
    store: Arc<PieceStore>,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
    /// Recorded from the remote handshake; informational only.
    pub remote_peer_id: Option<[u8; 20]>,
    remote_bitfield: Vec<bool>,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    /// Piece index this session has reserved in the store, if any.
    current_piece: Option<u32>,
}

/// Dials `addr` and completes an outbound handshake.
pub async fn connect(
    addr: String,
    store: Arc<PieceStore>,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
) -> PeerResult<PeerSession<TcpStream>> {
    let stream = TcpStream::connect(&addr).await?;
    info!(peer = %addr, "connected to peer");
    let mut session = PeerSession::new(stream, store, info_hash, our_peer_id, addr);
    session.handshake_outbound().await?;
    Ok(session)
}

impl<S: AsyncRead + AsyncWrite + Unpin> PeerSession<S> {
    pub fn new(
        stream: S,
        store: Arc<PieceStore>,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        label: String,
    ) -> Self {
        let pieces = store.total_pieces() as usize;
        Self {
            stream,
            label,
            store,
            info_hash,
            our_peer_id,
            remote_peer_id: None,
            remote_bitfield: vec![false; pieces],
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            current_piece: None,
        }
    }

    /// Outbound side: send our handshake, then read and validate theirs.
    pub async fn handshake_outbound(&mut self) -> PeerResult<()> {
        let result = timeout(HANDSHAKE_TIMEOUT, async {
            let ours = Handshake::new(self.info_hash, self.our_peer_id);
            self.stream.write_all(&ours.serialize()).await?;
            let theirs = Handshake::read(&mut self.stream).await?;
            theirs.validate(&self.info_hash)?;
            debug!(
                peer = %self.label,
                remote_id = %String::from_utf8_lossy(&theirs.peer_id),
                "handshake complete"
            );
            self.remote_peer_id = Some(theirs.peer_id);
            Ok(())
        })
        .await;
        match result {
            Ok(inner) => inner,
            Err(_) => Err(PeerError::HandshakeTimeout),
        }
    }

    /// Inbound side: read and validate theirs first, then send ours.
    pub async fn handshake_inbound(&mut self) -> PeerResult<()> {
        let result = timeout(HANDSHAKE_TIMEOUT, async {
            let theirs = Handshake::read(&mut self.stream).await?;
            theirs.validate(&self.info_hash)?;
            self.remote_peer_id = Some(theirs.peer_id);
            let ours = Handshake::new(self.info_hash, self.our_peer_id);
            self.stream.write_all(&ours.serialize()).await?;
            Ok(())
        })
        .await;
        match result {
            Ok(inner) => inner,
            Err(_) => Err(PeerError::HandshakeTimeout),
        }
    }

    /// Runs the session to completion: advertise our bitfield, then service
    /// messages until the transport closes or a protocol violation ends the
    /// connection. Any reservation still held on exit is released so other
    /// sessions can pick the piece up.
    pub async fn run(mut self) -> PeerResult<()> {
        let result = self.message_loop().await;
        if let Some(index) = self.current_piece.take() {
            debug!(peer = %self.label, index, "releasing reservation on session exit");
            self.store.mark_abandoned(index);
        }
        result
    }

    async fn message_loop(&mut self) -> PeerResult<()> {
        self.send(Message::Bitfield(pack_bitfield(&self.store.bitfield())))
            .await?;

        loop {
            let msg = match read_message(&mut self.stream).await {
                Ok(msg) => msg,
                // a clean close between frames ends the session normally
                Err(PeerError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!(peer = %self.label, "peer closed the connection");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            self.dispatch(msg).await?;
        }
    }

    async fn dispatch(&mut self, msg: Message) -> PeerResult<()> {
        trace!(peer = %self.label, ?msg, "received message");
        match msg {
            Message::KeepAlive => {}
            Message::Choke => self.handle_choke(),
            Message::Unchoke => self.handle_unchoke().await?,
            Message::Interested => self.handle_interested().await?,
            Message::NotInterested => self.peer_interested = false,
            Message::Have(index) => self.handle_have(index).await?,
            Message::Bitfield(packed) => self.handle_bitfield(&packed).await?,
            Message::Request(index, begin, length) => {
                self.handle_request(index, begin, length).await?
            }
            Message::Piece(index, begin, block) => {
                self.handle_piece(index, begin, block).await?
            }
            Message::Cancel(..) => debug!(peer = %self.label, "cancel ignored"),
            Message::Unknown(id) => debug!(peer = %self.label, id, "unknown message id, skipping"),
        }
        Ok(())
    }

    fn handle_choke(&mut self) {
        self.peer_choking = true;
        if let Some(index) = self.current_piece.take() {
            debug!(peer = %self.label, index, "choked mid-download, abandoning piece");
            self.store.mark_abandoned(index);
        }
    }

    async fn handle_unchoke(&mut self) -> PeerResult<()> {
        self.peer_choking = false;
        self.start_download().await
    }

    async fn handle_interested(&mut self) -> PeerResult<()> {
        self.peer_interested = true;
        self.send(Message::Unchoke).await?;
        self.am_choking = false;
        Ok(())
    }

    async fn handle_have(&mut self, index: u32) -> PeerResult<()> {
        let Some(bit) = self.remote_bitfield.get_mut(index as usize) else {
            warn!(peer = %self.label, index, "have for out-of-range piece, ignoring");
            return Ok(());
        };
        *bit = true;
        if !self.store.have(index) && !self.am_interested {
            self.send(Message::Interested).await?;
            self.am_interested = true;
        }
        Ok(())
    }

    async fn handle_bitfield(&mut self, packed: &[u8]) -> PeerResult<()> {
        let pieces = self.store.total_pieces() as usize;
        let expected = pieces.div_ceil(8);
        if packed.len() != expected {
            return Err(PeerError::Protocol(format!(
                "bitfield length {} does not match {} pieces",
                packed.len(),
                pieces
            )));
        }
        for i in pieces..expected * 8 {
            if packed[i / 8] & (1 << (7 - (i % 8))) != 0 {
                return Err(PeerError::Protocol(
                    "bitfield has non-zero padding bits".to_string(),
                ));
            }
        }

        self.remote_bitfield = unpack_bitfield(packed, pieces);

        let wants = self
            .remote_bitfield
            .iter()
            .enumerate()
            .any(|(i, set)| *set && !self.store.have(i as u32));
        if wants && !self.am_interested {
            self.send(Message::Interested).await?;
            self.am_interested = true;
        }
        Ok(())
    }

    async fn handle_request(&mut self, index: u32, begin: u32, length: u32) -> PeerResult<()> {
        if self.am_choking || !self.store.have(index) {
            debug!(peer = %self.label, index, "ignoring request while choking or for a missing piece");
            return Ok(());
        }

        // ownership was checked above, so the read observes verified bytes
        let piece = self.store.read_piece(index).map_err(PeerError::Store)?;
        let end = begin as u64 + length as u64;
        if end > piece.len() as u64 {
            warn!(peer = %self.label, index, begin, length, "request out of bounds, ignoring");
            return Ok(());
        }

        self.send(Message::Piece(
            index,
            begin,
            piece[begin as usize..end as usize].to_vec(),
        ))
        .await
    }

    async fn handle_piece(&mut self, index: u32, begin: u32, block: Vec<u8>) -> PeerResult<()> {
        if index >= self.store.total_pieces() {
            warn!(peer = %self.label, index, "piece for out-of-range index, discarding");
            return Ok(());
        }
        // whole pieces only: a block reply carries begin 0 and the full
        // piece for its index
        if begin != 0 || block.len() != self.store.piece_size(index) as usize {
            warn!(
                peer = %self.label,
                index,
                begin,
                size = block.len(),
                "partial piece received, discarding"
            );
            return Ok(());
        }

        if !self.store.verify(index, &block) {
            warn!(peer = %self.label, index, "piece failed verification, abandoning");
            if self.current_piece == Some(index) {
                self.current_piece = None;
                self.store.mark_abandoned(index);
            }
            return self.start_download().await;
        }

        self.store
            .write_piece(index, &block)
            .map_err(PeerError::Store)?;
        self.store.mark_complete(index);
        if self.current_piece == Some(index) {
            self.current_piece = None;
        }
        info!(peer = %self.label, index, "piece complete and verified");

        self.send(Message::Have(index)).await?;
        self.start_download().await
    }

    /// Reserves and requests the next piece this peer can provide.
    ///
    /// Reserved indices the remote does not have are held aside during the
    /// scan (they stay in progress, so `reserve_next` keeps moving forward)
    /// and released as soon as the scan settles. With nothing useful to
    /// request the session goes idle until the remote announces more pieces.
    async fn start_download(&mut self) -> PeerResult<()> {
        if self.peer_choking || self.current_piece.is_some() || self.store.is_complete() {
            return Ok(());
        }

        let mut unavailable = Vec::new();
        let mut chosen = None;
        while let Some(index) = self.store.reserve_next() {
            if self.remote_has(index) {
                chosen = Some(index);
                break;
            }
            unavailable.push(index);
        }
        for index in unavailable {
            self.store.mark_abandoned(index);
        }

        let Some(index) = chosen else {
            debug!(peer = %self.label, "no piece this peer can provide, idling");
            return Ok(());
        };

        self.current_piece = Some(index);
        let length = self.store.piece_size(index);
        debug!(peer = %self.label, index, length, "requesting piece");
        self.send(Message::Request(index, 0, length)).await
    }

    fn remote_has(&self, index: u32) -> bool {
        self.remote_bitfield
            .get(index as usize)
            .copied()
            .unwrap_or(false)
    }

    async fn send(&mut self, msg: Message) -> PeerResult<()> {
        trace!(peer = %self.label, ?msg, "sending message");
        self.stream.write_all(&msg.to_bytes()).await?;
        Ok(())
    }
}
