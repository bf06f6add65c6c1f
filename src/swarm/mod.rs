//! Swarm coordination: the listen socket, outbound dialing, progress
//! monitoring, and the announce lifecycle.
//!
//! One coordinator runs per torrent. Every peer gets its own detached
//! session task; the only state those tasks share is the [`PieceStore`].
//! Session failures stay inside their task, with one exception: an I/O
//! error on the backing file means piece integrity can no longer be
//! guaranteed, so it requests a process-wide shutdown.
use crate::peer::session::{self, PeerSession};
use crate::peer::PeerError;
use crate::peer::PeerResult;
use crate::piece::PieceStore;
use crate::torrent::file::Metainfo;
use crate::tracker::{Client, Event, Peer};

use anyhow::Context;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

const PROGRESS_PERIOD: Duration = Duration::from_secs(5);

/// Cooperative stop flag shared by every loop in the process. Set once by
/// the signal handler (or by a fatal storage error) and polled at loop
/// boundaries; `wait` parks a task until the flag goes up.
#[derive(Clone, Default)]
pub struct Shutdown(Arc<ShutdownInner>);

#[derive(Default)]
struct ShutdownInner {
    requested: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.requested.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.0.requested.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            if self.is_requested() {
                return;
            }
            // register before the re-check so a request between the check
            // and the await is not lost
            let notified = self.0.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// Resolves when the process receives SIGINT or SIGTERM, then raises the
/// shutdown flag.
pub async fn listen_for_shutdown(shutdown: Shutdown) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, watching SIGINT only");
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    info!("shutdown signal received");
    shutdown.request();
}

/// Runs the swarm until shutdown: announce, accept, dial, monitor, seed.
pub async fn run(
    meta: Arc<Metainfo>,
    store: Arc<PieceStore>,
    listen_port: u16,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", listen_port))
        .await
        .context("binding the peer listen socket")?;
    let port = listener.local_addr()?.port();
    info!(port, "listening for peers");

    let client = Client::new(port);
    info!(peer_id = %String::from_utf8_lossy(&client.peer_id()), "generated peer id");

    // the first announce is fatal on failure; later ones only log
    let response = client
        .announce(&meta, store.bytes_left(), Some(Event::Started))
        .await
        .context("initial tracker announce")?;
    info!(
        peers = response.peers.len(),
        interval = response.interval,
        "tracker responded"
    );

    let fatal = Arc::new(AtomicBool::new(false));

    tokio::spawn(accept_loop(
        listener,
        Arc::clone(&store),
        meta.info_hash,
        client.peer_id(),
        shutdown.clone(),
        Arc::clone(&fatal),
    ));

    let already_complete = store.is_complete();
    if already_complete {
        info!("file already complete, seeding only");
    } else {
        info!(peers = response.peers.len(), "dialing peers");
        for peer in response.peers {
            if peer.peer_id == Some(client.peer_id()) {
                continue;
            }
            spawn_session(
                dial_peer(peer, Arc::clone(&store), meta.info_hash, client.peer_id()),
                shutdown.clone(),
                Arc::clone(&fatal),
            );
        }
    }

    tokio::spawn(reannounce_loop(
        client,
        Arc::clone(&meta),
        Arc::clone(&store),
        shutdown.clone(),
        response.interval,
    ));

    if !already_complete {
        monitor_progress(&store, &shutdown).await;
        if store.is_complete() {
            info!("download complete, seeding");
            if let Err(e) = client.announce(&meta, 0, Some(Event::Completed)).await {
                warn!(error = %e, "completed announce failed");
            }
        }
    }

    shutdown.wait().await;

    info!("shutting down");
    match client
        .announce(&meta, store.bytes_left(), Some(Event::Stopped))
        .await
    {
        Ok(_) => info!("notified tracker of shutdown"),
        Err(e) => warn!(error = %e, "failed to notify tracker of shutdown"),
    }

    if fatal.load(Ordering::SeqCst) {
        anyhow::bail!("backing file failure, stored pieces may be incomplete");
    }
    Ok(())
}

/// Accepts inbound connections until shutdown, one session task each.
async fn accept_loop(
    listener: TcpListener,
    store: Arc<PieceStore>,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
    shutdown: Shutdown,
    fatal: Arc<AtomicBool>,
) {
    debug!("acceptor started");
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    info!(peer = %addr, "accepted inbound connection");
                    spawn_session(
                        inbound_session(socket, addr.to_string(), Arc::clone(&store), info_hash, our_peer_id),
                        shutdown.clone(),
                        Arc::clone(&fatal),
                    );
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    debug!("acceptor exiting");
}

async fn inbound_session(
    socket: TcpStream,
    addr: String,
    store: Arc<PieceStore>,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
) -> PeerResult<()> {
    let mut session = PeerSession::new(socket, store, info_hash, our_peer_id, addr);
    session.handshake_inbound().await?;
    session.run().await
}

async fn dial_peer(
    peer: Peer,
    store: Arc<PieceStore>,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
) -> PeerResult<()> {
    let addr = format!("{}:{}", peer.ip, peer.port);
    let session = session::connect(addr, store, info_hash, our_peer_id).await?;
    session.run().await
}

/// Detaches one session task. Errors never leave the task; a backing-file
/// error additionally flips the fatal flag and requests shutdown.
fn spawn_session(
    session: impl Future<Output = PeerResult<()>> + Send + 'static,
    shutdown: Shutdown,
    fatal: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        match session.await {
            Ok(()) => debug!("peer session ended"),
            Err(PeerError::Store(e)) => {
                error!(error = %e, "backing file failure, requesting shutdown");
                fatal.store(true, Ordering::SeqCst);
                shutdown.request();
            }
            Err(e) => warn!(error = %e, "peer session failed"),
        }
    });
}

/// Logs download progress every few seconds until the file is complete or
/// shutdown is requested.
async fn monitor_progress(store: &Arc<PieceStore>, shutdown: &Shutdown) {
    while !store.is_complete() && !shutdown.is_requested() {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(PROGRESS_PERIOD) => {
                let left = store.bytes_left();
                let total = store.total_length();
                let percent = (100.0 * (1.0 - left as f64 / total as f64)) as u64;
                info!(percent, bytes_left = left, "download progress");
            }
        }
    }
}

/// Re-announces on the tracker's interval until shutdown. Failures are
/// logged and retried on the next tick.
async fn reannounce_loop(
    client: Client,
    meta: Arc<Metainfo>,
    store: Arc<PieceStore>,
    shutdown: Shutdown,
    interval: u64,
) {
    let period = Duration::from_secs(interval.max(1));
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(period) => {
                match client.announce(&meta, store.bytes_left(), None).await {
                    Ok(_) => debug!("re-announced to tracker"),
                    Err(e) => warn!(error = %e, "re-announce failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_wakes_waiters() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let task = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());

        shutdown.request();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(shutdown.is_requested());
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_requested() {
        let shutdown = Shutdown::new();
        shutdown.request();
        tokio::time::timeout(Duration::from_millis(100), shutdown.wait())
            .await
            .unwrap();
    }
}
