//! Peer-to-peer piece exchange over real sockets.
mod common;

use std::sync::Arc;
use std::time::Duration;
use swarmbit::peer::session::{self, PeerSession};
use swarmbit::piece::PieceStore;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const SEEDER_ID: [u8; 20] = *b"-SB0001-seederseeder";
const LEECHER_ID: [u8; 20] = *b"-SB0001-leecherleech";

/// Serves the store from an already-bound listener, one inbound session.
fn spawn_seeder(
    listener: TcpListener,
    store: Arc<PieceStore>,
    info_hash: [u8; 20],
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (socket, peer_addr) = listener.accept().await.unwrap();
        let mut session = PeerSession::new(
            socket,
            store,
            info_hash,
            SEEDER_ID,
            peer_addr.to_string(),
        );
        session.handshake_inbound().await.unwrap();
        let _ = session.run().await;
    })
}

async fn wait_until_complete(store: &Arc<PieceStore>) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !store.is_complete() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("download did not complete in time");
}

#[tokio::test(flavor = "multi_thread")]
async fn single_piece_file_transfers_between_peers() {
    let meta = common::meta_for("hello.txt", &[b"hello"], 16);

    let seeder_dir = tempfile::tempdir().unwrap();
    std::fs::write(seeder_dir.path().join("hello.txt"), b"hello").unwrap();
    let seeder_store = Arc::new(PieceStore::open(&meta, seeder_dir.path()).unwrap());
    assert!(seeder_store.is_complete());

    let leecher_dir = tempfile::tempdir().unwrap();
    let leecher_store = Arc::new(PieceStore::open(&meta, leecher_dir.path()).unwrap());
    assert_eq!(leecher_store.bytes_left(), 5);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seeder = spawn_seeder(listener, Arc::clone(&seeder_store), meta.info_hash);

    let leecher = {
        let store = Arc::clone(&leecher_store);
        let info_hash = meta.info_hash;
        tokio::spawn(async move {
            let session = session::connect(addr.to_string(), store, info_hash, LEECHER_ID)
                .await
                .unwrap();
            let _ = session.run().await;
        })
    };

    wait_until_complete(&leecher_store).await;
    assert_eq!(leecher_store.bytes_left(), 0);
    assert_eq!(
        std::fs::read(leecher_dir.path().join("hello.txt")).unwrap(),
        b"hello"
    );

    leecher.abort();
    seeder.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn short_final_piece_transfers_exactly() {
    let contents: &[&[u8]] = &[b"0123456789abcdef", b"tail"];
    let meta = common::meta_for("data.bin", contents, 16);

    let seeder_dir = tempfile::tempdir().unwrap();
    std::fs::write(seeder_dir.path().join("data.bin"), b"0123456789abcdeftail").unwrap();
    let seeder_store = Arc::new(PieceStore::open(&meta, seeder_dir.path()).unwrap());
    assert!(seeder_store.is_complete());

    let leecher_dir = tempfile::tempdir().unwrap();
    let leecher_store = Arc::new(PieceStore::open(&meta, leecher_dir.path()).unwrap());
    assert_eq!(leecher_store.bytes_left(), 20);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seeder = spawn_seeder(listener, Arc::clone(&seeder_store), meta.info_hash);

    let leecher = {
        let store = Arc::clone(&leecher_store);
        let info_hash = meta.info_hash;
        tokio::spawn(async move {
            let session = session::connect(addr.to_string(), store, info_hash, LEECHER_ID)
                .await
                .unwrap();
            let _ = session.run().await;
        })
    };

    wait_until_complete(&leecher_store).await;

    // the final piece is 4 bytes on disk and in reads, never padded
    let last = leecher_store.read_piece(1).unwrap();
    assert_eq!(last, b"tail");
    assert!(leecher_store.verify(1, &last));
    assert_eq!(
        std::fs::read(leecher_dir.path().join("data.bin")).unwrap(),
        b"0123456789abcdeftail"
    );

    leecher.abort();
    seeder.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn mismatched_info_hash_drops_the_session() {
    let meta = common::meta_for("hello.txt", &[b"hello"], 16);

    let seeder_dir = tempfile::tempdir().unwrap();
    std::fs::write(seeder_dir.path().join("hello.txt"), b"hello").unwrap();
    let seeder_store = Arc::new(PieceStore::open(&meta, seeder_dir.path()).unwrap());

    let leecher_dir = tempfile::tempdir().unwrap();
    let leecher_store = Arc::new(PieceStore::open(&meta, leecher_dir.path()).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let seeder = tokio::spawn(async move {
        let (socket, peer_addr) = listener.accept().await.unwrap();
        let mut session = PeerSession::new(
            socket,
            seeder_store,
            meta.info_hash,
            SEEDER_ID,
            peer_addr.to_string(),
        );
        session.handshake_inbound().await
    });

    // the leecher is in a different swarm
    let result = session::connect(addr.to_string(), leecher_store, [0xcd; 20], LEECHER_ID).await;
    assert!(result.is_err());
    assert!(seeder.await.unwrap().is_err());
}
