//! The HTTP tracker: one announce endpoint over a per-torrent peer roster.
//!
//! Announce parameters arrive percent-encoded in the query string.
//! `info_hash` and `peer_id` are raw 20-byte values, so the query is
//! decoded by hand to bytes instead of going through a UTF-8 string layer.
use axum::extract::{ConnectInfo, RawQuery, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use serde_bytes::ByteBuf;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const ANNOUNCE_INTERVAL: u64 = 30;
pub const PEER_TIMEOUT: u64 = 120;

/// One peer as remembered by the tracker.
#[derive(Debug, Clone)]
struct PeerEntry {
    peer_id: [u8; 20],
    ip: String,
    port: u16,
    /// Last announce event, kept for diagnostics ("started", "completed",
    /// "stopped", or empty for periodic re-announces).
    status: String,
    last_announce: Instant,
}

/// Per-torrent peer rosters, keyed by info-hash.
pub struct Roster {
    torrents: Mutex<HashMap<[u8; 20], Vec<PeerEntry>>>,
    announce_interval: u64,
    peer_timeout: Duration,
}

impl Roster {
    pub fn new(announce_interval: u64, peer_timeout_secs: u64) -> Self {
        Self {
            torrents: Mutex::new(HashMap::new()),
            announce_interval,
            peer_timeout: Duration::from_secs(peer_timeout_secs),
        }
    }

    /// Records one announce and returns the bencoded response body: the
    /// re-announce interval plus every live peer except the caller.
    fn handle_announce(&self, params: &AnnounceParams, ip: String) -> Vec<u8> {
        debug!(
            info_hash = %hex::encode(params.info_hash),
            peer_id = %String::from_utf8_lossy(&params.peer_id),
            %ip,
            port = params.port,
            event = %params.event,
            "peer announce"
        );

        let mut torrents = self.torrents.lock();
        let peer_list = torrents.entry(params.info_hash).or_default();

        match peer_list
            .iter_mut()
            .find(|peer| peer.peer_id == params.peer_id)
        {
            Some(existing) => {
                existing.ip = ip;
                existing.port = params.port;
                existing.status = params.event.clone();
                existing.last_announce = Instant::now();
            }
            None => peer_list.push(PeerEntry {
                peer_id: params.peer_id,
                ip,
                port: params.port,
                status: params.event.clone(),
                last_announce: Instant::now(),
            }),
        }

        let now = Instant::now();
        let peers: Vec<ReplyPeer> = peer_list
            .iter()
            .filter(|peer| {
                peer.peer_id != params.peer_id
                    && now.duration_since(peer.last_announce) <= self.peer_timeout
            })
            .map(|peer| ReplyPeer {
                ip: peer.ip.clone(),
                peer_id: ByteBuf::from(peer.peer_id.to_vec()),
                port: peer.port,
            })
            .collect();

        let reply = AnnounceReply {
            interval: self.announce_interval as i64,
            peers,
        };
        // the reply is two keys and flat lists; serialization cannot fail
        serde_bencode::to_bytes(&reply).unwrap_or_default()
    }

    /// Drops every peer whose last announce is older than the timeout.
    pub fn evict_stale(&self) {
        let now = Instant::now();
        let mut torrents = self.torrents.lock();
        for (info_hash, peer_list) in torrents.iter_mut() {
            let before = peer_list.len();
            peer_list.retain(|peer| now.duration_since(peer.last_announce) <= self.peer_timeout);
            if peer_list.len() < before {
                debug!(
                    info_hash = %hex::encode(info_hash),
                    evicted = before - peer_list.len(),
                    "evicted inactive peers"
                );
            }
        }
        torrents.retain(|_, peer_list| !peer_list.is_empty());
    }

    fn sweep_period(&self) -> Duration {
        self.peer_timeout
    }
}

/// Bencoded response layout. Field order matches ascending key order, the
/// canonical dictionary encoding.
#[derive(Serialize)]
struct AnnounceReply {
    interval: i64,
    peers: Vec<ReplyPeer>,
}

#[derive(Serialize)]
struct ReplyPeer {
    ip: String,
    #[serde(rename = "peer id")]
    peer_id: ByteBuf,
    port: u16,
}

#[derive(Debug)]
struct AnnounceParams {
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
    event: String,
}

impl AnnounceParams {
    /// Splits and percent-decodes the raw query. `info_hash` and `peer_id`
    /// must decode to exactly 20 bytes; `port` must be a valid u16.
    fn from_query(query: &str) -> Result<AnnounceParams, String> {
        let mut params: HashMap<&str, Vec<u8>> = HashMap::new();
        for pair in query.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                params.insert(key, percent_decode_str(value).collect());
            }
        }

        let info_hash = fixed_param(&params, "info_hash")?;
        let peer_id = fixed_param(&params, "peer_id")?;

        let port = params
            .get("port")
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| "missing or invalid port".to_string())?;

        let event = params
            .get("event")
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default();

        Ok(AnnounceParams {
            info_hash,
            peer_id,
            port,
            event,
        })
    }
}

fn fixed_param(params: &HashMap<&str, Vec<u8>>, name: &str) -> Result<[u8; 20], String> {
    let value = params
        .get(name)
        .ok_or_else(|| format!("missing {}", name))?;
    value
        .as_slice()
        .try_into()
        .map_err(|_| format!("{} must be exactly 20 bytes", name))
}

async fn announce(
    State(roster): State<Arc<Roster>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
) -> Response {
    let query = query.unwrap_or_default();
    let params = match AnnounceParams::from_query(&query) {
        Ok(params) => params,
        Err(reason) => {
            warn!(%remote, %reason, "rejecting announce");
            return (StatusCode::BAD_REQUEST, reason).into_response();
        }
    };

    let body = roster.handle_announce(&params, remote.ip().to_string());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        body,
    )
        .into_response()
}

pub fn router(roster: Arc<Roster>) -> Router {
    Router::new()
        .route("/announce", get(announce))
        .with_state(roster)
}

/// Serves the tracker on an already-bound listener and keeps the roster
/// swept in the background.
pub async fn serve(listener: tokio::net::TcpListener, roster: Arc<Roster>) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "tracker listening");

    let sweeper = Arc::clone(&roster);
    tokio::spawn(async move {
        let period = sweeper.sweep_period();
        loop {
            tokio::time::sleep(period).await;
            sweeper.evict_stale();
        }
    });

    axum::serve(
        listener,
        router(roster).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}
