//! Tracker communication.
//!
//! The announce client lives here: it builds the announce URL, performs the
//! HTTP GET, and decodes the bencoded response into a peer list and
//! re-announce interval. The companion HTTP tracker lives in [`server`].
use crate::torrent::file::Metainfo;

use rand::distr::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use serde_bytes::ByteBuf;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

pub mod server;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid announce URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracker returned HTTP {0}")]
    BadStatus(u16),

    #[error("bencode deserialization error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("tracker response missing interval")]
    MissingInterval,

    #[error("tracker response missing peers")]
    MissingPeers,
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// Announce event, attached to the first announce, the completion announce,
/// and the shutdown announce. Periodic re-announces carry no event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Completed,
    Stopped,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Event::Started => write!(f, "started"),
            Event::Completed => write!(f, "completed"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

/// A peer as reported by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Absent for peers from the compact response format.
    pub peer_id: Option<[u8; 20]>,
    pub ip: IpAddr,
    pub port: u16,
}

/// Parsed announce response.
#[derive(Debug)]
pub struct AnnounceResponse {
    /// Seconds until the next periodic re-announce.
    pub interval: u64,
    pub peers: Vec<Peer>,
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    interval: Option<i64>,
    peers: Option<RawPeers>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPeers {
    Compact(ByteBuf),
    NonCompact(Vec<RawPeer>),
}

#[derive(Debug, Deserialize)]
struct RawPeer {
    #[serde(rename = "peer id", default)]
    peer_id: Option<ByteBuf>,
    ip: String,
    port: u16,
}

/// A client communicating with the tracker on behalf of one torrent.
#[derive(Debug, Clone, Copy)]
pub struct Client {
    peer_id: [u8; 20],
    port: u16,
}

impl Client {
    pub fn new(port: u16) -> Self {
        Self {
            peer_id: generate_peer_id(),
            port,
        }
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Announces to the tracker and returns the decoded peer list.
    ///
    /// `left` is the number of bytes still missing locally; `event` is
    /// attached when present. A missing `interval` or `peers` key in the
    /// response is an error, not a default.
    #[tracing::instrument(skip(self, torrent), level = "debug")]
    pub async fn announce(
        &self,
        torrent: &Metainfo,
        left: u64,
        event: Option<Event>,
    ) -> TrackerResult<AnnounceResponse> {
        let url = build_announce_url(
            &torrent.announce,
            &torrent.info_hash,
            &self.peer_id,
            self.port,
            0,
            0,
            left,
            event,
        )?;
        tracing::debug!(%url, "making announce request to tracker");

        let response = reqwest::get(url).await?;
        if !response.status().is_success() {
            return Err(TrackerError::BadStatus(response.status().as_u16()));
        }
        let body = response.bytes().await?;
        parse_announce_response(&body)
    }
}

/// Parses the bencoded tracker response.
///
/// Both peer list formats are handled:
/// - compact: a byte string of 6-byte entries (IPv4 address then port, in
///   network byte order), carrying no peer ids
/// - non-compact: a list of dictionaries with "peer id", "ip" and "port"
fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
    // 1. Deserialize the outer dictionary
    let raw: RawResponse = serde_bencode::from_bytes(bytes)?;
    let interval = raw.interval.ok_or(TrackerError::MissingInterval)?;
    let raw_peers = raw.peers.ok_or(TrackerError::MissingPeers)?;

    // 2. Flatten whichever peer encoding the tracker chose
    let peers = match raw_peers {
        RawPeers::Compact(bytes) => bytes
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                Peer {
                    peer_id: None,
                    ip: IpAddr::V4(ip),
                    port,
                }
            })
            .collect(),
        RawPeers::NonCompact(dicts) => dicts
            .into_iter()
            .filter_map(|dict| {
                let ip = dict.ip.parse::<IpAddr>().ok()?;
                Some(Peer {
                    peer_id: dict.peer_id.and_then(|id| id.into_vec().try_into().ok()),
                    ip,
                    port: dict.port,
                })
            })
            .collect(),
    };

    Ok(AnnounceResponse {
        interval: interval.max(0) as u64,
        peers,
    })
}

/// Generates this client's peer id: an 8-byte client prefix followed by 12
/// random alphanumeric bytes.
fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-SB0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    for byte in peer_id[prefix.len()..].iter_mut() {
        *byte = rng.sample(Alphanumeric);
    }
    peer_id
}

/// Appends the announce query parameters to the tracker URL, reusing an
/// existing query string when the URL already carries one.
#[allow(clippy::too_many_arguments)]
fn build_announce_url(
    announce: &str,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    event: Option<Event>,
) -> TrackerResult<String> {
    // validate the base URL before string surgery
    url::Url::parse(announce)?;

    let separator = if announce.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}",
        announce,
        separator,
        url_encode(info_hash),
        url_encode(peer_id),
        port,
        uploaded,
        downloaded,
        left,
    );
    if let Some(event) = event {
        url.push_str(&format!("&event={}", event));
    }
    Ok(url)
}

/// Percent-encodes a byte slice. Unreserved characters (a-z, A-Z, 0-9, `-`,
/// `.`, `_`, `~`) pass through; every other byte becomes `%XX` with
/// uppercase hex.
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encode_escapes_everything_outside_the_unreserved_set() {
        assert_eq!(url_encode(b"AZaz09-._~"), "AZaz09-._~");
        assert_eq!(url_encode(b"Hello World!"), "Hello%20World%21");
        assert_eq!(url_encode(&[0x00, 0xff, 0x1b]), "%00%FF%1B");
    }

    #[test]
    fn peer_id_has_the_client_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-SB0001-");
        assert!(id[8..].iter().all(u8::is_ascii_alphanumeric));
    }

    #[test]
    fn announce_url_carries_all_parameters() {
        let url = build_announce_url(
            "http://tracker.local:8080/announce",
            &[0xab; 20],
            b"-SB0001-000000000000",
            6881,
            1,
            2,
            3,
            Some(Event::Started),
        )
        .unwrap();
        assert!(url.starts_with("http://tracker.local:8080/announce?info_hash=%AB%AB"));
        assert!(url.contains("&peer_id=-SB0001-000000000000"));
        assert!(url.contains("&port=6881"));
        assert!(url.contains("&uploaded=1&downloaded=2&left=3"));
        assert!(url.ends_with("&event=started"));
    }

    #[test]
    fn periodic_announce_omits_the_event() {
        let url = build_announce_url(
            "http://t/announce",
            &[0u8; 20],
            &[0u8; 20],
            1,
            0,
            0,
            0,
            None,
        )
        .unwrap();
        assert!(!url.contains("event"));
    }

    #[test]
    fn announce_url_extends_an_existing_query() {
        let url = build_announce_url(
            "http://t/announce?key=abc",
            &[0u8; 20],
            &[0u8; 20],
            1,
            0,
            0,
            0,
            None,
        )
        .unwrap();
        assert!(url.starts_with("http://t/announce?key=abc&info_hash="));
    }

    #[test]
    fn parses_a_dict_peer_response() {
        let body = b"d8:intervali30e5:peersld2:ip9:127.0.0.17:peer id20:-SB0001-aaaaaaaaaaaa4:porti6881eeee";
        let response = parse_announce_response(body).unwrap();
        assert_eq!(response.interval, 30);
        assert_eq!(
            response.peers,
            vec![Peer {
                peer_id: Some(*b"-SB0001-aaaaaaaaaaaa"),
                ip: "127.0.0.1".parse().unwrap(),
                port: 6881,
            }]
        );
    }

    #[test]
    fn parses_a_compact_peer_response() {
        let mut body = b"d8:intervali60e5:peers6:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        body.push(b'e');
        let response = parse_announce_response(&body).unwrap();
        assert_eq!(response.interval, 60);
        assert_eq!(
            response.peers,
            vec![Peer {
                peer_id: None,
                ip: "127.0.0.1".parse().unwrap(),
                port: 6881,
            }]
        );
    }

    #[test]
    fn missing_interval_is_an_error() {
        let body = b"d5:peerslee";
        assert!(matches!(
            parse_announce_response(body),
            Err(TrackerError::MissingInterval)
        ));
    }

    #[test]
    fn missing_peers_is_an_error() {
        let body = b"d8:intervali30ee";
        assert!(matches!(
            parse_announce_response(body),
            Err(TrackerError::MissingPeers)
        ));
    }
}
