//! Tracker client logic for the BitTorrent protocol.
//!
//! Implements HTTP(S) announce requests and responses: peer discovery
//! (compact and non-compact forms), the announce-event lifecycle
//! (`started`/empty/`stopped`/`completed`), and peer ID generation.
use crate::torrent::Metainfo;
use rand::Rng;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;
use tracing::{debug, instrument, warn};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid tracker URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("bencode decoding error in tracker response: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("tracker reported failure: {0}")]
    Failure(String),

    #[error("tracker responded with HTTP status {0}")]
    HttpStatus(reqwest::StatusCode),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// Announce event, sent once on connect (`Started`), once on graceful
/// shutdown (`Stopped`, best-effort), once on reaching completion
/// (`Completed`, best-effort), and omitted (`None`) on every other
/// periodic re-announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Stopped,
    Completed,
    None,
}

impl Event {
    fn as_query_value(self) -> Option<&'static str> {
        match self {
            Event::Started => Some("started"),
            Event::Stopped => Some("stopped"),
            Event::Completed => Some("completed"),
            Event::None => None,
        }
    }
}

/// Parameters for a single announce request.
#[derive(Debug)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
}

/// A peer returned by the tracker.
#[derive(Debug, Clone, Copy)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

/// The parsed response to an announce request.
#[derive(Debug)]
pub struct AnnounceResponse {
    pub interval: i64,
    pub min_interval: Option<i64>,
    pub tracker_id: Option<String>,
    pub complete: Option<i64>,
    pub incomplete: Option<i64>,
    pub warning_message: Option<String>,
    pub peers: Vec<Peer>,
}

#[derive(Debug, Deserialize)]
struct RawTrackerResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(rename = "warning message", default)]
    warning_message: Option<String>,
    #[serde(default)]
    interval: i64,
    #[serde(rename = "min interval", default)]
    min_interval: Option<i64>,
    #[serde(rename = "tracker id", default)]
    tracker_id: Option<String>,
    #[serde(default)]
    complete: Option<i64>,
    #[serde(default)]
    incomplete: Option<i64>,
    #[serde(default)]
    peers: RawPeers,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPeers {
    Compact(serde_bytes::ByteBuf),
    NonCompact(Vec<RawPeerDict>),
}

impl Default for RawPeers {
    fn default() -> Self {
        RawPeers::Compact(serde_bytes::ByteBuf::new())
    }
}

#[derive(Debug, Deserialize)]
struct RawPeerDict {
    ip: String,
    port: u16,
}

/// A client communicating with a BitTorrent tracker over HTTP(S). Owns a
/// single `reqwest::Client` so repeated announces reuse connections
/// rather than opening a fresh socket per request.
#[derive(Debug)]
pub struct Client {
    http: reqwest::Client,
    peer_id: [u8; 20],
    port: u16,
}

impl Client {
    pub fn new(port: u16) -> Self {
        Self {
            http: reqwest::Client::new(),
            peer_id: generate_peer_id(),
            port,
        }
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Sends an announce request to `metainfo`'s tracker and parses the
    /// response.
    #[instrument(skip(self, metainfo), level = "debug")]
    pub async fn announce(
        &self,
        metainfo: &Metainfo,
        uploaded: u64,
        downloaded: u64,
        event: Event,
    ) -> TrackerResult<AnnounceResponse> {
        let request = AnnounceRequest {
            info_hash: metainfo.info_hash(),
            peer_id: self.peer_id,
            port: self.port,
            uploaded,
            downloaded,
            left: metainfo.total_length().saturating_sub(downloaded),
            event,
        };

        // `info_hash`/`peer_id` are raw bytes, percent-encoded byte-by-byte —
        // NOT a UTF-8 string. `Url::query_pairs_mut` percent-encodes its
        // *input* through the form-urlencoded serializer, which would encode
        // our already-escaped `%XX` sequences a second time (`%` itself isn't
        // in its safe set). So the query string is built by hand and handed
        // to `set_query`, whose WHATWG query parser passes a literal `%`
        // through untouched.
        let mut url = url::Url::parse(&metainfo.announce)?;
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            url_encode(&request.info_hash),
            url_encode(&request.peer_id),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
        );
        if let Some(event) = request.event.as_query_value() {
            query.push_str("&event=");
            query.push_str(event);
        }
        url.set_query(Some(&query));

        debug!(%url, "making announce request to tracker");
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(TrackerError::HttpStatus(response.status()));
        }
        let response_bytes = response.bytes().await?;
        Self::parse_announce_response(&response_bytes)
    }

    /// Tears down the underlying HTTP session. `reqwest::Client` has no
    /// explicit close call; this exists so the orchestrator has one
    /// guaranteed teardown point regardless of what the HTTP layer needs
    /// in the future.
    pub async fn close(&self) {}

    fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
        let raw: RawTrackerResponse = serde_bencode::from_bytes(bytes)?;

        if let Some(reason) = raw.failure_reason {
            return Err(TrackerError::Failure(reason));
        }

        let peers = match raw.peers {
            RawPeers::Compact(bytes) => bytes
                .chunks_exact(6)
                .map(|chunk| {
                    let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                    Peer {
                        ip: IpAddr::V4(ip),
                        port,
                    }
                })
                .collect(),
            RawPeers::NonCompact(dicts) => dicts
                .into_iter()
                .filter_map(|dict| {
                    dict.ip.parse::<IpAddr>().ok().map(|ip| Peer {
                        ip,
                        port: dict.port,
                    })
                })
                .collect(),
        };

        if let Some(warning) = &raw.warning_message {
            warn!(%warning, "tracker returned a warning message");
        }

        Ok(AnnounceResponse {
            interval: raw.interval,
            min_interval: raw.min_interval,
            tracker_id: raw.tracker_id,
            complete: raw.complete,
            incomplete: raw.incomplete,
            warning_message: raw.warning_message,
            peers,
        })
    }
}

/// Generates a 20-byte peer ID: the prefix `-BP0001-` ("BitTorrent
/// Peer") followed by 12 random ASCII decimal digits.
fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-BP0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    for slot in &mut peer_id[prefix.len()..] {
        *slot = b'0' + rng.random_range(0..10);
    }
    peer_id
}

/// URL-encodes a byte slice per RFC 3986: unreserved characters
/// (`a-z A-Z 0-9 - . _ ~`) pass through unescaped, everything else
/// becomes `%XX`.
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_peer_id_has_expected_prefix_and_length() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-BP0001-");
        assert_eq!(id.len(), 20);
        assert!(id[8..].iter().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn url_encode_escapes_reserved_bytes() {
        assert_eq!(url_encode(b"abc"), "abc");
        assert_eq!(url_encode(&[0x00, 0xFF]), "%00%FF");
    }

    #[test]
    fn set_query_does_not_double_encode_percent_escapes() {
        // Regression test: query_pairs_mut().append_pair() would run our
        // already-%XX-escaped info_hash through the form-urlencoded
        // serializer again, turning "%00" into "%2500". set_query must
        // leave a literal '%' followed by two hex digits untouched.
        let mut url = url::Url::parse("http://tracker.example/announce").unwrap();
        let raw = [0x00u8, 0xFFu8, b'a'];
        let query = format!("info_hash={}", url_encode(&raw));
        url.set_query(Some(&query));
        assert_eq!(url.query(), Some("info_hash=%00%FFa"));
    }

    #[test]
    fn parses_compact_peer_list() {
        let mut bencoded = Vec::new();
        bencoded.extend_from_slice(b"d8:intervali900e5:peers6:");
        bencoded.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        bencoded.extend_from_slice(b"e");
        let response = Client::parse_announce_response(&bencoded).unwrap();
        assert_eq!(response.interval, 900);
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].port, 0x1ae1);
    }

    #[test]
    fn surfaces_failure_reason_as_error() {
        let bencoded = b"d14:failure reason17:torrent not founde";
        let err = Client::parse_announce_response(bencoded).unwrap_err();
        assert!(matches!(err, TrackerError::Failure(_)));
    }

    fn metainfo_with_announce(announce: &str) -> Metainfo {
        use crate::bencode::encoder::encode_to_vec;
        use crate::bencode::BencodeValue;
        use std::collections::BTreeMap;

        let mut info = BTreeMap::new();
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(16384));
        info.insert(b"pieces".to_vec(), BencodeValue::String(vec![0u8; 20]));
        info.insert(b"name".to_vec(), BencodeValue::String(b"file.bin".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(1000));

        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            BencodeValue::String(announce.as_bytes().to_vec()),
        );
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));
        let data = encode_to_vec(&BencodeValue::Dict(root)).unwrap();
        Metainfo::parse(&data).unwrap()
    }

    #[tokio::test]
    async fn announce_fails_on_non_success_status() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let metainfo = metainfo_with_announce(&format!("http://{addr}/announce"));
        let client = Client::new(6881);
        let err = client
            .announce(&metainfo, 0, 0, Event::Started)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::HttpStatus(status) if status.as_u16() == 503));

        server.await.unwrap();
    }
}
