//! # Tracker Client
//!
//! The tracker is an HTTP endpoint that maps a swarm (identified by its
//! info-hash) to the peers currently participating in it. An announce is a
//! GET request whose query carries the info-hash, our peer id, listen port,
//! and transfer statistics; the response is a bencoded dictionary holding
//! either a peer list or a `failure reason` string.
//!
//! The `info_hash` and `peer_id` parameters are raw 20-byte values. They are
//! percent-encoded byte by byte: unreserved ASCII passes through and every
//! other byte becomes `%XX`. Generic URL query builders mangle binary
//! values, so the query string is assembled by hand.
//!
//! When the metainfo names several trackers, each is tried in order until
//! one returns peers.

use std::net::Ipv4Addr;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::bencode::{self, Value};
use crate::peer::{self, Peer};
use crate::torrent::Torrent;

/// Timeout for one announce round trip.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);

const USER_AGENT: &str = concat!("remora/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("announce request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("tracker reported failure: {0}")]
    Failure(String),
    #[error("could not parse tracker url `{0}`")]
    InvalidUrl(String),
    #[error("malformed tracker response: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Bencode(#[from] bencode::BencodeError),
    #[error("no peers from any tracker")]
    NoPeers,
}

type Result<T> = std::result::Result<T, TrackerError>;

/// Announces to the torrent's trackers in order and returns the first
/// non-empty peer list, deduplicated.
pub fn announce(torrent: &Torrent, peer_id: &[u8; 20], port: u16) -> Result<Vec<Peer>> {
    let mut last_error = None;

    for tracker_url in &torrent.trackers {
        match announce_once(tracker_url, torrent, peer_id, port) {
            Ok(peers) if !peers.is_empty() => {
                info!("tracker {} returned {} peers", tracker_url, peers.len());
                return Ok(dedup(peers));
            }
            Ok(_) => warn!("tracker {} returned no peers", tracker_url),
            Err(e) => {
                warn!("tracker {} failed: {}", tracker_url, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or(TrackerError::NoPeers))
}

fn announce_once(
    announce_url: &str,
    torrent: &Torrent,
    peer_id: &[u8; 20],
    port: u16,
) -> Result<Vec<Peer>> {
    let url = build_announce_url(
        announce_url,
        &torrent.info_hash,
        peer_id,
        port,
        torrent.total_length,
    )?;

    let client = reqwest::blocking::Client::builder()
        .timeout(ANNOUNCE_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()?;

    let response = client.get(&url).send()?.error_for_status()?.bytes()?;

    parse_response(&response)
}

/// Builds the full announce URL. The query string is appended manually so
/// the binary `info_hash` and `peer_id` survive unmangled.
fn build_announce_url(
    announce_url: &str,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    left: u64,
) -> Result<String> {
    let base = Url::parse(announce_url)
        .map_err(|_| TrackerError::InvalidUrl(announce_url.to_owned()))?;

    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1&event=started",
        percent_encode_bytes(info_hash),
        percent_encode_bytes(peer_id),
        port,
        left
    );

    let mut url = base.to_string();
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str(&query);

    Ok(url)
}

/// Percent-encodes arbitrary bytes. Unreserved ASCII passes through,
/// everything else becomes `%XX`.
fn percent_encode_bytes(data: &[u8]) -> String {
    const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";

    let mut encoded = String::with_capacity(data.len() * 3);
    for &byte in data {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push('%');
                encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
                encoded.push(HEX_DIGITS[(byte & 0x0f) as usize] as char);
            }
        }
    }

    encoded
}

/// Decodes the bencoded announce response into a peer list.
fn parse_response(body: &[u8]) -> Result<Vec<Peer>> {
    let decoded = bencode::decode(body)?;
    let root = &decoded.root;
    if root.as_dict().is_none() {
        return Err(TrackerError::Malformed("response is not a dictionary"));
    }

    if let Some(reason) = root.get(b"failure reason") {
        let reason = reason.as_str().unwrap_or("unspecified").to_owned();
        return Err(TrackerError::Failure(reason));
    }

    if let Some(interval) = root.get(b"interval").and_then(Value::as_int) {
        debug!("tracker suggests a {}s announce interval", interval);
    }

    let peers = root
        .get(b"peers")
        .ok_or(TrackerError::Malformed("response has no peers"))?;

    match peers {
        Value::Bytes(blob) => Ok(peer::from_compact(blob)),
        Value::List(entries) => parse_peer_dicts(entries),
        _ => Err(TrackerError::Malformed("peers has an unsupported form")),
    }
}

/// The dictionary-model peer list: a sequence of `{ip, port}` mappings.
/// Entries that are not IPv4 endpoints are skipped.
fn parse_peer_dicts(entries: &[Value]) -> Result<Vec<Peer>> {
    let mut peers = Vec::with_capacity(entries.len());

    for entry in entries {
        let Some(ip) = entry.get(b"ip").and_then(Value::as_str) else {
            return Err(TrackerError::Malformed("peer entry has no ip"));
        };
        let Some(port) = entry.get(b"port").and_then(Value::as_int) else {
            return Err(TrackerError::Malformed("peer entry has no port"));
        };

        let Ok(ip) = ip.parse::<Ipv4Addr>() else {
            debug!("skipping non-IPv4 peer address {}", ip);
            continue;
        };
        let Ok(port) = u16::try_from(port) else {
            return Err(TrackerError::Malformed("peer port out of range"));
        };

        peers.push(Peer { ip, port });
    }

    Ok(peers)
}

fn dedup(peers: Vec<Peer>) -> Vec<Peer> {
    let mut seen = std::collections::HashSet::new();
    peers.into_iter().filter(|p| seen.insert(*p)).collect()
}
