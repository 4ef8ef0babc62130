//! # Peer Endpoints
//!
//! Peers are discovered through the tracker, which usually returns them in
//! the compact binary format: 6 bytes per peer, a 4-byte IPv4 address
//! followed by a 2-byte port, both in network byte order.

use std::fmt;
use std::io::Cursor;
use std::net::Ipv4Addr;

use byteorder::{BigEndian, ReadBytesExt};

/// Number of bytes one peer occupies in a compact peer list.
const COMPACT_PEER_SIZE: usize = 6;

/// A remote peer endpoint in the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parses a compact peer list.
///
/// A blob whose length is not a multiple of 6 is tolerated: the ragged tail
/// is dropped with a warning and the full entries are kept.
pub fn from_compact(blob: &[u8]) -> Vec<Peer> {
    if !blob.len().is_multiple_of(COMPACT_PEER_SIZE) {
        warn!(
            "compact peer list has {} stray trailing bytes, truncating",
            blob.len() % COMPACT_PEER_SIZE
        );
    }

    let mut peers = Vec::with_capacity(blob.len() / COMPACT_PEER_SIZE);
    for chunk in blob.chunks_exact(COMPACT_PEER_SIZE) {
        let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);

        let mut port_cursor = Cursor::new(&chunk[4..6]);
        // reading two bytes from a two-byte cursor cannot fail
        let port = port_cursor.read_u16::<BigEndian>().unwrap_or(0);

        peers.push(Peer { ip, port });
    }

    peers
}
