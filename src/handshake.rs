//! # Handshake
//!
//! The handshake is the first exchange on a fresh peer connection, a fixed
//! 68-byte message with no framing:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte, always 19
//! - **pstr**: the protocol identifier `"BitTorrent protocol"`
//! - **reserved**: 8 zero bytes (extension bits, none spoken here)
//! - **info_hash**: 20 bytes identifying the swarm
//! - **peer_id**: 20 bytes identifying the peer
//!
//! A peer answering with a different protocol string or a different
//! info-hash is talking about some other protocol or some other torrent, and
//! the connection is rejected.

use crate::connection::PeerError;

const PROTOCOL_ID: &[u8] = b"BitTorrent protocol";

/// Total size of a serialized handshake: 49 + 19.
pub const HANDSHAKE_LEN: usize = 68;

/// The identifying fields of a handshake. The protocol string and reserved
/// bytes are constant and are supplied during serialization.
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake { info_hash, peer_id }
    }

    /// Serializes the handshake into its 68-byte wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut serialized = Vec::with_capacity(HANDSHAKE_LEN);

        serialized.push(PROTOCOL_ID.len() as u8);
        serialized.extend_from_slice(PROTOCOL_ID);
        serialized.extend_from_slice(&[0; 8]);
        serialized.extend_from_slice(&self.info_hash);
        serialized.extend_from_slice(&self.peer_id);

        serialized
    }

    /// Parses and validates a received handshake.
    ///
    /// Rejects a buffer of the wrong size, a `pstrlen` other than 19, and a
    /// protocol string other than `"BitTorrent protocol"`. The info-hash is
    /// returned as-is; comparing it against our own is the caller's job.
    pub fn deserialize(buf: &[u8]) -> Result<Handshake, PeerError> {
        if buf.len() != HANDSHAKE_LEN {
            return Err(PeerError::Protocol("handshake has the wrong length"));
        }

        if buf[0] as usize != PROTOCOL_ID.len() {
            return Err(PeerError::Protocol("handshake pstrlen is not 19"));
        }
        if &buf[1..20] != PROTOCOL_ID {
            return Err(PeerError::Protocol("handshake protocol string mismatch"));
        }

        // reserved bytes (20..28) are extension bits and are ignored
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Handshake { info_hash, peer_id })
    }
}
