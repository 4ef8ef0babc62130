//! # Peer Connection Plumbing
//!
//! Blocking TCP transport for one peer: connect with a deadline, exchange
//! handshakes, then read and write framed messages. Protocol state (what the
//! messages mean, which piece is in flight) lives in the worker; this module
//! only moves validated bytes.
//!
//! Timeouts are staged. The connect and handshake run under a short 5 second
//! deadline so that dead peers are discarded quickly. Once a session is
//! established the read and write timeouts are relaxed to 30 seconds, enough
//! to ride out slow peers without letting a stalled one pin its worker
//! forever.

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt};
use thiserror::Error;

use crate::handshake::{Handshake, HANDSHAKE_LEN};
use crate::message::{self, Message, MESSAGE_KEEPALIVE};
use crate::peer::Peer;

/// Deadline for connecting and for the handshake round trip.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Read/write deadline for an established session.
const SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on an incoming frame. The largest legitimate messages are a
/// piece frame (9 bytes of header plus a 16 KiB block) and the bitfield of a
/// very large torrent; anything past this is a corrupt or hostile length
/// prefix.
const MAX_MESSAGE_LEN: usize = (1 << 20) + 9;

/// How a peer session can fail.
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("peer i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("peer protocol violation: {0}")]
    Protocol(&'static str),
}

impl PeerError {
    /// True when the error is a read or write deadline expiring rather than
    /// a broken connection.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            PeerError::Io(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        )
    }
}

/// An established TCP connection to one peer.
pub struct PeerConnection {
    peer: Peer,
    stream: TcpStream,
}

impl PeerConnection {
    /// Connects to `peer` under the handshake deadline.
    pub fn connect(peer: Peer) -> Result<PeerConnection, PeerError> {
        let addr = SocketAddr::new(IpAddr::V4(peer.ip), peer.port);
        let stream = TcpStream::connect_timeout(&addr, HANDSHAKE_TIMEOUT)?;

        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        stream.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;

        debug!("peer {}: connected", peer);
        Ok(PeerConnection { peer, stream })
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Sends our handshake, reads the peer's, and verifies that it is for
    /// the same torrent. On success the session timeouts take effect.
    pub fn handshake(
        &mut self,
        info_hash: &[u8; 20],
        peer_id: &[u8; 20],
    ) -> Result<(), PeerError> {
        let ours = Handshake::new(*info_hash, *peer_id);
        self.stream.write_all(&ours.serialize())?;

        let mut buf = [0u8; HANDSHAKE_LEN];
        self.stream.read_exact(&mut buf)?;

        let theirs = Handshake::deserialize(&buf)?;
        if theirs.info_hash != *info_hash {
            return Err(PeerError::Protocol("handshake info hash mismatch"));
        }

        self.stream.set_read_timeout(Some(SESSION_TIMEOUT))?;
        self.stream.set_write_timeout(Some(SESSION_TIMEOUT))?;

        Ok(())
    }

    /// Reads one framed message. A zero length prefix comes back as a
    /// keep-alive message with no payload.
    pub fn read_message(&mut self) -> Result<Message, PeerError> {
        let message_len = self.stream.read_u32::<BigEndian>()? as usize;

        if message_len == 0 {
            return Ok(Message::new(MESSAGE_KEEPALIVE));
        }
        if message_len > MAX_MESSAGE_LEN {
            return Err(PeerError::Protocol("message length out of range"));
        }

        let mut buf = vec![0u8; message_len];
        self.stream.read_exact(&mut buf)?;

        message::deserialize_message(&buf)
    }

    pub fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        self.stream.write_all(&message.serialize())?;
        Ok(())
    }

    pub fn send_interested(&mut self) -> Result<(), PeerError> {
        debug!("peer {}: sending INTERESTED", self.peer);
        self.send(&Message::new(message::MESSAGE_INTERESTED))
    }

    pub fn send_request(
        &mut self,
        index: u32,
        begin: u32,
        length: u32,
    ) -> Result<(), PeerError> {
        self.send(&Message::request(index, begin, length))
    }
}
