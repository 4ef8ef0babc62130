//! # Peer Worker
//!
//! One worker per peer, each on its own thread. A worker owns its TCP
//! connection, its piece buffer, and all per-session state exclusively; the
//! only shared objects it touches are the piece coordinator (to acquire and
//! settle pieces) and the file writer (to persist verified data).
//!
//! ## Session lifecycle
//!
//! 1. Connect and handshake, then declare interest.
//! 2. Read messages until the peer unchokes us.
//! 3. Acquire the lowest missing piece the peer has, request its blocks
//!    with up to [`PIPELINE_DEPTH`] outstanding at once, and assemble the
//!    responses into the piece buffer at their declared offsets. Blocks may
//!    arrive in any order.
//! 4. When the buffer holds the piece's nominal length, verify its SHA-1
//!    against the metainfo digest. A match is written out and marked
//!    complete; a mismatch drops the buffer and requeues the piece without
//!    giving up the connection.
//! 5. Repeat from 3 until no work is left.
//!
//! ## Failure semantics
//!
//! Socket errors and protocol violations end the session; a choke or a hash
//! mismatch does not. Whatever piece was in progress goes back to the pool
//! in every case, so another session can finish it. Workers do not retry
//! their peer: a session that ends stays ended.

use std::io;
use std::sync::Arc;

use boring::sha::Sha1;

use crate::bitfield::Bitfield;
use crate::connection::{PeerConnection, PeerError};
use crate::coordinator::PieceCoordinator;
use crate::message::{
    Message, MESSAGE_BITFIELD, MESSAGE_CHOKE, MESSAGE_HAVE, MESSAGE_KEEPALIVE, MESSAGE_PIECE,
    MESSAGE_UNCHOKE,
};
use crate::peer::Peer;
use crate::storage::FileWriter;
use crate::torrent::Torrent;

/// Maximum number of outstanding block requests per peer.
const PIPELINE_DEPTH: u32 = 64;

/// Nominal block size (16 KiB); the final block of a piece may be smaller.
const BLOCK_SIZE: u32 = 16 * 1024;

/// Downloads pieces from a single peer until the torrent completes or the
/// session dies.
pub struct Worker {
    peer: Peer,
    peer_id: [u8; 20],
    torrent: Arc<Torrent>,
    coordinator: Arc<PieceCoordinator>,
    writer: Arc<FileWriter>,
}

#[derive(PartialEq, Eq)]
enum Stage {
    Idle,
    Downloading,
}

/// Per-connection download state, owned exclusively by its worker thread.
struct Session<'a> {
    conn: PeerConnection,
    torrent: &'a Torrent,
    coordinator: &'a PieceCoordinator,
    writer: &'a FileWriter,
    bitfield: Bitfield,
    choked: bool,
    stage: Stage,
    current_piece: Option<usize>,
    /// Next offset within the current piece to request.
    current_offset: u64,
    in_flight: u32,
    downloaded_in_piece: u64,
    /// Assembly buffer, sized for a full piece; shorter pieces use a prefix.
    piece_buffer: Vec<u8>,
}

impl Worker {
    pub fn new(
        peer: Peer,
        peer_id: [u8; 20],
        torrent: Arc<Torrent>,
        coordinator: Arc<PieceCoordinator>,
        writer: Arc<FileWriter>,
    ) -> Worker {
        Worker {
            peer,
            peer_id,
            torrent,
            coordinator,
            writer,
        }
    }

    /// Runs the session to completion. Errors end this worker only; the
    /// swarm-level outcome is whatever the coordinator says.
    pub fn run(&self) {
        match self.session() {
            Ok(()) => debug!("peer {}: session finished", self.peer),
            Err(e) => debug!("peer {}: session ended: {}", self.peer, e),
        }
    }

    fn session(&self) -> Result<(), PeerError> {
        let mut conn = PeerConnection::connect(self.peer)?;
        conn.handshake(&self.torrent.info_hash, &self.peer_id)?;
        info!("peer {}: handshake ok", self.peer);

        conn.send_interested()?;

        let mut session = Session {
            conn,
            torrent: &self.torrent,
            coordinator: &self.coordinator,
            writer: &self.writer,
            bitfield: Bitfield::new(),
            choked: true,
            stage: Stage::Idle,
            current_piece: None,
            current_offset: 0,
            in_flight: 0,
            downloaded_in_piece: 0,
            piece_buffer: vec![0; self.torrent.piece_length as usize],
        };

        session.run()
    }
}

impl Session<'_> {
    fn run(&mut self) -> Result<(), PeerError> {
        let result = self.message_loop();

        // whatever happened, never keep a piece assigned to a dead session
        if result.is_err() {
            if let Some(index) = self.current_piece {
                self.coordinator.mark_failed(index);
            }
        }

        result
    }

    fn message_loop(&mut self) -> Result<(), PeerError> {
        loop {
            if self.coordinator.is_complete() {
                return Ok(());
            }

            let message = match self.conn.read_message() {
                Ok(message) => message,
                Err(e) if e.is_timeout() => {
                    if self.stage == Stage::Downloading {
                        // requests are outstanding and nothing came back
                        return Err(e);
                    }
                    // idle lull; see whether work appeared in the meantime
                    self.try_acquire();
                    self.fill_pipeline()?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match message.id {
                MESSAGE_KEEPALIVE => {
                    debug!("peer {}: keep-alive", self.conn.peer());
                }
                MESSAGE_CHOKE => self.handle_choke(),
                MESSAGE_UNCHOKE => {
                    debug!("peer {}: unchoked us", self.conn.peer());
                    self.choked = false;
                    self.try_acquire();
                    self.fill_pipeline()?;
                }
                MESSAGE_BITFIELD => {
                    self.bitfield = Bitfield::from_bytes(&message.payload);
                    debug!(
                        "peer {}: bitfield covers {} slots",
                        self.conn.peer(),
                        self.bitfield.len()
                    );
                    self.try_acquire();
                    self.fill_pipeline()?;
                }
                MESSAGE_HAVE => {
                    let index = message.parse_have()?;
                    self.bitfield.set(index as usize);
                    self.try_acquire();
                    self.fill_pipeline()?;
                }
                MESSAGE_PIECE => self.handle_piece(&message)?,
                id => {
                    // includes ids we never act on as a pure leecher; the
                    // payload was already consumed, so skipping is free
                    debug!("peer {}: ignoring message id {}", self.conn.peer(), id);
                }
            }
        }
    }

    fn handle_choke(&mut self) {
        info!("peer {}: choked us", self.conn.peer());
        self.choked = true;

        if let Some(index) = self.current_piece {
            self.coordinator.mark_failed(index);
        }
        self.reset_piece_state();
    }

    /// Copies one block into the assembly buffer and, when the piece is
    /// complete, verifies and settles it.
    fn handle_piece(&mut self, message: &Message) -> Result<(), PeerError> {
        let (index, begin, block) = message.parse_piece()?;

        let Some(current) = self.current_piece else {
            return Err(PeerError::Protocol("block while no piece is in progress"));
        };
        if index as usize != current {
            return Err(PeerError::Protocol("block for a piece we did not request"));
        }

        let nominal = self.torrent.piece_length_at(current);
        let begin = u64::from(begin);
        let n = block.len() as u64;
        if begin + n > nominal {
            return Err(PeerError::Protocol("block past the end of the piece"));
        }

        self.piece_buffer[begin as usize..(begin + n) as usize].copy_from_slice(block);
        self.in_flight = self.in_flight.saturating_sub(1);
        self.downloaded_in_piece += n;
        self.coordinator.add_bytes(n);

        if self.downloaded_in_piece >= nominal {
            self.finish_piece(current, nominal)?;
            self.try_acquire();
        }

        self.fill_pipeline()
    }

    /// Verifies the assembled piece and either commits it or requeues it.
    /// Only a disk failure ends the session here; a bad hash costs just the
    /// piece.
    fn finish_piece(&mut self, index: usize, nominal: u64) -> Result<(), PeerError> {
        let data = &self.piece_buffer[..nominal as usize];

        let mut hasher = Sha1::new();
        hasher.update(data);
        let digest = hasher.finish();

        if digest == *self.torrent.piece_hash(index) {
            match self.writer.write(self.torrent.piece_offset(index), data) {
                Ok(()) => {
                    self.coordinator.mark_completed(index);
                    info!(
                        "piece {} verified and written ({} bytes)",
                        index, nominal
                    );
                }
                Err(e) => {
                    error!("piece {}: {}", index, e);
                    self.coordinator.mark_failed(index);
                    self.reset_piece_state();
                    return Err(PeerError::Io(io::Error::other(e)));
                }
            }
        } else {
            warn!(
                "piece {}: hash mismatch, dropping {} bytes",
                index, nominal
            );
            self.coordinator.mark_failed(index);
        }

        self.reset_piece_state();
        Ok(())
    }

    fn reset_piece_state(&mut self) {
        self.stage = Stage::Idle;
        self.current_piece = None;
        self.current_offset = 0;
        self.in_flight = 0;
        self.downloaded_in_piece = 0;
    }

    /// Claims the next piece this peer can serve, if the session is idle
    /// and unchoked.
    fn try_acquire(&mut self) {
        if self.stage == Stage::Downloading || self.choked {
            return;
        }

        if let Some(index) = self.coordinator.acquire_next_piece(&self.bitfield) {
            self.stage = Stage::Downloading;
            self.current_piece = Some(index);
            self.current_offset = 0;
            self.in_flight = 0;
            self.downloaded_in_piece = 0;
            self.piece_buffer.fill(0);
            debug!("peer {}: assigned piece {}", self.conn.peer(), index);
        }
    }

    /// Tops the request pipeline back up to its target depth.
    fn fill_pipeline(&mut self) -> Result<(), PeerError> {
        if self.choked {
            return Ok(());
        }
        let Some(index) = self.current_piece else {
            return Ok(());
        };

        let nominal = self.torrent.piece_length_at(index);
        while self.in_flight < PIPELINE_DEPTH && self.current_offset < nominal {
            let length = u64::from(BLOCK_SIZE).min(nominal - self.current_offset) as u32;

            self.conn
                .send_request(index as u32, self.current_offset as u32, length)?;
            self.current_offset += u64::from(length);
            self.in_flight += 1;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::FileEntry;
    use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
    use std::fs;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpListener, TcpStream};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    const TEST_PIECE_LENGTH: u64 = 32 * 1024;

    static TEST_DIR_SEQ: AtomicU32 = AtomicU32::new(0);

    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "remora-worker-{}-{}-{}",
            tag,
            std::process::id(),
            TEST_DIR_SEQ.fetch_add(1, Ordering::Relaxed),
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sha1(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finish()
    }

    /// A deterministic payload of one full piece plus a shorter final piece.
    fn test_payload() -> Vec<u8> {
        let total = TEST_PIECE_LENGTH as usize + 20_000;
        (0..total).map(|i| (i % 251) as u8).collect()
    }

    fn test_torrent(payload: &[u8]) -> Torrent {
        let pieces: Vec<[u8; 20]> = payload
            .chunks(TEST_PIECE_LENGTH as usize)
            .map(sha1)
            .collect();
        let total = payload.len() as u64;

        Torrent {
            trackers: vec!["http://unused.invalid/announce".to_owned()],
            info_hash: [0xab; 20],
            pieces,
            piece_length: TEST_PIECE_LENGTH,
            name: "payload.bin".to_owned(),
            files: vec![FileEntry {
                path: PathBuf::from("payload.bin"),
                length: total,
                start_offset: 0,
                end_offset: total,
            }],
            total_length: total,
        }
    }

    /// What the scripted remote peer should do besides serving blocks.
    #[derive(Default)]
    struct PeerScript {
        /// Serve a corrupted first block once, forcing one hash mismatch.
        corrupt_first_block: bool,
        /// Choke right after the first request batch, then unchoke.
        choke_after_first_request: bool,
    }

    fn write_message(stream: &mut TcpStream, id: u8, payload: &[u8]) {
        stream
            .write_u32::<BigEndian>(1 + payload.len() as u32)
            .unwrap();
        stream.write_all(&[id]).unwrap();
        stream.write_all(payload).unwrap();
    }

    /// Reads one framed message, returning `(id, payload)`.
    fn read_peer_message(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let len = stream.read_u32::<BigEndian>().ok()? as usize;
        if len == 0 {
            return Some((MESSAGE_KEEPALIVE, vec![]));
        }
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).ok()?;
        Some((buf[0], buf[1..].to_vec()))
    }

    /// Serves one downloader connection the way a remote seeder would:
    /// handshake, full bitfield, unchoke, then block responses. Requests are
    /// answered in reversed pairs so blocks arrive out of order.
    fn serve_scripted_peer(
        listener: TcpListener,
        payload: Vec<u8>,
        piece_count: usize,
        script: PeerScript,
    ) {
        let (mut stream, _) = listener.accept().unwrap();

        // handshake exchange
        let mut handshake = [0u8; 68];
        stream.read_exact(&mut handshake).unwrap();
        assert_eq!(handshake[0], 19);
        assert_eq!(&handshake[1..20], b"BitTorrent protocol");

        let mut reply = Vec::with_capacity(68);
        reply.push(19);
        reply.extend_from_slice(b"BitTorrent protocol");
        reply.extend_from_slice(&[0u8; 8]);
        reply.extend_from_slice(&handshake[28..48]); // echo the info hash
        reply.extend_from_slice(&[b's'; 20]);
        stream.write_all(&reply).unwrap();

        // the downloader declares interest first
        let (id, _) = read_peer_message(&mut stream).unwrap();
        assert_eq!(id, crate::message::MESSAGE_INTERESTED);

        // advertise every piece, then open the tap
        let bitfield_bytes = vec![0xffu8; piece_count.div_ceil(8)];
        write_message(&mut stream, MESSAGE_BITFIELD, &bitfield_bytes);

        write_message(&mut stream, MESSAGE_UNCHOKE, &[]);

        if script.choke_after_first_request {
            // yank the session back after its first request batch, then
            // resume; the downloader must requeue the piece and start over
            let (id, _) = read_peer_message(&mut stream).unwrap();
            assert_eq!(id, crate::message::MESSAGE_REQUEST);
            write_message(&mut stream, MESSAGE_CHOKE, &[]);

            // the second request of the batch is already in flight; drain
            // it so the post-choke requests pair up cleanly below
            let (id, _) = read_peer_message(&mut stream).unwrap();
            assert_eq!(id, crate::message::MESSAGE_REQUEST);
            write_message(&mut stream, MESSAGE_UNCHOKE, &[]);
        }

        let mut corrupt_pending = script.corrupt_first_block;
        let mut pending: Vec<(u32, u32, u32)> = Vec::new();

        while let Some((id, req)) = read_peer_message(&mut stream) {
            if id != crate::message::MESSAGE_REQUEST {
                continue;
            }

            let mut cursor = std::io::Cursor::new(&req);
            let index = cursor.read_u32::<BigEndian>().unwrap();
            let begin = cursor.read_u32::<BigEndian>().unwrap();
            let length = cursor.read_u32::<BigEndian>().unwrap();
            pending.push((index, begin, length));

            // answer in reversed pairs to exercise out-of-order assembly
            if pending.len() == 2 {
                for &(index, begin, length) in pending.iter().rev() {
                    let offset = index as usize * TEST_PIECE_LENGTH as usize + begin as usize;
                    let mut block = payload[offset..offset + length as usize].to_vec();
                    if corrupt_pending {
                        block[0] ^= 0xff;
                        corrupt_pending = false;
                    }

                    let mut piece_payload = Vec::with_capacity(8 + block.len());
                    piece_payload.write_u32::<BigEndian>(index).unwrap();
                    piece_payload.write_u32::<BigEndian>(begin).unwrap();
                    piece_payload.extend_from_slice(&block);
                    write_message(&mut stream, MESSAGE_PIECE, &piece_payload);
                }
                pending.clear();
            }
        }
    }

    fn run_download(script: PeerScript) -> (Arc<PieceCoordinator>, PathBuf, Vec<u8>) {
        let payload = test_payload();
        let torrent = Arc::new(test_torrent(&payload));

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let root = temp_root("download");
        let writer = Arc::new(FileWriter::new(&torrent.files, &root).unwrap());
        let coordinator = Arc::new(PieceCoordinator::new(torrent.piece_count()));

        let piece_count = torrent.piece_count();
        let serve_payload = payload.clone();
        let peer_thread =
            thread::spawn(move || serve_scripted_peer(listener, serve_payload, piece_count, script));

        let worker = Worker::new(
            Peer {
                ip: Ipv4Addr::LOCALHOST,
                port,
            },
            *b"-RM0100-000000000000",
            Arc::clone(&torrent),
            Arc::clone(&coordinator),
            Arc::clone(&writer),
        );
        worker.run();

        peer_thread.join().unwrap();
        writer.sync().unwrap();

        (coordinator, root, payload)
    }

    #[test]
    fn test_download_with_out_of_order_blocks() {
        let (coordinator, root, payload) = run_download(PeerScript::default());

        assert!(coordinator.is_complete());
        assert_eq!(coordinator.progress(), 1.0);
        assert_eq!(coordinator.total_downloaded(), payload.len() as u64);

        assert_eq!(fs::read(root.join("payload.bin")).unwrap(), payload);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_hash_mismatch_requeues_on_the_same_connection() {
        let (coordinator, root, payload) = run_download(PeerScript {
            corrupt_first_block: true,
            ..Default::default()
        });

        // the corrupted attempt was dropped and re-downloaded over the same
        // session, so ingress exceeds the payload by one full piece
        assert!(coordinator.is_complete());
        assert_eq!(
            coordinator.total_downloaded(),
            payload.len() as u64 + TEST_PIECE_LENGTH
        );

        assert_eq!(fs::read(root.join("payload.bin")).unwrap(), payload);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_choke_requeues_and_unchoke_resumes() {
        let (coordinator, root, payload) = run_download(PeerScript {
            choke_after_first_request: true,
            ..Default::default()
        });

        assert!(coordinator.is_complete());
        assert_eq!(fs::read(root.join("payload.bin")).unwrap(), payload);
        fs::remove_dir_all(&root).unwrap();
    }
}
