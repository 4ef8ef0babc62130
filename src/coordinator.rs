//! # Piece Coordinator
//!
//! The shared registry that hands out pieces to peer workers and aggregates
//! their progress. Every worker holds a reference to one coordinator; the
//! piece states live behind a single mutex, and the raw ingress byte counter
//! is a lock-free atomic so the hot path of block arrival never contends on
//! the lock.
//!
//! A piece moves through three states. It starts `Missing`, becomes
//! `InProgress` when a worker acquires it, and ends `Have` once it has been
//! verified and written. A failed worker, a choke, or a hash mismatch
//! returns it to `Missing` so another session can claim it. `Have` is final
//! within a session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::bitfield::Bitfield;

/// Minimum interval between throughput samples.
const SAMPLE_INTERVAL_SECS: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Missing,
    InProgress,
    Have,
}

struct Registry {
    states: Vec<PieceState>,
    last_sample: Option<Instant>,
    last_sample_bytes: u64,
    speed_mbps: f64,
}

pub struct PieceCoordinator {
    registry: Mutex<Registry>,
    /// Raw bytes accepted into piece buffers, including bytes later dropped
    /// on a hash mismatch. Measures network ingress, not committed payload.
    downloaded: AtomicU64,
}

impl PieceCoordinator {
    pub fn new(piece_count: usize) -> Self {
        PieceCoordinator {
            registry: Mutex::new(Registry {
                states: vec![PieceState::Missing; piece_count],
                last_sample: None,
                last_sample_bytes: 0,
                speed_mbps: 0.0,
            }),
            downloaded: AtomicU64::new(0),
        }
    }

    /// Assigns the lowest missing piece the peer claims to have, marking it
    /// `InProgress` under the lock so no two sessions can claim the same
    /// piece. Returns `None` when the peer has nothing useful.
    pub fn acquire_next_piece(&self, bitfield: &Bitfield) -> Option<usize> {
        let mut registry = self.registry.lock().unwrap();

        for (index, state) in registry.states.iter_mut().enumerate() {
            if *state == PieceState::Missing && bitfield.has(index) {
                *state = PieceState::InProgress;
                return Some(index);
            }
        }

        None
    }

    /// Records a verified and written piece. Tolerates a piece that is
    /// already `Have`; a completed piece never regresses.
    pub fn mark_completed(&self, index: usize) {
        let mut registry = self.registry.lock().unwrap();
        registry.states[index] = PieceState::Have;
    }

    /// Returns an in-progress piece to the pool. A piece that already
    /// reached `Have` stays there.
    pub fn mark_failed(&self, index: usize) {
        let mut registry = self.registry.lock().unwrap();
        if registry.states[index] == PieceState::InProgress {
            registry.states[index] = PieceState::Missing;
        }
    }

    pub fn add_bytes(&self, n: u64) {
        self.downloaded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn total_downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Fraction of pieces in `Have`, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        let registry = self.registry.lock().unwrap();

        if registry.states.is_empty() {
            return 1.0;
        }
        let have = registry
            .states
            .iter()
            .filter(|&&s| s == PieceState::Have)
            .count();

        have as f64 / registry.states.len() as f64
    }

    pub fn is_complete(&self) -> bool {
        let registry = self.registry.lock().unwrap();
        registry.states.iter().all(|&s| s == PieceState::Have)
    }

    /// Recomputes the download speed over the interval since the previous
    /// sample. Calls closer together than half a second are ignored so the
    /// reading stays stable.
    pub fn sample_throughput(&self) {
        let now = Instant::now();
        let current_bytes = self.total_downloaded();

        let mut registry = self.registry.lock().unwrap();

        let Some(last) = registry.last_sample else {
            registry.last_sample = Some(now);
            registry.last_sample_bytes = current_bytes;
            return;
        };

        let elapsed = now.duration_since(last).as_secs_f64();
        if elapsed < SAMPLE_INTERVAL_SECS {
            return;
        }

        let delta = (current_bytes - registry.last_sample_bytes) as f64;
        registry.speed_mbps = delta / (1024.0 * 1024.0) / elapsed;
        registry.last_sample = Some(now);
        registry.last_sample_bytes = current_bytes;
    }

    /// The most recent sampled speed in MB/s.
    pub fn speed_mbps(&self) -> f64 {
        self.registry.lock().unwrap().speed_mbps
    }
}
