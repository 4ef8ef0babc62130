//! # Remora BitTorrent Client
//!
//! A leeching command-line BitTorrent client written in Rust.
//!
//! ## Usage
//!
//! ```bash
//! remora <torrent_file> <output_dir>
//! ```
//!
//! ## Architecture
//!
//! The client follows a multi-threaded architecture:
//!
//! - **Main thread**: Parses the metainfo, announces to the tracker, spawns
//!   a worker per peer, and renders progress until the download completes
//! - **Worker threads**: Each drives the wire protocol with one peer
//! - **Shared state**: A piece coordinator hands out work and aggregates
//!   progress; a file writer places verified pieces into the output files
//!
//! A piece is written to disk only after its SHA-1 digest matches the
//! metainfo, so an interrupted run never leaves corrupt payload behind,
//! only missing pieces.

#[macro_use]
extern crate log;

mod bencode;
mod bitfield;
mod connection;
mod coordinator;
mod handshake;
mod message;
mod peer;
mod storage;
mod torrent;
mod tracker;
mod worker;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;

use coordinator::PieceCoordinator;
use storage::FileWriter;
use torrent::Torrent;
use worker::Worker;

/// Port reported to the tracker. Nothing listens on it; this client only
/// makes outbound connections.
const PORT: u16 = 6881;

/// Refresh cadence for the progress display and throughput sampler.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A leeching command-line BitTorrent client, written in Rust."
)]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Directory where the payload is written
    output: PathBuf,
}

/// A fresh Azureus-style peer id: client prefix plus random digits.
fn generate_peer_id() -> [u8; 20] {
    const PREFIX: &[u8; 8] = b"-RM0100-";

    let mut peer_id = [0u8; 20];
    peer_id[..PREFIX.len()].copy_from_slice(PREFIX);

    let mut rng = rand::thread_rng();
    for byte in peer_id[PREFIX.len()..].iter_mut() {
        *byte = rng.gen_range(b'0'..=b'9');
    }

    peer_id
}

fn run(args: Args) -> Result<()> {
    println!("Parsing {:?}", args.torrent);
    let buf = fs::read(&args.torrent)
        .map_err(|e| anyhow!("could not read torrent file {:?}: {}", args.torrent, e))?;
    let torrent = Arc::new(Torrent::from_bytes(&buf)?);

    println!("Contacting tracker {}", torrent.trackers[0]);
    let peer_id = generate_peer_id();
    let peers = tracker::announce(&torrent, &peer_id, PORT)?;
    println!("Found {} peers", peers.len());

    let writer = Arc::new(FileWriter::new(&torrent.files, &args.output)?);
    let coordinator = Arc::new(PieceCoordinator::new(torrent.piece_count()));

    println!(
        "Downloading {:?} ({} pieces)",
        torrent.name,
        torrent.piece_count()
    );

    let mut handles = Vec::with_capacity(peers.len());
    for peer in peers {
        let worker = Worker::new(
            peer,
            peer_id,
            Arc::clone(&torrent),
            Arc::clone(&coordinator),
            Arc::clone(&writer),
        );
        handles.push(thread::spawn(move || worker.run()));
    }

    // Render progress until every piece is in, or every session has died
    // with pieces still missing.
    let pb = ProgressBar::new(torrent.total_length);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );

    while !coordinator.is_complete() {
        thread::sleep(PROGRESS_INTERVAL);
        coordinator.sample_throughput();

        pb.set_position((coordinator.progress() * torrent.total_length as f64) as u64);
        pb.set_message(format!("{:.2} MB/s", coordinator.speed_mbps()));

        if handles.iter().all(|handle| handle.is_finished()) && !coordinator.is_complete() {
            pb.abandon();
            return Err(anyhow!(
                "all peer connections ended before the download completed"
            ));
        }
    }

    // Workers observe completion and wind down; the writer is flushed only
    // after the last one is gone.
    for handle in handles {
        let _ = handle.join();
    }
    writer.sync()?;

    pb.finish_with_message("done");
    println!("Saved in {:?}.", args.output);

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }

    // Exit success
    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_peer_id() {
        let peer_id = generate_peer_id();

        assert_eq!(&peer_id[..8], b"-RM0100-");
        assert!(peer_id[8..].iter().all(u8::is_ascii_digit));
    }
}
