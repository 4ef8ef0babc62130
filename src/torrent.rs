//! # Torrent Metadata
//!
//! Projects a decoded metainfo tree into a strongly typed descriptor.
//!
//! A metainfo file is a bencoded dictionary:
//!
//! - **announce** / **announce-list**: tracker URLs for peer discovery
//! - **info.name**: suggested file or directory name
//! - **info.piece length**: size of each piece (the last may be shorter)
//! - **info.pieces**: concatenated 20-byte SHA-1 digests, one per piece
//! - **info.length** (single-file) or **info.files** (multi-file)
//!
//! The descriptor also carries the info-hash, the SHA-1 over the exact bytes
//! of the `info` value as they appear in the metainfo, which identifies the
//! swarm to trackers and peers.
//!
//! ## File layout
//!
//! Files are laid out contiguously in the virtual payload stream, starting
//! at offset 0. Each entry carries its global `[start_offset, end_offset)`
//! range, computed by a left-to-right cumulative sum, so the writer can map
//! a global byte position to a file and an offset within it. Multi-file
//! paths are flattened from their components under the output directory.

use std::path::PathBuf;

use boring::sha::Sha1;
use thiserror::Error;

use crate::bencode::{self, Value};

/// Size of a SHA-1 digest in bytes.
const SHA1_HASH_SIZE: usize = 20;

#[derive(Error, Debug)]
pub enum MetainfoError {
    #[error(transparent)]
    Bencode(#[from] bencode::BencodeError),
    #[error("metainfo is missing the `{0}` field")]
    MissingField(&'static str),
    #[error("metainfo field `{0}` has the wrong type")]
    WrongType(&'static str),
    #[error("metainfo has an empty file list")]
    EmptyFileList,
    #[error("metainfo contains an unsafe file path")]
    UnsafePath,
    #[error("piece length is not positive")]
    PieceLengthNonPositive,
    #[error("pieces is not a multiple of twenty bytes")]
    PiecesNotMultipleOfTwenty,
    #[error("piece count does not match the total length")]
    PieceCountMismatch,
}

type Result<T> = std::result::Result<T, MetainfoError>;

/// One file of the payload and its place in the virtual byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the output directory, built from validated
    /// components.
    pub path: PathBuf,
    pub length: u64,
    pub start_offset: u64,
    /// Always `start_offset + length`.
    pub end_offset: u64,
}

/// Everything the download engine needs to know about one torrent.
#[derive(Debug, Clone)]
pub struct Torrent {
    /// Tracker URLs in announce order, deduplicated. Never empty.
    pub trackers: Vec<String>,
    /// SHA-1 of the raw `info` value.
    pub info_hash: [u8; 20],
    /// Expected digest of each piece.
    pub pieces: Vec<[u8; 20]>,
    /// Nominal piece size; the final piece may fall short of it.
    pub piece_length: u64,
    /// Suggested name from the metainfo.
    pub name: String,
    /// Payload layout. Never empty.
    pub files: Vec<FileEntry>,
    /// Sum of all file lengths.
    pub total_length: u64,
}

impl Torrent {
    /// Parses a metainfo buffer into a descriptor.
    pub fn from_bytes(buf: &[u8]) -> Result<Torrent> {
        let decoded = bencode::decode(buf)?;
        let root = &decoded.root;
        if root.as_dict().is_none() {
            return Err(MetainfoError::WrongType("root"));
        }

        let trackers = parse_trackers(root)?;

        let info = root
            .get(b"info")
            .ok_or(MetainfoError::MissingField("info"))?;
        if info.as_dict().is_none() {
            return Err(MetainfoError::WrongType("info"));
        }
        let info_raw = decoded
            .info_raw
            .ok_or(MetainfoError::MissingField("info"))?;

        let mut hasher = Sha1::new();
        hasher.update(info_raw);
        let info_hash = hasher.finish();

        let name = info
            .get(b"name")
            .ok_or(MetainfoError::MissingField("name"))?
            .as_str()
            .ok_or(MetainfoError::WrongType("name"))?
            .to_owned();

        let piece_length = info
            .get(b"piece length")
            .ok_or(MetainfoError::MissingField("piece length"))?
            .as_int()
            .ok_or(MetainfoError::WrongType("piece length"))?;
        if piece_length <= 0 {
            return Err(MetainfoError::PieceLengthNonPositive);
        }
        let piece_length = piece_length as u64;

        let pieces = split_piece_hashes(
            info.get(b"pieces")
                .ok_or(MetainfoError::MissingField("pieces"))?
                .as_bytes()
                .ok_or(MetainfoError::WrongType("pieces"))?,
        )?;

        let files = match info.get(b"files") {
            Some(files) => parse_multi_file(files)?,
            None => parse_single_file(info, &name)?,
        };
        let total_length = files.last().map(|f| f.end_offset).unwrap_or(0);

        if total_length.div_ceil(piece_length) != pieces.len() as u64 {
            return Err(MetainfoError::PieceCountMismatch);
        }

        Ok(Torrent {
            trackers,
            info_hash,
            pieces,
            piece_length,
            name,
            files,
            total_length,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece_hash(&self, index: usize) -> &[u8; 20] {
        &self.pieces[index]
    }

    /// Global byte offset where piece `index` begins.
    pub fn piece_offset(&self, index: usize) -> u64 {
        index as u64 * self.piece_length
    }

    /// The true length of piece `index`: the nominal piece length clamped by
    /// the end of the payload, so the final piece comes out shorter.
    pub fn piece_length_at(&self, index: usize) -> u64 {
        let begin = self.piece_offset(index);
        let end = (begin + self.piece_length).min(self.total_length);
        end - begin
    }
}

/// Collects tracker URLs: the `announce-list` tiers flattened in order when
/// present, the plain `announce` URL otherwise.
fn parse_trackers(root: &Value) -> Result<Vec<String>> {
    let mut trackers: Vec<String> = Vec::new();

    if let Some(tiers) = root.get(b"announce-list") {
        let tiers = tiers
            .as_list()
            .ok_or(MetainfoError::WrongType("announce-list"))?;
        for tier in tiers {
            let tier = tier
                .as_list()
                .ok_or(MetainfoError::WrongType("announce-list"))?;
            for url in tier {
                let url = url
                    .as_str()
                    .ok_or(MetainfoError::WrongType("announce-list"))?;
                if !trackers.iter().any(|t| t == url) {
                    trackers.push(url.to_owned());
                }
            }
        }
    }

    if trackers.is_empty() {
        let announce = root
            .get(b"announce")
            .ok_or(MetainfoError::MissingField("announce"))?
            .as_str()
            .ok_or(MetainfoError::WrongType("announce"))?;
        trackers.push(announce.to_owned());
    }

    Ok(trackers)
}

fn split_piece_hashes(pieces: &[u8]) -> Result<Vec<[u8; 20]>> {
    if !pieces.len().is_multiple_of(SHA1_HASH_SIZE) {
        return Err(MetainfoError::PiecesNotMultipleOfTwenty);
    }

    Ok(pieces
        .chunks_exact(SHA1_HASH_SIZE)
        .map(|chunk| {
            let mut hash = [0u8; SHA1_HASH_SIZE];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

/// A path component the metainfo may not supply: empty, the current or
/// parent directory, or anything containing a separator.
fn validate_component(component: &str) -> Result<()> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('/')
        || component.contains('\\')
    {
        return Err(MetainfoError::UnsafePath);
    }
    Ok(())
}

fn parse_single_file(info: &Value, name: &str) -> Result<Vec<FileEntry>> {
    let length = info
        .get(b"length")
        .ok_or(MetainfoError::MissingField("length"))?
        .as_int()
        .ok_or(MetainfoError::WrongType("length"))?;
    if length < 0 {
        return Err(MetainfoError::WrongType("length"));
    }
    let length = length as u64;

    validate_component(name)?;

    Ok(vec![FileEntry {
        path: PathBuf::from(name),
        length,
        start_offset: 0,
        end_offset: length,
    }])
}

fn parse_multi_file(files: &Value) -> Result<Vec<FileEntry>> {
    let files = files.as_list().ok_or(MetainfoError::WrongType("files"))?;
    if files.is_empty() {
        return Err(MetainfoError::EmptyFileList);
    }

    let mut entries = Vec::with_capacity(files.len());
    let mut offset = 0u64;

    for file in files {
        let length = file
            .get(b"length")
            .ok_or(MetainfoError::MissingField("length"))?
            .as_int()
            .ok_or(MetainfoError::WrongType("length"))?;
        if length < 0 {
            return Err(MetainfoError::WrongType("length"));
        }
        let length = length as u64;

        let components = file
            .get(b"path")
            .ok_or(MetainfoError::MissingField("path"))?
            .as_list()
            .ok_or(MetainfoError::WrongType("path"))?;
        if components.is_empty() {
            return Err(MetainfoError::UnsafePath);
        }

        let mut path = PathBuf::new();
        for component in components {
            let component = component
                .as_str()
                .ok_or(MetainfoError::WrongType("path"))?;
            validate_component(component)?;
            path.push(component);
        }

        entries.push(FileEntry {
            path,
            length,
            start_offset: offset,
            end_offset: offset + length,
        });
        offset += length;
    }

    Ok(entries)
}
