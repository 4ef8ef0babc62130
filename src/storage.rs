//! # Output File Writing
//!
//! A torrent's payload is one contiguous byte stream, but on disk it may
//! span several files. The writer owns the whole layout: it creates the
//! directories and opens every file up front, and `write` splits a verified
//! piece buffer across the file segments its global byte range covers.
//!
//! Writes are positional (`pwrite` semantics), so file cursors are never
//! shared state; one mutex serializes `write` calls against each other and
//! that is the writer's entire locking story. Pieces occupy disjoint byte
//! ranges, so concurrent workers cannot disagree about file content, only
//! about ordering of the syscalls themselves.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use crate::torrent::FileEntry;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("could not create {path:?}: {source}")]
    Create {
        path: PathBuf,
        source: io::Error,
    },
    #[error("write to {path:?} failed: {source}")]
    WriteFailed {
        path: PathBuf,
        source: io::Error,
    },
    #[error("flush of {path:?} failed: {source}")]
    SyncFailed {
        path: PathBuf,
        source: io::Error,
    },
    #[error("write of {len} bytes at offset {offset} extends past the file layout")]
    OutOfBounds { offset: u64, len: usize },
}

struct OutputFile {
    path: PathBuf,
    handle: File,
    start_offset: u64,
    end_offset: u64,
    length: u64,
}

/// Writes piece buffers to their places in the torrent's file layout.
pub struct FileWriter {
    files: Vec<OutputFile>,
    write_lock: Mutex<()>,
}

impl FileWriter {
    /// Opens every file of the layout under `root`, creating missing
    /// directories and files as needed.
    pub fn new(entries: &[FileEntry], root: &Path) -> Result<FileWriter, StorageError> {
        let mut files = Vec::with_capacity(entries.len());

        for entry in entries {
            let path = root.join(&entry.path);
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).map_err(|source| StorageError::Create {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }

            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|source| StorageError::Create {
                    path: path.clone(),
                    source,
                })?;

            files.push(OutputFile {
                path,
                handle,
                start_offset: entry.start_offset,
                end_offset: entry.end_offset,
                length: entry.length,
            });
        }

        Ok(FileWriter {
            files,
            write_lock: Mutex::new(()),
        })
    }

    /// Writes `data` at `global_offset` of the virtual concatenated stream,
    /// splitting it across every file segment the range covers.
    pub fn write(&self, global_offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().unwrap();

        let mut pos = global_offset;
        let mut src = 0usize;
        let mut remaining = data.len() as u64;

        for file in &self.files {
            if file.end_offset <= pos {
                continue;
            }
            if file.start_offset >= pos + remaining {
                break;
            }

            let in_file_offset = pos - file.start_offset;
            let n = remaining.min(file.length - in_file_offset);

            file.handle
                .write_all_at(&data[src..src + n as usize], in_file_offset)
                .map_err(|source| StorageError::WriteFailed {
                    path: file.path.clone(),
                    source,
                })?;

            pos += n;
            src += n as usize;
            remaining -= n;
            if remaining == 0 {
                break;
            }
        }

        if remaining > 0 {
            return Err(StorageError::OutOfBounds {
                offset: global_offset,
                len: data.len(),
            });
        }

        Ok(())
    }

    /// Flushes every file to stable storage.
    pub fn sync(&self) -> Result<(), StorageError> {
        for file in &self.files {
            file.handle
                .sync_all()
                .map_err(|source| StorageError::SyncFailed {
                    path: file.path.clone(),
                    source,
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_DIR_SEQ: AtomicU32 = AtomicU32::new(0);

    /// A unique scratch directory per test invocation.
    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "remora-storage-{}-{}-{}",
            tag,
            std::process::id(),
            TEST_DIR_SEQ.fetch_add(1, Ordering::Relaxed),
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn layout(lengths: &[u64]) -> Vec<FileEntry> {
        let mut entries = Vec::new();
        let mut offset = 0;
        for (i, &length) in lengths.iter().enumerate() {
            entries.push(FileEntry {
                path: PathBuf::from(format!("file-{}", i)),
                length,
                start_offset: offset,
                end_offset: offset + length,
            });
            offset += length;
        }
        entries
    }

    #[test]
    fn test_write_spanning_two_files() {
        let root = temp_root("span");
        let entries = layout(&[10, 5]);
        let writer = FileWriter::new(&entries, &root).unwrap();

        // fill the full layout first so short files have their final size
        writer.write(0, &[0u8; 15]).unwrap();

        let data: Vec<u8> = (0..6).collect();
        writer.write(8, &data).unwrap();
        writer.sync().unwrap();

        let a = fs::read(root.join("file-0")).unwrap();
        let b = fs::read(root.join("file-1")).unwrap();
        assert_eq!(&a[8..10], &[0, 1]);
        assert_eq!(&b[..4], &[2, 3, 4, 5]);

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_write_spanning_many_files() {
        let root = temp_root("many");
        let entries = layout(&[4, 1, 3, 8]);
        let writer = FileWriter::new(&entries, &root).unwrap();

        let data: Vec<u8> = (0..16).collect();
        writer.write(0, &data).unwrap();

        let mut reassembled = Vec::new();
        for i in 0..4 {
            reassembled.extend(fs::read(root.join(format!("file-{}", i))).unwrap());
        }
        assert_eq!(reassembled, data);

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_write_inside_one_file() {
        let root = temp_root("inside");
        let entries = layout(&[8, 8]);
        let writer = FileWriter::new(&entries, &root).unwrap();

        writer.write(0, &[0u8; 16]).unwrap();
        writer.write(9, b"xy").unwrap();

        let b = fs::read(root.join("file-1")).unwrap();
        assert_eq!(&b, &[0, b'x', b'y', 0, 0, 0, 0, 0]);

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_write_past_layout_is_rejected() {
        let root = temp_root("bounds");
        let entries = layout(&[4]);
        let writer = FileWriter::new(&entries, &root).unwrap();

        let result = writer.write(2, &[1, 2, 3, 4]);
        assert!(matches!(result, Err(StorageError::OutOfBounds { .. })));

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_nested_directories_are_created() {
        let root = temp_root("nested");
        let entries = vec![FileEntry {
            path: PathBuf::from("a/b/c.bin"),
            length: 3,
            start_offset: 0,
            end_offset: 3,
        }];
        let writer = FileWriter::new(&entries, &root).unwrap();

        writer.write(0, b"abc").unwrap();
        assert_eq!(fs::read(root.join("a/b/c.bin")).unwrap(), b"abc");

        fs::remove_dir_all(&root).unwrap();
    }
}
