//! Append-only log of pre-mutation block images
//!
//! Byte 0 of the log file holds the offset of the newest entry (-1 when
//! empty). Every entry is `{previous, target, timestamp, image}` with the
//! image exactly one data block long, so entries chain backwards from the
//! newest one.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::codec::Fixed;

use super::block_file::BlockFile;
use super::error::{FileError, FileResult};
use super::{NULL_POINTER, Pointer, Timestamp};

const LOG_HEADER_SIZE: u64 = 8;
const ENTRY_HEADER_SIZE: usize = 24;

/// Header of one log entry (the image is not loaded)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RollbackEntry {
    /// Offset of this entry inside the log file
    pub offset: Pointer,
    /// Offset of the entry written before this one
    pub previous: Pointer,
    /// Data block the image belongs to
    pub target: Pointer,
    pub timestamp: Timestamp,
}

/// Rollback log bound to one data file
pub struct RollbackLog {
    file: File,
    path: PathBuf,
    block_size: usize,
    last: Pointer,
    /// Scratch space for one serialized entry
    scratch: Vec<u8>,
}

impl RollbackLog {
    /// Open the log at `path`, creating an empty one if absent
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> FileResult<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let last = if file.metadata()?.len() < LOG_HEADER_SIZE {
            file.set_len(0)?;
            file.write_all(&NULL_POINTER.to_le_bytes())?;
            NULL_POINTER
        } else {
            let mut buf = [0u8; 8];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            Pointer::from_le_bytes(buf)
        };

        Ok(Self {
            file,
            path: path.to_path_buf(),
            block_size,
            last,
            scratch: vec![0u8; ENTRY_HEADER_SIZE + block_size],
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset of the newest entry, or -1
    pub fn last(&self) -> Pointer {
        self.last
    }

    /// Append the pre-mutation `image` of block `target`
    pub fn insert(&mut self, image: &[u8], target: Pointer, timestamp: Timestamp) -> FileResult<()> {
        if image.len() != self.block_size {
            return Err(FileError::InvalidBufferSize {
                expected: self.block_size,
                actual: image.len(),
            });
        }

        self.last.encode(&mut self.scratch[0..8]);
        target.encode(&mut self.scratch[8..16]);
        timestamp.encode(&mut self.scratch[16..24]);
        self.scratch[ENTRY_HEADER_SIZE..].copy_from_slice(image);

        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&self.scratch)?;
        self.last = offset as Pointer;
        self.write_last()?;

        Ok(())
    }

    /// Restore `data` to its state before the first mutation stamped `timestamp`.
    ///
    /// Entries with a timestamp `>= timestamp` are replayed newest-first, each
    /// overwriting its target block with the stored image. The walk stops at
    /// the first older entry, which stays in the log. Undone entries are cut
    /// off the end of the log. Returns the number of entries replayed.
    pub fn roll_back(&mut self, data: &mut BlockFile, timestamp: Timestamp) -> FileResult<usize> {
        let mut undone = 0;
        let mut cut = None;

        while self.last != NULL_POINTER {
            let entry = self.read_entry(self.last, true)?;
            if entry.timestamp < timestamp {
                break;
            }

            tracing::trace!(
                target = entry.target,
                timestamp = entry.timestamp,
                "replaying rollback entry"
            );
            data.write_block(entry.target, &self.scratch[ENTRY_HEADER_SIZE..])?;

            cut = Some(entry.offset);
            self.last = entry.previous;
            undone += 1;
        }

        if let Some(offset) = cut {
            self.file.set_len(offset as u64)?;
        }
        self.write_last()?;

        Ok(undone)
    }

    /// Entry headers from newest to oldest
    pub fn entries(&mut self) -> FileResult<Vec<RollbackEntry>> {
        let mut entries = Vec::new();
        let mut current = self.last;
        while current != NULL_POINTER {
            let entry = self.read_entry(current, false)?;
            current = entry.previous;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Drop the whole history
    pub fn reset(&mut self) -> FileResult<()> {
        self.file.set_len(LOG_HEADER_SIZE)?;
        self.last = NULL_POINTER;
        self.write_last()
    }

    pub fn sync(&mut self) -> FileResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Read the entry at `offset` into the scratch buffer
    fn read_entry(&mut self, offset: Pointer, with_image: bool) -> FileResult<RollbackEntry> {
        if offset < LOG_HEADER_SIZE as Pointer {
            return Err(FileError::InvalidPointer(offset));
        }

        self.file.seek(SeekFrom::Start(offset as u64))?;
        let len = if with_image {
            self.scratch.len()
        } else {
            ENTRY_HEADER_SIZE
        };
        self.file.read_exact(&mut self.scratch[..len])?;

        Ok(RollbackEntry {
            offset,
            previous: Pointer::decode(&self.scratch[0..8]),
            target: Pointer::decode(&self.scratch[8..16]),
            timestamp: Timestamp::decode(&self.scratch[16..24]),
        })
    }

    fn write_last(&mut self) -> FileResult<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.last.to_le_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SIZE: usize = 64;

    fn setup() -> (TempDir, BlockFile, RollbackLog) {
        let temp_dir = tempfile::tempdir().unwrap();
        let (data, _) = BlockFile::open(temp_dir.path().join("data.db"), SIZE).unwrap();
        let log = RollbackLog::open(temp_dir.path().join("data.db.rollback"), SIZE).unwrap();
        (temp_dir, data, log)
    }

    fn read(data: &mut BlockFile, offset: Pointer) -> u8 {
        let mut buf = vec![0u8; SIZE];
        data.read_block(offset, &mut buf).unwrap();
        buf[0]
    }

    #[test]
    fn test_empty_log() {
        let (_temp_dir, mut data, mut log) = setup();
        assert_eq!(log.last(), NULL_POINTER);
        assert!(log.entries().unwrap().is_empty());
        assert_eq!(log.roll_back(&mut data, 0).unwrap(), 0);
    }

    #[test]
    fn test_entries_chain_backwards() {
        let (_temp_dir, _data, mut log) = setup();

        log.insert(&[1u8; SIZE], 64, 10).unwrap();
        log.insert(&[2u8; SIZE], 128, 11).unwrap();
        log.insert(&[3u8; SIZE], 64, 12).unwrap();

        let entries = log.entries().unwrap();
        let stamps: Vec<_> = entries.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![12, 11, 10]);
        assert_eq!(entries[0].previous, entries[1].offset);
        assert_eq!(entries[2].previous, NULL_POINTER);
        assert_eq!(entries[1].target, 128);
    }

    #[test]
    fn test_roll_back_stops_at_older_entry() {
        let (_temp_dir, mut data, mut log) = setup();

        // Block 64 goes 1 -> 2 -> 3 at timestamps 10, 11, 12
        log.insert(&[1u8; SIZE], 64, 10).unwrap();
        log.insert(&[2u8; SIZE], 64, 11).unwrap();
        data.write_block(64, &[3u8; SIZE]).unwrap();

        let undone = log.roll_back(&mut data, 11).unwrap();
        assert_eq!(undone, 1);
        assert_eq!(read(&mut data, 64), 2);

        // The entry at 10 survives the rollback
        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].timestamp, 10);

        log.roll_back(&mut data, 10).unwrap();
        assert_eq!(read(&mut data, 64), 1);
        assert!(log.entries().unwrap().is_empty());
    }

    #[test]
    fn test_roll_back_truncates_log() {
        let (_temp_dir, mut data, mut log) = setup();

        log.insert(&[1u8; SIZE], 64, 1).unwrap();
        let keep = std::fs::metadata(log.path()).unwrap().len();
        log.insert(&[2u8; SIZE], 64, 2).unwrap();
        log.insert(&[3u8; SIZE], 128, 3).unwrap();

        log.roll_back(&mut data, 2).unwrap();
        assert_eq!(std::fs::metadata(log.path()).unwrap().len(), keep);

        // New entries continue the surviving chain
        log.insert(&[4u8; SIZE], 64, 5).unwrap();
        let stamps: Vec<_> = log.entries().unwrap().iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![5, 1]);
    }

    #[test]
    fn test_reopen_keeps_chain() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("log");

        {
            let mut log = RollbackLog::open(&path, SIZE).unwrap();
            log.insert(&[1u8; SIZE], 64, 1).unwrap();
            log.insert(&[2u8; SIZE], 64, 2).unwrap();
        }

        let mut log = RollbackLog::open(&path, SIZE).unwrap();
        assert_eq!(log.entries().unwrap().len(), 2);
    }

    #[test]
    fn test_reset() {
        let (_temp_dir, _data, mut log) = setup();

        log.insert(&[1u8; SIZE], 64, 1).unwrap();
        log.reset().unwrap();
        assert_eq!(log.last(), NULL_POINTER);
        assert!(log.entries().unwrap().is_empty());
    }

    #[test]
    fn test_image_size_checked() {
        let (_temp_dir, _data, mut log) = setup();
        let result = log.insert(&[0u8; SIZE + 1], 64, 1);
        assert!(matches!(result, Err(FileError::InvalidBufferSize { .. })));
    }
}
