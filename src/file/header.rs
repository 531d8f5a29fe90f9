//! Layout of the metadata block at offset 0 of every store file
//!
//! ```text
//! 0..4    magic "TILE"
//! 4..8    format version
//! 8..12   block size
//! 12..16  store kind
//! 16..24  free-list head (-1 = empty)
//! 24..32  end pointer: offset of the first never-allocated block
//! 32..    store-owned metadata (tree root, record count, ...)
//! ```

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Serialize;

use crate::codec::Fixed;

use super::error::{FileError, FileResult};
use super::{NULL_POINTER, Pointer};

/// Magic number for store files: "TILE" in ASCII
pub const MAGIC_NUMBER: u32 = u32::from_le_bytes(*b"TILE");

/// Current store file version
pub const VERSION: u32 = 1;

/// Bytes of the metadata block owned by the buffer manager
pub const HEADER_SIZE: usize = 32;

/// First byte of the metadata region a store may use for its own fields
pub const META_OFFSET: usize = HEADER_SIZE;

/// What kind of structure a store file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Plain blocks with no structure imposed by the crate
    Raw = 0,
    /// B+ tree index nodes
    Tree = 1,
    /// Fixed-size records
    Record = 2,
}

impl StoreKind {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(StoreKind::Raw),
            1 => Some(StoreKind::Tree),
            2 => Some(StoreKind::Record),
            _ => None,
        }
    }
}

/// Header fields maintained by the buffer manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreHeader {
    pub block_size: usize,
    pub kind: StoreKind,
    pub free_head: Pointer,
    pub end: Pointer,
}

impl StoreHeader {
    /// Header of a fresh file: only the metadata block is allocated
    pub fn new(block_size: usize, kind: StoreKind) -> Self {
        Self {
            block_size,
            kind,
            free_head: NULL_POINTER,
            end: block_size as Pointer,
        }
    }

    /// Write the header fields, leaving the store metadata region untouched
    pub fn write_to(&self, buf: &mut [u8]) {
        MAGIC_NUMBER.encode(&mut buf[0..4]);
        VERSION.encode(&mut buf[4..8]);
        (self.block_size as u32).encode(&mut buf[8..12]);
        (self.kind as u32).encode(&mut buf[12..16]);
        self.free_head.encode(&mut buf[16..24]);
        self.end.encode(&mut buf[24..32]);
    }

    /// Read the header of a store file without opening it as a store
    pub fn load<P: AsRef<Path>>(path: P) -> FileResult<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        File::open(path)?.read_exact(&mut buf)?;
        Self::read_from(&buf)
    }

    /// Parse and validate the header fields of a metadata block
    pub fn read_from(buf: &[u8]) -> FileResult<Self> {
        let magic = u32::decode(&buf[0..4]);
        if magic != MAGIC_NUMBER {
            return Err(FileError::InvalidMagic(magic));
        }

        let version = u32::decode(&buf[4..8]);
        if version != VERSION {
            return Err(FileError::UnsupportedVersion(version));
        }

        let raw_kind = u32::decode(&buf[12..16]);
        let kind = StoreKind::from_u32(raw_kind).ok_or(FileError::InvalidKind(raw_kind))?;

        Ok(Self {
            block_size: u32::decode(&buf[8..12]) as usize,
            kind,
            free_head: Pointer::decode(&buf[16..24]),
            end: Pointer::decode(&buf[24..32]),
        })
    }
}
