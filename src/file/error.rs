use std::io;
use thiserror::Error;

use super::Pointer;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid magic number in store header: {0:#010x}")]
    InvalidMagic(u32),

    #[error("Unsupported store file version: {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid block size: {0}")]
    InvalidBlockSize(usize),

    #[error("Block size mismatch: file has {found}, store expects {expected}")]
    BlockSizeMismatch { expected: usize, found: usize },

    #[error("Store kind mismatch: file holds kind {found}, opened as kind {expected}")]
    KindMismatch { expected: u32, found: u32 },

    #[error("Unknown store kind in header: {0}")]
    InvalidKind(u32),

    #[error("Free-list loops back through block {0}")]
    FreeListCycle(Pointer),

    #[error("Invalid block pointer: {0}")]
    InvalidPointer(Pointer),

    #[error("Invalid buffer size: expected {expected}, got {actual}")]
    InvalidBufferSize { expected: usize, actual: usize },

    #[error("Rollback is not enabled for this store")]
    RollbackDisabled,
}

pub type FileResult<T> = Result<T, FileError>;
