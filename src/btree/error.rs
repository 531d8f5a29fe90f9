use thiserror::Error;

use crate::file::FileError;

/// Errors that can occur during B+ tree operations
#[derive(Debug, Error)]
pub enum BPlusTreeError {
    #[error("File error: {0}")]
    File(#[from] FileError),

    #[error("Invalid capacity: {max_keys} separator keys, {max_entries} leaf entries")]
    InvalidCapacity { max_keys: usize, max_entries: usize },

    #[error(
        "Capacity mismatch: file was built with ({found_keys}, {found_entries}), \
         opened with ({expected_keys}, {expected_entries})"
    )]
    CapacityMismatch {
        expected_keys: usize,
        expected_entries: usize,
        found_keys: usize,
        found_entries: usize,
    },

    #[error("Key of {key_size} bytes and value of {value_size} bytes do not fit a node")]
    KeyTooLarge { key_size: usize, value_size: usize },

    #[error("Invalid tree state: {0}")]
    InvalidState(String),
}

pub type BPlusTreeResult<T> = Result<T, BPlusTreeError>;
