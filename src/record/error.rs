use crate::file::{FileError, Pointer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("File error: {0}")]
    File(#[from] FileError),

    #[error("Invalid record offset: {0}")]
    InvalidOffset(Pointer),

    #[error("Record at offset {0} is already deleted")]
    Deleted(Pointer),

    #[error("Record of {0} bytes is too large for a block")]
    RecordTooLarge(usize),
}

pub type RecordResult<T> = Result<T, RecordError>;
