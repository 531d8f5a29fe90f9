mod block_file;
mod buffer_manager;
mod error;
mod header;
mod rollback;

pub use block_file::BlockFile;
pub use buffer_manager::BufferManager;
pub use error::{FileError, FileResult};
pub use header::{HEADER_SIZE, META_OFFSET, StoreHeader, StoreKind};
pub use rollback::{RollbackEntry, RollbackLog};

/// Nominal block size in bytes (4KiB), used for index nodes
pub const BLOCK_SIZE: usize = 4096;

/// Smallest block a store may use: the header and a free-list link must fit
pub const MIN_BLOCK_SIZE: usize = 64;

/// Total memory the page cache may hold by default.
/// With 4KiB blocks this is 1024 resident blocks.
pub const CACHE_MEMORY: usize = 4 * 1024 * 1024;

/// Byte offset of a block inside its file; doubles as the block's handle
pub type Pointer = i64;

/// Marks "no block" in every on-disk link (root, next leaf, free-list)
pub const NULL_POINTER: Pointer = -1;

/// Logical time attached to a mutation for rollback purposes
pub type Timestamp = i64;

/// Round a record size up to a block size usable by the store
pub fn block_size_for(record_size: usize) -> usize {
    record_size.next_multiple_of(8).max(MIN_BLOCK_SIZE)
}
