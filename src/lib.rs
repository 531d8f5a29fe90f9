pub mod btree;
pub mod codec;
pub mod config;
pub mod file;
pub mod record;

pub use btree::{BPlusTree, BPlusTreeError, BPlusTreeResult, TreeStats};
pub use codec::{Fixed, FixedString, HashPair};
pub use config::{StoreConfig, StoreConfigBuilder};
pub use file::{
    BLOCK_SIZE, BufferManager, FileError, FileResult, NULL_POINTER, Pointer, RollbackLog,
    StoreHeader, StoreKind, Timestamp,
};
pub use record::{RecordError, RecordResult, RecordStore};
