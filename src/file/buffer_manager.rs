use ahash::AHashSet;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::Path;

use crate::codec::Fixed;
use crate::config::StoreConfig;

use super::block_file::BlockFile;
use super::error::{FileError, FileResult};
use super::header::{META_OFFSET, StoreHeader, StoreKind};
use super::rollback::RollbackLog;
use super::{NULL_POINTER, Pointer, Timestamp};

/// Entry in the block cache
struct CacheEntry {
    /// Current image of the block
    data: Vec<u8>,
    /// Whether the image differs from the file
    dirty: bool,
}

/// Page cache over one block file with LRU eviction
///
/// Block 0 is the metadata block. All other blocks are handed out by
/// `add_node`, recycled by `del_node` through a free-list threaded through
/// the freed blocks themselves, and accessed by their byte offset.
///
/// Mutable access goes through `write_node`, which records the block's
/// pre-mutation image in the rollback log (when one is attached) the first
/// time the block is written under a given timestamp.
pub struct BufferManager {
    /// Underlying block file
    file: BlockFile,
    /// Combined block storage and recency order
    cache: LruCache<Pointer, CacheEntry, ahash::RandomState>,
    /// Maximum number of cached blocks
    capacity: usize,
    /// Recycled buffer from the last eviction, reused for the next load
    spare: Vec<u8>,
    /// Pre-image log, present when rollback is enabled
    rollback: Option<RollbackLog>,
    /// Blocks whose pre-image is already logged for `journal_stamp`
    journaled: AHashSet<Pointer>,
    journal_stamp: Option<Timestamp>,
}

impl BufferManager {
    /// Open (or create) the store file at `path`
    pub fn open<P: AsRef<Path>>(
        path: P,
        kind: StoreKind,
        block_size: usize,
        config: &StoreConfig,
    ) -> FileResult<Self> {
        let path = path.as_ref();
        let (mut file, fresh) = BlockFile::open(path, block_size)?;

        let mut block = vec![0u8; block_size];
        if fresh {
            StoreHeader::new(block_size, kind).write_to(&mut block);
            file.write_block(0, &block)?;
        } else {
            file.read_block(0, &mut block)?;
            let header = StoreHeader::read_from(&block)?;
            if header.block_size != block_size {
                return Err(FileError::BlockSizeMismatch {
                    expected: block_size,
                    found: header.block_size,
                });
            }
            if header.kind != kind {
                return Err(FileError::KindMismatch {
                    expected: kind as u32,
                    found: header.kind as u32,
                });
            }
        }

        let rollback = if config.rollback {
            let mut log = RollbackLog::open(config.rollback_path(path), block_size)?;
            // A log left over from an earlier file with this name holds images of that file
            if fresh && log.last() != NULL_POINTER {
                tracing::warn!(log = %log.path().display(), "discarding stale rollback log");
                log.reset()?;
            }
            Some(log)
        } else {
            None
        };

        let capacity = config.cache_capacity(block_size);
        tracing::debug!(
            path = %path.display(),
            ?kind,
            block_size,
            capacity,
            fresh,
            rollback = config.rollback,
            "opened block store"
        );

        Ok(Self {
            file,
            cache: LruCache::with_hasher(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
                ahash::RandomState::new(),
            ),
            capacity,
            spare: block,
            rollback,
            journaled: AHashSet::new(),
            journal_stamp: None,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn block_size(&self) -> usize {
        self.file.block_size()
    }

    /// Maximum number of cached blocks
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn rollback_enabled(&self) -> bool {
        self.rollback.is_some()
    }

    pub fn rollback_log_mut(&mut self) -> Option<&mut RollbackLog> {
        self.rollback.as_mut()
    }

    /// Current header fields
    pub fn header(&mut self) -> FileResult<StoreHeader> {
        StoreHeader::read_from(self.read_node(0)?)
    }

    /// Store-owned region of the metadata block
    pub fn meta(&mut self) -> FileResult<&[u8]> {
        Ok(&self.read_node(0)?[META_OFFSET..])
    }

    /// Mutable store-owned region of the metadata block
    pub fn meta_mut(&mut self, ts: Option<Timestamp>) -> FileResult<&mut [u8]> {
        Ok(&mut self.write_node(0, ts)?[META_OFFSET..])
    }

    /// Allocate a block and return its offset with a zeroed, writable image.
    ///
    /// The head of the free-list is reused first; otherwise the block at the
    /// end pointer is taken and the end pointer advances.
    pub fn add_node(&mut self, ts: Option<Timestamp>) -> FileResult<(Pointer, &mut [u8])> {
        let mut header = self.header()?;
        let block_size = self.block_size() as Pointer;

        let ptr = if header.free_head != NULL_POINTER {
            let ptr = header.free_head;
            header.free_head = Pointer::decode(self.read_node(ptr)?);
            header.write_to(self.write_node(0, ts)?);

            // The free-list link is the pre-image here; logging it lets a
            // rollback put the block back on the list.
            self.write_node(ptr, ts)?.fill(0);
            tracing::trace!(ptr, "reused freed block");
            ptr
        } else {
            let ptr = header.end;
            header.end += block_size;
            header.write_to(self.write_node(0, ts)?);

            // Nothing below the end pointer references this block yet, so
            // there is no pre-image worth logging.
            if self.rollback.is_some()
                && let Some(ts) = ts
            {
                self.stamp(ts);
                self.journaled.insert(ptr);
            }

            while self.cache.len() >= self.capacity {
                self.evict_lru()?;
            }
            let mut data = self.take_buffer();
            data.fill(0);
            self.cache.put(ptr, CacheEntry { data, dirty: true });
            ptr
        };

        let entry = self
            .cache
            .get_mut(&ptr)
            .ok_or(FileError::InvalidPointer(ptr))?;
        entry.dirty = true;
        Ok((ptr, &mut entry.data))
    }

    /// Get the image of a block, loading it from disk if necessary
    pub fn read_node(&mut self, ptr: Pointer) -> FileResult<&[u8]> {
        self.load(ptr)?;

        // get() promotes the entry to most recently used
        let entry = self.cache.get(&ptr).ok_or(FileError::InvalidPointer(ptr))?;
        Ok(&entry.data)
    }

    /// Get a mutable image of a block, loading it if necessary.
    ///
    /// Marks the block dirty. With rollback enabled and `ts` given, the
    /// current image is logged before it is handed out, once per block and
    /// timestamp.
    pub fn write_node(&mut self, ptr: Pointer, ts: Option<Timestamp>) -> FileResult<&mut [u8]> {
        self.load(ptr)?;
        self.journal(ptr, ts)?;

        let entry = self
            .cache
            .get_mut(&ptr)
            .ok_or(FileError::InvalidPointer(ptr))?;
        entry.dirty = true;
        Ok(&mut entry.data)
    }

    /// Release a block to the free-list.
    ///
    /// Its cache entry is dropped without a flush; the only bytes that reach
    /// the file are the free-list link.
    pub fn del_node(&mut self, ptr: Pointer, ts: Option<Timestamp>) -> FileResult<()> {
        if ptr <= 0 {
            return Err(FileError::InvalidPointer(ptr));
        }

        self.journal(ptr, ts)?;
        self.cache.pop(&ptr);

        let mut header = self.header()?;
        let mut link = self.take_buffer();
        link.fill(0);
        header.free_head.encode(&mut link[0..8]);
        self.file.write_block(ptr, &link)?;
        self.spare = link;

        header.free_head = ptr;
        header.write_to(self.write_node(0, ts)?);
        Ok(())
    }

    /// Offsets on the free-list, head first
    pub fn free_blocks(&mut self) -> FileResult<Vec<Pointer>> {
        let header = self.header()?;
        let allocated = (header.end / self.block_size() as Pointer).max(0) as usize;
        let mut blocks = Vec::new();
        let mut current = header.free_head;
        let mut link = vec![0u8; self.block_size()];
        while current != NULL_POINTER {
            if blocks.len() >= allocated {
                return Err(FileError::FreeListCycle(current));
            }
            blocks.push(current);
            self.file.read_block(current, &mut link)?;
            current = Pointer::decode(&link);
        }
        Ok(blocks)
    }

    /// Write every dirty block to disk and sync
    pub fn flush_all(&mut self) -> FileResult<()> {
        let mut dirty_blocks = Vec::new();
        for (ptr, entry) in self.cache.iter() {
            if entry.dirty {
                dirty_blocks.push(*ptr);
            }
        }

        for ptr in dirty_blocks {
            // peek_mut leaves the recency order alone
            if let Some(entry) = self.cache.peek_mut(&ptr)
                && entry.dirty
            {
                self.file.write_block(ptr, &entry.data)?;
                entry.dirty = false;
            }
        }

        self.file.sync()?;
        if let Some(log) = self.rollback.as_mut() {
            log.sync()?;
        }

        Ok(())
    }

    /// Flush all dirty blocks and empty the cache
    pub fn flush_and_clear(&mut self) -> FileResult<()> {
        self.flush_all()?;
        self.cache.clear();
        Ok(())
    }

    /// Throw away every block and the rollback history; the file is left
    /// holding a fresh header only.
    pub fn reset(&mut self) -> FileResult<()> {
        let header = self.header()?;

        self.cache.clear();
        self.journaled.clear();
        self.journal_stamp = None;

        let mut block = self.take_buffer();
        block.fill(0);
        StoreHeader::new(header.block_size, header.kind).write_to(&mut block);
        self.file.truncate(0)?;
        self.file.write_block(0, &block)?;
        self.file.sync()?;
        self.spare = block;

        if let Some(log) = self.rollback.as_mut() {
            log.reset()?;
        }

        tracing::debug!(path = %self.path().display(), "reset block store");
        Ok(())
    }

    /// Revert the file to its state before the first mutation stamped `ts`.
    ///
    /// Cached images are flushed and discarded first, so every block is
    /// reloaded from the reverted file afterwards. Returns the number of
    /// log entries replayed.
    pub fn roll_back(&mut self, ts: Timestamp) -> FileResult<usize> {
        if self.rollback.is_none() {
            return Err(FileError::RollbackDisabled);
        }

        self.flush_and_clear()?;
        self.journaled.clear();
        self.journal_stamp = None;

        let log = self.rollback.as_mut().ok_or(FileError::RollbackDisabled)?;
        let undone = log.roll_back(&mut self.file, ts)?;
        self.file.sync()?;

        tracing::debug!(
            path = %self.file.path().display(),
            timestamp = ts,
            undone,
            "rolled back block store"
        );
        Ok(undone)
    }

    /// Flush and close the store
    pub fn close(mut self) -> FileResult<()> {
        self.flush_all()
    }

    /// Get the number of blocks currently cached
    pub fn cached_blocks(&self) -> usize {
        self.cache.len()
    }

    /// Check if a block is cached
    pub fn is_cached(&self, ptr: Pointer) -> bool {
        self.cache.contains(&ptr)
    }

    /// Get the number of dirty blocks in the cache
    pub fn dirty_blocks(&self) -> usize {
        self.cache.iter().filter(|(_, e)| e.dirty).count()
    }

    /// Make sure `ptr` is cached, evicting the LRU block if the cache is full
    fn load(&mut self, ptr: Pointer) -> FileResult<()> {
        if self.cache.contains(&ptr) {
            return Ok(());
        }

        while self.cache.len() >= self.capacity {
            self.evict_lru()?;
        }

        let mut data = self.take_buffer();
        if let Err(e) = self.file.read_block(ptr, &mut data) {
            self.spare = data;
            return Err(e);
        }
        self.cache.put(ptr, CacheEntry { data, dirty: false });

        Ok(())
    }

    /// Evict the least recently used block, flushing it if dirty
    fn evict_lru(&mut self) -> FileResult<()> {
        if let Some((ptr, entry)) = self.cache.pop_lru() {
            if entry.dirty {
                self.file.write_block(ptr, &entry.data)?;
            }
            tracing::trace!(ptr, dirty = entry.dirty, "evicted block");

            // Recycle the evicted buffer for the next load
            self.spare = entry.data;
        }

        Ok(())
    }

    /// Take the spare buffer, allocating one if it was already used
    fn take_buffer(&mut self) -> Vec<u8> {
        let block_size = self.block_size();
        let mut data = std::mem::take(&mut self.spare);
        if data.len() != block_size {
            data = vec![0u8; block_size];
        }
        data
    }

    /// Start a new journaling window when the timestamp changes
    fn stamp(&mut self, ts: Timestamp) {
        if self.journal_stamp != Some(ts) {
            self.journaled.clear();
            self.journal_stamp = Some(ts);
        }
    }

    /// Log the current image of `ptr` unless already logged under `ts`
    fn journal(&mut self, ptr: Pointer, ts: Option<Timestamp>) -> FileResult<()> {
        let Some(ts) = ts else {
            return Ok(());
        };
        if self.rollback.is_none() {
            return Ok(());
        }

        self.stamp(ts);
        if !self.journaled.insert(ptr) {
            return Ok(());
        }

        let Some(log) = self.rollback.as_mut() else {
            return Ok(());
        };
        match self.cache.peek(&ptr) {
            Some(entry) => log.insert(&entry.data, ptr, ts),
            None => {
                let mut image = std::mem::take(&mut self.spare);
                image.resize(self.file.block_size(), 0);
                self.file.read_block(ptr, &mut image)?;
                let result = log.insert(&image, ptr, ts);
                self.spare = image;
                result
            }
        }
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        // Flush all dirty blocks when the buffer manager is dropped
        let _ = self.flush_all();
    }
}
