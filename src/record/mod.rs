//! Offset-addressed store of fixed-size records
//!
//! Each record occupies one block sized for it; the block's offset is the
//! record's handle for its whole life. Deleted blocks go to the free-list
//! and are handed out again by later adds.

mod error;

pub use error::{RecordError, RecordResult};

use std::marker::PhantomData;
use std::path::Path;

use crate::codec::Fixed;
use crate::config::StoreConfig;
use crate::file::{BufferManager, Pointer, StoreKind, Timestamp, block_size_for};

/// Fixed-size record store backed by one file
pub struct RecordStore<T> {
    buffer: BufferManager,
    /// Live records; persisted in the metadata region
    len: usize,
    _record: PhantomData<T>,
}

impl<T: Fixed> RecordStore<T> {
    /// Open (or create) a record store
    pub fn open<P: AsRef<Path>>(path: P, config: &StoreConfig) -> RecordResult<Self> {
        let block_size = block_size_for(T::SIZE);
        if block_size > u32::MAX as usize {
            return Err(RecordError::RecordTooLarge(T::SIZE));
        }

        let path = path.as_ref();
        let mut buffer = BufferManager::open(path, StoreKind::Record, block_size, config)?;
        let len = u64::decode(buffer.meta()?) as usize;

        tracing::debug!(path = %path.display(), block_size, len, "opened record store");
        Ok(Self {
            buffer,
            len,
            _record: PhantomData,
        })
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The underlying page cache
    pub fn buffer(&self) -> &BufferManager {
        &self.buffer
    }

    /// Store a record and return its offset
    pub fn add(&mut self, value: &T) -> RecordResult<Pointer> {
        self.add_stamped(value, None)
    }

    pub fn add_at(&mut self, value: &T, ts: Timestamp) -> RecordResult<Pointer> {
        self.add_stamped(value, Some(ts))
    }

    fn add_stamped(&mut self, value: &T, ts: Option<Timestamp>) -> RecordResult<Pointer> {
        let (ptr, buf) = self.buffer.add_node(ts)?;
        value.encode(buf);
        self.len += 1;
        self.save_len(ts)?;
        Ok(ptr)
    }

    /// Read the record at `ptr`
    pub fn get(&mut self, ptr: Pointer) -> RecordResult<T> {
        self.check(ptr)?;
        Ok(T::decode(self.buffer.read_node(ptr)?))
    }

    /// Overwrite the record at `ptr` in place
    pub fn modify(&mut self, ptr: Pointer, value: &T) -> RecordResult<()> {
        self.modify_stamped(ptr, value, None)
    }

    pub fn modify_at(&mut self, ptr: Pointer, value: &T, ts: Timestamp) -> RecordResult<()> {
        self.modify_stamped(ptr, value, Some(ts))
    }

    fn modify_stamped(&mut self, ptr: Pointer, value: &T, ts: Option<Timestamp>) -> RecordResult<()> {
        self.check(ptr)?;
        self.check_live(ptr)?;
        value.encode(self.buffer.write_node(ptr, ts)?);
        Ok(())
    }

    /// Release the record at `ptr`; the offset may be reused by a later add
    pub fn delete(&mut self, ptr: Pointer) -> RecordResult<()> {
        self.delete_stamped(ptr, None)
    }

    pub fn delete_at(&mut self, ptr: Pointer, ts: Timestamp) -> RecordResult<()> {
        self.delete_stamped(ptr, Some(ts))
    }

    fn delete_stamped(&mut self, ptr: Pointer, ts: Option<Timestamp>) -> RecordResult<()> {
        self.check(ptr)?;
        self.check_live(ptr)?;
        self.buffer.del_node(ptr, ts)?;
        self.len = self.len.saturating_sub(1);
        self.save_len(ts)
    }

    /// Drop every record and the rollback history
    pub fn clear(&mut self) -> RecordResult<()> {
        self.buffer.reset()?;
        self.len = 0;
        tracing::debug!(path = %self.buffer.path().display(), "cleared record store");
        Ok(())
    }

    /// Undo every mutation stamped `ts` or later
    pub fn roll_back(&mut self, ts: Timestamp) -> RecordResult<usize> {
        let undone = self.buffer.roll_back(ts)?;
        self.len = u64::decode(self.buffer.meta()?) as usize;
        Ok(undone)
    }

    /// Flush every dirty record and close the file
    pub fn close(self) -> RecordResult<()> {
        self.buffer.close()?;
        Ok(())
    }

    fn save_len(&mut self, ts: Option<Timestamp>) -> RecordResult<()> {
        (self.len as u64).encode(self.buffer.meta_mut(ts)?);
        Ok(())
    }

    /// Reject offsets that cannot name a record block
    fn check(&mut self, ptr: Pointer) -> RecordResult<()> {
        let block_size = self.buffer.block_size() as Pointer;
        let end = self.buffer.header()?.end;
        if ptr < block_size || ptr >= end || ptr % block_size != 0 {
            return Err(RecordError::InvalidOffset(ptr));
        }
        Ok(())
    }

    /// Reject offsets already on the free-list; writing one would relink it
    fn check_live(&mut self, ptr: Pointer) -> RecordResult<()> {
        if self.buffer.free_blocks()?.contains(&ptr) {
            return Err(RecordError::Deleted(ptr));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FixedString;
    use crate::file::FileError;
    use tempfile::TempDir;

    /// Train id with (seats left, fare in cents)
    type Seats = (FixedString<20>, (u32, i64));

    fn seats(train: &str, left: u32) -> Seats {
        (FixedString::new(train), (left, left as i64 * 150))
    }

    fn setup(dir: &TempDir, config: &StoreConfig) -> RecordStore<Seats> {
        RecordStore::open(dir.path().join("seats"), config).unwrap()
    }

    #[test]
    fn test_block_size() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = setup(&temp_dir, &StoreConfig::default());
        // 20 + 12 = 32 bytes rounds up to the 64-byte minimum
        assert_eq!(store.buffer().block_size(), 64);

        let big: RecordStore<[u8; 100]> =
            RecordStore::open(temp_dir.path().join("big"), &StoreConfig::default()).unwrap();
        assert_eq!(big.buffer().block_size(), 104);
    }

    #[test]
    fn test_add_and_get() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = setup(&temp_dir, &StoreConfig::default());

        let a = store.add(&seats("G1", 100)).unwrap();
        let b = store.add(&seats("D302", 50)).unwrap();

        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(a).unwrap(), seats("G1", 100));
        assert_eq!(store.get(b).unwrap(), seats("D302", 50));
    }

    #[test]
    fn test_modify() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = setup(&temp_dir, &StoreConfig::default());

        let ptr = store.add(&seats("G1", 100)).unwrap();
        store.modify(ptr, &seats("G1", 99)).unwrap();
        assert_eq!(store.get(ptr).unwrap(), seats("G1", 99));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_delete_and_reuse() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = setup(&temp_dir, &StoreConfig::default());

        let a = store.add(&seats("G1", 1)).unwrap();
        let b = store.add(&seats("G2", 2)).unwrap();
        store.delete(a).unwrap();
        assert_eq!(store.len(), 1);

        let c = store.add(&seats("G3", 3)).unwrap();
        assert_eq!(c, a);
        assert_eq!(store.get(c).unwrap(), seats("G3", 3));
        assert_eq!(store.get(b).unwrap(), seats("G2", 2));
    }

    #[test]
    fn test_invalid_offsets() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = setup(&temp_dir, &StoreConfig::default());
        let ptr = store.add(&seats("G1", 1)).unwrap();

        for bad in [-1, 0, ptr + 1, ptr + 64] {
            assert!(matches!(store.get(bad), Err(RecordError::InvalidOffset(_))));
        }
        assert!(matches!(
            store.modify(0, &seats("x", 0)),
            Err(RecordError::InvalidOffset(0))
        ));
        assert!(matches!(store.delete(-5), Err(RecordError::InvalidOffset(-5))));
    }

    #[test]
    fn test_deleted_record_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = setup(&temp_dir, &StoreConfig::default());

        let a = store.add(&seats("G1", 10)).unwrap();
        let b = store.add(&seats("G2", 20)).unwrap();
        store.delete(a).unwrap();
        store.delete(b).unwrap();

        assert!(matches!(store.delete(a), Err(RecordError::Deleted(p)) if p == a));
        assert!(matches!(store.delete(b), Err(RecordError::Deleted(p)) if p == b));
        assert!(matches!(
            store.modify(a, &seats("G1", 1)),
            Err(RecordError::Deleted(_))
        ));
        assert!(store.is_empty());

        // Each freed block is handed out exactly once
        let x = store.add(&seats("X", 1)).unwrap();
        let y = store.add(&seats("Y", 2)).unwrap();
        assert_ne!(x, y);
        assert_eq!(store.get(x).unwrap(), seats("X", 1));
        assert_eq!(store.get(y).unwrap(), seats("Y", 2));
        assert!(store.buffer.free_blocks().unwrap().is_empty());
    }

    #[test]
    fn test_persistence() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::default();

        let (a, b) = {
            let mut store = setup(&temp_dir, &config);
            let a = store.add(&seats("G1", 1)).unwrap();
            let b = store.add(&seats("G2", 2)).unwrap();
            store.modify(a, &seats("G1", 11)).unwrap();
            store.close().unwrap();
            (a, b)
        };

        let mut store = setup(&temp_dir, &config);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(a).unwrap(), seats("G1", 11));
        assert_eq!(store.get(b).unwrap(), seats("G2", 2));
    }

    #[test]
    fn test_evicted_record_flushed() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::builder().cache_limit(3).build();

        let offsets: Vec<_> = {
            let mut store = setup(&temp_dir, &config);
            let offsets: Vec<_> = (0..4)
                .map(|i| store.add(&seats("K", i)).unwrap())
                .collect();
            assert_eq!(store.buffer().cached_blocks(), 3);
            assert!(!store.buffer().is_cached(offsets[0]));
            offsets
        };

        let mut store = setup(&temp_dir, &StoreConfig::default());
        for (i, &ptr) in offsets.iter().enumerate() {
            assert_eq!(store.get(ptr).unwrap(), seats("K", i as u32));
        }
    }

    #[test]
    fn test_clear() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = setup(&temp_dir, &StoreConfig::default());

        for i in 0..10 {
            store.add(&seats("T", i)).unwrap();
        }
        store.clear().unwrap();
        assert!(store.is_empty());

        let ptr = store.add(&seats("T", 42)).unwrap();
        assert_eq!(ptr, 64);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_roll_back_disabled() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = setup(&temp_dir, &StoreConfig::default());

        assert!(matches!(
            store.roll_back(1),
            Err(RecordError::File(FileError::RollbackDisabled))
        ));
    }

    #[test]
    fn test_roll_back() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::builder().rollback(true).build();
        let mut store = setup(&temp_dir, &config);

        let a = store.add_at(&seats("G1", 10), 1).unwrap();
        let b = store.add_at(&seats("G2", 20), 2).unwrap();
        store.modify_at(a, &seats("G1", 9), 3).unwrap();
        store.delete_at(b, 4).unwrap();
        let c = store.add_at(&seats("G3", 30), 5).unwrap();
        assert_eq!(c, b);

        store.roll_back(5).unwrap();
        assert_eq!(store.len(), 1);

        store.roll_back(4).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(b).unwrap(), seats("G2", 20));
        assert_eq!(store.get(a).unwrap(), seats("G1", 9));

        store.roll_back(3).unwrap();
        assert_eq!(store.get(a).unwrap(), seats("G1", 10));

        store.roll_back(2).unwrap();
        assert_eq!(store.len(), 1);
        assert!(matches!(store.get(b), Err(RecordError::InvalidOffset(_))));
    }
}
