use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::error::{FileError, FileResult};
use super::{MIN_BLOCK_SIZE, Pointer};

/// Raw fixed-size block file: every block lives at a multiple of `block_size`
pub struct BlockFile {
    file: File,
    path: PathBuf,
    block_size: usize,
}

impl BlockFile {
    /// Open a block file, creating it (and its parent directories) if absent.
    ///
    /// Returns the file and whether it was empty, i.e. still needs a header.
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> FileResult<(Self, bool)> {
        if block_size < MIN_BLOCK_SIZE || block_size % 8 != 0 {
            return Err(FileError::InvalidBlockSize(block_size));
        }

        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let fresh = file.metadata()?.len() == 0;

        Ok((
            Self {
                file,
                path: path.to_path_buf(),
                block_size,
            },
            fresh,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Read the block at `offset` into `buffer`
    ///
    /// Bytes past the physical end of file read as zeros, so a block that was
    /// allocated but never flushed comes back blank.
    pub fn read_block(&mut self, offset: Pointer, buffer: &mut [u8]) -> FileResult<()> {
        self.check(offset, buffer.len())?;

        self.file.seek(SeekFrom::Start(offset as u64))?;

        let mut filled = 0;
        while filled < buffer.len() {
            match self.file.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buffer[filled..].fill(0);

        Ok(())
    }

    /// Write `buffer` as the block at `offset`, extending the file if needed
    pub fn write_block(&mut self, offset: Pointer, buffer: &[u8]) -> FileResult<()> {
        self.check(offset, buffer.len())?;

        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(buffer)?;
        // No sync here; sync() is called on flush_all and close

        Ok(())
    }

    /// Physical length of the file in bytes
    pub fn len(&self) -> FileResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> FileResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Shrink (or grow) the file to exactly `len` bytes
    pub fn truncate(&mut self, len: u64) -> FileResult<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    /// Flush OS buffers to disk
    pub fn sync(&mut self) -> FileResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn check(&self, offset: Pointer, len: usize) -> FileResult<()> {
        if len != self.block_size {
            return Err(FileError::InvalidBufferSize {
                expected: self.block_size,
                actual: len,
            });
        }
        if offset < 0 || offset as u64 % self.block_size as u64 != 0 {
            return Err(FileError::InvalidPointer(offset));
        }
        Ok(())
    }
}
