use std::path::{Path, PathBuf};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::RecordLocation;
use crate::mmap::mmap_file::MmapFile;

/// Zero-copy window over the archive. One per worker.
pub struct RecordView {
    path: PathBuf,
    file: MmapFile,
}

impl RecordView {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = MmapFile::open_read_only(&path)?;
        Ok(RecordView {
            path: path.as_ref().to_path_buf(),
            file,
        })
    }

    pub fn len(&self) -> u64 {
        self.file.len
    }

    pub fn is_empty(&self) -> bool {
        self.file.len == 0
    }

    /// Borrow `byte_length` bytes at `byte_offset`. Never truncates.
    pub fn read(&self, byte_offset: u64, byte_length: u64) -> Result<&[u8]> {
        let end = byte_offset.checked_add(byte_length).filter(|end| *end <= self.file.len);
        match end {
            Some(end) => Ok(&self.file.data()[byte_offset as usize..end as usize]),
            None => Err(Error::new(
                ErrorKind::RecordOutOfBounds,
                format!(
                    "range {}+{} exceeds {} ({} bytes mapped)",
                    byte_offset,
                    byte_length,
                    self.path.display(),
                    self.file.len
                ),
            )),
        }
    }

    pub fn read_location(&self, location: &RecordLocation) -> Result<&[u8]> {
        self.read(location.byte_offset, location.byte_length)
    }

    /// Reads in the given order; the first bad range fails the whole call.
    pub fn read_batch(&self, locations: &[RecordLocation]) -> Result<Vec<&[u8]>> {
        locations.iter().map(|location| self.read_location(location)).collect()
    }
}
