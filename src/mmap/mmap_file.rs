use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::path::Path;
use crate::core::error::Result;

/// Read-only memory map of a whole file. Zero-length files are not mapped.
pub struct MmapFile {
    mmap: Option<Mmap>,
    pub len: u64,
}

impl MmapFile {
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        let len = file.metadata()?.len();

        if len == 0 {
            return Ok(MmapFile { mmap: None, len });
        }

        // SAFETY: the archive is never written while a run holds a view on it.
        let mmap = unsafe { MmapOptions::new().len(len as usize).map(&file)? };

        Ok(MmapFile { mmap: Some(mmap), len })
    }

    /// Hint the kernel that the mapping will be read front to back.
    pub fn advise_sequential(&self) {
        #[cfg(unix)]
        {
            if let Some(mmap) = &self.mmap {
                let _ = mmap.advise(memmap2::Advice::Sequential);
            }
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.mmap {
            Some(mmap) => &mmap[..],
            None => &[],
        }
    }
}
