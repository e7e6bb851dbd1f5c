use std::fs;
use std::io::{self, Write};
use std::path::Path;
use crc32fast::Hasher;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use crate::core::error::{Error, ErrorKind, Result};

// [ MAGIC 8B ][ VERSION u32 ][ BODY_LEN u64 ][ BODY_CRC32 u32 ]  <- byte 0
// [ BODY (bincode) ]
pub const HEADER_SIZE: usize = 24;

/// Decoded file plus what is needed to tie other files to it
pub struct Checksummed<T> {
    pub body: T,
    pub body_crc: u32,
    pub file_len: u64,
}

/// Serialize `body` to a temp file beside `path`, fsync, then rename over `path`.
/// Readers see either the previous file or the complete new one.
pub fn write_checksummed<T: Serialize>(
    path: &Path,
    magic: &[u8; 8],
    version: u32,
    body: &T,
) -> Result<(u64, u32)> {
    let data = bincode::serialize(body)?;
    let mut hasher = Hasher::new();
    hasher.update(&data);
    let crc = hasher.finalize();

    let mut header = Vec::with_capacity(HEADER_SIZE);
    header.extend_from_slice(magic);
    header.extend_from_slice(&version.to_le_bytes());
    header.extend_from_slice(&(data.len() as u64).to_le_bytes());
    header.extend_from_slice(&crc.to_le_bytes());

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&header)?;
    tmp.write_all(&data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;

    Ok(((HEADER_SIZE + data.len()) as u64, crc))
}

pub fn read_checksummed<T: DeserializeOwned>(
    path: &Path,
    magic: &[u8; 8],
    version: u32,
) -> Result<Checksummed<T>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::new(ErrorKind::NotFound, format!("{} does not exist", path.display())));
        }
        Err(e) => return Err(e.into()),
    };

    if data.len() < HEADER_SIZE {
        return Err(corrupt(path, "truncated header"));
    }
    if &data[0..8] != magic {
        return Err(corrupt(path, "bad magic number"));
    }

    let found_version = u32::from_le_bytes(read_array(&data[8..12]));
    if found_version != version {
        return Err(corrupt(
            path,
            &format!("schema version {} (expected {})", found_version, version),
        ));
    }

    let body_len = u64::from_le_bytes(read_array(&data[12..20]));
    let expected_crc = u32::from_le_bytes(read_array(&data[20..24]));
    let body = &data[HEADER_SIZE..];
    if body.len() as u64 != body_len {
        return Err(corrupt(
            path,
            &format!("body is {} bytes, header says {}", body.len(), body_len),
        ));
    }

    let mut hasher = Hasher::new();
    hasher.update(body);
    if hasher.finalize() != expected_crc {
        return Err(corrupt(path, "checksum mismatch"));
    }

    let decoded = bincode::deserialize(body)
        .map_err(|e| corrupt(path, &format!("undecodable body: {}", e)))?;

    Ok(Checksummed {
        body: decoded,
        body_crc: expected_crc,
        file_len: data.len() as u64,
    })
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

fn corrupt(path: &Path, reason: &str) -> Error {
    Error::new(ErrorKind::IndexCorrupt, format!("{}: {}", path.display(), reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: &[u8; 8] = b"TESTFILE";

    #[test]
    fn flipped_byte_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body.bin");
        write_checksummed(&path, MAGIC, 1, &vec![1u64, 2, 3]).unwrap();

        let read: Checksummed<Vec<u64>> = read_checksummed(&path, MAGIC, 1).unwrap();
        assert_eq!(read.body, vec![1, 2, 3]);

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let err = read_checksummed::<Vec<u64>>(&path, MAGIC, 1).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::IndexCorrupt);
    }

    #[test]
    fn version_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body.bin");
        write_checksummed(&path, MAGIC, 1, &7u32).unwrap();

        let err = read_checksummed::<u32>(&path, MAGIC, 2).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::IndexCorrupt);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_checksummed::<u32>(&dir.path().join("nope"), MAGIC, 1).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
