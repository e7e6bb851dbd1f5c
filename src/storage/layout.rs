use std::path::{Path, PathBuf};
use std::fs;
use crate::core::config::Config;
use crate::core::error::Result;

/// On-disk locations for one archive's index and outputs
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub archive_path: PathBuf,
    pub index_path: PathBuf,      // Offset index (.idx)
    pub output_dir: PathBuf,      // Artifacts and metadata store
}

impl StorageLayout {
    pub fn new(config: &Config) -> Result<Self> {
        let output_dir = config.output_dir.clone();
        fs::create_dir_all(&output_dir)?;
        if let Some(parent) = config.index_path().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        Ok(StorageLayout {
            archive_path: config.archive_path.clone(),
            index_path: config.index_path(),
            output_dir,
        })
    }

    pub fn group_index_path(&self) -> PathBuf {
        sibling(&self.index_path, "groups")
    }

    pub fn lock_path(&self) -> PathBuf {
        lock_path_for(&self.index_path)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.output_dir.join("metadata.jsonl")
    }
}

/// Build lock guarding an index file.
pub fn lock_path_for(index_path: &Path) -> PathBuf {
    sibling(index_path, "lock")
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_sit_next_to_index() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path().join("mail.mbox"), dir.path().join("out"));
        let layout = StorageLayout::new(&config).unwrap();

        assert_eq!(layout.index_path, dir.path().join("mail.mbox.idx"));
        assert_eq!(layout.group_index_path(), dir.path().join("mail.mbox.idx.groups"));
        assert_eq!(layout.lock_path(), dir.path().join("mail.mbox.idx.lock"));
        assert_eq!(layout.metadata_path(), dir.path().join("out").join("metadata.jsonl"));
        assert!(layout.output_dir.is_dir());
    }
}
