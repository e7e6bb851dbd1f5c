use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, ErrorKind, Result};
use crate::parallel::distributor::PartitionStrategy;
use crate::writer::layout::LayoutKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub archive_path: PathBuf,
    pub index_path: Option<PathBuf>,   // Defaults to <archive>.idx
    pub output_dir: PathBuf,

    // Workers
    pub workers: usize,
    pub partition_strategy: PartitionStrategy,
    pub max_batch_retries: usize,

    // Output buffering
    pub flush_max_items: usize,
    pub flush_max_bytes: usize,
    pub sink_retry_attempts: usize,
    pub sink_retry_backoff_ms: u64,

    // Index
    pub force_rebuild: bool,
    pub show_progress: bool,
    pub delimiter: String,

    // Artifacts
    pub artifact_extension: String,
    pub artifact_layout: LayoutKind,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            archive_path: PathBuf::from("./archive.mbox"),
            index_path: None,
            output_dir: PathBuf::from("./output"),

            workers: num_cpus::get(),
            partition_strategy: PartitionStrategy::Balanced,
            max_batch_retries: 1,

            flush_max_items: 1000,                 // Flush every 1000 results
            flush_max_bytes: 100 * 1024 * 1024,    // or every 100MB of artifacts
            sink_retry_attempts: 3,
            sink_retry_backoff_ms: 50,

            force_rebuild: false,
            show_progress: true,
            delimiter: "From ".to_string(),

            artifact_extension: "eml".to_string(),
            artifact_layout: LayoutKind::Flat,
        }
    }
}

impl Config {
    pub fn new(archive_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Config {
            archive_path: archive_path.into(),
            output_dir: output_dir.into(),
            ..Config::default()
        }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::new(ErrorKind::InvalidArgument, "workers must be at least 1".to_string()));
        }
        if self.flush_max_items == 0 || self.flush_max_bytes == 0 {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "flush thresholds must be non-zero".to_string(),
            ));
        }
        if self.delimiter.is_empty() || self.delimiter.contains('\n') {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "delimiter must be a non-empty single-line prefix".to_string(),
            ));
        }
        Ok(())
    }

    pub fn index_path(&self) -> PathBuf {
        match &self.index_path {
            Some(path) => path.clone(),
            None => {
                let mut name = self.archive_path.as_os_str().to_os_string();
                name.push(".idx");
                PathBuf::from(name)
            }
        }
    }

    pub fn sink_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.sink_retry_backoff_ms)
    }
}
