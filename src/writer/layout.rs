use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::core::types::RecordId;

const NO_GROUP: &str = "no_group";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutKind {
    /// `records/<id>.<ext>`
    #[default]
    Flat,
    /// `threads/<shard>/<group>/<id>.<ext>`
    Grouped,
}

/// Maps a record to its artifact path. The path depends only on the record id
/// and group key, so re-writing a record always lands on the same file.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
    kind: LayoutKind,
    extension: String,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>, kind: LayoutKind, extension: impl Into<String>) -> Self {
        ArtifactLayout {
            root: root.into(),
            kind,
            extension: extension.into().trim_start_matches('.').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn kind(&self) -> LayoutKind {
        self.kind
    }

    pub fn artifact_path(&self, record_id: RecordId, group_key: Option<&str>) -> PathBuf {
        let file_name = if self.extension.is_empty() {
            format!("{:08}", record_id.value())
        } else {
            format!("{:08}.{}", record_id.value(), self.extension)
        };

        match self.kind {
            LayoutKind::Flat => self.root.join("records").join(file_name),
            LayoutKind::Grouped => {
                let group = group_key.map(sanitize_key).unwrap_or_else(|| NO_GROUP.to_string());
                self.root
                    .join("threads")
                    .join(shard(&group))
                    .join(group)
                    .join(file_name)
            }
        }
    }
}

/// Make a group key safe to use as a single path component.
pub fn sanitize_key(key: &str) -> String {
    let cleaned: String = key
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned.to_string()
    }
}

fn shard(group: &str) -> String {
    let mut shard: String = group.chars().take(2).collect();
    while shard.len() < 2 {
        shard.push('_');
    }
    shard
}
