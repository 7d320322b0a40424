use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// How a plugin volume is backed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum VolumeKind {
    /// The volume manager volume of the same name, activated on mount.
    Plain,
    /// A local overlay of `source`, whose snapshots are pulled from `remote`.
    Overlay { source: String, remote: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub name: String,
    pub kind: VolumeKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    volumes: Vec<VolumeRecord>,
}

/// Volumes Docker has created through the plugin, persisted so the
/// references survive daemon restarts.
#[derive(Debug, Default)]
pub struct Catalog {
    path: Option<PathBuf>,
    records: BTreeMap<String, VolumeRecord>,
}

impl Catalog {
    /// Catalog that is never written to disk.
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path`; a missing file is an empty catalog.
    pub async fn load(path: &Path) -> Result<Self> {
        let records = match tokio::fs::read(path).await {
            Ok(data) => {
                let file: CatalogFile = serde_json::from_slice(&data)
                    .with_context(|| format!("parsing plugin catalog {}", path.display()))?;
                file.volumes
                    .into_iter()
                    .map(|r| (r.name.clone(), r))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no plugin catalog yet");
                BTreeMap::new()
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("reading plugin catalog {}", path.display()))
            }
        };
        info!(path = %path.display(), volumes = records.len(), "plugin catalog loaded");
        Ok(Self {
            path: Some(path.to_path_buf()),
            records,
        })
    }

    pub async fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = CatalogFile {
            volumes: self.records.values().cloned().collect(),
        };
        let data = serde_json::to_vec_pretty(&file).context("serializing plugin catalog")?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        // Write to temp file then rename (atomic on same filesystem)
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &data)
            .await
            .with_context(|| format!("writing temp catalog file: {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, path)
            .await
            .with_context(|| format!("renaming catalog file into place: {}", path.display()))?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&VolumeRecord> {
        self.records.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn insert(&mut self, record: VolumeRecord) {
        self.records.insert(record.name.clone(), record);
    }

    pub fn remove(&mut self, name: &str) -> Option<VolumeRecord> {
        self.records.remove(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &VolumeRecord> {
        self.records.values()
    }
}
