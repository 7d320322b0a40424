pub mod catalog;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument};

use crate::volume::{validate_name, VolumeError, VolumeManager};

pub use catalog::{Catalog, VolumeKind, VolumeRecord};

const OPT_SOURCE: &str = "source";
const OPT_REMOTE: &str = "remote";

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("volume {0} not found")]
    NotFound(String),

    #[error("volume {0} already exists")]
    AlreadyExists(String),

    #[error("unsupported option {0:?}")]
    InvalidOption(String),

    #[error("overlay of {0} needs a remote host (opt remote= or replication.remote_host)")]
    MissingRemote(String),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error("plugin catalog: {0:#}")]
    Catalog(anyhow::Error),
}

/// What Docker gets back for Get and List.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeStatus {
    pub name: String,
    pub mountpoint: Option<PathBuf>,
    pub created_at: String,
}

/// Docker volume driver semantics on top of the volume manager.
pub struct VolumePlugin {
    volumes: Arc<VolumeManager>,
    catalog: AsyncMutex<Catalog>,
    default_remote: Option<String>,
    /// Mount ids per volume, for this process lifetime only.
    mounted: Mutex<HashMap<String, HashSet<String>>>,
}

impl VolumePlugin {
    pub fn new(volumes: Arc<VolumeManager>, catalog: Catalog, default_remote: Option<String>) -> Self {
        Self {
            volumes,
            catalog: AsyncMutex::new(catalog),
            default_remote,
            mounted: Mutex::new(HashMap::new()),
        }
    }

    async fn record(&self, name: &str) -> Result<VolumeRecord, PluginError> {
        self.catalog
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }

    fn mountpoint(&self, record: &VolumeRecord) -> PathBuf {
        match &record.kind {
            VolumeKind::Plain => self.volumes.active_path(&record.name),
            VolumeKind::Overlay { source, .. } => self.volumes.overlay_path(source, &record.name),
        }
    }

    async fn mounted_path(&self, record: &VolumeRecord) -> Option<PathBuf> {
        let path = self.mountpoint(record);
        tokio::fs::try_exists(&path)
            .await
            .unwrap_or(false)
            .then_some(path)
    }

    #[instrument(skip(self, opts))]
    pub async fn create(
        &self,
        name: &str,
        opts: HashMap<String, String>,
    ) -> Result<(), PluginError> {
        validate_name(name)?;
        if let Some(key) = opts.keys().find(|k| *k != OPT_SOURCE && *k != OPT_REMOTE) {
            return Err(PluginError::InvalidOption(key.clone()));
        }

        let kind = match opts.get(OPT_SOURCE) {
            Some(source) => {
                validate_name(source)?;
                let remote = opts
                    .get(OPT_REMOTE)
                    .cloned()
                    .or_else(|| self.default_remote.clone())
                    .ok_or_else(|| PluginError::MissingRemote(source.clone()))?;
                VolumeKind::Overlay {
                    source: source.clone(),
                    remote,
                }
            }
            None if opts.contains_key(OPT_REMOTE) => {
                return Err(PluginError::InvalidOption(OPT_REMOTE.to_string()))
            }
            None => VolumeKind::Plain,
        };

        let mut catalog = self.catalog.lock().await;
        if catalog.contains(name) {
            return Err(PluginError::AlreadyExists(name.to_string()));
        }
        catalog.insert(VolumeRecord {
            name: name.to_string(),
            kind: kind.clone(),
            created_at: Utc::now(),
        });
        if let Err(e) = catalog.save().await {
            catalog.remove(name);
            return Err(PluginError::Catalog(e));
        }
        info!(volume = name, kind = ?kind, "plugin volume created");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn mount(&self, name: &str, id: &str) -> Result<PathBuf, PluginError> {
        let record = self.record(name).await?;

        let path = match &record.kind {
            VolumeKind::Plain => {
                let shared = self
                    .mounted
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .get(name)
                    .is_some_and(|ids| ids.iter().any(|other| other != id));
                match self.mounted_path(&record).await {
                    // Another container has it mounted; swapping the active
                    // subvolume would pull it out from under them.
                    Some(active) if shared => active,
                    _ => self.volumes.activate(name, None).await?,
                }
            }
            VolumeKind::Overlay { source, remote } => {
                if self.volumes.overlay_exists(source, name).await {
                    self.volumes.overlay_path(source, name)
                } else {
                    let snapshot = self.volumes.fetch(source, remote).await?;
                    self.volumes.overlay(source, name, Some(snapshot.id)).await?
                }
            }
        };

        self.mounted
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(name.to_string())
            .or_default()
            .insert(id.to_string());
        debug!(volume = name, id, path = %path.display(), "plugin volume mounted");
        Ok(path)
    }

    /// Deactivation is left to `remove` so repeated mounts stay cheap.
    pub async fn unmount(&self, name: &str, id: &str) -> Result<(), PluginError> {
        self.record(name).await?;
        let mut mounted = self.mounted.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(ids) = mounted.get_mut(name) {
            ids.remove(id);
            if ids.is_empty() {
                mounted.remove(name);
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn remove(&self, name: &str) -> Result<(), PluginError> {
        let record = self.record(name).await?;
        match &record.kind {
            VolumeKind::Overlay { source, .. } => self.volumes.remove_overlay(source, name).await?,
            VolumeKind::Plain => {
                self.volumes.snapshot(name).await?;
            }
        }

        let mut catalog = self.catalog.lock().await;
        let removed = catalog.remove(name);
        if let Err(e) = catalog.save().await {
            if let Some(record) = removed {
                catalog.insert(record);
            }
            return Err(PluginError::Catalog(e));
        }
        self.mounted
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name);
        info!(volume = name, "plugin volume removed");
        Ok(())
    }

    pub async fn path(&self, name: &str) -> Result<Option<PathBuf>, PluginError> {
        let record = self.record(name).await?;
        Ok(self.mounted_path(&record).await)
    }

    pub async fn get(&self, name: &str) -> Result<VolumeStatus, PluginError> {
        let record = self.record(name).await?;
        Ok(self.status(&record).await)
    }

    pub async fn list(&self) -> Vec<VolumeStatus> {
        let records: Vec<VolumeRecord> = self.catalog.lock().await.list().cloned().collect();
        let mut out = Vec::with_capacity(records.len());
        for record in &records {
            out.push(self.status(record).await);
        }
        out
    }

    async fn status(&self, record: &VolumeRecord) -> VolumeStatus {
        VolumeStatus {
            name: record.name.clone(),
            mountpoint: self.mounted_path(record).await,
            created_at: record.created_at.to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::tests::harness;

    fn opts(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_create_mount_remove_plain() {
        let h = harness();
        let plugin = VolumePlugin::new(h.volumes.clone(), Catalog::in_memory(), None);

        plugin.create("home-a", HashMap::new()).await.unwrap();
        assert!(plugin.path("home-a").await.unwrap().is_none());

        let path = plugin.mount("home-a", "c1").await.unwrap();
        assert_eq!(path, h.volumes.active_path("home-a"));
        std::fs::write(path.join("f"), "x").unwrap();
        assert_eq!(plugin.get("home-a").await.unwrap().mountpoint, Some(path.clone()));

        plugin.unmount("home-a", "c1").await.unwrap();
        plugin.remove("home-a").await.unwrap();
        // Flushed to a snapshot but left active.
        assert_eq!(h.volumes.snapshots("home-a").await.unwrap().len(), 1);
        assert!(h.volumes.is_active("home-a").await);
        assert!(matches!(
            plugin.get("home-a").await,
            Err(PluginError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_create() {
        let h = harness();
        let plugin = VolumePlugin::new(h.volumes.clone(), Catalog::in_memory(), None);
        plugin.create("v", HashMap::new()).await.unwrap();
        assert!(matches!(
            plugin.create("v", HashMap::new()).await,
            Err(PluginError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_options() {
        let h = harness();
        let plugin = VolumePlugin::new(h.volumes.clone(), Catalog::in_memory(), None);
        assert!(matches!(
            plugin.create("v", opts(&[("size", "1G")])).await,
            Err(PluginError::InvalidOption(k)) if k == "size"
        ));
        assert!(matches!(
            plugin.create("v", opts(&[("source", "home-a")])).await,
            Err(PluginError::MissingRemote(_))
        ));
        assert!(matches!(
            plugin.create("v", opts(&[("remote", "h:1")])).await,
            Err(PluginError::InvalidOption(_))
        ));
        assert_eq!(plugin.list().await.len(), 0);
    }

    #[tokio::test]
    async fn test_overlay_uses_default_remote() {
        let h = harness();
        let plugin = VolumePlugin::new(
            h.volumes.clone(),
            Catalog::in_memory(),
            Some("10.0.0.9:8787".to_string()),
        );
        plugin
            .create("branch", opts(&[("source", "home-a")]))
            .await
            .unwrap();
        let record = plugin.record("branch").await.unwrap();
        assert_eq!(
            record.kind,
            VolumeKind::Overlay {
                source: "home-a".to_string(),
                remote: "10.0.0.9:8787".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_existing_overlay_mounts_without_fetch() {
        let h = harness();
        h.volumes.activate("home-a", None).await.unwrap();
        h.volumes.deactivate("home-a").await.unwrap();
        h.volumes.overlay("home-a", "branch", None).await.unwrap();

        // Unroutable remote: any fetch attempt would fail.
        let plugin = VolumePlugin::new(h.volumes.clone(), Catalog::in_memory(), None);
        plugin
            .create("branch", opts(&[("source", "home-a"), ("remote", "127.0.0.1:1")]))
            .await
            .unwrap();
        let path = plugin.mount("branch", "c1").await.unwrap();
        assert_eq!(path, h.volumes.overlay_path("home-a", "branch"));

        plugin.remove("branch").await.unwrap();
        assert!(!h.volumes.overlay_exists("home-a", "branch").await);
    }

    #[tokio::test]
    async fn test_second_container_shares_active_volume() {
        let h = harness();
        let plugin = VolumePlugin::new(h.volumes.clone(), Catalog::in_memory(), None);
        plugin.create("home-a", HashMap::new()).await.unwrap();
        let path = plugin.mount("home-a", "c1").await.unwrap();
        std::fs::write(path.join("live"), "unsnapshotted").unwrap();

        plugin.mount("home-a", "c2").await.unwrap();
        // No capture-and-replace happened underneath c1.
        assert!(h.volumes.snapshots("home-a").await.unwrap().is_empty());
        assert!(path.join("live").exists());
    }

    #[tokio::test]
    async fn test_unknown_volume_errors() {
        let h = harness();
        let plugin = VolumePlugin::new(h.volumes.clone(), Catalog::in_memory(), None);
        let err = plugin.mount("ghost", "c1").await.unwrap_err();
        assert_eq!(err.to_string(), "volume ghost not found");
        assert!(plugin.unmount("ghost", "c1").await.is_err());
        assert!(plugin.remove("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_catalog_survives_restart() {
        let h = harness();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin.json");

        let plugin = VolumePlugin::new(
            h.volumes.clone(),
            Catalog::load(&path).await.unwrap(),
            None,
        );
        plugin.create("home-a", HashMap::new()).await.unwrap();
        drop(plugin);

        let plugin = VolumePlugin::new(
            h.volumes.clone(),
            Catalog::load(&path).await.unwrap(),
            None,
        );
        assert_eq!(plugin.list().await[0].name, "home-a");
    }
}
