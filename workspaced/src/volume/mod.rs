pub mod snapshot;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use tokio::sync::RwLock;
use tokio_util::io::StreamReader;
use tracing::{debug, info, instrument, warn};

use workspaced_protocol::SNAPSHOT_PARENTS_HEADER;

use crate::config::Config;
use crate::lock::{LockError, LockHandle, LockService};
use crate::metrics::{FetchResult, MetricsRegistry, SnapshotResult};
use crate::storage::{changes_beyond_root, is_unchanged, ByteStream, SnapshotStore, StoreError};

pub use snapshot::{Snapshot, SnapshotId, SnapshotIndex};

const MAX_NAME_LEN: usize = 128;
const RECEIVING_PREFIX: &str = ".receiving-";

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered {status}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("{url} did not name the snapshot it sent")]
    MissingSnapshotId { url: String },

    #[error("{url} answered not-modified but nothing is held locally")]
    NothingLocal { url: String },
}

#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    #[error("invalid volume name {0:?}")]
    InvalidName(String),

    #[error("volume {volume} has no snapshot {id}")]
    UnknownSnapshot { volume: String, id: SnapshotId },

    #[error("volume {0} has no snapshots")]
    NoSnapshots(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error("volume filesystem: {0}")]
    Io(#[from] std::io::Error),
}

/// Lock key guarding one volume's on-disk state.
pub fn volume_lock_key(name: &str) -> String {
    format!("volume:{name}")
}

/// Volume and overlay names become path components: no separators, no
/// leading dot.
pub fn validate_name(name: &str) -> Result<(), VolumeError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(VolumeError::InvalidName(name.to_string()))
    }
}

pub fn format_etag(id: SnapshotId) -> String {
    format!("\"{id}\"")
}

pub fn parse_etag(value: &str) -> Option<SnapshotId> {
    let value = value.trim();
    let value = value.strip_prefix("W/").unwrap_or(value);
    value.trim_matches('"').parse().ok()
}

fn now_millis() -> SnapshotId {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Manages copy-on-write volumes under one root directory.
///
/// Layout per volume:
///
/// ```text
/// {root}/{name}/active              writable, present iff the volume is active
/// {root}/{name}/snapshots/{id}      read-only, ids strictly increasing
/// {root}/{name}/overlays/{overlay}  writable branches of a snapshot
/// ```
///
/// Locking discipline: every mutation of `active` or `snapshots/` happens
/// under the shared `volume:{name}` lock. `snapshot` never waits for that
/// lock; under contention it serves the latest existing snapshot. The
/// in-memory indexes are only a cache of the `snapshots/` listings.
pub struct VolumeManager {
    root: PathBuf,
    store: Arc<dyn SnapshotStore>,
    locks: LockService,
    quota: Option<String>,
    lock_ttl: Duration,
    lock_wait: Duration,
    http: reqwest::Client,
    indexes: RwLock<HashMap<String, SnapshotIndex>>,
    metrics: MetricsRegistry,
}

impl VolumeManager {
    pub fn new(
        config: &Config,
        store: Arc<dyn SnapshotStore>,
        locks: LockService,
        metrics: MetricsRegistry,
    ) -> Result<Self, VolumeError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(
                config.replication.connect_timeout_secs,
            ))
            .build()
            .map_err(|source| ReplicationError::Http {
                url: String::new(),
                source,
            })?;

        Ok(Self {
            root: config.storage.volumes_root.clone(),
            store,
            locks,
            quota: config.storage.quota.clone(),
            lock_ttl: config.lock.volume_ttl(),
            lock_wait: config.lock.volume_wait(),
            http,
            indexes: RwLock::new(HashMap::new()),
            metrics,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn volume_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn active_path(&self, name: &str) -> PathBuf {
        self.volume_dir(name).join("active")
    }

    pub fn snapshots_dir(&self, name: &str) -> PathBuf {
        self.volume_dir(name).join("snapshots")
    }

    pub fn overlay_path(&self, name: &str, overlay: &str) -> PathBuf {
        self.volume_dir(name).join("overlays").join(overlay)
    }

    /// Rebuild every volume's snapshot index from disk. Called once at
    /// startup; returns the number of volumes found.
    pub async fn load(&self) -> Result<usize, VolumeError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let mut found = HashMap::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_name(&name).is_err() || !entry.file_type().await?.is_dir() {
                continue;
            }
            self.discard_stale_receives(&name).await?;
            let index = SnapshotIndex::scan(&self.snapshots_dir(&name)).await?;
            found.insert(name, index);
        }
        let count = found.len();
        *self.indexes.write().await = found;
        info!(root = %self.root.display(), volumes = count, "volume indexes loaded");
        Ok(count)
    }

    /// Staging dirs left by a receive interrupted by a crash.
    async fn discard_stale_receives(&self, name: &str) -> Result<(), VolumeError> {
        let mut entries = match tokio::fs::read_dir(self.snapshots_dir(name)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with(RECEIVING_PREFIX) {
                warn!(volume = name, dir = %entry.path().display(), "discarding interrupted receive");
                self.discard_staging(&entry.path()).await;
            }
        }
        Ok(())
    }

    async fn index(&self, name: &str) -> Result<SnapshotIndex, VolumeError> {
        if let Some(index) = self.indexes.read().await.get(name) {
            return Ok(index.clone());
        }
        let scanned = SnapshotIndex::scan(&self.snapshots_dir(name)).await?;
        let mut indexes = self.indexes.write().await;
        Ok(indexes.entry(name.to_string()).or_insert(scanned).clone())
    }

    async fn record_snapshot(&self, name: &str, snapshot: &Snapshot) -> Result<(), VolumeError> {
        // Make sure the cache exists so the insert is not lost to a later scan.
        self.index(name).await?;
        if let Some(index) = self.indexes.write().await.get_mut(name) {
            index.insert(snapshot.id, snapshot.path.clone());
        }
        Ok(())
    }

    pub async fn is_active(&self, name: &str) -> bool {
        exists(&self.active_path(name)).await
    }

    pub async fn latest(&self, name: &str) -> Result<Option<Snapshot>, VolumeError> {
        validate_name(name)?;
        Ok(self.index(name).await?.latest())
    }

    /// Snapshot ids, oldest first.
    pub async fn snapshots(&self, name: &str) -> Result<Vec<SnapshotId>, VolumeError> {
        validate_name(name)?;
        Ok(self.index(name).await?.ids())
    }

    pub async fn overlay_exists(&self, name: &str, overlay: &str) -> bool {
        exists(&self.overlay_path(name, overlay)).await
    }

    async fn ensure_layout(&self, name: &str) -> Result<(), VolumeError> {
        tokio::fs::create_dir_all(self.snapshots_dir(name)).await?;
        tokio::fs::create_dir_all(self.volume_dir(name).join("overlays")).await?;
        Ok(())
    }

    async fn release(&self, lock: &LockHandle) {
        if let Err(e) = self.locks.release(lock).await {
            warn!(key = lock.key(), error = %e, "failed to release volume lock");
        }
    }

    /// Make `name` writable at `{root}/{name}/active`, cloned from
    /// `from` or the latest snapshot, or empty for a new volume.
    ///
    /// An already active subvolume is captured as a snapshot before it is
    /// replaced, so unsnapshotted writes are never dropped.
    #[instrument(skip(self))]
    pub async fn activate(
        &self,
        name: &str,
        from: Option<SnapshotId>,
    ) -> Result<PathBuf, VolumeError> {
        validate_name(name)?;
        self.ensure_layout(name).await?;

        let lock = self
            .locks
            .acquire(&volume_lock_key(name), self.lock_ttl, self.lock_wait)
            .await?;
        let result = self.activate_locked(name, from).await;
        self.release(&lock).await;
        result
    }

    async fn activate_locked(
        &self,
        name: &str,
        from: Option<SnapshotId>,
    ) -> Result<PathBuf, VolumeError> {
        if let Some(id) = from {
            if !self.index(name).await?.contains(id) {
                return Err(VolumeError::UnknownSnapshot {
                    volume: name.to_string(),
                    id,
                });
            }
        }

        let active = self.active_path(name);
        if exists(&active).await {
            self.snapshot_locked(name).await?;
            self.store.delete_subvolume(&active).await?;
            info!(volume = name, "captured and removed previous active subvolume");
        }

        let index = self.index(name).await?;
        let source = match from {
            Some(id) => index.get(id),
            None => index.latest(),
        };
        match &source {
            Some(snapshot) => {
                self.store
                    .snapshot_subvolume(&snapshot.path, &active, false)
                    .await?
            }
            None => self.store.create_subvolume(&active).await?,
        }

        if let Some(quota) = &self.quota {
            self.store.set_quota(&active, quota).await?;
        }

        info!(
            volume = name,
            from = ?source.as_ref().map(|s| s.id),
            "volume activated"
        );
        Ok(active)
    }

    /// Snapshot and remove the active subvolume. `None` if the volume was not
    /// active.
    #[instrument(skip(self))]
    pub async fn deactivate(&self, name: &str) -> Result<Option<Snapshot>, VolumeError> {
        validate_name(name)?;
        let lock = self
            .locks
            .acquire(&volume_lock_key(name), self.lock_ttl, self.lock_wait)
            .await?;
        let result = self.deactivate_locked(name).await;
        self.release(&lock).await;
        result
    }

    async fn deactivate_locked(&self, name: &str) -> Result<Option<Snapshot>, VolumeError> {
        let active = self.active_path(name);
        if !exists(&active).await {
            debug!(volume = name, "deactivate: volume not active");
            return Ok(None);
        }
        let snapshot = self.snapshot_locked(name).await?;
        self.store.delete_subvolume(&active).await?;
        info!(volume = name, id = ?snapshot.as_ref().map(|s| s.id), "volume deactivated");
        Ok(snapshot)
    }

    /// The latest consistent snapshot of `name`, taking a new one if the
    /// active subvolume changed since the last.
    ///
    /// Never blocks: if another operation holds the volume, the latest
    /// existing snapshot is returned instead. A cold volume with no
    /// snapshots gets an empty baseline so it can always be replicated.
    #[instrument(skip(self))]
    pub async fn snapshot(&self, name: &str) -> Result<Option<Snapshot>, VolumeError> {
        validate_name(name)?;

        if !self.is_active(name).await {
            if let Some(latest) = self.index(name).await?.latest() {
                return Ok(Some(latest));
            }
            return self.create_baseline(name).await;
        }

        let lock = match self
            .locks
            .try_acquire(&volume_lock_key(name), self.lock_ttl)
            .await
        {
            Ok(lock) => lock,
            Err(LockError::Busy { .. }) => {
                debug!(volume = name, "volume busy, serving latest existing snapshot");
                self.metrics.record_snapshot(SnapshotResult::Fallback);
                return Ok(self.index(name).await?.latest());
            }
            Err(e) => return Err(e.into()),
        };
        let result = self.snapshot_locked(name).await;
        self.release(&lock).await;
        result
    }

    async fn snapshot_locked(&self, name: &str) -> Result<Option<Snapshot>, VolumeError> {
        let index = self.index(name).await?;
        let previous = index.latest();
        let active = self.active_path(name);
        if !exists(&active).await {
            return Ok(previous);
        }

        let id = index.next_id(now_millis());
        let path = self.snapshots_dir(name).join(id.to_string());
        self.store.snapshot_subvolume(&active, &path, true).await?;

        if let Some(prev) = &previous {
            match self.store.diff(&prev.path, &path).await {
                Ok(records) if is_unchanged(&records) => {
                    match self.store.delete_subvolume(&path).await {
                        Ok(()) => {
                            debug!(volume = name, id = prev.id, "no changes since previous snapshot");
                            self.metrics.record_snapshot(SnapshotResult::Unchanged);
                            return Ok(previous);
                        }
                        Err(e) => {
                            warn!(volume = name, id, error = %e, "failed to discard unchanged snapshot, keeping it");
                        }
                    }
                }
                Ok(records) => {
                    debug!(volume = name, changes = changes_beyond_root(&records), "snapshot has changes");
                }
                Err(e) => {
                    warn!(volume = name, id, error = %e, "diff failed, keeping new snapshot");
                }
            }
        }

        let snapshot = Snapshot { id, path };
        self.record_snapshot(name, &snapshot).await?;
        self.metrics.record_snapshot(SnapshotResult::Created);
        info!(volume = name, id, "snapshot created");
        Ok(Some(snapshot))
    }

    /// Empty read-only snapshot for a volume that was never written.
    async fn create_baseline(&self, name: &str) -> Result<Option<Snapshot>, VolumeError> {
        self.ensure_layout(name).await?;
        let lock = match self
            .locks
            .try_acquire(&volume_lock_key(name), self.lock_ttl)
            .await
        {
            Ok(lock) => lock,
            Err(LockError::Busy { .. }) => return Ok(self.index(name).await?.latest()),
            Err(e) => return Err(e.into()),
        };
        let result = self.create_baseline_locked(name).await;
        self.release(&lock).await;
        result
    }

    async fn create_baseline_locked(&self, name: &str) -> Result<Option<Snapshot>, VolumeError> {
        // Activated or replicated while we waited.
        if self.is_active(name).await {
            return self.snapshot_locked(name).await;
        }
        let index = self.index(name).await?;
        if let Some(latest) = index.latest() {
            return Ok(Some(latest));
        }

        let id = index.next_id(now_millis());
        let scratch = self.snapshots_dir(name).join(format!(".baseline-{id}"));
        let path = self.snapshots_dir(name).join(id.to_string());
        self.store.create_subvolume(&scratch).await?;
        let created = self.store.snapshot_subvolume(&scratch, &path, true).await;
        if let Err(e) = self.store.delete_subvolume(&scratch).await {
            warn!(path = %scratch.display(), error = %e, "failed to remove baseline scratch subvolume");
        }
        created?;

        let snapshot = Snapshot { id, path };
        self.record_snapshot(name, &snapshot).await?;
        self.metrics.record_snapshot(SnapshotResult::Baseline);
        info!(volume = name, id, "baseline snapshot created");
        Ok(Some(snapshot))
    }

    /// Writable branch `overlay` of `name`, replacing any previous one.
    #[instrument(skip(self))]
    pub async fn overlay(
        &self,
        name: &str,
        overlay: &str,
        from: Option<SnapshotId>,
    ) -> Result<PathBuf, VolumeError> {
        validate_name(name)?;
        validate_name(overlay)?;

        let source = match from {
            Some(id) => self
                .index(name)
                .await?
                .get(id)
                .ok_or_else(|| VolumeError::UnknownSnapshot {
                    volume: name.to_string(),
                    id,
                })?,
            None => self
                .snapshot(name)
                .await?
                .ok_or_else(|| VolumeError::NoSnapshots(name.to_string()))?,
        };

        self.ensure_layout(name).await?;
        let path = self.overlay_path(name, overlay);
        if exists(&path).await {
            self.store.delete_subvolume(&path).await?;
        }
        self.store
            .snapshot_subvolume(&source.path, &path, false)
            .await?;

        info!(volume = name, overlay, from = source.id, "overlay created");
        Ok(path)
    }

    #[instrument(skip(self))]
    pub async fn remove_overlay(&self, name: &str, overlay: &str) -> Result<(), VolumeError> {
        validate_name(name)?;
        validate_name(overlay)?;
        let path = self.overlay_path(name, overlay);
        if !exists(&path).await {
            return Ok(());
        }
        self.store.delete_subvolume(&path).await?;
        info!(volume = name, overlay, "overlay removed");
        Ok(())
    }

    /// Stream snapshot `id` (default: latest), as a delta against the newest
    /// of `known_parents` present here.
    #[instrument(skip(self))]
    pub async fn send(
        &self,
        name: &str,
        id: Option<SnapshotId>,
        known_parents: &[SnapshotId],
    ) -> Result<(Snapshot, ByteStream), VolumeError> {
        validate_name(name)?;
        let index = self.index(name).await?;
        let snapshot = match id {
            Some(id) => index.get(id).ok_or_else(|| VolumeError::UnknownSnapshot {
                volume: name.to_string(),
                id,
            })?,
            None => index
                .latest()
                .ok_or_else(|| VolumeError::NoSnapshots(name.to_string()))?,
        };
        let parent = index
            .newest_known(known_parents, snapshot.id)
            .and_then(|p| index.get(p));

        let stream = self
            .store
            .send(&snapshot.path, parent.as_ref().map(|p| p.path.as_path()))
            .await?;
        info!(
            volume = name,
            id = snapshot.id,
            parent = ?parent.as_ref().map(|p| p.id),
            "sending snapshot"
        );
        Ok((snapshot, stream))
    }

    /// Materialize a snapshot stream into `name`'s snapshots.
    ///
    /// The stream is received under a `.receiving-*` directory and moved into
    /// `snapshots/` only once complete, so a failed or cut-off transfer never
    /// becomes a snapshot id.
    #[instrument(skip(self, stream))]
    pub async fn receive(&self, name: &str, stream: ByteStream) -> Result<Snapshot, VolumeError> {
        validate_name(name)?;
        self.ensure_layout(name).await?;
        let snapshots = self.snapshots_dir(name);
        let staging = snapshots.join(format!("{RECEIVING_PREFIX}{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&staging).await?;

        let received = match self.store.receive(stream, &staging).await {
            Ok(path) => path,
            Err(e) => {
                warn!(volume = name, error = %e, "receive failed, discarding partial subvolume");
                self.discard_staging(&staging).await;
                return Err(e.into());
            }
        };

        let id = received
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<SnapshotId>().ok());
        let Some(id) = id else {
            self.discard_staging(&staging).await;
            return Err(StoreError::Malformed(format!(
                "received subvolume {} is not named by a snapshot id",
                received.display()
            ))
            .into());
        };
        let path = snapshots.join(id.to_string());
        if tokio::fs::try_exists(&path).await? {
            self.discard_staging(&staging).await;
            return Err(StoreError::Command {
                op: "receive",
                path,
                stderr: "snapshot already exists".to_string(),
            }
            .into());
        }
        tokio::fs::rename(&received, &path).await?;
        if let Err(e) = tokio::fs::remove_dir(&staging).await {
            warn!(dir = %staging.display(), error = %e, "failed to remove receive staging dir");
        }

        let snapshot = Snapshot { id, path };
        self.record_snapshot(name, &snapshot).await?;
        info!(volume = name, id, "snapshot received");
        Ok(snapshot)
    }

    /// Delete whatever a receive left under `staging`, then the directory.
    async fn discard_staging(&self, staging: &Path) {
        if let Ok(mut entries) = tokio::fs::read_dir(staging).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if let Err(e) = self.store.delete_subvolume(&path).await {
                    warn!(path = %path.display(), error = %e, "failed to delete partial subvolume");
                }
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %staging.display(), error = %e, "failed to remove receive staging dir");
            }
        }
    }

    /// Pull the latest snapshot of `name` from `remote` (`host:port`),
    /// transferring only what is not already held locally.
    #[instrument(skip(self))]
    pub async fn fetch(&self, name: &str, remote: &str) -> Result<Snapshot, VolumeError> {
        validate_name(name)?;
        let url = format!("http://{remote}/volume/{name}");
        let index = self.index(name).await?;
        let local = index.latest();

        let mut request = self.http.get(&url);
        if let Some(local) = &local {
            let parents = index
                .ids()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            request = request
                .header(IF_NONE_MATCH, format_etag(local.id))
                .header(SNAPSHOT_PARENTS_HEADER, parents);
        }

        let response = request
            .send()
            .await
            .map_err(|source| ReplicationError::Http {
                url: url.clone(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_MODIFIED => {
                let local = local.ok_or(ReplicationError::NothingLocal { url })?;
                debug!(volume = name, id = local.id, "remote has nothing newer");
                self.metrics.record_fetch(FetchResult::NotModified);
                Ok(local)
            }
            StatusCode::OK => {
                let id = response
                    .headers()
                    .get(ETAG)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_etag)
                    .ok_or_else(|| ReplicationError::MissingSnapshotId { url: url.clone() })?;

                if let Some(existing) = index.get(id) {
                    debug!(volume = name, id, "remote snapshot already present");
                    self.metrics.record_fetch(FetchResult::AlreadyPresent);
                    return Ok(existing);
                }

                let body = response.bytes_stream().map_err(std::io::Error::other);
                let stream: ByteStream = Box::pin(StreamReader::new(body));
                let snapshot = self.receive(name, stream).await?;
                if snapshot.id != id {
                    warn!(volume = name, expected = id, got = snapshot.id, "received snapshot id differs from etag");
                }
                self.metrics.record_fetch(FetchResult::Received);
                Ok(snapshot)
            }
            status => Err(ReplicationError::UnexpectedStatus {
                url,
                status: status.as_u16(),
            }
            .into()),
        }
    }
}
