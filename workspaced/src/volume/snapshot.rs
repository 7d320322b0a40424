use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Snapshot identity within a volume: wall-clock milliseconds, forced to be
/// strictly increasing per volume.
pub type SnapshotId = u64;

/// A read-only snapshot of one volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub path: PathBuf,
}

/// Ordered index of the snapshots of a single volume.
///
/// The subvolumes on disk are the source of truth; this index is rebuilt from
/// the `snapshots/` directory listing and kept in step with every create and
/// delete the volume manager performs. Each snapshot's implicit parent is the
/// entry before it.
#[derive(Debug, Clone, Default)]
pub struct SnapshotIndex {
    snapshots: BTreeMap<SnapshotId, PathBuf>,
}

impl SnapshotIndex {
    pub fn new() -> Self {
        Self {
            snapshots: BTreeMap::new(),
        }
    }

    /// Rebuild from a `snapshots/` directory. Entries whose name is not a
    /// snapshot id (temporaries, stray files) are ignored. A missing directory
    /// yields an empty index.
    pub async fn scan(dir: &Path) -> std::io::Result<Self> {
        let mut index = Self::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<SnapshotId>().ok())
            else {
                continue;
            };
            if entry.file_type().await?.is_dir() {
                index.insert(id, entry.path());
            }
        }
        Ok(index)
    }

    pub fn insert(&mut self, id: SnapshotId, path: PathBuf) {
        self.snapshots.insert(id, path);
    }

    pub fn remove(&mut self, id: SnapshotId) -> Option<PathBuf> {
        self.snapshots.remove(&id)
    }

    pub fn get(&self, id: SnapshotId) -> Option<Snapshot> {
        self.snapshots.get(&id).map(|path| Snapshot {
            id,
            path: path.clone(),
        })
    }

    pub fn contains(&self, id: SnapshotId) -> bool {
        self.snapshots.contains_key(&id)
    }

    pub fn latest(&self) -> Option<Snapshot> {
        self.snapshots.last_key_value().map(|(id, path)| Snapshot {
            id: *id,
            path: path.clone(),
        })
    }

    /// The snapshot immediately preceding `id`.
    pub fn parent_of(&self, id: SnapshotId) -> Option<SnapshotId> {
        self.snapshots.range(..id).next_back().map(|(id, _)| *id)
    }

    /// All ids, oldest first.
    pub fn ids(&self) -> Vec<SnapshotId> {
        self.snapshots.keys().copied().collect()
    }

    /// Newest of `candidates` that is present here, excluding `except`.
    pub fn newest_known(&self, candidates: &[SnapshotId], except: SnapshotId) -> Option<SnapshotId> {
        candidates
            .iter()
            .copied()
            .filter(|id| *id != except && self.contains(*id))
            .max()
    }

    /// Id for a new snapshot taken at `now_ms`: never less than or equal to
    /// the current latest, even if the clock went backwards.
    pub fn next_id(&self, now_ms: SnapshotId) -> SnapshotId {
        match self.snapshots.last_key_value() {
            Some((latest, _)) => now_ms.max(latest + 1),
            None => now_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(ids: &[SnapshotId]) -> SnapshotIndex {
        let mut index = SnapshotIndex::new();
        for id in ids {
            index.insert(*id, PathBuf::from(format!("/v/snapshots/{id}")));
        }
        index
    }

    #[test]
    fn snapshot_index_new_is_empty() {
        let index = SnapshotIndex::new();
        assert!(index.is_empty());
        assert_eq!(index.len(), 0);
        assert!(index.latest().is_none());
    }

    #[test]
    fn snapshot_index_latest_is_highest_id() {
        let index = index_of(&[30, 10, 20]);
        let latest = index.latest().unwrap();
        assert_eq!(latest.id, 30);
        assert_eq!(latest.path, PathBuf::from("/v/snapshots/30"));
        assert_eq!(index.ids(), vec![10, 20, 30]);
    }

    #[test]
    fn snapshot_index_remove() {
        let mut index = index_of(&[1, 2]);
        assert!(index.remove(2).is_some());
        assert!(index.remove(2).is_none());
        assert_eq!(index.latest().unwrap().id, 1);
    }

    #[test]
    fn snapshot_index_parent_chain() {
        let index = index_of(&[5, 9, 12]);
        assert_eq!(index.parent_of(12), Some(9));
        assert_eq!(index.parent_of(9), Some(5));
        assert_eq!(index.parent_of(5), None);
    }

    #[test]
    fn snapshot_index_next_id_uses_clock() {
        let index = index_of(&[100]);
        assert_eq!(index.next_id(250), 250);
    }

    #[test]
    fn snapshot_index_next_id_survives_clock_skew() {
        let index = index_of(&[1_000]);
        assert_eq!(index.next_id(900), 1_001);
        assert_eq!(index.next_id(1_000), 1_001);
        assert_eq!(SnapshotIndex::new().next_id(42), 42);
    }

    #[test]
    fn snapshot_index_newest_known() {
        let index = index_of(&[10, 20, 30]);
        assert_eq!(index.newest_known(&[10, 20, 99], 30), Some(20));
        assert_eq!(index.newest_known(&[30], 30), None);
        assert_eq!(index.newest_known(&[], 30), None);
        assert_eq!(index.newest_known(&[1, 2], 30), None);
    }

    #[tokio::test]
    async fn snapshot_index_scan_ignores_non_ids() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("1700000000001")).unwrap();
        std::fs::create_dir(dir.path().join("1700000000002")).unwrap();
        std::fs::create_dir(dir.path().join(".tmp-3")).unwrap();
        std::fs::write(dir.path().join("1700000000009"), b"not a dir").unwrap();

        let index = SnapshotIndex::scan(dir.path()).await.unwrap();
        assert_eq!(index.ids(), vec![1700000000001, 1700000000002]);
    }

    #[tokio::test]
    async fn snapshot_index_scan_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let index = SnapshotIndex::scan(&dir.path().join("absent")).await.unwrap();
        assert!(index.is_empty());
    }
}
