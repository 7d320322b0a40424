//! Directory-backed stand-in for btrfs, used by unit tests. Subvolumes are
//! plain directories, snapshots are recursive copies and send streams are
//! tar archives.

use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use super::{ByteStream, ChangeRecord, SnapshotStore, StoreError};

#[derive(Default)]
pub(crate) struct DirStore {
    readonly: Mutex<HashSet<PathBuf>>,
    /// (path, parent) of every send, in call order.
    pub(crate) sends: Mutex<Vec<(PathBuf, Option<PathBuf>)>>,
    pub(crate) quotas: Mutex<Vec<(PathBuf, String)>>,
}

impl DirStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_readonly(&self, path: &Path) -> bool {
        self.readonly.lock().unwrap().contains(path)
    }
}

fn command_error(op: &'static str, path: &Path, stderr: impl Into<String>) -> StoreError {
    StoreError::Command {
        op,
        path: path.to_path_buf(),
        stderr: stderr.into(),
    }
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

/// Relative path -> file contents (None for directories).
fn walk(root: &Path) -> std::io::Result<BTreeMap<PathBuf, Option<Vec<u8>>>> {
    fn visit(
        root: &Path,
        dir: &Path,
        out: &mut BTreeMap<PathBuf, Option<Vec<u8>>>,
    ) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let rel = entry
                .path()
                .strip_prefix(root)
                .map(Path::to_path_buf)
                .unwrap_or_default();
            if entry.file_type()?.is_dir() {
                out.insert(rel, None);
                visit(root, &entry.path(), out)?;
            } else {
                out.insert(rel, Some(std::fs::read(entry.path())?));
            }
        }
        Ok(())
    }
    let mut out = BTreeMap::new();
    visit(root, root, &mut out)?;
    Ok(out)
}

#[async_trait]
impl SnapshotStore for DirStore {
    async fn create_subvolume(&self, path: &Path) -> Result<(), StoreError> {
        if path.exists() {
            return Err(command_error("subvolume create", path, "target exists"));
        }
        std::fs::create_dir_all(path)
            .map_err(|e| command_error("subvolume create", path, e.to_string()))
    }

    async fn snapshot_subvolume(
        &self,
        src: &Path,
        dst: &Path,
        readonly: bool,
    ) -> Result<(), StoreError> {
        if !src.is_dir() {
            return Err(command_error("subvolume snapshot", src, "not a subvolume"));
        }
        if dst.exists() {
            return Err(command_error("subvolume snapshot", dst, "target exists"));
        }
        copy_tree(src, dst).map_err(|e| command_error("subvolume snapshot", dst, e.to_string()))?;
        if readonly {
            self.readonly.lock().unwrap().insert(dst.to_path_buf());
        }
        Ok(())
    }

    async fn delete_subvolume(&self, path: &Path) -> Result<(), StoreError> {
        if !path.is_dir() {
            return Err(command_error("subvolume delete", path, "not a subvolume"));
        }
        std::fs::remove_dir_all(path)
            .map_err(|e| command_error("subvolume delete", path, e.to_string()))?;
        self.readonly.lock().unwrap().remove(path);
        Ok(())
    }

    async fn diff(&self, a: &Path, b: &Path) -> Result<Vec<ChangeRecord>, StoreError> {
        let before = walk(a).map_err(|e| command_error("send", a, e.to_string()))?;
        let after = walk(b).map_err(|e| command_error("send", b, e.to_string()))?;
        let root = format!(
            "./{}",
            b.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        );

        let mut records = vec![
            ChangeRecord::new("snapshot", root.clone()),
            ChangeRecord::new("utimes", format!("{root}/")),
        ];
        for (path, content) in &after {
            match before.get(path) {
                Some(old) if old == content => {}
                _ => records.push(ChangeRecord::new(
                    "update",
                    format!("{root}/{}", path.display()),
                )),
            }
        }
        for path in before.keys().filter(|p| !after.contains_key(*p)) {
            records.push(ChangeRecord::new(
                "unlink",
                format!("{root}/{}", path.display()),
            ));
        }
        Ok(records)
    }

    async fn send(&self, path: &Path, parent: Option<&Path>) -> Result<ByteStream, StoreError> {
        self.sends
            .lock()
            .unwrap()
            .push((path.to_path_buf(), parent.map(Path::to_path_buf)));

        let name = path
            .file_name()
            .ok_or_else(|| command_error("send", path, "no file name"))?;
        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append_dir_all(name, path)
            .map_err(|e| command_error("send", path, e.to_string()))?;
        let bytes = builder
            .into_inner()
            .map_err(|e| command_error("send", path, e.to_string()))?;
        Ok(Box::pin(Cursor::new(bytes)))
    }

    async fn receive(&self, mut stream: ByteStream, dest_dir: &Path) -> Result<PathBuf, StoreError> {
        let mut bytes = Vec::new();
        stream
            .read_to_end(&mut bytes)
            .await
            .map_err(|e| StoreError::Malformed(e.to_string()))?;

        let mut archive = tar::Archive::new(Cursor::new(&bytes));
        let mut top = None;
        for entry in archive
            .entries()
            .map_err(|e| StoreError::Malformed(e.to_string()))?
        {
            let entry = entry.map_err(|e| StoreError::Malformed(e.to_string()))?;
            let path = entry
                .path()
                .map_err(|e| StoreError::Malformed(e.to_string()))?;
            if let Some(Component::Normal(first)) = path.components().next() {
                top = Some(first.to_os_string());
                break;
            }
        }
        let top = top.ok_or_else(|| StoreError::Malformed("empty stream".into()))?;
        if dest_dir.join(&top).exists() {
            return Err(command_error("receive", dest_dir, "target exists"));
        }

        tar::Archive::new(Cursor::new(&bytes))
            .unpack(dest_dir)
            .map_err(|e| command_error("receive", dest_dir, e.to_string()))?;

        let received = dest_dir.join(top);
        self.readonly.lock().unwrap().insert(received.clone());
        Ok(received)
    }

    async fn set_quota(&self, path: &Path, size: &str) -> Result<(), StoreError> {
        self.quotas
            .lock()
            .unwrap()
            .push((path.to_path_buf(), size.to_string()));
        Ok(())
    }
}
