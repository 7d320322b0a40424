pub mod btrfs;
#[cfg(test)]
pub(crate) mod memory;

use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::AsyncRead;

pub use btrfs::Btrfs;

/// A snapshot delta stream, either produced by [`SnapshotStore::send`] or
/// received from a remote host.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Errors from the snapshot store. Carry the failing operation, the path it
/// was applied to and whatever the filesystem tool printed.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{op} failed for {}: {stderr}", .path.display())]
    Command {
        op: &'static str,
        path: PathBuf,
        stderr: String,
    },

    #[error("{} is busy", .path.display())]
    Busy { path: PathBuf },

    #[error("failed to run {op}: {source}")]
    Spawn {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed snapshot stream: {0}")]
    Malformed(String),
}

/// One record of a metadata-only diff between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub command: String,
    pub path: String,
}

impl ChangeRecord {
    pub fn new(command: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            path: path.into(),
        }
    }
}

/// Copy-on-write subvolume primitives the volume manager is built on.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn create_subvolume(&self, path: &Path) -> Result<(), StoreError>;

    async fn snapshot_subvolume(
        &self,
        src: &Path,
        dst: &Path,
        readonly: bool,
    ) -> Result<(), StoreError>;

    async fn delete_subvolume(&self, path: &Path) -> Result<(), StoreError>;

    /// Metadata-only change list from `a` to `b`.
    async fn diff(&self, a: &Path, b: &Path) -> Result<Vec<ChangeRecord>, StoreError>;

    /// Serialize `path`, as a delta against `parent` when given.
    async fn send(&self, path: &Path, parent: Option<&Path>) -> Result<ByteStream, StoreError>;

    /// Materialize a stream under `dest_dir`; returns the new subvolume path.
    async fn receive(&self, stream: ByteStream, dest_dir: &Path) -> Result<PathBuf, StoreError>;

    async fn set_quota(&self, path: &Path, size: &str) -> Result<(), StoreError>;
}

/// Header commands that open a stream and name the snapshot root.
const HEADER_COMMANDS: [&str; 2] = ["snapshot", "subvol"];

/// Number of diff records that touch anything other than the snapshot root.
///
/// An unchanged tree still produces the stream header and a `utimes` on the
/// root directory; neither counts as a change.
pub fn changes_beyond_root(records: &[ChangeRecord]) -> usize {
    let root = records
        .iter()
        .find(|r| HEADER_COMMANDS.contains(&r.command.as_str()))
        .map(|r| r.path.trim_end_matches('/'))
        .unwrap_or(".");

    records
        .iter()
        .filter(|r| !HEADER_COMMANDS.contains(&r.command.as_str()))
        .filter(|r| !(r.command == "utimes" && r.path.trim_end_matches('/') == root))
        .count()
}

pub fn is_unchanged(records: &[ChangeRecord]) -> bool {
    changes_beyond_root(records) == 0
}
