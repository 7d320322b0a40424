use std::ffi::{OsStr, OsString};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::process::{ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use super::{ByteStream, ChangeRecord, SnapshotStore, StoreError};

/// Snapshot store backed by btrfs subvolumes. All operations shell out to
/// the `btrfs` CLI.
#[derive(Debug, Clone)]
pub struct Btrfs {
    binary: PathBuf,
}

impl Btrfs {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run a btrfs command and return its stdout.
    async fn run<I, S>(&self, op: &'static str, path: &Path, args: I) -> Result<String, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        debug!(args = ?args, "running btrfs command");

        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .map_err(|source| StoreError::Spawn { op, source })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("busy") {
                return Err(StoreError::Busy {
                    path: path.to_path_buf(),
                });
            }
            return Err(StoreError::Command {
                op,
                path: path.to_path_buf(),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl SnapshotStore for Btrfs {
    /// Runs: `btrfs subvolume create {path}`
    #[instrument(skip(self))]
    async fn create_subvolume(&self, path: &Path) -> Result<(), StoreError> {
        self.run(
            "subvolume create",
            path,
            [OsStr::new("subvolume"), OsStr::new("create"), path.as_os_str()],
        )
        .await?;
        Ok(())
    }

    /// Runs: `btrfs subvolume snapshot [-r] {src} {dst}`
    #[instrument(skip(self))]
    async fn snapshot_subvolume(
        &self,
        src: &Path,
        dst: &Path,
        readonly: bool,
    ) -> Result<(), StoreError> {
        self.run("subvolume snapshot", dst, snapshot_args(src, dst, readonly))
            .await?;
        Ok(())
    }

    /// Runs: `btrfs subvolume delete {path}`
    #[instrument(skip(self))]
    async fn delete_subvolume(&self, path: &Path) -> Result<(), StoreError> {
        self.run(
            "subvolume delete",
            path,
            [OsStr::new("subvolume"), OsStr::new("delete"), path.as_os_str()],
        )
        .await?;
        Ok(())
    }

    /// Runs: `btrfs send --no-data -p {a} {b} | btrfs receive --dump`
    #[instrument(skip(self))]
    async fn diff(&self, a: &Path, b: &Path) -> Result<Vec<ChangeRecord>, StoreError> {
        let mut send = Command::new(&self.binary)
            .args(send_args(b, Some(a), true))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StoreError::Spawn { op: "send", source })?;

        let send_stdout: Stdio = send
            .stdout
            .take()
            .ok_or_else(|| StoreError::Malformed("send produced no stdout".into()))?
            .try_into()
            .map_err(|source| StoreError::Spawn { op: "send", source })?;

        let dump = Command::new(&self.binary)
            .args(["receive", "--dump"])
            .stdin(send_stdout)
            .output()
            .await
            .map_err(|source| StoreError::Spawn {
                op: "receive --dump",
                source,
            })?;

        let send_output = send
            .wait_with_output()
            .await
            .map_err(|source| StoreError::Spawn { op: "send", source })?;

        if !send_output.status.success() {
            return Err(StoreError::Command {
                op: "send --no-data",
                path: b.to_path_buf(),
                stderr: String::from_utf8_lossy(&send_output.stderr).trim().to_string(),
            });
        }
        if !dump.status.success() {
            return Err(StoreError::Command {
                op: "receive --dump",
                path: b.to_path_buf(),
                stderr: String::from_utf8_lossy(&dump.stderr).trim().to_string(),
            });
        }

        Ok(parse_dump_output(&String::from_utf8_lossy(&dump.stdout)))
    }

    /// Runs: `btrfs send [-p {parent}] {path}` and hands back its stdout.
    /// A non-zero exit surfaces as an I/O error at the end of the stream.
    #[instrument(skip(self))]
    async fn send(&self, path: &Path, parent: Option<&Path>) -> Result<ByteStream, StoreError> {
        let mut child = Command::new(&self.binary)
            .args(send_args(path, parent, false))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StoreError::Spawn { op: "send", source })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StoreError::Malformed("send produced no stdout".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| StoreError::Malformed("send produced no stderr".into()))?;

        let exit = tokio::spawn(async move {
            let mut err = Vec::new();
            stderr.read_to_end(&mut err).await?;
            let status = child.wait().await?;
            Ok::<_, io::Error>((status, String::from_utf8_lossy(&err).trim().to_string()))
        });

        Ok(Box::pin(SendStream {
            stdout,
            exit: Some(exit),
        }))
    }

    /// Runs: `btrfs receive {dest_dir}` fed from `stream`.
    #[instrument(skip(self, stream))]
    async fn receive(&self, mut stream: ByteStream, dest_dir: &Path) -> Result<PathBuf, StoreError> {
        let mut child = Command::new(&self.binary)
            .arg("receive")
            .arg(dest_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StoreError::Spawn {
                op: "receive",
                source,
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| StoreError::Malformed("receive has no stdin".into()))?;
        let copied = tokio::io::copy(&mut stream, &mut stdin).await;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| StoreError::Spawn {
                op: "receive",
                source,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(StoreError::Command {
                op: "receive",
                path: dest_dir.to_path_buf(),
                stderr,
            });
        }
        if let Err(e) = copied {
            return Err(StoreError::Malformed(format!("stream interrupted: {e}")));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let name = parse_received_name(&stderr)
            .or_else(|| parse_received_name(&stdout))
            .ok_or_else(|| StoreError::Malformed(format!("no subvolume reported: {stderr}")))?;

        Ok(dest_dir.join(name))
    }

    /// Runs: `btrfs qgroup limit {size} {path}`
    #[instrument(skip(self))]
    async fn set_quota(&self, path: &Path, size: &str) -> Result<(), StoreError> {
        self.run(
            "qgroup limit",
            path,
            [
                OsStr::new("qgroup"),
                OsStr::new("limit"),
                OsStr::new(size),
                path.as_os_str(),
            ],
        )
        .await?;
        Ok(())
    }
}

/// stdout of a running `btrfs send`. The exit task owns the child, so
/// aborting it on drop kills the process.
struct SendStream {
    stdout: ChildStdout,
    exit: Option<JoinHandle<io::Result<(ExitStatus, String)>>>,
}

impl AsyncRead for SendStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.stdout).poll_read(cx, buf))?;
        if buf.filled().len() > before {
            return Poll::Ready(Ok(()));
        }

        // stdout is at EOF: the stream is only complete if send succeeded.
        let Some(exit) = self.exit.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let joined = ready!(Pin::new(exit).poll(cx));
        self.exit = None;
        Poll::Ready(match joined {
            Ok(Ok((status, _))) if status.success() => Ok(()),
            Ok(Ok((status, stderr))) => Err(io::Error::other(format!(
                "btrfs send exited with {status}: {stderr}"
            ))),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(io::Error::other(e)),
        })
    }
}

impl Drop for SendStream {
    fn drop(&mut self) {
        if let Some(exit) = self.exit.take() {
            exit.abort();
        }
    }
}

pub(crate) fn snapshot_args(src: &Path, dst: &Path, readonly: bool) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["subvolume".into(), "snapshot".into()];
    if readonly {
        args.push("-r".into());
    }
    args.push(src.into());
    args.push(dst.into());
    args
}

pub(crate) fn send_args(path: &Path, parent: Option<&Path>, no_data: bool) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["send".into()];
    if no_data {
        args.push("--no-data".into());
    }
    if let Some(parent) = parent {
        args.push("-p".into());
        args.push(parent.into());
    }
    args.push(path.into());
    args
}

/// Parse `btrfs receive --dump` output.
///
/// Each line is `{command} {path} [key=value ...]`, with whitespace and
/// backslashes inside the path escaped by a backslash.
pub(crate) fn parse_dump_output(output: &str) -> Vec<ChangeRecord> {
    let mut records = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((command, rest)) = line.split_once(char::is_whitespace) else {
            records.push(ChangeRecord::new(line, ""));
            continue;
        };
        records.push(ChangeRecord::new(command, unescape_path(rest.trim_start())));
    }
    records
}

fn unescape_path(rest: &str) -> String {
    let mut path = String::new();
    let mut chars = rest.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                if let Some(next) = chars.next() {
                    path.push(next);
                }
            }
            c if c.is_whitespace() => break,
            c => path.push(c),
        }
    }
    path
}

/// Extract the subvolume name from `At subvol X` / `At snapshot X`.
pub(crate) fn parse_received_name(output: &str) -> Option<String> {
    output.lines().rev().find_map(|line| {
        let line = line.trim();
        line.strip_prefix("At subvol ")
            .or_else(|| line.strip_prefix("At snapshot "))
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::changes_beyond_root;

    #[tokio::test]
    async fn test_failed_send_is_a_read_error() {
        let store = Btrfs::new("false");
        let mut stream = store
            .send(Path::new("/volumes/v1/snapshots/1"), None)
            .await
            .unwrap();
        let mut bytes = Vec::new();
        let err = stream.read_to_end(&mut bytes).await.unwrap_err();
        assert!(err.to_string().contains("btrfs send exited"), "{err}");
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn test_successful_send_streams_stdout() {
        // `echo` stands in for btrfs: it prints its arguments and exits 0.
        let store = Btrfs::new("echo");
        let mut stream = store
            .send(Path::new("/volumes/v1/snapshots/2"), Some(Path::new("/volumes/v1/snapshots/1")))
            .await
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out.trim(), "send -p /volumes/v1/snapshots/1 /volumes/v1/snapshots/2");
    }

    #[test]
    fn test_snapshot_args_readonly() {
        let args = snapshot_args(Path::new("/v/active"), Path::new("/v/snapshots/7"), true);
        assert_eq!(
            args,
            vec!["subvolume", "snapshot", "-r", "/v/active", "/v/snapshots/7"]
        );
    }

    #[test]
    fn test_snapshot_args_writable() {
        let args = snapshot_args(Path::new("/v/snapshots/7"), Path::new("/v/active"), false);
        assert!(!args.iter().any(|a| a == "-r"));
    }

    #[test]
    fn test_send_args_full_stream() {
        let args = send_args(Path::new("/v/snapshots/9"), None, false);
        assert_eq!(args, vec!["send", "/v/snapshots/9"]);
    }

    #[test]
    fn test_send_args_delta_metadata_only() {
        let args = send_args(
            Path::new("/v/snapshots/9"),
            Some(Path::new("/v/snapshots/8")),
            true,
        );
        assert_eq!(
            args,
            vec!["send", "--no-data", "-p", "/v/snapshots/8", "/v/snapshots/9"]
        );
    }

    #[test]
    fn test_parse_dump_unchanged_tree() {
        // Exactly what `btrfs receive --dump` prints for a snapshot of an
        // untouched subvolume: the header plus a root utimes.
        let output = "\
snapshot        ./1700000000002                 uuid=7c0a9f2e-2f43-4a4b-9a36-1b2d0b0bbbe1 transid=12 parent_uuid=1b1f0f3c-5a1e-4d8c-9b4b-4c7ce2fe2a10 parent_transid=11
utimes          ./1700000000002/                atime=2024-01-01T00:00:00+0000 mtime=2024-01-01T00:00:00+0000 ctime=2024-01-01T00:00:00+0000
";
        let records = parse_dump_output(output);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], ChangeRecord::new("snapshot", "./1700000000002"));
        assert_eq!(records[1].path, "./1700000000002/");
        assert_eq!(changes_beyond_root(&records), 0);
    }

    #[test]
    fn test_parse_dump_with_changes() {
        let output = "\
snapshot        ./1700000000003                 uuid=a transid=13 parent_uuid=b parent_transid=12
utimes          ./1700000000003/                atime=x mtime=y ctime=z
mkfile          ./1700000000003/o257-13-0
rename          ./1700000000003/o257-13-0       dest=./1700000000003/notes.txt
update_extent   ./1700000000003/notes.txt       offset=0 len=6
";
        let records = parse_dump_output(output);
        assert_eq!(records.len(), 5);
        assert_eq!(records[2].command, "mkfile");
        assert_eq!(changes_beyond_root(&records), 3);
    }

    #[test]
    fn test_parse_dump_escaped_path() {
        let records = parse_dump_output("mkfile          ./5/my\\ file.txt\n");
        assert_eq!(records, vec![ChangeRecord::new("mkfile", "./5/my file.txt")]);
    }

    #[test]
    fn test_parse_dump_empty() {
        assert!(parse_dump_output("").is_empty());
        assert!(parse_dump_output("\n\n").is_empty());
    }

    #[test]
    fn test_parse_received_name_subvol() {
        assert_eq!(
            parse_received_name("At subvol 1700000000004\n").as_deref(),
            Some("1700000000004")
        );
    }

    #[test]
    fn test_parse_received_name_snapshot() {
        let out = "At snapshot 1700000000005\n";
        assert_eq!(parse_received_name(out).as_deref(), Some("1700000000005"));
    }

    #[test]
    fn test_parse_received_name_missing() {
        assert!(parse_received_name("ERROR: short read from stream").is_none());
        assert!(parse_received_name("").is_none());
    }
}
