use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{ContainerMount, ContainerRuntime, ExecOutput, RuntimeError, SandboxSpec};

/// Drives the Docker engine through the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl DockerCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn spawn_error(&self, source: std::io::Error) -> RuntimeError {
        RuntimeError::Spawn {
            binary: self.binary.display().to_string(),
            source,
        }
    }

    /// Run a docker command, optionally feeding `stdin`, and capture its
    /// output without judging the exit status.
    async fn output<I, S>(&self, args: I, stdin: Option<Vec<u8>>) -> Result<ExecOutput, RuntimeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        debug!(args = ?args, "running docker command");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&data).await.map_err(|e| self.spawn_error(e))?;
            pipe.shutdown().await.map_err(|e| self.spawn_error(e))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| self.spawn_error(e))?;
        Ok(ExecOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn run_checked<I, S>(
        &self,
        op: &'static str,
        args: I,
        stdin: Option<Vec<u8>>,
    ) -> Result<String, RuntimeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let output = self.output(args, stdin).await?;
        if !output.success() {
            return Err(RuntimeError::Command {
                op,
                code: output.code,
                stderr: output.stderr,
            });
        }
        Ok(output.stdout)
    }

    /// `docker version` reachability probe for `check`.
    pub async fn server_version(&self) -> Result<String, RuntimeError> {
        let out = self
            .run_checked(
                "version",
                ["version", "--format", "{{.Server.Version}}"],
                None,
            )
            .await?;
        Ok(out.trim().to_string())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    /// Runs: `docker rm --force {name}`
    #[instrument(skip(self))]
    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        let output = self.output(["rm", "--force", name], None).await?;
        if output.success() || is_missing(&output.stderr) {
            return Ok(());
        }
        Err(RuntimeError::Command {
            op: "rm",
            code: output.code,
            stderr: output.stderr,
        })
    }

    #[instrument(skip(self, spec), fields(name = %spec.name))]
    async fn run(&self, spec: &SandboxSpec) -> Result<String, RuntimeError> {
        let out = self.run_checked("run", spec.to_args(), None).await?;
        let id = out.trim().to_string();
        if id.is_empty() {
            return Err(RuntimeError::Output {
                op: "run",
                detail: "no container id printed".to_string(),
            });
        }
        Ok(id)
    }

    /// Runs: `docker inspect --format '{{json .Mounts}}' {name}`
    async fn mounts(&self, name: &str) -> Result<Vec<ContainerMount>, RuntimeError> {
        let out = self
            .run_checked(
                "inspect",
                ["inspect", "--format", "{{json .Mounts}}", name],
                None,
            )
            .await?;
        parse_mounts(&out)
    }

    #[instrument(skip(self, stdin))]
    async fn exec(
        &self,
        name: &str,
        cmd: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput, RuntimeError> {
        let mut args = vec!["exec".to_string()];
        if stdin.is_some() {
            args.push("--interactive".to_string());
        }
        args.extend(["--user".to_string(), "root".to_string(), name.to_string()]);
        args.extend(cmd.iter().cloned());
        self.output(args, stdin).await
    }

    /// Runs: `docker cp - {name}:{dest}` with the archive on stdin.
    #[instrument(skip(self, archive), fields(bytes = archive.len()))]
    async fn copy_in(&self, name: &str, dest: &Path, archive: Vec<u8>) -> Result<(), RuntimeError> {
        let target = format!("{name}:{}", dest.display());
        self.run_checked("cp", ["cp", "-", target.as_str()], Some(archive))
            .await?;
        Ok(())
    }
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such container")
}

pub(crate) fn parse_mounts(out: &str) -> Result<Vec<ContainerMount>, RuntimeError> {
    let out = out.trim();
    if out.is_empty() || out == "null" {
        return Ok(Vec::new());
    }
    serde_json::from_str(out).map_err(|e| RuntimeError::Output {
        op: "inspect",
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mounts_bind() {
        let mounts = parse_mounts(
            r#"[{"Type":"bind","Source":"/v/home-1/active","Destination":"/home/hacker","Mode":"","RW":true,"Propagation":"shared"}]
"#,
        )
        .unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].kind, "bind");
        assert_eq!(mounts[0].propagation, "shared");
        assert!(mounts[0].rw);
    }

    #[test]
    fn test_parse_mounts_empty() {
        assert!(parse_mounts("[]").unwrap().is_empty());
        assert!(parse_mounts("null\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_mounts_garbage() {
        assert!(matches!(
            parse_mounts("Template parsing error"),
            Err(RuntimeError::Output { op: "inspect", .. })
        ));
    }

    #[test]
    fn test_missing_container_detection() {
        assert!(is_missing("Error response from daemon: No such container: user_1"));
        assert!(!is_missing("permission denied"));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let docker = DockerCli::new("/nonexistent/docker-binary");
        let err = docker.remove("user_1").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Spawn { .. }));
    }
}
