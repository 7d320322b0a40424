pub mod docker;
#[cfg(test)]
pub(crate) mod fake;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use workspaced_protocol::StartRequest;

use crate::config::SandboxConfig;

pub use docker::DockerCli;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("docker {op} failed (exit {code:?}): {stderr}")]
    Command {
        op: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unexpected docker {op} output: {detail}")]
    Output { op: &'static str, detail: String },
}

/// Where the user's home comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HomeMount {
    /// Named volume resolved by a volume driver plugin.
    Volume { name: String, driver: String },
    /// Host path bind mounted with shared propagation.
    Bind { source: PathBuf },
}

/// Everything `docker run` needs to create one hardened sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub network: String,
    pub extra_hosts: BTreeMap<String, String>,
    pub memory: String,
    pub pids_limit: u32,
    pub cpus: Option<f64>,
    pub cap_add: Vec<String>,
    pub seccomp_profile: Option<PathBuf>,
    pub home: HomeMount,
    pub home_target: PathBuf,
}

impl SandboxSpec {
    pub fn new(
        config: &SandboxConfig,
        name: String,
        request: &StartRequest,
        home: HomeMount,
        auth_token: &str,
    ) -> Self {
        let mode = if request.practice {
            "privileged"
        } else {
            "standard"
        };
        let labels = [
            ("dojo.dojo_id", request.dojo_ref.as_str()),
            ("dojo.module_id", request.module_ref.as_str()),
            ("dojo.challenge_id", request.challenge_ref.as_str()),
            ("dojo.user_id", request.user_id.as_str()),
            ("dojo.mode", mode),
            ("dojo.auth_token", auth_token),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let env = BTreeMap::from([("DOJO_AUTH_TOKEN".to_string(), auth_token.to_string())]);

        let network = if request.internet {
            config.internet_network.clone()
        } else {
            config.isolated_network.clone()
        };

        Self {
            name,
            image: request.image.clone().unwrap_or_else(|| config.image.clone()),
            command: config.command.clone(),
            labels,
            env,
            network,
            extra_hosts: config.extra_hosts.clone(),
            memory: config.memory.clone(),
            pids_limit: config.pids_limit,
            cpus: config.cpus,
            cap_add: config.cap_add.clone(),
            seccomp_profile: config.seccomp_profile.clone(),
            home,
            home_target: config.home_mount.clone(),
        }
    }

    fn mount_arg(&self) -> String {
        let target = self.home_target.display();
        match &self.home {
            HomeMount::Volume { name, driver } => format!(
                "type=volume,source={name},destination={target},volume-driver={driver}"
            ),
            HomeMount::Bind { source } => format!(
                "type=bind,source={},destination={target},bind-propagation=shared",
                source.display()
            ),
        }
    }

    /// `docker run` arguments, without the binary.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--init".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "--hostname".to_string(),
            "workspace".to_string(),
        ];
        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &self.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }

        args.push("--memory".to_string());
        args.push(self.memory.clone());
        args.push("--pids-limit".to_string());
        args.push(self.pids_limit.to_string());
        if let Some(cpus) = self.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }

        args.push("--cap-drop".to_string());
        args.push("ALL".to_string());
        for cap in &self.cap_add {
            args.push("--cap-add".to_string());
            args.push(cap.clone());
        }
        if let Some(profile) = &self.seccomp_profile {
            args.push("--security-opt".to_string());
            args.push(format!("seccomp={}", profile.display()));
        }

        args.push("--network".to_string());
        args.push(self.network.clone());
        for (host, ip) in &self.extra_hosts {
            args.push("--add-host".to_string());
            args.push(format!("{host}:{ip}"));
        }

        args.push("--mount".to_string());
        args.push(self.mount_arg());

        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// One entry of `docker inspect --format '{{json .Mounts}}'`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerMount {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub source: String,
    pub destination: PathBuf,
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(rename = "RW", default)]
    pub rw: bool,
    #[serde(default)]
    pub propagation: String,
}

/// Check that the home mount landed where and how it was requested.
/// Returns the reason on mismatch.
pub fn verify_home_mount(spec: &SandboxSpec, mounts: &[ContainerMount]) -> Result<(), String> {
    let target = spec.home_target.as_path();
    let mount = mounts
        .iter()
        .find(|m| m.destination == target)
        .ok_or_else(|| format!("nothing mounted at {}", target.display()))?;

    if !mount.rw {
        return Err(format!("{} is mounted read-only", target.display()));
    }

    match &spec.home {
        HomeMount::Volume { name, driver } => {
            if mount.kind != "volume" {
                return Err(format!("expected a volume mount, found {}", mount.kind));
            }
            if mount.name.as_deref() != Some(name.as_str()) {
                return Err(format!(
                    "expected volume {name}, found {}",
                    mount.name.as_deref().unwrap_or("<none>")
                ));
            }
            if mount.driver.as_deref() != Some(driver.as_str()) {
                return Err(format!(
                    "expected driver {driver}, found {}",
                    mount.driver.as_deref().unwrap_or("<none>")
                ));
            }
        }
        HomeMount::Bind { source } => {
            if mount.kind != "bind" {
                return Err(format!("expected a bind mount, found {}", mount.kind));
            }
            if Path::new(&mount.source) != source.as_path() {
                return Err(format!(
                    "expected source {}, found {}",
                    source.display(),
                    mount.source
                ));
            }
            if mount.propagation != "shared" {
                return Err(format!(
                    "expected shared propagation, found {:?}",
                    mount.propagation
                ));
            }
        }
    }
    Ok(())
}

/// Output of a command run inside a sandbox.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// The container runtime the worker drives.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Force-remove `name`. Succeeds if it does not exist.
    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;

    /// Create and start a container; returns its id.
    async fn run(&self, spec: &SandboxSpec) -> Result<String, RuntimeError>;

    async fn mounts(&self, name: &str) -> Result<Vec<ContainerMount>, RuntimeError>;

    /// Run `cmd` as root inside `name`, feeding `stdin` if given.
    async fn exec(
        &self,
        name: &str,
        cmd: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput, RuntimeError>;

    /// Extract the tar archive `archive` into `dest` inside `name`.
    async fn copy_in(&self, name: &str, dest: &Path, archive: Vec<u8>) -> Result<(), RuntimeError>;
}
