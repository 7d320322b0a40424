use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the workspaced daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub coord: CoordConfig,
    pub lock: LockConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub replication: ReplicationConfig,
    pub sandbox: SandboxConfig,
    pub secrets: SecretsConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub(crate) fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.worker.max_attempts >= 1, "worker.max_attempts must be >= 1");
        anyhow::ensure!(self.worker.concurrency >= 1, "worker.concurrency must be >= 1");
        anyhow::ensure!(
            self.worker.attempt_timeout_secs >= 1,
            "worker.attempt_timeout_secs must be >= 1"
        );
        anyhow::ensure!(self.lock.user_ttl_secs >= 3, "lock.user_ttl_secs must be >= 3");
        anyhow::ensure!(self.lock.volume_ttl_secs >= 1, "lock.volume_ttl_secs must be >= 1");
        anyhow::ensure!(self.lock.poll_interval_ms >= 1, "lock.poll_interval_ms must be >= 1");
        anyhow::ensure!(self.queue.block_ms >= 1, "queue.block_ms must be >= 1");
        anyhow::ensure!(self.queue.autoclaim_batch >= 1, "queue.autoclaim_batch must be >= 1");
        anyhow::ensure!(!self.queue.stream.is_empty(), "queue.stream must not be empty");
        anyhow::ensure!(!self.queue.group.is_empty(), "queue.group must not be empty");
        // A live worker's message must never look stale to another worker.
        anyhow::ensure!(
            self.queue.autoclaim_idle() > self.worker.max_job_duration(),
            "queue.autoclaim_idle_secs ({}) must exceed the longest possible job ({}s = max_attempts x (attempt_timeout_secs + backoff_secs))",
            self.queue.autoclaim_idle_secs,
            self.worker.max_job_duration().as_secs()
        );
        anyhow::ensure!(
            self.sandbox.home_mount.is_absolute(),
            "sandbox.home_mount must be an absolute path"
        );
        anyhow::ensure!(
            !self.sandbox.image.is_empty(),
            "sandbox.image must not be empty"
        );
        if let Some(driver) = &self.sandbox.volume_driver {
            anyhow::ensure!(!driver.is_empty(), "sandbox.volume_driver must not be empty when set");
        }
        if let Some(url) = &self.coord.redis_url {
            anyhow::ensure!(
                url.starts_with("redis://") || url.starts_with("rediss://") || url.starts_with("redis+unix://"),
                "coord.redis_url must be a redis:// URL"
            );
        }
        Ok(())
    }

    /// Secrets are optional for `check` but required to serve.
    pub fn require_secrets(&self) -> Result<()> {
        anyhow::ensure!(
            !self.secrets.volume_name_key.is_empty(),
            "secrets.volume_name_key must be set"
        );
        anyhow::ensure!(!self.secrets.flag_key.is_empty(), "secrets.flag_key must be set");
        Ok(())
    }
}

/// HTTP listeners and local state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Node API: replication, start submission, metrics.
    pub bind_addr: SocketAddr,
    /// Unix socket Docker connects to for the volume driver.
    pub plugin_socket: PathBuf,
    /// Catalog of volumes Docker created through the plugin.
    pub plugin_state_file: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8787)),
            plugin_socket: PathBuf::from("/run/docker/plugins/workspaced.sock"),
            plugin_state_file: PathBuf::from("/var/lib/workspaced/plugin-volumes.json"),
        }
    }
}

/// Snapshot-capable filesystem holding the volumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Must live on a btrfs filesystem with quotas enabled when `quota` is set.
    pub volumes_root: PathBuf,
    pub btrfs_binary: PathBuf,
    /// Size cap applied to every activated volume (btrfs qgroup syntax).
    pub quota: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            volumes_root: PathBuf::from("/var/lib/workspaced/volumes"),
            btrfs_binary: PathBuf::from("btrfs"),
            quota: Some("10G".to_string()),
        }
    }
}

/// Shared coordination backend. Without a URL the daemon coordinates only
/// with itself, which is fine for a single node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordConfig {
    pub redis_url: Option<String>,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            redis_url: Some("redis://127.0.0.1:6379".to_string()),
        }
    }
}

/// Distributed lock timings.
///
/// The user lock is renewed every third of its TTL while a job runs, so the
/// TTL only bounds how long a crashed worker blocks that user. 120s covers two
/// missed renewals plus a full sandbox creation (typically under 30s).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub volume_ttl_secs: u64,
    /// How long `activate` waits for a busy volume.
    pub volume_wait_secs: u64,
    pub user_ttl_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            volume_ttl_secs: 60,
            volume_wait_secs: 30,
            user_ttl_secs: 120,
            poll_interval_ms: 100,
        }
    }
}

impl LockConfig {
    pub fn volume_ttl(&self) -> Duration {
        Duration::from_secs(self.volume_ttl_secs)
    }

    pub fn volume_wait(&self) -> Duration {
        Duration::from_secs(self.volume_wait_secs)
    }

    pub fn user_ttl(&self) -> Duration {
        Duration::from_secs(self.user_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Start queue and status records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub stream: String,
    pub group: String,
    pub block_ms: u64,
    pub autoclaim_interval_secs: u64,
    /// Pending messages idle this long are assumed abandoned.
    pub autoclaim_idle_secs: u64,
    pub autoclaim_batch: usize,
    pub status_ttl_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stream: "workspace:start".to_string(),
            group: "workspace-workers".to_string(),
            block_ms: 5_000,
            autoclaim_interval_secs: 30,
            autoclaim_idle_secs: 1_200,
            autoclaim_batch: 10,
            status_ttl_secs: 3_600,
        }
    }
}

impl QueueConfig {
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn autoclaim_interval(&self) -> Duration {
        Duration::from_secs(self.autoclaim_interval_secs)
    }

    pub fn autoclaim_idle(&self) -> Duration {
        Duration::from_secs(self.autoclaim_idle_secs)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker tasks per process.
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_secs: u64,
    pub attempt_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            backoff_secs: 2,
            attempt_timeout_secs: 300,
        }
    }
}

impl WorkerConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn max_job_duration(&self) -> Duration {
        (self.attempt_timeout() + self.backoff()) * self.max_attempts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Default `host:port` overlay volumes pull their source from.
    pub remote_host: Option<String>,
    pub connect_timeout_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            remote_host: None,
            connect_timeout_secs: 5,
        }
    }
}

/// Hardened sandbox container settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub docker_binary: PathBuf,
    pub image: String,
    /// Long-running command the container idles in.
    pub command: Vec<String>,
    pub home_mount: PathBuf,
    /// When set, the home volume is mounted through this Docker volume
    /// driver instead of a direct bind mount.
    pub volume_driver: Option<String>,
    pub isolated_network: String,
    pub internet_network: String,
    pub seccomp_profile: Option<PathBuf>,
    pub memory: String,
    pub pids_limit: u32,
    pub cpus: Option<f64>,
    pub cap_add: Vec<String>,
    /// Deterministic /etc/hosts entries.
    pub extra_hosts: BTreeMap<String, String>,
    /// `{challenges_root}/{dojo}/{module}/{challenge}` is copied into the sandbox.
    pub challenges_root: PathBuf,
    pub challenge_mount: PathBuf,
    pub hacker_uid: u32,
    pub init_command: Vec<String>,
    pub flag_prefix: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let extra_hosts = [
            ("challenge.localhost", "127.0.0.1"),
            ("hacker.localhost", "127.0.0.1"),
            ("dojo-user", "127.0.0.1"),
        ]
        .into_iter()
        .map(|(host, ip)| (host.to_string(), ip.to_string()))
        .collect();

        Self {
            docker_binary: PathBuf::from("docker"),
            image: "pwncollege/challenge-simple".to_string(),
            command: vec!["/bin/sleep".to_string(), "6h".to_string()],
            home_mount: PathBuf::from("/home/hacker"),
            volume_driver: None,
            isolated_network: "workspace_isolated".to_string(),
            internet_network: "workspace_internet".to_string(),
            seccomp_profile: None,
            memory: "4g".to_string(),
            pids_limit: 1024,
            cpus: None,
            cap_add: ["SYS_PTRACE", "SETUID", "SETGID", "CHOWN", "DAC_OVERRIDE", "FOWNER", "KILL"]
                .into_iter()
                .map(String::from)
                .collect(),
            extra_hosts,
            challenges_root: PathBuf::from("/var/lib/workspaced/challenges"),
            challenge_mount: PathBuf::from("/challenge"),
            hacker_uid: 1000,
            init_command: vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()],
            flag_prefix: "pwn.college".to_string(),
        }
    }
}

/// Keys for the derived names and flags. Never logged.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    pub volume_name_key: String,
    pub flag_key: String,
}

impl std::fmt::Debug for SecretsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsConfig")
            .field("volume_name_key", &"<redacted>")
            .field("flag_key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load_str(content: &str) -> Result<Config> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        Config::load(file.path())
    }

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(config.worker.max_attempts, 3);
        assert_eq!(config.lock.user_ttl_secs, 120);
        assert_eq!(config.queue.stream, "workspace:start");
        assert_eq!(config.sandbox.home_mount, PathBuf::from("/home/hacker"));
        assert!(config.sandbox.volume_driver.is_none());
        assert_eq!(config.sandbox.extra_hosts["dojo-user"], "127.0.0.1");
    }

    #[test]
    fn config_default_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn config_default_has_no_secrets() {
        assert!(Config::default().require_secrets().is_err());
    }

    #[test]
    fn config_load_from_toml() {
        let config = load_str(
            r#"
[storage]
volumes_root = "/srv/homes"
quota = "2G"

[worker]
max_attempts = 5
attempt_timeout_secs = 60

[sandbox]
volume_driver = "workspaced"

[secrets]
volume_name_key = "k1"
flag_key = "k2"
"#,
        )
        .unwrap();
        assert_eq!(config.storage.volumes_root, PathBuf::from("/srv/homes"));
        assert_eq!(config.storage.quota.as_deref(), Some("2G"));
        assert_eq!(config.worker.max_attempts, 5);
        assert_eq!(config.sandbox.volume_driver.as_deref(), Some("workspaced"));
        // Unset fields use defaults
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.lock.volume_wait_secs, 30);
        assert!(config.require_secrets().is_ok());
    }

    #[test]
    fn config_validation_rejects_zero_attempts() {
        let err = load_str("[worker]\nmax_attempts = 0\n").unwrap_err();
        assert!(format!("{err:#}").contains("max_attempts"));
    }

    #[test]
    fn config_validation_rejects_short_autoclaim_idle() {
        let mut config = Config::default();
        config.queue.autoclaim_idle_secs = 60;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("autoclaim_idle_secs"));
    }

    #[test]
    fn config_validation_rejects_relative_home() {
        let mut config = Config::default();
        config.sandbox.home_mount = PathBuf::from("home/hacker");
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_bad_redis_url() {
        let mut config = Config::default();
        config.coord.redis_url = Some("localhost:6379".into());
        assert!(config.validate().is_err());
        config.coord.redis_url = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_max_job_duration() {
        let worker = WorkerConfig {
            concurrency: 1,
            max_attempts: 3,
            backoff_secs: 2,
            attempt_timeout_secs: 100,
        };
        assert_eq!(worker.max_job_duration(), Duration::from_secs(306));
    }

    #[test]
    fn config_secrets_debug_is_redacted() {
        let secrets = SecretsConfig {
            volume_name_key: "hunter2".into(),
            flag_key: "hunter3".into(),
        };
        let shown = format!("{secrets:?}");
        assert!(!shown.contains("hunter"));
    }

    #[test]
    fn config_serde_roundtrip() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.queue.group, config.queue.group);
        assert_eq!(parsed.sandbox.cap_add, config.sandbox.cap_add);
    }
}
