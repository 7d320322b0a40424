//! CLI-only subcommand implementations: `check` and `status`.
//!
//! These commands do not start the daemon. They are useful for debugging the
//! host environment before/after running `serve`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::coord::{Backend, RedisBackend};
use crate::sandbox::DockerCli;
use crate::status::StatusStore;

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    fix: Option<String>,
}

impl Check {
    fn pass(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, ok: true, detail: detail.into(), fix: None }
    }

    fn fail(label: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self { label, ok: false, detail: detail.into(), fix: Some(fix.into()) }
    }
}

/// Run `workspaced check`. Returns `Ok(())` if all checks pass, `Err` otherwise.
pub async fn run_check(config: &Config) -> Result<()> {
    println!("Checking prerequisites...\n");

    let checks = vec![
        check_btrfs(config).await,
        check_docker(config).await,
        check_writable_dir("Volumes root", &config.storage.volumes_root),
        check_writable_parent("Plugin state directory", &config.server.plugin_state_file),
        check_challenges(config),
        check_secrets(config),
        check_coord(config).await,
    ];

    for c in &checks {
        let icon = if c.ok { "\u{2713}" } else { "\u{2717}" };
        println!("  {} {} ({})", icon, c.label, c.detail);
        if !c.ok {
            if let Some(fix) = &c.fix {
                println!("    Fix: {}", fix);
            }
        }
    }

    println!();
    let failed = checks.iter().filter(|c| !c.ok).count();
    if failed == 0 {
        let config_hint = match std::env::current_exe() {
            Ok(exe) => format!("{} serve --config config.toml", exe.display()),
            Err(_) => "workspaced serve --config config.toml".to_string(),
        };
        println!("All checks passed. Run: {}", config_hint);
        Ok(())
    } else {
        anyhow::bail!("{} check(s) failed", failed)
    }
}

async fn check_btrfs(config: &Config) -> Check {
    let binary = &config.storage.btrfs_binary;
    match tokio::process::Command::new(binary).arg("--version").output().await {
        Ok(out) if out.status.success() => {
            let version = String::from_utf8_lossy(&out.stdout);
            let version = version
                .lines()
                .next()
                .unwrap_or("unknown")
                .trim()
                .to_string();
            Check::pass("btrfs", version)
        }
        Ok(out) => Check::fail(
            "btrfs",
            format!(
                "{} exited with error: {}",
                binary.display(),
                String::from_utf8_lossy(&out.stderr).trim()
            ),
            "Install btrfs tools: apt install btrfs-progs",
        ),
        Err(e) => Check::fail(
            "btrfs",
            format!("{} not found: {}", binary.display(), e),
            "Install btrfs tools: apt install btrfs-progs",
        ),
    }
}

async fn check_docker(config: &Config) -> Check {
    let docker = DockerCli::new(&config.sandbox.docker_binary);
    match docker.server_version().await {
        Ok(version) => Check::pass("Docker engine", version),
        Err(e) => Check::fail(
            "Docker engine",
            e.to_string(),
            "Start dockerd and make sure this user can reach /var/run/docker.sock",
        ),
    }
}

fn check_writable_dir(label: &'static str, dir: &Path) -> Check {
    if let Err(e) = std::fs::create_dir_all(dir) {
        return Check::fail(
            label,
            format!("{} does not exist and could not be created: {}", dir.display(), e),
            format!("mkdir -p {}", dir.display()),
        );
    }

    // Check writability by attempting to open a temp file
    let probe = dir.join(".workspaced-check");
    match std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&probe)
    {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            Check::pass(label, dir.display().to_string())
        }
        Err(e) => Check::fail(
            label,
            format!("{} is not writable: {}", dir.display(), e),
            format!("chmod u+w {} or run workspaced as a user with write access", dir.display()),
        ),
    }
}

fn check_writable_parent(label: &'static str, file: &Path) -> Check {
    match file.parent() {
        Some(parent) => check_writable_dir(label, parent),
        None => Check::fail(
            label,
            format!("{} has no parent directory", file.display()),
            "Use an absolute path",
        ),
    }
}

fn check_challenges(config: &Config) -> Check {
    let root = &config.sandbox.challenges_root;
    if root.is_dir() {
        Check::pass("Challenge files", root.display().to_string())
    } else {
        Check::fail(
            "Challenge files",
            format!("{} is not a directory", root.display()),
            "Set sandbox.challenges_root to the directory holding {dojo}/{module}/{challenge}",
        )
    }
}

fn check_secrets(config: &Config) -> Check {
    match config.require_secrets() {
        Ok(()) => Check::pass("Secrets", "volume_name_key, flag_key set"),
        Err(e) => Check::fail(
            "Secrets",
            format!("{e:#}"),
            "Set secrets.volume_name_key and secrets.flag_key to long random strings",
        ),
    }
}

async fn check_coord(config: &Config) -> Check {
    let Some(url) = &config.coord.redis_url else {
        return Check::pass("Coordination", "in-process (single node)");
    };
    let backend = match RedisBackend::connect(url).await {
        Ok(backend) => backend,
        Err(e) => {
            return Check::fail(
                "Coordination",
                format!("cannot connect to redis: {e}"),
                "Start redis or fix coord.redis_url",
            )
        }
    };
    match backend.ping().await {
        Ok(()) => Check::pass("Coordination", "redis reachable"),
        Err(e) => Check::fail(
            "Coordination",
            format!("redis ping failed: {e}"),
            "Check redis credentials in coord.redis_url",
        ),
    }
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

/// Run `workspaced status <start-id>`: print the job's status record as JSON.
pub async fn run_status(config: &Config, start_id: &str) -> Result<()> {
    let url = config
        .coord
        .redis_url
        .as_deref()
        .context("status needs coord.redis_url; the in-process backend lives only inside serve")?;
    let backend: Arc<dyn Backend> = Arc::new(
        RedisBackend::connect(url)
            .await
            .context("connecting to redis")?,
    );
    let statuses = StatusStore::new(backend, config.queue.status_ttl());
    let status = statuses
        .get(start_id)
        .await
        .with_context(|| format!("reading status of {start_id}"))?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Load a config from an optional path, falling back to defaults.
pub fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Ok(Config::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writable_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b");
        let check = check_writable_dir("Volumes root", &target);
        assert!(check.ok, "{}", check.detail);
        assert!(target.is_dir());
        assert!(!target.join(".workspaced-check").exists());
    }

    #[test]
    fn test_missing_secrets_fail() {
        let check = check_secrets(&Config::default());
        assert!(!check.ok);
        assert!(check.fix.is_some());
    }

    #[test]
    fn test_challenges_root_must_exist() {
        let mut config = Config::default();
        config.sandbox.challenges_root = PathBuf::from("/nonexistent/workspaced/challenges");
        assert!(!check_challenges(&config).ok);
    }

    #[tokio::test]
    async fn test_in_process_coord_passes() {
        let mut config = Config::default();
        config.coord.redis_url = None;
        assert!(check_coord(&config).await.ok);
    }

    #[tokio::test]
    async fn test_missing_btrfs_binary_fails() {
        let mut config = Config::default();
        config.storage.btrfs_binary = PathBuf::from("/nonexistent/btrfs");
        let check = check_btrfs(&config).await;
        assert!(!check.ok);
        assert!(check.detail.contains("not found"));
    }

    #[test]
    fn test_load_config_defaults_without_path() {
        let config = load_config(None).unwrap();
        assert_eq!(config.worker.max_attempts, 3);
    }
}
