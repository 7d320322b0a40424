use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use workspaced_protocol::StartRequest;

use crate::config::{SandboxConfig, SecretsConfig};
use crate::identity;
use crate::lock::Heartbeat;
use crate::sandbox::{verify_home_mount, ContainerRuntime, HomeMount, SandboxSpec};
use crate::util::{sh_command, shell_path};
use crate::volume::VolumeManager;

use super::StartError;

/// Runs the hardened creation sequence for one sandbox.
pub struct Provisioner {
    runtime: Arc<dyn ContainerRuntime>,
    volumes: Arc<VolumeManager>,
    sandbox: SandboxConfig,
    secrets: SecretsConfig,
}

impl Provisioner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        volumes: Arc<VolumeManager>,
        sandbox: SandboxConfig,
        secrets: SecretsConfig,
    ) -> Self {
        Self {
            runtime,
            volumes,
            sandbox,
            secrets,
        }
    }

    fn challenge_dir(&self, request: &StartRequest) -> PathBuf {
        self.sandbox
            .challenges_root
            .join(&request.dojo_ref)
            .join(&request.module_ref)
            .join(&request.challenge_ref)
    }

    /// One attempt. The user lock must be held and heartbeating; it is
    /// checked before every step with an effect outside this process.
    pub async fn provision(&self, request: &StartRequest, hb: &Heartbeat) -> Result<(), StartError> {
        let name = identity::sandbox_name(&request.user_id);

        hb.check()?;
        self.runtime.remove(&name).await?;

        let home = self.home_mount(request, hb).await?;
        let auth_token = identity::auth_token();
        let spec = SandboxSpec::new(&self.sandbox, name.clone(), request, home, &auth_token);

        hb.check()?;
        let id = self
            .runtime
            .run(&spec)
            .await
            .map_err(StartError::ContainerStart)?;
        debug!(sandbox = %name, id = %id, "sandbox container started");

        let mounts = self.runtime.mounts(&name).await?;
        if let Err(reason) = verify_home_mount(&spec, &mounts) {
            warn!(sandbox = %name, %reason, "home mount verification failed, removing sandbox");
            if let Err(e) = self.runtime.remove(&name).await {
                warn!(sandbox = %name, error = %e, "failed to remove sandbox after bad mount");
            }
            return Err(StartError::MountVerification(reason));
        }

        if request.practice {
            hb.check()?;
            self.grant_privileges(&name).await?;
        }

        hb.check()?;
        self.inject_challenge(&name, request).await?;

        hb.check()?;
        let flag = identity::flag(&self.secrets.flag_key, &self.sandbox.flag_prefix, request);
        self.write_secret(&name, "flag", Path::new("/flag"), 0, flag.into_bytes())
            .await?;
        self.write_secret(
            &name,
            "auth token",
            Path::new("/run/dojo/auth_token"),
            self.sandbox.hacker_uid,
            auth_token.into_bytes(),
        )
        .await?;

        hb.check()?;
        self.exec_ok(&name, "init", &self.sandbox.init_command, None)
            .await?;

        info!(sandbox = %name, user = %request.user_id, practice = request.practice, "sandbox ready");
        Ok(())
    }

    async fn home_mount(&self, request: &StartRequest, hb: &Heartbeat) -> Result<HomeMount, StartError> {
        let volume = identity::home_volume_name(&self.secrets.volume_name_key, &request.user_id);
        match &self.sandbox.volume_driver {
            // The plugin activates the volume when Docker mounts it.
            Some(driver) => Ok(HomeMount::Volume {
                name: volume,
                driver: driver.clone(),
            }),
            None => {
                hb.check()?;
                let source = self.volumes.activate(&volume, None).await?;
                Ok(HomeMount::Bind { source })
            }
        }
    }

    async fn grant_privileges(&self, name: &str) -> Result<(), StartError> {
        let script = format!(
            "mkdir -p /etc/sudoers.d && echo '#{uid} ALL=(ALL) NOPASSWD: ALL' > /etc/sudoers.d/practice && chmod 0440 /etc/sudoers.d/practice",
            uid = self.sandbox.hacker_uid
        );
        self.sh(name, "grant privileges", &script, None).await
    }

    async fn inject_challenge(&self, name: &str, request: &StartRequest) -> Result<(), StartError> {
        let dir = self.challenge_dir(request);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(StartError::Provision {
                step: "inject challenge",
                detail: format!("no challenge files at {}", dir.display()),
            });
        }

        let archive = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut builder = tar::Builder::new(Vec::new());
            builder.follow_symlinks(false);
            builder.append_dir_all(".", &dir)?;
            builder.into_inner()
        })
        .await
        .map_err(|e| StartError::Provision {
            step: "inject challenge",
            detail: e.to_string(),
        })?
        .map_err(|e| StartError::Provision {
            step: "inject challenge",
            detail: e.to_string(),
        })?;

        let mount = shell_path(&self.sandbox.challenge_mount);
        self.sh(name, "prepare challenge dir", &format!("mkdir -p {mount}"), None)
            .await?;
        self.runtime
            .copy_in(name, &self.sandbox.challenge_mount, archive)
            .await?;

        // Challenge binaries run setuid root against the unprivileged user.
        let fixup = format!(
            "chown -R 0:0 {mount} && chmod -R go-w,a+rX {mount} && find {mount} -type f -perm -u+x -exec chmod u+s {{}} +"
        );
        self.sh(name, "fix challenge permissions", &fixup, None).await
    }

    async fn write_secret(
        &self,
        name: &str,
        step: &'static str,
        path: &Path,
        owner: u32,
        content: Vec<u8>,
    ) -> Result<(), StartError> {
        let target = shell_path(path);
        let parent = path
            .parent()
            .map(shell_path)
            .unwrap_or_else(|| "/".to_string());
        let script = format!(
            "mkdir -p {parent} && umask 077 && cat > {target} && chown {owner}:{owner} {target} && chmod 0400 {target}"
        );
        self.sh(name, step, &script, Some(content)).await
    }

    async fn sh(
        &self,
        name: &str,
        step: &'static str,
        script: &str,
        stdin: Option<Vec<u8>>,
    ) -> Result<(), StartError> {
        self.exec_ok(name, step, &sh_command(script), stdin).await
    }

    async fn exec_ok(
        &self,
        name: &str,
        step: &'static str,
        cmd: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<(), StartError> {
        let output = self.runtime.exec(name, cmd, stdin).await?;
        if !output.success() {
            return Err(StartError::Provision {
                step,
                detail: format!("exit {:?}: {}", output.code, output.stderr),
            });
        }
        Ok(())
    }
}
