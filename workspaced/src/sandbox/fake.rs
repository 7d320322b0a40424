//! Recording container runtime for worker tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ContainerMount, ContainerRuntime, ExecOutput, HomeMount, RuntimeError, SandboxSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Remove(String),
    Run(String),
    Mounts(String),
    Exec(String, Vec<String>),
    CopyIn(String, PathBuf),
}

#[derive(Default)]
pub(crate) struct FakeRuntime {
    pub(crate) calls: Mutex<Vec<Call>>,
    /// Errors returned by successive `run` calls before it starts succeeding.
    pub(crate) run_failures: Mutex<VecDeque<String>>,
    /// Report the home mount with private propagation.
    pub(crate) break_mounts: Mutex<bool>,
    /// Delay applied to every `run`.
    pub(crate) run_delay: Mutex<Option<std::time::Duration>>,
    specs: Mutex<HashMap<String, SandboxSpec>>,
    pub(crate) stdin: Mutex<Vec<(Vec<String>, Vec<u8>)>>,
}

impl FakeRuntime {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_runs(&self, errors: &[&str]) {
        self.run_failures
            .lock()
            .unwrap()
            .extend(errors.iter().map(|e| e.to_string()));
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn runs(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Run(_)))
            .count()
    }

    pub(crate) fn spec(&self, name: &str) -> Option<SandboxSpec> {
        self.specs.lock().unwrap().get(name).cloned()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(Call::Remove(name.to_string()));
        self.specs.lock().unwrap().remove(name);
        Ok(())
    }

    async fn run(&self, spec: &SandboxSpec) -> Result<String, RuntimeError> {
        self.record(Call::Run(spec.name.clone()));
        let delay = *self.run_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.run_failures.lock().unwrap().pop_front();
        if let Some(stderr) = failure {
            return Err(RuntimeError::Command {
                op: "run",
                code: Some(125),
                stderr,
            });
        }
        self.specs
            .lock()
            .unwrap()
            .insert(spec.name.clone(), spec.clone());
        Ok(format!("id-{}", spec.name))
    }

    async fn mounts(&self, name: &str) -> Result<Vec<ContainerMount>, RuntimeError> {
        self.record(Call::Mounts(name.to_string()));
        let Some(spec) = self.spec(name) else {
            return Err(RuntimeError::Command {
                op: "inspect",
                code: Some(1),
                stderr: format!("No such container: {name}"),
            });
        };
        let broken = *self.break_mounts.lock().unwrap();
        let mount = match &spec.home {
            HomeMount::Bind { source } => ContainerMount {
                kind: "bind".to_string(),
                name: None,
                source: source.display().to_string(),
                destination: spec.home_target.clone(),
                driver: None,
                rw: true,
                propagation: if broken { "rprivate" } else { "shared" }.to_string(),
            },
            HomeMount::Volume { name, driver } => ContainerMount {
                kind: "volume".to_string(),
                name: Some(name.clone()),
                source: String::new(),
                destination: spec.home_target.clone(),
                driver: Some(if broken { "local" } else { driver.as_str() }.to_string()),
                rw: true,
                propagation: String::new(),
            },
        };
        Ok(vec![mount])
    }

    async fn exec(
        &self,
        name: &str,
        cmd: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput, RuntimeError> {
        self.record(Call::Exec(name.to_string(), cmd.to_vec()));
        if let Some(data) = stdin {
            self.stdin.lock().unwrap().push((cmd.to_vec(), data));
        }
        Ok(ExecOutput {
            code: Some(0),
            ..Default::default()
        })
    }

    async fn copy_in(&self, name: &str, dest: &Path, _archive: Vec<u8>) -> Result<(), RuntimeError> {
        self.record(Call::CopyIn(name.to_string(), dest.to_path_buf()));
        Ok(())
    }
}
