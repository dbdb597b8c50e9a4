//! Backend-agnostic facade over the sandbox adapters.
//!
//! Callers hold a [`TargetRef`] (a name plus the backend it lives on) and
//! never branch on the backend themselves. Options the active backend cannot
//! honour are dropped with a debug log instead of failing the call.

use crate::config::RunnerConfig;
use crate::error::{KodoError, Result};
use crate::identity;
use crate::sandbox::{
    ClusterSandbox, CommandResult, ExecOptions, ExecutionRequest, LocalSandbox, Sandbox,
    SandboxKind,
};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Handle to a started target, identical across backends.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetRef {
    pub name: String,
    pub backend: SandboxKind,
}

impl std::fmt::Display for TargetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.backend, self.name)
    }
}

pub struct Runner {
    sandbox: Box<dyn Sandbox>,
    config: RunnerConfig,
    /// name -> image for every name this runner has handed out
    assigned: HashMap<String, String>,
}

impl Runner {
    /// Parse `backend` and connect to it. An unknown backend fails before
    /// anything is contacted.
    pub async fn connect(backend: &str, config: RunnerConfig) -> Result<Self> {
        let kind: SandboxKind = backend.parse()?;
        let sandbox: Box<dyn Sandbox> = match kind {
            SandboxKind::Local => Box::new(LocalSandbox::connect(&config)?),
            SandboxKind::Cluster => Box::new(ClusterSandbox::connect(&config).await?),
        };
        info!(%kind, "runner connected");
        Ok(Self::with_sandbox(sandbox, config))
    }

    pub fn with_sandbox(sandbox: Box<dyn Sandbox>, config: RunnerConfig) -> Self {
        Self {
            sandbox,
            config,
            assigned: HashMap::new(),
        }
    }

    pub fn backend(&self) -> SandboxKind {
        self.sandbox.kind()
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Names the active adapter will tear down on cleanup.
    pub fn managed(&self) -> Vec<String> {
        self.sandbox.managed()
    }

    fn target_ref(&self, name: &str) -> TargetRef {
        TargetRef {
            name: name.to_string(),
            backend: self.backend(),
        }
    }

    /// Start a target for `request`, generating a name when none is given.
    pub async fn start(
        &mut self,
        mut request: ExecutionRequest,
        name: Option<&str>,
    ) -> Result<TargetRef> {
        let name = match name {
            Some(name) => name.to_string(),
            None => identity::target_name(&request.image),
        };

        if let Some(existing) = self.assigned.get(&name) {
            if existing != &request.image {
                return Err(KodoError::NameConflict {
                    name,
                    existing: existing.clone(),
                    requested: request.image,
                });
            }
        }

        if self.backend() == SandboxKind::Local {
            if request.node_selector.take().is_some() {
                debug!(name = %name, "node selector ignored on local backend");
            }
            if request.resources.take().is_some() {
                debug!(name = %name, "resource request ignored on local backend");
            }
        }

        let target = self.sandbox.create(&name, &request).await?;
        self.assigned.insert(name.clone(), request.image.clone());
        info!(name = %name, image = %request.image, status = %target.status, "target started");
        Ok(self.target_ref(&name))
    }

    /// Run `command` with the configured default timeout.
    pub async fn execute_command(&self, target: &TargetRef, command: &str) -> CommandResult {
        let options = ExecOptions::with_timeout(self.config.exec_timeout());
        self.execute_command_with(target, command, options).await
    }

    pub async fn execute_command_with(
        &self,
        target: &TargetRef,
        command: &str,
        mut options: ExecOptions,
    ) -> CommandResult {
        if self.backend() == SandboxKind::Cluster && options.workdir.take().is_some() {
            debug!(name = %target.name, "workdir ignored on cluster backend");
        }
        debug!(name = %target.name, command, "executing");
        self.sandbox.exec(&target.name, command, &options).await
    }

    pub async fn execute_command_timeout(
        &self,
        target: &TargetRef,
        command: &str,
        timeout: Duration,
    ) -> CommandResult {
        self.execute_command_with(target, command, ExecOptions::with_timeout(timeout))
            .await
    }

    pub async fn copy_to(&self, target: &TargetRef, src: &Path, dest: &str) -> Result<()> {
        self.sandbox.copy_in(&target.name, src, dest).await
    }

    pub async fn stop(&mut self, target: &TargetRef) -> Result<()> {
        self.sandbox.destroy(&target.name).await
    }

    /// Tear down everything this runner still manages.
    pub async fn cleanup(&mut self) {
        self.sandbox.cleanup().await;
    }
}
