//! Local container engine adapter.
//!
//! Per target: `Absent -> Created -> Running -> (Stopped | Removed)`.
//! Creation is assumed local and fast, so nothing here is retried.

use super::archive;
use super::exec::{bounded, interpret, CommandResult};
use super::{
    merged_environment, ExecOptions, ExecutionRequest, ExecutionTarget, Sandbox, SandboxKind,
};
use crate::config::RunnerConfig;
use crate::engine::{ContainerEngine, ContainerSpec, DockerEngine, Lookup};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Command a new container keeps running when the caller gives none
pub const DEFAULT_CONTAINER_COMMAND: &str = "/bin/bash";

pub struct LocalSandbox<E: ContainerEngine = DockerEngine> {
    engine: E,
    managed: HashMap<String, ExecutionTarget>,
    exec_grace: Duration,
}

impl LocalSandbox<DockerEngine> {
    pub fn connect(config: &RunnerConfig) -> Result<Self> {
        let engine = DockerEngine::connect(Duration::from_secs(config.engine_timeout_secs))?;
        Ok(Self::new(engine, config))
    }
}

impl<E: ContainerEngine> LocalSandbox<E> {
    pub fn new(engine: E, config: &RunnerConfig) -> Self {
        Self {
            engine,
            managed: HashMap::new(),
            exec_grace: config.exec_grace(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Start `name`, reusing an existing container of that name.
    pub async fn start_container(
        &mut self,
        name: &str,
        request: &ExecutionRequest,
    ) -> Result<ExecutionTarget> {
        match self.bring_up(name, request).await {
            Ok(target) => {
                self.managed.insert(name.to_string(), target.clone());
                Ok(target)
            }
            Err(e) => {
                error!(container = name, error = %e, "container start failed");
                Err(e)
            }
        }
    }

    async fn bring_up(
        &mut self,
        name: &str,
        request: &ExecutionRequest,
    ) -> Result<ExecutionTarget> {
        if let Lookup::Found(info) = self.engine.find(name).await? {
            let mut status = info.state.clone();
            if !info.is_running() {
                info!(container = name, state = %info.state, "starting existing container");
                self.engine.start(name).await?;
                status = "running".to_string();
            } else {
                debug!(container = name, "reusing running container");
            }
            return Ok(ExecutionTarget {
                name: name.to_string(),
                backend: SandboxKind::Local,
                image: info.image.unwrap_or_else(|| request.image.clone()),
                status,
            });
        }

        let command = request
            .command
            .clone()
            .unwrap_or_else(|| DEFAULT_CONTAINER_COMMAND.to_string());
        let spec = ContainerSpec {
            name: name.to_string(),
            image: request.image.clone(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), command],
            environment: request.merged_environment(),
            tty: true,
            open_stdin: true,
        };
        info!(container = name, image = %request.image, "creating container");
        self.engine.create(&spec).await?;

        let mut target = ExecutionTarget {
            name: name.to_string(),
            backend: SandboxKind::Local,
            image: request.image.clone(),
            status: "created".to_string(),
        };
        if let Err(e) = self.engine.start(name).await {
            // The container exists now; track it so cleanup removes it.
            self.managed.insert(name.to_string(), target);
            return Err(e.into());
        }
        target.status = "running".to_string();
        Ok(target)
    }

    pub async fn execute_command(
        &self,
        name: &str,
        command: &str,
        options: &ExecOptions,
    ) -> CommandResult {
        let env = merged_environment(&BTreeMap::new());
        let invocation = self.engine.exec(
            name,
            vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()],
            options.workdir.as_deref(),
            &env,
        );
        match bounded(options.timeout, self.exec_grace, invocation).await {
            Err(_) => {
                warn!(container = name, timeout = ?options.timeout, "exec abandoned");
                CommandResult::timed_out(options.timeout)
            }
            Ok(Err(e)) => CommandResult::invocation_error(e),
            Ok(Ok(out)) => interpret(&out.output, out.exit_code, options.timeout),
        }
    }

    pub async fn copy_to_container(&self, name: &str, src: &Path, dest: &str) -> Result<()> {
        let packed = archive::pack(src, dest)?;
        debug!(
            container = name,
            dest_dir = %packed.dest_dir,
            entry = %packed.entry_name,
            bytes = packed.bytes.len(),
            "uploading archive"
        );
        self.engine
            .upload_archive(name, &packed.dest_dir, packed.bytes)
            .await?;
        Ok(())
    }

    /// Stop and remove a managed container. Failures are logged, not raised.
    pub async fn stop_container(&mut self, name: &str) {
        if !self.managed.contains_key(name) {
            debug!(container = name, "not managed, nothing to stop");
            return;
        }
        if let Err(e) = self.engine.stop(name).await {
            warn!(container = name, error = %e, "container stop failed");
        }
        match self.engine.remove(name).await {
            Ok(()) => {
                self.managed.remove(name);
                info!(container = name, "container removed");
            }
            Err(e) if e.is_not_found() => {
                self.managed.remove(name);
            }
            Err(e) => warn!(container = name, error = %e, "container delete failed"),
        }
    }

    /// Stop every managed container, then release the engine.
    pub async fn close(&mut self) {
        let names: Vec<String> = self.managed.keys().cloned().collect();
        for name in names {
            self.stop_container(&name).await;
        }
        self.engine.close().await;
    }
}

#[async_trait]
impl<E: ContainerEngine> Sandbox for LocalSandbox<E> {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Local
    }

    async fn create(&mut self, name: &str, request: &ExecutionRequest) -> Result<ExecutionTarget> {
        self.start_container(name, request).await
    }

    async fn exec(&self, name: &str, command: &str, options: &ExecOptions) -> CommandResult {
        self.execute_command(name, command, options).await
    }

    async fn copy_in(&self, name: &str, src: &Path, dest: &str) -> Result<()> {
        self.copy_to_container(name, src, dest).await
    }

    async fn destroy(&mut self, name: &str) -> Result<()> {
        self.stop_container(name).await;
        Ok(())
    }

    async fn cleanup(&mut self) {
        self.close().await;
    }

    fn managed(&self) -> Vec<String> {
        self.managed.keys().cloned().collect()
    }
}
