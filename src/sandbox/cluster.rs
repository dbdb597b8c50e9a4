//! Cluster orchestrator adapter.
//!
//! Per target: `Absent -> Pending -> Running -> (Succeeded | Failed | Unknown | Deleted)`.
//! `Running` is the only state a start waits for. Every API interaction runs
//! inside a [`ProxyGuard`].

use super::archive;
use super::exec::{bounded, interpret, CommandResult};
use super::spec::pod_manifest;
use super::{ExecOptions, ExecutionRequest, ExecutionTarget, Sandbox, SandboxKind};
use crate::config::RunnerConfig;
use crate::engine::{EngineError, KubePodApi, Lookup, PodApi, PodPhase};
use crate::error::{KodoError, Result, RetryConfig, RetryState};
use crate::proxy::ProxyGuard;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Pause before reopening a watch the server closed early
const WATCH_REOPEN_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub disable_proxy: bool,
    pub create_retry: RetryConfig,
    pub copy_retry: RetryConfig,
    pub ready_timeout: Duration,
    pub request_timeout: Duration,
    pub exec_grace: Duration,
    pub delete_grace_period_secs: i64,
}

impl From<&RunnerConfig> for ClusterSettings {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            disable_proxy: config.disable_proxy,
            create_retry: config.create_retry.clone(),
            copy_retry: config.copy_retry.clone(),
            ready_timeout: config.ready_timeout(),
            request_timeout: config.request_timeout(),
            exec_grace: config.exec_grace(),
            delete_grace_period_secs: config.delete_grace_period_secs,
        }
    }
}

pub struct ClusterSandbox<A: PodApi = KubePodApi> {
    api: A,
    managed: HashMap<String, ExecutionTarget>,
    settings: ClusterSettings,
}

impl ClusterSandbox<KubePodApi> {
    pub async fn connect(config: &RunnerConfig) -> Result<Self> {
        let api = KubePodApi::connect(
            &config.namespace,
            config.kubeconfig.as_deref(),
            config.disable_proxy,
        )
        .await?;
        Ok(Self::new(api, ClusterSettings::from(config)))
    }
}

impl<A: PodApi> ClusterSandbox<A> {
    pub fn new(api: A, settings: ClusterSettings) -> Self {
        Self {
            api,
            managed: HashMap::new(),
            settings,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    fn target(&self, name: &str, image: String, phase: &PodPhase) -> ExecutionTarget {
        ExecutionTarget {
            name: name.to_string(),
            backend: SandboxKind::Cluster,
            image,
            status: phase.to_string(),
        }
    }

    /// Attach to an existing pod or create one and wait for it to run.
    /// The pod is registered only once it is ready.
    pub async fn start_pod(
        &mut self,
        name: &str,
        request: &ExecutionRequest,
        max_retries: u32,
        timeout: Duration,
    ) -> Result<ExecutionTarget> {
        let _proxy = ProxyGuard::enter(self.settings.disable_proxy);
        let read_timeout = self.settings.request_timeout / 2;

        let existing = bounded(read_timeout, Duration::ZERO, self.api.read(name))
            .await
            .map_err(|_| EngineError::Timeout(read_timeout))??;
        if let Lookup::Found(pod) = existing {
            debug!(pod = name, phase = %pod.phase, "attaching to existing pod");
            let target = self.target(
                name,
                pod.image.unwrap_or_else(|| request.image.clone()),
                &pod.phase,
            );
            self.managed.insert(name.to_string(), target.clone());
            return Ok(target);
        }

        let manifest = pod_manifest(name, request);
        self.create_with_retry(name, &manifest, max_retries).await?;
        info!(pod = name, namespace = self.api.namespace(), "pod created, waiting for readiness");

        self.wait_until_running(name, timeout).await?;
        let target = self.target(name, request.image.clone(), &PodPhase::Running);
        self.managed.insert(name.to_string(), target.clone());
        Ok(target)
    }

    async fn create_with_retry(
        &self,
        name: &str,
        manifest: &k8s_openapi::api::core::v1::Pod,
        max_retries: u32,
    ) -> Result<()> {
        let config = RetryConfig {
            max_attempts: max_retries,
            ..self.settings.create_retry.clone()
        };
        let mut state = RetryState::new(&config);
        let request_timeout = self.settings.request_timeout;

        loop {
            state.attempt += 1;
            let outcome = bounded(request_timeout, Duration::ZERO, self.api.create(manifest))
                .await
                .unwrap_or(Err(EngineError::Timeout(request_timeout)));
            match outcome {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && state.has_budget() => {
                    warn!(
                        pod = name,
                        attempt = state.attempt,
                        backoff = ?state.backoff,
                        error = %e,
                        "pod creation failed, retrying"
                    );
                    state.wait().await;
                }
                Err(e) if e.is_transient() => {
                    return Err(KodoError::RetriesExhausted {
                        operation: format!("creating pod '{}'", name),
                        attempts: state.attempt,
                        last: e,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Watch `name` until it runs, ends, or `timeout` elapses. The watch is
    /// stopped on every exit path.
    async fn wait_until_running(&self, name: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let timed_out = || KodoError::ReadinessTimeout {
            name: name.to_string(),
            timeout,
        };

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out());
            }
            let mut watch = match tokio::time::timeout_at(
                deadline,
                self.api.watch_phases(name, remaining),
            )
            .await
            {
                Ok(watch) => watch?,
                Err(_) => return Err(timed_out()),
            };

            let outcome = loop {
                match tokio::time::timeout_at(deadline, watch.next_phase()).await {
                    Err(_) => break Err(timed_out()),
                    Ok(None) => break Ok(false),
                    Ok(Some(Err(e))) => break Err(KodoError::from(e)),
                    Ok(Some(Ok(PodPhase::Running))) => break Ok(true),
                    Ok(Some(Ok(phase))) if phase.is_terminal() => {
                        break Err(KodoError::TerminalPhase {
                            name: name.to_string(),
                            phase: phase.to_string(),
                        })
                    }
                    Ok(Some(Ok(phase))) => debug!(pod = name, %phase, "waiting for pod"),
                }
            };
            watch.stop();

            match outcome {
                Ok(true) => {
                    info!(pod = name, "pod running");
                    return Ok(());
                }
                Ok(false) => {
                    debug!(pod = name, "watch closed by server, reopening");
                    tokio::time::sleep_until(
                        (Instant::now() + WATCH_REOPEN_DELAY).min(deadline),
                    )
                    .await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn execute_command(
        &self,
        name: &str,
        command: &str,
        timeout: Duration,
    ) -> CommandResult {
        let _proxy = ProxyGuard::enter(self.settings.disable_proxy);
        let full_command = vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()];

        let drain = async {
            let mut session = self.api.exec(name, full_command).await?;
            let mut output = Vec::new();
            while let Some(chunk) = session.next_chunk().await {
                output.extend_from_slice(chunk.bytes());
            }
            let exit_code = session.exit_code().await;
            Ok::<_, EngineError>((output, exit_code))
        };

        match bounded(timeout, self.settings.exec_grace, drain).await {
            Err(_) => {
                warn!(pod = name, ?timeout, "exec abandoned");
                CommandResult::timed_out(timeout)
            }
            Ok(Err(e)) => CommandResult::invocation_error(e),
            Ok(Ok((output, exit_code))) => interpret(&output, exit_code, timeout),
        }
    }

    /// Stream a single-entry archive into the pod through `tar`, retrying
    /// transient and transport failures.
    pub async fn copy_to_pod(&self, name: &str, src: &Path, dest: &str) -> Result<()> {
        let _proxy = ProxyGuard::enter(self.settings.disable_proxy);
        let packed = archive::pack(src, dest)?;
        let command = vec![
            "tar".to_string(),
            "xmf".to_string(),
            "-".to_string(),
            "-C".to_string(),
            packed.dest_dir.clone(),
        ];

        let mut archive = Cursor::new(packed.bytes);
        let mut state = RetryState::new(&self.settings.copy_retry);
        let request_timeout = self.settings.request_timeout;

        loop {
            state.attempt += 1;
            archive.rewind()?;
            let mut payload = Vec::with_capacity(archive.get_ref().len());
            archive.read_to_end(&mut payload)?;

            let outcome = bounded(
                request_timeout,
                Duration::ZERO,
                self.api.exec_with_input(name, command.clone(), payload),
            )
            .await
            .unwrap_or(Err(EngineError::Timeout(request_timeout)));

            match outcome {
                Ok(()) => {
                    debug!(pod = name, dest, attempts = state.attempt, "archive copied");
                    return Ok(());
                }
                Err(e) if copy_retryable(&e) && state.has_budget() => {
                    warn!(
                        pod = name,
                        attempt = state.attempt,
                        backoff = ?state.backoff,
                        error = %e,
                        "copy failed, retrying"
                    );
                    state.wait().await;
                }
                Err(e) if copy_retryable(&e) => {
                    return Err(KodoError::RetriesExhausted {
                        operation: format!("copying to pod '{}'", name),
                        attempts: state.attempt,
                        last: e,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Delete a pod. A pod that is already gone counts as deleted.
    pub async fn delete_pod(&mut self, name: &str, grace_period_secs: i64) -> Result<()> {
        let _proxy = ProxyGuard::enter(self.settings.disable_proxy);
        let read_timeout = self.settings.request_timeout / 2;
        let deleted = bounded(
            read_timeout,
            Duration::ZERO,
            self.api.delete(name, grace_period_secs),
        )
        .await
        .map_err(|_| EngineError::Timeout(read_timeout))??;

        if let Lookup::NotFound = deleted {
            debug!(pod = name, "pod already deleted");
        } else {
            info!(pod = name, "pod deleted");
        }
        self.managed.remove(name);
        Ok(())
    }

    /// Delete every managed pod, logging individual failures.
    pub async fn cleanup_pods(&mut self) {
        let grace = self.settings.delete_grace_period_secs;
        let names: Vec<String> = self.managed.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.delete_pod(&name, grace).await {
                warn!(pod = %name, error = %e, "error deleting pod");
            }
        }
    }
}

fn copy_retryable(err: &EngineError) -> bool {
    match err {
        EngineError::Api { .. } => err.is_transient(),
        EngineError::Transport(_) | EngineError::Timeout(_) => true,
    }
}

#[async_trait]
impl<A: PodApi> Sandbox for ClusterSandbox<A> {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Cluster
    }

    async fn create(&mut self, name: &str, request: &ExecutionRequest) -> Result<ExecutionTarget> {
        let max_retries = request
            .max_retries
            .unwrap_or(self.settings.create_retry.max_attempts);
        let timeout = request.ready_timeout.unwrap_or(self.settings.ready_timeout);
        self.start_pod(name, request, max_retries, timeout).await
    }

    async fn exec(&self, name: &str, command: &str, options: &ExecOptions) -> CommandResult {
        self.execute_command(name, command, options.timeout).await
    }

    async fn copy_in(&self, name: &str, src: &Path, dest: &str) -> Result<()> {
        self.copy_to_pod(name, src, dest).await
    }

    async fn destroy(&mut self, name: &str) -> Result<()> {
        let grace = self.settings.delete_grace_period_secs;
        self.delete_pod(name, grace).await
    }

    async fn cleanup(&mut self) {
        self.cleanup_pods().await;
    }

    fn managed(&self) -> Vec<String> {
        self.managed.keys().cloned().collect()
    }
}
