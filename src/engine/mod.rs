//! Seams to the external services that realize execution targets.
//!
//! The adapters in [`crate::sandbox`] only talk to these traits. Production
//! implementations live in [`docker`] (local container engine via bollard)
//! and [`kubernetes`] (cluster API via kube); tests plug in in-memory fakes.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod docker;
pub mod kubernetes;

pub use docker::DockerEngine;
pub use kubernetes::KubePodApi;

/// Failure reported by an external engine call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl EngineError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Conflict, rate-limit and server-side statuses worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self.status(), Some(409 | 429 | 500 | 503))
    }
}

/// Outcome of an existence-sensitive call. Paired with `Result` this gives
/// the Found | NotFound | OtherError split used at every adapter boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    /// Folds a raw engine result, turning a 404 into `NotFound`.
    pub fn from_result(result: Result<T, EngineError>) -> Result<Self, EngineError> {
        match result {
            Ok(value) => Ok(Lookup::Found(value)),
            Err(e) if e.is_not_found() => Ok(Lookup::NotFound),
            Err(e) => Err(e),
        }
    }
}

/// Engine-reported view of an existing container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    pub name: String,
    pub image: Option<String>,
    pub state: String,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }
}

/// Creation parameters handed to the local engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub tty: bool,
    pub open_stdin: bool,
}

/// Fully buffered result of a local exec.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub output: Vec<u8>,
    pub exit_code: Option<i64>,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Looks a container up by exact name, including stopped ones.
    async fn find(&self, name: &str) -> Result<Lookup<ContainerInfo>, EngineError>;
    async fn create(&self, spec: &ContainerSpec) -> Result<(), EngineError>;
    async fn start(&self, name: &str) -> Result<(), EngineError>;
    async fn stop(&self, name: &str) -> Result<(), EngineError>;
    async fn remove(&self, name: &str) -> Result<(), EngineError>;
    async fn exec(
        &self,
        name: &str,
        command: Vec<String>,
        workdir: Option<&str>,
        environment: &BTreeMap<String, String>,
    ) -> Result<ExecOutput, EngineError>;
    /// Extracts a tar archive into `dest_dir` inside the container.
    async fn upload_archive(
        &self,
        name: &str,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> Result<(), EngineError>;
    /// Releases the engine connection. Calls made afterwards fail.
    async fn close(&mut self) {}
}

/// Pod lifecycle phase as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
    /// The pod object disappeared while being watched.
    Deleted,
}

impl PodPhase {
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            // A freshly created pod may not report a phase yet.
            None => PodPhase::Pending,
            Some(_) => PodPhase::Unknown,
        }
    }

    /// End states a pod never leaves to become ready.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PodPhase::Succeeded | PodPhase::Failed | PodPhase::Unknown | PodPhase::Deleted
        )
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
            PodPhase::Deleted => "Deleted",
        };
        f.write_str(s)
    }
}

/// Engine-reported view of an existing pod.
#[derive(Debug, Clone, PartialEq)]
pub struct PodInfo {
    pub name: String,
    pub image: Option<String>,
    pub phase: PodPhase,
}

/// Live subscription to phase transitions of a single pod.
#[async_trait]
pub trait PhaseWatch: Send {
    /// Next observed phase, or `None` once the server closes the watch.
    async fn next_phase(&mut self) -> Option<Result<PodPhase, EngineError>>;
    /// Tears the subscription down. Must be safe to call more than once.
    fn stop(&mut self);
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

impl ExecChunk {
    pub fn bytes(&self) -> &[u8] {
        match self {
            ExecChunk::Stdout(b) | ExecChunk::Stderr(b) => b,
        }
    }
}

/// An open exec stream: output chunks in arrival order, then an exit code.
pub struct ExecSession {
    chunks: mpsc::UnboundedReceiver<ExecChunk>,
    status: BoxFuture<'static, Option<i64>>,
}

impl ExecSession {
    pub fn new(
        chunks: mpsc::UnboundedReceiver<ExecChunk>,
        status: BoxFuture<'static, Option<i64>>,
    ) -> Self {
        Self { chunks, status }
    }

    /// Next chunk from either stream; `None` once both are closed.
    pub async fn next_chunk(&mut self) -> Option<ExecChunk> {
        self.chunks.recv().await
    }

    /// Resolves the exit code. `None` when the stream never reported one.
    pub async fn exit_code(self) -> Option<i64> {
        self.status.await
    }
}

#[async_trait]
pub trait PodApi: Send + Sync {
    fn namespace(&self) -> &str;
    async fn read(&self, name: &str) -> Result<Lookup<PodInfo>, EngineError>;
    async fn create(&self, pod: &k8s_openapi::api::core::v1::Pod) -> Result<(), EngineError>;
    /// Opens a watch filtered to `name`. `timeout` bounds the server side.
    async fn watch_phases(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Box<dyn PhaseWatch>, EngineError>;
    /// Opens an exec stream with stdout and stderr attached, no stdin, no tty.
    async fn exec(&self, name: &str, command: Vec<String>) -> Result<ExecSession, EngineError>;
    /// Runs `command` with `input` written to its stdin, then closes it.
    async fn exec_with_input(
        &self,
        name: &str,
        command: Vec<String>,
        input: Vec<u8>,
    ) -> Result<(), EngineError>;
    async fn delete(&self, name: &str, grace_period_secs: i64) -> Result<Lookup<()>, EngineError>;
}
