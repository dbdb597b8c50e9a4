use crate::error::{KodoError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub mod archive;
pub mod cluster;
pub mod exec;
pub mod local;
pub mod spec;

pub use cluster::ClusterSandbox;
pub use exec::CommandResult;
pub use local::LocalSandbox;

/// Baseline PATH for new targets and local exec calls
pub const DEFAULT_PATH: &str = "/root/.venv/bin:/root/.local/bin:/root/.cargo/bin:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    Local,
    Cluster,
}

impl FromStr for SandboxKind {
    type Err = KodoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "docker" => Ok(SandboxKind::Local),
            "cluster" | "kubernetes" | "k8s" => Ok(SandboxKind::Cluster),
            _ => Err(KodoError::UnknownBackend(s.to_string())),
        }
    }
}

impl fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxKind::Local => f.write_str("local"),
            SandboxKind::Cluster => f.write_str("cluster"),
        }
    }
}

/// Resource requests and limits, in Kubernetes quantity notation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

/// Desired creation of a target. Not persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub image: String,
    /// Long-running command; the backend picks its default when `None`
    pub command: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub resources: Option<ResourceSpec>,
    /// Cluster only
    pub node_selector: Option<BTreeMap<String, String>>,
    /// Cluster only: creation attempts before giving up
    pub max_retries: Option<u32>,
    /// Cluster only: readiness wait budget
    pub ready_timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            command: None,
            environment: BTreeMap::new(),
            resources: None,
            node_selector: None,
            max_retries: None,
            ready_timeout: None,
        }
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment.extend(environment);
        self
    }

    pub fn resources(mut self, resources: ResourceSpec) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn node_selector(mut self, selector: BTreeMap<String, String>) -> Self {
        self.node_selector = Some(selector);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = Some(timeout);
        self
    }

    /// Baseline PATH first, caller keys win on conflict.
    pub fn merged_environment(&self) -> BTreeMap<String, String> {
        merged_environment(&self.environment)
    }
}

pub fn merged_environment(user: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("PATH".to_string(), DEFAULT_PATH.to_string());
    env.extend(user.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// One running sandbox as recorded by the adapter that owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionTarget {
    pub name: String,
    pub backend: SandboxKind,
    pub image: String,
    /// Engine-reported status at the time of the last lookup
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecOptions {
    pub timeout: Duration,
    /// Local only
    pub workdir: Option<String>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            workdir: None,
        }
    }
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// Capability interface every backend adapter provides.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn kind(&self) -> SandboxKind;
    /// Start `name`, reusing an existing target with that name.
    async fn create(&mut self, name: &str, request: &ExecutionRequest) -> Result<ExecutionTarget>;
    /// Never fails: every outcome is encoded in the result.
    async fn exec(&self, name: &str, command: &str, options: &ExecOptions) -> CommandResult;
    async fn copy_in(&self, name: &str, src: &Path, dest: &str) -> Result<()>;
    async fn destroy(&mut self, name: &str) -> Result<()>;
    /// Best-effort teardown of every managed target.
    async fn cleanup(&mut self);
    /// Names currently tracked for cleanup.
    fn managed(&self) -> Vec<String>;
}
