//! Run commands in sandboxed execution targets, a local container or a
//! Kubernetes pod, behind one lifecycle, exec and file-injection interface.

pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod patch;
pub mod proxy;
pub mod runner;
pub mod sandbox;

pub use config::RunnerConfig;
pub use error::{KodoError, Result};
pub use runner::{Runner, TargetRef};
pub use sandbox::{CommandResult, ExecOptions, ExecutionRequest, SandboxKind};
