use crate::error::{KodoError, Result, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_NAMESPACE: &str = "default";

/// Runner-wide settings shared by both backends. Every field has a default,
/// so a config file only needs the keys it changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    pub namespace: String,
    pub kubeconfig: Option<PathBuf>,
    /// Clear proxy variables around cluster API calls
    pub disable_proxy: bool,
    /// Client-side timeout of the local engine connection
    pub engine_timeout_secs: u64,
    pub exec_timeout_secs: u64,
    /// Slack added on top of the exec timeout before the caller gives up
    pub exec_grace_secs: u64,
    pub ready_timeout_secs: u64,
    /// Bound on a single cluster create call; reads use half of it
    pub request_timeout_secs: u64,
    pub delete_grace_period_secs: i64,
    pub create_retry: RetryConfig,
    pub copy_retry: RetryConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            kubeconfig: None,
            disable_proxy: true,
            engine_timeout_secs: 120,
            exec_timeout_secs: 300,
            exec_grace_secs: 5,
            ready_timeout_secs: 1200,
            request_timeout_secs: 120,
            delete_grace_period_secs: 0,
            create_retry: RetryConfig::default(),
            copy_retry: RetryConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Load from an optional JSON file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KodoError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| KodoError::Config(e.to_string()))
    }

    /// `KODO_NAMESPACE`, `KODO_KUBECONFIG` and `KODO_DISABLE_PROXY` win over
    /// file values.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(namespace) = std::env::var("KODO_NAMESPACE") {
            self.namespace = namespace;
        }
        if let Ok(path) = std::env::var("KODO_KUBECONFIG") {
            self.kubeconfig = Some(PathBuf::from(path));
        }
        if let Ok(flag) = std::env::var("KODO_DISABLE_PROXY") {
            self.disable_proxy = parse_flag(&flag).ok_or_else(|| {
                KodoError::Config(format!("KODO_DISABLE_PROXY must be a boolean, got '{}'", flag))
            })?;
        }
        Ok(())
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn exec_grace(&self) -> Duration {
        Duration::from_secs(self.exec_grace_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Parse a JSON object option such as `--env` or `--node-selector`.
/// Non-string values are kept in their JSON text form.
pub fn parse_json_map(
    value: Option<&str>,
    option: &str,
) -> Result<Option<BTreeMap<String, String>>> {
    let Some(raw) = value.filter(|v| !v.trim().is_empty()) else {
        return Ok(None);
    };
    let invalid = |reason: String| KodoError::InvalidOption {
        option: option.to_string(),
        reason,
    };
    let parsed: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| invalid(format!("Invalid JSON format - {}", e)))?;
    let serde_json::Value::Object(map) = parsed else {
        return Err(invalid(format!("{} must be a JSON object", option)));
    };
    Ok(Some(
        map.into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect(),
    ))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
