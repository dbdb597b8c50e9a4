use super::{ExecutionRequest, ResourceSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod, PodSpec, ResourceRequirements, Toleration,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

/// Command a new pod keeps running when the caller gives none
pub const DEFAULT_POD_COMMAND: &str = "sleep infinity";

pub const TOLERATION_KEY: &str = "rl-training-only";
pub const TOLERATION_VALUE: &str = "true";

pub fn default_resources() -> ResourceSpec {
    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), "1".to_string());
    requests.insert("memory".to_string(), "1Gi".to_string());
    ResourceSpec {
        requests,
        limits: BTreeMap::new(),
    }
}

/// Caller requests replace the default requests wholesale; limits are
/// taken as given.
fn effective_resources(requested: Option<&ResourceSpec>) -> ResourceSpec {
    let mut resources = default_resources();
    if let Some(requested) = requested {
        if !requested.requests.is_empty() {
            resources.requests = requested.requests.clone();
        }
        resources.limits = requested.limits.clone();
    }
    resources
}

fn quantities(values: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    if values.is_empty() {
        return None;
    }
    Some(
        values
            .iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect(),
    )
}

/// Build the declarative pod for `name`: one container running the command
/// through `/bin/sh -c`, never restarted.
pub fn pod_manifest(name: &str, request: &ExecutionRequest) -> Pod {
    let command = request
        .command
        .clone()
        .unwrap_or_else(|| DEFAULT_POD_COMMAND.to_string());

    let env = request
        .merged_environment()
        .into_iter()
        .map(|(name, value)| EnvVar {
            name,
            value: Some(value),
            value_from: None,
        })
        .collect();

    let resources = effective_resources(request.resources.as_ref());

    let container = Container {
        name: name.to_string(),
        image: Some(request.image.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        args: Some(vec![command]),
        stdin: Some(true),
        tty: Some(true),
        env: Some(env),
        resources: Some(ResourceRequirements {
            requests: quantities(&resources.requests),
            limits: quantities(&resources.limits),
            ..Default::default()
        }),
        ..Default::default()
    };

    let toleration = Toleration {
        effect: Some("NoSchedule".to_string()),
        key: Some(TOLERATION_KEY.to_string()),
        operator: Some("Equal".to_string()),
        value: Some(TOLERATION_VALUE.to_string()),
        toleration_seconds: None,
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![container],
            tolerations: Some(vec![toleration]),
            node_selector: request.node_selector.clone().filter(|s| !s.is_empty()),
            ..Default::default()
        }),
        status: None,
    }
}
