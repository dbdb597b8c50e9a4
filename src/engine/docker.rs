use super::{ContainerEngine, ContainerInfo, ContainerSpec, EngineError, ExecOutput, Lookup};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, StartContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => EngineError::Api {
                status: status_code,
                message,
            },
            other => EngineError::Transport(other.to_string()),
        }
    }
}

/// Local Docker engine reached through its default socket.
pub struct DockerEngine {
    /// `None` once closed
    client: Option<Docker>,
}

impl DockerEngine {
    pub fn connect(timeout: Duration) -> Result<Self, EngineError> {
        let client = Docker::connect_with_local_defaults()?.with_timeout(timeout);
        Ok(Self {
            client: Some(client),
        })
    }

    fn client(&self) -> Result<&Docker, EngineError> {
        self.client
            .as_ref()
            .ok_or_else(|| EngineError::Transport("engine connection closed".to_string()))
    }
}

fn env_list(environment: &BTreeMap<String, String>) -> Vec<String> {
    environment
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect()
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn find(&self, name: &str) -> Result<Lookup<ContainerInfo>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);
        let containers = self
            .client()?
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        // The engine's name filter is a substring match; names carry a leading '/'.
        let wanted = format!("/{}", name);
        let found = containers.into_iter().find(|c| {
            c.names
                .as_ref()
                .map(|names| names.iter().any(|n| n == &wanted || n == name))
                .unwrap_or(false)
        });

        Ok(match found {
            Some(c) => Lookup::Found(ContainerInfo {
                name: name.to_string(),
                image: c.image,
                state: c.state.unwrap_or_default(),
            }),
            None => Lookup::NotFound,
        })
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<(), EngineError> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(env_list(&spec.environment)),
            tty: Some(spec.tty),
            open_stdin: Some(spec.open_stdin),
            attach_stdin: Some(false),
            ..Default::default()
        };
        self.client()?
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), EngineError> {
        self.client()?
            .start_container(name, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), EngineError> {
        self.client()?.stop_container(name, None).await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), EngineError> {
        self.client()?.remove_container(name, None).await?;
        Ok(())
    }

    async fn exec(
        &self,
        name: &str,
        command: Vec<String>,
        workdir: Option<&str>,
        environment: &BTreeMap<String, String>,
    ) -> Result<ExecOutput, EngineError> {
        let exec = self
            .client()?
            .create_exec(
                name,
                CreateExecOptions::<String> {
                    cmd: Some(command),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: workdir.map(str::to_string),
                    env: Some(env_list(environment)),
                    ..Default::default()
                },
            )
            .await?;

        let mut buffer = Vec::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.client()?.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                buffer.extend_from_slice(&chunk?.into_bytes());
            }
        }

        let inspect = self.client()?.inspect_exec(&exec.id).await?;
        debug!(container = name, exit_code = ?inspect.exit_code, "exec finished");
        Ok(ExecOutput {
            output: buffer,
            exit_code: inspect.exit_code,
        })
    }

    async fn upload_archive(
        &self,
        name: &str,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> Result<(), EngineError> {
        self.client()?
            .upload_to_container(
                name,
                Some(UploadToContainerOptions {
                    path: dest_dir.to_string(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await?;
        Ok(())
    }

    async fn close(&mut self) {
        if self.client.take().is_some() {
            debug!("engine connection released");
        }
    }
}
