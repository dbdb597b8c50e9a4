use super::{EngineError, ExecChunk, ExecSession, Lookup, PhaseWatch, PodApi, PodInfo, PodPhase};
use crate::error::{KodoError, Result};
use crate::proxy::ProxyGuard;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{AttachParams, DeleteParams, PostParams, WatchEvent, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Server-side watch timeouts must stay below this many seconds.
const MAX_WATCH_TIMEOUT_SECS: u64 = 290;

impl From<kube::Error> for EngineError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => EngineError::Api {
                status: response.code,
                message: response.message,
            },
            other => EngineError::Transport(other.to_string()),
        }
    }
}

/// Pod API of one namespace on a Kubernetes cluster.
pub struct KubePodApi {
    pods: Api<Pod>,
    namespace: String,
}

impl KubePodApi {
    /// Loads credentials and builds a client. In-cluster service account
    /// credentials win; otherwise the explicit kubeconfig, then the default one.
    pub async fn connect(
        namespace: &str,
        kubeconfig: Option<&Path>,
        disable_proxy: bool,
    ) -> Result<Self> {
        let _proxy = ProxyGuard::enter(disable_proxy);

        let config = match Config::incluster() {
            Ok(config) => {
                info!("using in-cluster credentials");
                config
            }
            Err(e) => {
                debug!(error = %e, "no in-cluster credentials, using kubeconfig");
                load_kubeconfig(kubeconfig).await?
            }
        };

        let client = Client::try_from(config)
            .map_err(|e| KodoError::Config(format!("cannot build cluster client: {}", e)))?;

        Ok(Self {
            pods: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        })
    }
}

async fn load_kubeconfig(path: Option<&Path>) -> Result<Config> {
    let options = KubeConfigOptions::default();
    let loaded = match path {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                KodoError::Config(format!("cannot read kubeconfig {}: {}", path.display(), e))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &options).await
        }
        None => Config::from_kubeconfig(&options).await,
    };
    loaded.map_err(|e| KodoError::Config(format!("cannot load kubeconfig: {}", e)))
}

fn pod_info(pod: Pod) -> PodInfo {
    let image = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.containers.first())
        .and_then(|c| c.image.clone());
    let phase = PodPhase::parse(pod.status.as_ref().and_then(|s| s.phase.as_deref()));
    PodInfo {
        name: pod.metadata.name.unwrap_or_default(),
        image,
        phase,
    }
}

/// Exit code carried by the exec status channel. A clean exit reports
/// `Success`; anything else carries an `ExitCode` cause.
fn exit_code_from_status(status: &Status) -> Option<i64> {
    if status.status.as_deref() == Some("Success") {
        return Some(0);
    }
    status
        .details
        .as_ref()?
        .causes
        .as_ref()?
        .iter()
        .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
        .and_then(|cause| cause.message.as_deref())
        .and_then(|code| code.trim().parse().ok())
}

async fn forward<R>(
    mut reader: R,
    tx: mpsc::UnboundedSender<ExecChunk>,
    wrap: fn(Vec<u8>) -> ExecChunk,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(wrap(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
        }
    }
}

struct KubePhaseWatch {
    events: Option<BoxStream<'static, kube::Result<WatchEvent<Pod>>>>,
}

#[async_trait]
impl PhaseWatch for KubePhaseWatch {
    async fn next_phase(&mut self) -> Option<std::result::Result<PodPhase, EngineError>> {
        loop {
            let events = self.events.as_mut()?;
            let event = match events.next().await {
                Some(event) => event,
                None => {
                    self.events = None;
                    return None;
                }
            };
            return Some(match event {
                Ok(WatchEvent::Added(pod)) | Ok(WatchEvent::Modified(pod)) => {
                    Ok(pod_info(pod).phase)
                }
                Ok(WatchEvent::Deleted(_)) => Ok(PodPhase::Deleted),
                Ok(WatchEvent::Bookmark(_)) => continue,
                Ok(WatchEvent::Error(e)) => Err(EngineError::Api {
                    status: e.code,
                    message: e.message,
                }),
                Err(e) => Err(e.into()),
            });
        }
    }

    fn stop(&mut self) {
        self.events = None;
    }
}

#[async_trait]
impl PodApi for KubePodApi {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn read(&self, name: &str) -> std::result::Result<Lookup<PodInfo>, EngineError> {
        let found = Lookup::from_result(self.pods.get(name).await.map_err(EngineError::from))?;
        Ok(match found {
            Lookup::Found(pod) => Lookup::Found(pod_info(pod)),
            Lookup::NotFound => Lookup::NotFound,
        })
    }

    async fn create(&self, pod: &Pod) -> std::result::Result<(), EngineError> {
        self.pods.create(&PostParams::default(), pod).await?;
        Ok(())
    }

    async fn watch_phases(
        &self,
        name: &str,
        timeout: Duration,
    ) -> std::result::Result<Box<dyn PhaseWatch>, EngineError> {
        let server_timeout = timeout.as_secs().clamp(1, MAX_WATCH_TIMEOUT_SECS) as u32;
        let params = WatchParams::default()
            .fields(&format!("metadata.name={}", name))
            .timeout(server_timeout);
        let events = self.pods.watch(&params, "0").await?.boxed();
        Ok(Box::new(KubePhaseWatch {
            events: Some(events),
        }))
    }

    async fn exec(
        &self,
        name: &str,
        command: Vec<String>,
    ) -> std::result::Result<ExecSession, EngineError> {
        let params = AttachParams::default()
            .stdin(false)
            .stdout(true)
            .stderr(true)
            .tty(false);
        let mut attached = self.pods.exec(name, command, &params).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = attached.stdout() {
            tokio::spawn(forward(stdout, tx.clone(), ExecChunk::Stdout));
        }
        if let Some(stderr) = attached.stderr() {
            tokio::spawn(forward(stderr, tx.clone(), ExecChunk::Stderr));
        }
        drop(tx);

        let status = attached.take_status();
        let exit_code = async move {
            let status = match status {
                Some(status) => status.await,
                None => None,
            };
            if let Err(e) = attached.join().await {
                debug!(error = %e, "exec stream closed with error");
            }
            status.as_ref().and_then(exit_code_from_status)
        };
        Ok(ExecSession::new(rx, exit_code.boxed()))
    }

    async fn exec_with_input(
        &self,
        name: &str,
        command: Vec<String>,
        input: Vec<u8>,
    ) -> std::result::Result<(), EngineError> {
        let params = AttachParams::default()
            .stdin(true)
            .stdout(false)
            .stderr(true)
            .tty(false);
        let mut attached = self.pods.exec(name, command, &params).await?;

        let mut stdin = attached
            .stdin()
            .ok_or_else(|| EngineError::Transport("exec stream has no stdin".to_string()))?;
        stdin
            .write_all(&input)
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        stdin
            .shutdown()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        drop(stdin);

        let mut errors = String::new();
        if let Some(mut stderr) = attached.stderr() {
            let _ = stderr.read_to_string(&mut errors).await;
        }
        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        match status {
            Some(status) if exit_code_from_status(&status) != Some(0) => {
                Err(EngineError::Transport(format!(
                    "remote command failed: {} {}",
                    status.message.unwrap_or_default(),
                    errors.trim()
                )))
            }
            _ => Ok(()),
        }
    }

    async fn delete(
        &self,
        name: &str,
        grace_period_secs: i64,
    ) -> std::result::Result<Lookup<()>, EngineError> {
        let params = DeleteParams {
            grace_period_seconds: Some(grace_period_secs.max(0) as u32),
            ..DeleteParams::default()
        };
        Lookup::from_result(
            self.pods
                .delete(name, &params)
                .await
                .map(|_| ())
                .map_err(EngineError::from),
        )
    }
}
