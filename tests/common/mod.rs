//! In-memory stand-ins for the container engine and the cluster API.
#![allow(dead_code)]

use async_trait::async_trait;
use futures::FutureExt;
use k8s_openapi::api::core::v1::Pod;
use kodo::engine::{
    ContainerEngine, ContainerInfo, ContainerSpec, EngineError, ExecChunk, ExecOutput,
    ExecSession, Lookup, PhaseWatch, PodApi, PodInfo, PodPhase,
};
use kodo::error::RetryConfig;
use kodo::sandbox::cluster::ClusterSettings;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_backoff_ms: 1,
        max_backoff_ms: 4,
        backoff_multiplier: 2.0,
    }
}

pub fn test_settings() -> ClusterSettings {
    ClusterSettings {
        disable_proxy: false,
        create_retry: fast_retry(5),
        copy_retry: fast_retry(5),
        ready_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
        exec_grace: Duration::ZERO,
        delete_grace_period_secs: 0,
    }
}

// ---------------------------------------------------------------------------
// Local engine
// ---------------------------------------------------------------------------

pub enum ExecBehavior {
    Reply(ExecOutput),
    Fail(EngineError),
    Hang,
}

pub fn reply(output: &str, exit_code: i64) -> ExecBehavior {
    ExecBehavior::Reply(ExecOutput {
        output: output.as_bytes().to_vec(),
        exit_code: Some(exit_code),
    })
}

#[derive(Default)]
pub struct EngineState {
    pub containers: HashMap<String, ContainerInfo>,
    pub calls: Vec<String>,
    pub created: Vec<ContainerSpec>,
    pub execs: Vec<(String, Vec<String>, Option<String>, BTreeMap<String, String>)>,
    pub exec_script: VecDeque<ExecBehavior>,
    pub uploads: Vec<(String, String, Vec<u8>)>,
    pub fail_start: Option<EngineError>,
    pub fail_stop: Option<EngineError>,
    pub fail_remove: Option<EngineError>,
    pub closed: bool,
}

#[derive(Clone, Default)]
pub struct FakeEngine {
    pub state: Arc<Mutex<EngineState>>,
}

impl FakeEngine {
    pub fn with_container(name: &str, image: &str, state: &str) -> Self {
        let engine = Self::default();
        engine.state.lock().unwrap().containers.insert(
            name.to_string(),
            ContainerInfo {
                name: name.to_string(),
                image: Some(image.to_string()),
                state: state.to_string(),
            },
        );
        engine
    }

    pub fn push_exec(&self, behavior: ExecBehavior) {
        self.state.lock().unwrap().exec_script.push_back(behavior);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn find(&self, name: &str) -> Result<Lookup<ContainerInfo>, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("find:{}", name));
        Ok(match state.containers.get(name) {
            Some(info) => Lookup::Found(info.clone()),
            None => Lookup::NotFound,
        })
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("create:{}", spec.name));
        if state.containers.contains_key(&spec.name) {
            return Err(EngineError::api(409, "name already in use"));
        }
        state.created.push(spec.clone());
        state.containers.insert(
            spec.name.clone(),
            ContainerInfo {
                name: spec.name.clone(),
                image: Some(spec.image.clone()),
                state: "created".to_string(),
            },
        );
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("start:{}", name));
        if let Some(e) = state.fail_start.clone() {
            return Err(e);
        }
        match state.containers.get_mut(name) {
            Some(info) => {
                info.state = "running".to_string();
                Ok(())
            }
            None => Err(EngineError::api(404, "no such container")),
        }
    }

    async fn stop(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("stop:{}", name));
        if let Some(e) = state.fail_stop.clone() {
            return Err(e);
        }
        if let Some(info) = state.containers.get_mut(name) {
            info.state = "exited".to_string();
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("remove:{}", name));
        if let Some(e) = state.fail_remove.clone() {
            return Err(e);
        }
        match state.containers.remove(name) {
            Some(_) => Ok(()),
            None => Err(EngineError::api(404, "no such container")),
        }
    }

    async fn exec(
        &self,
        name: &str,
        command: Vec<String>,
        workdir: Option<&str>,
        environment: &BTreeMap<String, String>,
    ) -> Result<ExecOutput, EngineError> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("exec:{}", name));
            state.execs.push((
                name.to_string(),
                command,
                workdir.map(str::to_string),
                environment.clone(),
            ));
            state.exec_script.pop_front()
        };
        match behavior {
            None => Ok(ExecOutput {
                output: Vec::new(),
                exit_code: Some(0),
            }),
            Some(ExecBehavior::Reply(out)) => Ok(out),
            Some(ExecBehavior::Fail(e)) => Err(e),
            Some(ExecBehavior::Hang) => futures::future::pending().await,
        }
    }

    async fn upload_archive(
        &self,
        name: &str,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("upload:{}", name));
        state
            .uploads
            .push((name.to_string(), dest_dir.to_string(), archive));
        Ok(())
    }

    async fn close(&mut self) {
        self.state.lock().unwrap().closed = true;
    }
}

// ---------------------------------------------------------------------------
// Cluster API
// ---------------------------------------------------------------------------

pub struct WatchScript {
    pub phases: Vec<PodPhase>,
    /// Keep the watch open without events once the phases run out
    pub then_hang: bool,
}

pub struct ExecScript {
    pub chunks: Vec<ExecChunk>,
    pub exit_code: Option<i64>,
    pub hang: bool,
}

#[derive(Default)]
pub struct PodState {
    pub pods: HashMap<String, PodInfo>,
    pub events: Vec<String>,
    pub read_error: Option<EngineError>,
    pub create_failures: VecDeque<EngineError>,
    pub create_attempts: u32,
    pub created: Vec<Pod>,
    pub watch_scripts: VecDeque<WatchScript>,
    pub watches_opened: u32,
    pub watches_stopped: u32,
    pub exec_scripts: VecDeque<Result<ExecScript, EngineError>>,
    pub exec_commands: Vec<Vec<String>>,
    pub held_senders: Vec<mpsc::UnboundedSender<ExecChunk>>,
    pub copy_failures: VecDeque<EngineError>,
    pub copy_attempts: Vec<(Vec<String>, Vec<u8>)>,
    pub delete_errors: HashMap<String, EngineError>,
    pub deleted: Vec<(String, i64)>,
}

#[derive(Clone, Default)]
pub struct FakePodApi {
    pub state: Arc<Mutex<PodState>>,
}

impl FakePodApi {
    pub fn with_pod(name: &str, image: &str, phase: PodPhase) -> Self {
        let api = Self::default();
        api.state.lock().unwrap().pods.insert(
            name.to_string(),
            PodInfo {
                name: name.to_string(),
                image: Some(image.to_string()),
                phase,
            },
        );
        api
    }

    pub fn script_watch(&self, phases: Vec<PodPhase>, then_hang: bool) {
        self.state
            .lock()
            .unwrap()
            .watch_scripts
            .push_back(WatchScript { phases, then_hang });
    }

    pub fn script_exec(&self, chunks: Vec<ExecChunk>, exit_code: Option<i64>) {
        self.state.lock().unwrap().exec_scripts.push_back(Ok(ExecScript {
            chunks,
            exit_code,
            hang: false,
        }));
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }
}

struct FakeWatch {
    phases: VecDeque<PodPhase>,
    then_hang: bool,
    stopped: bool,
    state: Arc<Mutex<PodState>>,
}

#[async_trait]
impl PhaseWatch for FakeWatch {
    async fn next_phase(&mut self) -> Option<Result<PodPhase, EngineError>> {
        if self.stopped {
            return None;
        }
        match self.phases.pop_front() {
            Some(phase) => Some(Ok(phase)),
            None if self.then_hang => futures::future::pending().await,
            None => None,
        }
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            let mut state = self.state.lock().unwrap();
            state.watches_stopped += 1;
            state.events.push("watch-stop".to_string());
        }
    }
}

#[async_trait]
impl PodApi for FakePodApi {
    fn namespace(&self) -> &str {
        "test"
    }

    async fn read(&self, name: &str) -> Result<Lookup<PodInfo>, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.events.push("read".to_string());
        if let Some(e) = state.read_error.clone() {
            return Err(e);
        }
        Ok(match state.pods.get(name) {
            Some(pod) => Lookup::Found(pod.clone()),
            None => Lookup::NotFound,
        })
    }

    async fn create(&self, pod: &Pod) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.create_attempts += 1;
        state.events.push("create".to_string());
        if let Some(e) = state.create_failures.pop_front() {
            return Err(e);
        }
        let name = pod.metadata.name.clone().unwrap_or_default();
        state.pods.insert(
            name.clone(),
            PodInfo {
                name,
                image: None,
                phase: PodPhase::Pending,
            },
        );
        state.created.push(pod.clone());
        Ok(())
    }

    async fn watch_phases(
        &self,
        _name: &str,
        _timeout: Duration,
    ) -> Result<Box<dyn PhaseWatch>, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.watches_opened += 1;
        state.events.push("watch".to_string());
        let script = state.watch_scripts.pop_front().unwrap_or(WatchScript {
            phases: vec![PodPhase::Running],
            then_hang: false,
        });
        Ok(Box::new(FakeWatch {
            phases: script.phases.into(),
            then_hang: script.then_hang,
            stopped: false,
            state: self.state.clone(),
        }))
    }

    async fn exec(&self, _name: &str, command: Vec<String>) -> Result<ExecSession, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.exec_commands.push(command);
        let script = state.exec_scripts.pop_front().unwrap_or(Ok(ExecScript {
            chunks: Vec::new(),
            exit_code: Some(0),
            hang: false,
        }))?;

        let (tx, rx) = mpsc::unbounded_channel();
        for chunk in script.chunks {
            tx.send(chunk).expect("receiver alive");
        }
        if script.hang {
            state.held_senders.push(tx);
        }
        Ok(ExecSession::new(
            rx,
            futures::future::ready(script.exit_code).boxed(),
        ))
    }

    async fn exec_with_input(
        &self,
        _name: &str,
        command: Vec<String>,
        input: Vec<u8>,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.copy_attempts.push((command, input));
        match state.copy_failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn delete(&self, name: &str, grace_period_secs: i64) -> Result<Lookup<()>, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("delete:{}", name));
        if let Some(e) = state.delete_errors.get(name).cloned() {
            return Err(e);
        }
        state.deleted.push((name.to_string(), grace_period_secs));
        Ok(match state.pods.remove(name) {
            Some(_) => Lookup::Found(()),
            None => Lookup::NotFound,
        })
    }
}
