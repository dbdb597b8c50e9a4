mod common;

/// Tests for the local container adapter
#[cfg(test)]
mod local_lifecycle_tests {
    use crate::common::{reply, FakeEngine};
    use kodo::engine::EngineError;
    use kodo::sandbox::{ExecOptions, ExecutionRequest, LocalSandbox, Sandbox, DEFAULT_PATH};
    use kodo::RunnerConfig;

    fn sandbox(engine: &FakeEngine) -> LocalSandbox<FakeEngine> {
        LocalSandbox::new(engine.clone(), &RunnerConfig::default())
    }

    #[tokio::test]
    async fn test_start_exec_stop_roundtrip() {
        let engine = FakeEngine::default();
        engine.push_exec(reply("hi\n", 0));
        let mut local = sandbox(&engine);

        let target = local
            .start_container("img-abc123", &ExecutionRequest::new("myimg:latest"))
            .await
            .expect("start should succeed");
        assert_eq!(target.name, "img-abc123");
        assert_eq!(target.image, "myimg:latest");
        assert_eq!(local.managed(), vec!["img-abc123".to_string()]);

        let result = local
            .execute_command("img-abc123", "echo hi", &ExecOptions::default())
            .await;
        assert_eq!(result.into_tuple(), ("hi\n".to_string(), "0".to_string()));

        local.stop_container("img-abc123").await;
        assert!(local.managed().is_empty(), "ManagedSet should be empty after stop");
        assert_eq!(
            engine.calls(),
            vec![
                "find:img-abc123",
                "create:img-abc123",
                "start:img-abc123",
                "exec:img-abc123",
                "stop:img-abc123",
                "remove:img-abc123",
            ]
        );
    }

    #[tokio::test]
    async fn test_new_container_spec() {
        let engine = FakeEngine::default();
        let mut local = sandbox(&engine);
        let request = ExecutionRequest::new("python:3.11").env("MODE", "ci");

        local
            .start_container("py", &request)
            .await
            .expect("start should succeed");

        let spec = engine.state.lock().unwrap().created[0].clone();
        assert_eq!(spec.command, vec!["/bin/sh", "-c", "/bin/bash"]);
        assert!(spec.tty && spec.open_stdin);
        assert_eq!(spec.environment["PATH"], DEFAULT_PATH);
        assert_eq!(spec.environment["MODE"], "ci");
    }

    #[tokio::test]
    async fn test_start_twice_creates_once() {
        let engine = FakeEngine::default();
        let mut local = sandbox(&engine);
        let request = ExecutionRequest::new("alpine:3");

        local.start_container("dup", &request).await.unwrap();
        local.start_container("dup", &request).await.unwrap();

        assert_eq!(engine.count("create:"), 1, "second start must reuse the container");
        assert_eq!(local.managed().len(), 1);
    }

    #[tokio::test]
    async fn test_stopped_container_is_restarted() {
        let engine = FakeEngine::with_container("old", "alpine:3", "exited");
        let mut local = sandbox(&engine);

        let target = local
            .start_container("old", &ExecutionRequest::new("alpine:3"))
            .await
            .unwrap();

        assert_eq!(target.status, "running");
        assert_eq!(engine.count("create:"), 0);
        assert_eq!(engine.count("start:"), 1);
    }

    #[tokio::test]
    async fn test_running_container_is_reused_untouched() {
        let engine = FakeEngine::with_container("live", "alpine:3", "running");
        let mut local = sandbox(&engine);

        local
            .start_container("live", &ExecutionRequest::new("alpine:3"))
            .await
            .unwrap();

        assert_eq!(engine.calls(), vec!["find:live"]);
    }

    #[tokio::test]
    async fn test_failed_start_tracks_created_container() {
        let engine = FakeEngine::default();
        engine.state.lock().unwrap().fail_start = Some(EngineError::api(500, "cgroup error"));
        let mut local = sandbox(&engine);

        let err = local
            .start_container("broken", &ExecutionRequest::new("alpine:3"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cgroup error"));
        // The container was created, so cleanup must know about it.
        assert_eq!(local.managed(), vec!["broken".to_string()]);
    }
}

/// Tests for exec result mapping on the local adapter
#[cfg(test)]
mod local_exec_tests {
    use crate::common::{reply, ExecBehavior, FakeEngine};
    use kodo::engine::EngineError;
    use kodo::sandbox::{ExecOptions, LocalSandbox, DEFAULT_PATH};
    use kodo::RunnerConfig;
    use std::time::Duration;

    fn sandbox(engine: &FakeEngine) -> LocalSandbox<FakeEngine> {
        let config = RunnerConfig {
            exec_grace_secs: 0,
            ..RunnerConfig::default()
        };
        LocalSandbox::new(engine.clone(), &config)
    }

    #[tokio::test]
    async fn test_exec_invocation_shape() {
        let engine = FakeEngine::default();
        let local = sandbox(&engine);
        let options = ExecOptions {
            timeout: Duration::from_secs(10),
            workdir: Some("/work".to_string()),
        };

        local.execute_command("box", "ls -la", &options).await;

        let (name, command, workdir, env) = engine.state.lock().unwrap().execs[0].clone();
        assert_eq!(name, "box");
        assert_eq!(command, vec!["/bin/sh", "-c", "ls -la"]);
        assert_eq!(workdir.as_deref(), Some("/work"));
        assert_eq!(env["PATH"], DEFAULT_PATH);
    }

    #[tokio::test]
    async fn test_exec_timeout_code() {
        let engine = FakeEngine::default();
        engine.push_exec(reply("", 124));
        let local = sandbox(&engine);

        let result = local
            .execute_command("box", "sleep 100", &ExecOptions::with_timeout(Duration::from_secs(3)))
            .await;
        assert_eq!(result.output, "Command timed out (>3s)");
        assert_eq!(result.exit_code, "-1");
    }

    #[tokio::test]
    async fn test_exec_nonzero_exit() {
        let engine = FakeEngine::default();
        engine.push_exec(reply("boom", 7));
        let local = sandbox(&engine);

        let result = local
            .execute_command("box", "exit 7", &ExecOptions::default())
            .await;
        assert_eq!(result.into_tuple(), ("boom".to_string(), "Error: Exit code 7".to_string()));
    }

    #[tokio::test]
    async fn test_exec_engine_error() {
        let engine = FakeEngine::default();
        engine.push_exec(ExecBehavior::Fail(EngineError::api(409, "container is not running")));
        let local = sandbox(&engine);

        let result = local
            .execute_command("box", "true", &ExecOptions::default())
            .await;
        assert!(result.output.starts_with("Error: "));
        assert!(result.output.contains("container is not running"));
        assert_eq!(result.exit_code, "-1");
    }

    #[tokio::test]
    async fn test_hung_exec_is_abandoned() {
        let engine = FakeEngine::default();
        engine.push_exec(ExecBehavior::Hang);
        let local = sandbox(&engine);

        let result = local
            .execute_command("box", "cat", &ExecOptions::with_timeout(Duration::ZERO))
            .await;
        assert_eq!(result.output, "Command timed out (>0s)");
        assert_eq!(result.exit_code, "-1");
    }
}

/// Tests for file injection and teardown on the local adapter
#[cfg(test)]
mod local_copy_and_cleanup_tests {
    use crate::common::FakeEngine;
    use kodo::engine::EngineError;
    use kodo::sandbox::{ExecutionRequest, LocalSandbox, Sandbox};
    use kodo::RunnerConfig;
    use std::io::Read;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_copy_uploads_single_entry_archive() {
        let engine = FakeEngine::default();
        let local = LocalSandbox::new(engine.clone(), &RunnerConfig::default());
        let dir = tempdir().expect("Failed to create temp dir");
        let src = dir.path().join("fix.diff");
        std::fs::write(&src, "--- a\n+++ b\n").expect("Failed to write");

        local
            .copy_to_container("box", &src, "/tmp/incoming/change.patch")
            .await
            .expect("copy should succeed");

        let (name, dest_dir, bytes) = engine.state.lock().unwrap().uploads[0].clone();
        assert_eq!(name, "box");
        assert_eq!(dest_dir, "/tmp/incoming");

        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut entries = archive.entries().expect("valid archive");
        let mut entry = entries.next().expect("one entry").expect("readable entry");
        assert_eq!(entry.path().unwrap().to_str(), Some("change.patch"));
        let mut body = String::new();
        entry.read_to_string(&mut body).unwrap();
        assert_eq!(body, "--- a\n+++ b\n");
        drop(entry);
        assert!(entries.next().is_none(), "archive must hold a single entry");
    }

    #[tokio::test]
    async fn test_stop_failure_is_swallowed() {
        let engine = FakeEngine::default();
        let mut local = LocalSandbox::new(engine.clone(), &RunnerConfig::default());
        local
            .start_container("stuck", &ExecutionRequest::new("alpine:3"))
            .await
            .unwrap();
        engine.state.lock().unwrap().fail_remove = Some(EngineError::api(500, "device busy"));

        local.destroy("stuck").await.expect("stop never raises");
        assert_eq!(
            local.managed(),
            vec!["stuck".to_string()],
            "a container that could not be removed stays tracked"
        );
    }

    #[tokio::test]
    async fn test_stop_unmanaged_is_noop() {
        let engine = FakeEngine::with_container("foreign", "alpine:3", "running");
        let mut local = LocalSandbox::new(engine.clone(), &RunnerConfig::default());

        local.stop_container("foreign").await;
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_close_tears_everything_down() {
        let engine = FakeEngine::default();
        let mut local = LocalSandbox::new(engine.clone(), &RunnerConfig::default());
        for name in ["a", "b", "c"] {
            local
                .start_container(name, &ExecutionRequest::new("alpine:3"))
                .await
                .unwrap();
        }
        engine.state.lock().unwrap().fail_stop = Some(EngineError::api(304, "not running"));

        local.cleanup().await;

        assert!(local.managed().is_empty());
        assert_eq!(engine.count("remove:"), 3);
        assert!(engine.state.lock().unwrap().closed, "engine connection released");
    }
}
