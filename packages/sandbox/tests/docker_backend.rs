// ABOUTME: Tests for the Docker isolation backend
// ABOUTME: Daemon-dependent tests are ignored by default; unavailability is checked without a daemon

use bollard::Docker;
use knapsack_sandbox::backend::docker::DockerConfig;
use knapsack_sandbox::{
    BackendError, BrokerError, BrokerOptions, CancellationToken, DockerBackend, ExecutionBroker,
    ExecutionStatus, FileArtifactStore, IsolationBackend, ResourceLimits,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn test_config() -> DockerConfig {
    DockerConfig {
        image: std::env::var("KNAPSACK_TEST_IMAGE").unwrap_or_else(|_| "python:3.12-slim".to_string()),
        interpreter: vec!["python".to_string()],
        ..DockerConfig::default()
    }
}

async fn docker_broker() -> (ExecutionBroker, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = FileArtifactStore::open(dir.path()).await.unwrap();
    let backend = DockerBackend::connect(test_config());
    let broker = ExecutionBroker::new(
        Arc::new(store),
        Arc::new(backend),
        BrokerOptions::new(
            ResourceLimits {
                memory_limit_bytes: 256 * 1024 * 1024,
                cpu_cores: Some(1.0),
                pids_limit: Some(64),
            },
            Duration::from_secs(30),
        ),
    );
    (broker, dir)
}

/// A daemon that cannot be reached is reported as unavailable, not as a program failure
#[tokio::test]
async fn test_unreachable_daemon_is_unavailable() {
    // Nothing listens on port 1
    let client =
        Docker::connect_with_http("http://127.0.0.1:1", 5, bollard::API_DEFAULT_VERSION).unwrap();
    let backend = DockerBackend::with_client(client, test_config());

    assert!(!backend.is_available().await);
    let err = backend
        .acquire(&ResourceLimits::with_memory(64 * 1024 * 1024))
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Unavailable(_)), "{:?}", err);

    let broker_err: BrokerError = err.into();
    assert_eq!(broker_err.kind(), "backend_unavailable");
}

#[tokio::test]
#[ignore] // Requires Docker daemon
async fn test_docker_hello_world() {
    let (broker, _dir) = docker_broker().await;

    let result = broker
        .submit("hello.py", "print('hello')", Vec::new(), Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.stdout, "hello\n");
}

#[tokio::test]
#[ignore] // Requires Docker daemon
async fn test_docker_network_is_disabled() {
    let (broker, _dir) = docker_broker().await;
    let source = "import socket\nsocket.create_connection(('1.1.1.1', 53), timeout=2)\n";

    let result = broker
        .submit("net.py", source, Vec::new(), Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Crashed);
}

#[tokio::test]
#[ignore] // Requires Docker daemon
async fn test_docker_timeout_kills_container() {
    let (broker, _dir) = docker_broker().await;

    let result = broker
        .submit(
            "sleepy.py",
            "import time\ntime.sleep(60)\n",
            Vec::new(),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::TimedOut);
    assert!(result.duration_ms < 10_000);
}

#[tokio::test]
#[ignore] // Requires Docker daemon
async fn test_docker_release_removes_container() {
    let backend = DockerBackend::connect(test_config());
    let handle = backend
        .acquire(&ResourceLimits::with_memory(128 * 1024 * 1024))
        .await
        .unwrap();
    let id = handle.id().to_string();

    backend.release(handle).await.unwrap();

    let client = Docker::connect_with_defaults().unwrap();
    assert!(client.inspect_container(&id, None).await.is_err());
}

#[tokio::test]
#[ignore] // Requires Docker daemon
async fn test_docker_cancel_stops_run() {
    let (broker, _dir) = docker_broker().await;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        trigger.cancel();
    });

    let err = broker
        .submit_with_cancel(
            "long.py",
            "import time\ntime.sleep(60)\n",
            Vec::new(),
            Duration::from_secs(60),
            cancel,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BrokerError::Cancelled));
}

#[tokio::test]
#[ignore] // Requires Docker daemon
async fn test_docker_background_child_does_not_hold_the_run() {
    let (broker, _dir) = docker_broker().await;
    let source = "import subprocess\nsubprocess.Popen(['sleep', '30'])\nprint('done')\n";

    let result = broker
        .submit("spawner.py", source, Vec::new(), Duration::from_secs(20))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.stdout, "done\n");
    assert!(result.duration_ms < 10_000, "duration {}ms", result.duration_ms);
}
