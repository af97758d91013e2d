// ABOUTME: Common test utilities for broker integration tests
// ABOUTME: Provides a shell-backed broker and instrumented backends for counting or failing sandboxes

#![allow(dead_code)]

use async_trait::async_trait;
use knapsack_sandbox::backend::process::ProcessConfig;
use knapsack_sandbox::backend::Result as BackendResult;
use knapsack_sandbox::{
    BackendError, BrokerOptions, CancellationToken, ExecutionBroker, ExecutionRequest,
    FileArtifactStore, IsolationBackend, ProcessBackend, RawOutput, ResourceLimits,
    SandboxHandle,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const MEMORY_LIMIT: u64 = 512 * 1024 * 1024;

/// Test context keeping the scratchpad alive alongside the broker
pub struct TestBroker {
    pub broker: Arc<ExecutionBroker>,
    pub backend: Arc<CountingBackend>,
    pub _scratchpad: TempDir,
}

pub fn shell_backend() -> ProcessBackend {
    ProcessBackend::new(ProcessConfig {
        interpreter: vec!["sh".to_string()],
        capture_limit: 64 * 1024,
        enforce_memory_limit: false,
        root: None,
    })
    .unwrap()
}

pub fn options(max_concurrent: usize) -> BrokerOptions {
    let mut options = BrokerOptions::new(
        ResourceLimits::with_memory(MEMORY_LIMIT),
        Duration::from_secs(10),
    );
    options.max_concurrent = max_concurrent;
    options
}

/// Broker over a temp scratchpad and a counting shell backend
pub async fn setup_broker(max_concurrent: usize) -> TestBroker {
    let scratchpad = TempDir::new().unwrap();
    let store = FileArtifactStore::open(scratchpad.path()).await.unwrap();
    let backend = Arc::new(CountingBackend::new(shell_backend()));

    let broker = ExecutionBroker::new(Arc::new(store), backend.clone(), options(max_concurrent));

    TestBroker {
        broker: Arc::new(broker),
        backend,
        _scratchpad: scratchpad,
    }
}

/// Wraps a backend and tracks live and peak sandbox counts
pub struct CountingBackend {
    inner: ProcessBackend,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    live: AtomicUsize,
    pub peak: AtomicUsize,
}

impl CountingBackend {
    pub fn new(inner: ProcessBackend) -> Self {
        Self {
            inner,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Wait briefly for background releases to land
    pub async fn wait_for_releases(&self, expected: usize) {
        for _ in 0..100 {
            if self.released() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[async_trait]
impl IsolationBackend for CountingBackend {
    async fn acquire(&self, limits: &ResourceLimits) -> BackendResult<SandboxHandle> {
        let handle = self.inner.acquire(limits).await?;
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
        Ok(handle)
    }

    async fn execute(
        &self,
        handle: &SandboxHandle,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> BackendResult<RawOutput> {
        self.inner.execute(handle, request, cancel).await
    }

    async fn release(&self, handle: SandboxHandle) -> BackendResult<()> {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.released.fetch_add(1, Ordering::SeqCst);
        self.inner.release(handle).await
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

/// Backend whose execute panics, for checking release on unwind
#[derive(Default)]
pub struct PanickingBackend {
    pub released: AtomicUsize,
}

#[async_trait]
impl IsolationBackend for PanickingBackend {
    async fn acquire(&self, _limits: &ResourceLimits) -> BackendResult<SandboxHandle> {
        Ok(SandboxHandle::external("panicking-1"))
    }

    async fn execute(
        &self,
        _handle: &SandboxHandle,
        _request: &ExecutionRequest,
        _cancel: &CancellationToken,
    ) -> BackendResult<RawOutput> {
        panic!("backend exploded mid-run");
    }

    async fn release(&self, handle: SandboxHandle) -> BackendResult<()> {
        assert_eq!(handle.external_id(), Some("panicking-1"));
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "panicking"
    }
}

/// Backend that can never be reached
pub struct UnavailableBackend;

#[async_trait]
impl IsolationBackend for UnavailableBackend {
    async fn acquire(&self, _limits: &ResourceLimits) -> BackendResult<SandboxHandle> {
        Err(BackendError::Unavailable("container runtime is down".to_string()))
    }

    async fn execute(
        &self,
        _handle: &SandboxHandle,
        _request: &ExecutionRequest,
        _cancel: &CancellationToken,
    ) -> BackendResult<RawOutput> {
        unreachable!("execute without a sandbox")
    }

    async fn release(&self, _handle: SandboxHandle) -> BackendResult<()> {
        unreachable!("release without a sandbox")
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}
