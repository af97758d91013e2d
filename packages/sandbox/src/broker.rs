// ABOUTME: Execution broker tying artifact storage, sandbox leases and normalization together
// ABOUTME: Program failures come back as result data; only infrastructure faults are errors

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::backend::{BackendError, IsolationBackend, SandboxLease};
use crate::normalizer::{normalize, DEFAULT_OUTPUT_LIMIT};
use crate::types::{
    CodeArtifact, ExecutionRequest, ExecutionResult, RawOutput, ResourceLimits, Termination,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Isolation backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Sandbox failure: {0}")]
    Backend(BackendError),

    #[error("Artifact storage failure: {0}")]
    Storage(#[from] ArtifactError),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<BackendError> for BrokerError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(msg) => Self::BackendUnavailable(msg),
            other => Self::Backend(other),
        }
    }
}

impl BrokerError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::Backend(_) => "backend",
            Self::Storage(_) => "storage",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Ceilings applied to every sandbox
    pub limits: ResourceLimits,
    /// Per-stream byte ceiling in results
    pub output_limit: usize,
    /// Timeout used by callers that do not pick one
    pub default_timeout: Duration,
    /// Maximum number of live sandboxes
    pub max_concurrent: usize,
}

impl BrokerOptions {
    pub fn new(limits: ResourceLimits, default_timeout: Duration) -> Self {
        Self {
            limits,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            default_timeout,
            max_concurrent: 4,
        }
    }
}

/// Entry point for running model-written code
///
/// Each call saves the artifact, leases a fresh sandbox, runs the program on
/// a spawned task and returns the normalized result. The sandbox is released
/// on every path, including panics and cancellation.
pub struct ExecutionBroker {
    store: Arc<dyn ArtifactStore>,
    backend: Arc<dyn IsolationBackend>,
    options: BrokerOptions,
    permits: Arc<Semaphore>,
}

impl ExecutionBroker {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        backend: Arc<dyn IsolationBackend>,
        options: BrokerOptions,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_concurrent.max(1)));
        info!(
            "Execution broker ready (store: {}, backend: {}, max concurrent: {})",
            store.kind(),
            backend.name(),
            options.max_concurrent.max(1)
        );
        Self {
            store,
            backend,
            options,
            permits,
        }
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    /// Save `source` under `name` and run it with `args`
    ///
    /// Dropping the returned future cancels the run.
    pub async fn submit(
        &self,
        name: &str,
        source: &str,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        self.submit_with_cancel(name, source, args, timeout, cancel)
            .await
    }

    pub async fn submit_with_cancel(
        &self,
        name: &str,
        source: &str,
        args: Vec<String>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        if name.is_empty() {
            return Ok(ExecutionResult::rejected("artifact name is empty"));
        }
        if source.is_empty() {
            return Ok(ExecutionResult::rejected("source is empty"));
        }
        if timeout.is_zero() {
            return Ok(ExecutionResult::rejected("timeout must be greater than zero"));
        }

        let artifact = match self.store.save(name, source).await {
            Ok(artifact) => artifact,
            Err(e @ (ArtifactError::InvalidName { .. } | ArtifactError::WriteFailure(_))) => {
                warn!("Rejected artifact {:?}: {}", name, e);
                return Ok(ExecutionResult::rejected(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        self.run(artifact, args, timeout, cancel).await
    }

    /// Run an already stored artifact without saving it again
    pub async fn run_saved(
        &self,
        name: &str,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();

        if timeout.is_zero() {
            return Ok(ExecutionResult::rejected("timeout must be greater than zero"));
        }

        let artifact = match self.store.load(name).await {
            Ok(artifact) => artifact,
            Err(e @ (ArtifactError::InvalidName { .. } | ArtifactError::NotFound(_))) => {
                return Ok(ExecutionResult::rejected(e.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        self.run(artifact, args, timeout, cancel).await
    }

    pub async fn list_artifacts(&self) -> Result<Vec<String>> {
        Ok(self.store.list().await?)
    }

    pub async fn delete_artifact(&self, name: &str) -> Result<()> {
        Ok(self.store.delete(name).await?)
    }

    async fn run(
        &self,
        artifact: CodeArtifact,
        args: Vec<String>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let name = artifact.name.clone();
        let request = ExecutionRequest::new(artifact, args, timeout, self.options.limits.clone());

        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit
                .map_err(|_| BrokerError::Internal("sandbox limiter closed".to_string()))?,
            _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
        };

        debug!("Running artifact {} (timeout {:?})", name, timeout);

        let backend = self.backend.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let _permit = permit;
            let lease = SandboxLease::acquire(backend, &request.limits).await?;
            let outcome = lease.execute(&request, &task_cancel).await;
            if let Err(e) = lease.release().await {
                warn!("Failed to release sandbox: {}", e);
            }
            outcome
        });

        let raw: RawOutput = match task.await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                error!("Sandbox run of {} failed: {}", name, e);
                return Err(e.into());
            }
            Err(e) => {
                error!("Execution task for {} failed: {}", name, e);
                return Err(BrokerError::Internal(format!("execution task failed: {}", e)));
            }
        };

        if raw.termination == Termination::Cancelled {
            info!("Run of {} cancelled after {:?}", name, raw.duration);
            return Err(BrokerError::Cancelled);
        }

        let result = normalize(raw, self.options.output_limit);
        info!(
            "Artifact {} finished: {} in {}ms",
            name, result.status, result.duration_ms
        );

        if let Err(e) = self.store.mark_run(&name, Utc::now()).await {
            warn!("Failed to record run of {}: {}", name, e);
        }

        Ok(result)
    }
}
