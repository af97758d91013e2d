// ABOUTME: Isolation backend trait, opaque sandbox handles and scoped leases
// ABOUTME: Every backend provides acquire/execute/release; leases guarantee release on all paths

use crate::types::{ExecutionRequest, RawOutput, ResourceLimits};
use async_trait::async_trait;
use std::sync::Arc;
use tempfile::TempDir;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub mod docker;
pub mod process;

pub use docker::DockerBackend;
pub use process::ProcessBackend;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Isolation backend unavailable: {0}")]
    Unavailable(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// What a handle owns inside its backend
#[derive(Debug)]
pub(crate) enum Resource {
    Container(String),
    Directory(TempDir),
    External(String),
}

/// Opaque token for one acquired sandbox
///
/// Handles are not `Clone`: `release` consumes the handle, so a sandbox can
/// only be released once.
#[derive(Debug)]
pub struct SandboxHandle {
    id: String,
    pub(crate) resource: Resource,
}

impl SandboxHandle {
    pub(crate) fn container(id: String) -> Self {
        Self {
            id: id.clone(),
            resource: Resource::Container(id),
        }
    }

    pub(crate) fn directory(id: String, dir: TempDir) -> Self {
        Self {
            id,
            resource: Resource::Directory(dir),
        }
    }

    /// Handle for a backend implemented outside this crate
    pub fn external(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            id: id.clone(),
            resource: Resource::External(id),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Identifier given to [`SandboxHandle::external`], if this is an external handle
    pub fn external_id(&self) -> Option<&str> {
        match &self.resource {
            Resource::External(id) => Some(id),
            _ => None,
        }
    }
}

/// A mechanism that runs untrusted code in an isolated environment
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Create a fresh sandbox with the given ceilings
    ///
    /// Must fail with [`BackendError::Unavailable`] when the mechanism itself
    /// cannot be reached (daemon down, interpreter missing).
    async fn acquire(&self, limits: &ResourceLimits) -> Result<SandboxHandle>;

    /// Run the request's artifact inside `handle`
    ///
    /// Must return within roughly `request.timeout` plus a small kill grace,
    /// and promptly once `cancel` fires. Timeouts and cancellations are
    /// reported through [`RawOutput::termination`], not as errors.
    async fn execute(
        &self,
        handle: &SandboxHandle,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<RawOutput>;

    /// Tear the sandbox down, reclaiming everything it holds
    async fn release(&self, handle: SandboxHandle) -> Result<()>;

    /// Short backend name for logging
    fn name(&self) -> &'static str;
}

/// Byte sink that keeps at most `limit` bytes and remembers whether it dropped any
#[derive(Debug)]
pub struct CaptureBuffer {
    data: Vec<u8>,
    limit: usize,
    overflowed: bool,
}

impl CaptureBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            overflowed: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.overflowed = true;
        }
        let take = chunk.len().min(room);
        self.data.extend_from_slice(&chunk[..take]);
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn into_parts(self) -> (Vec<u8>, bool) {
        (self.data, self.overflowed)
    }
}

/// Scoped ownership of one sandbox
///
/// Call [`SandboxLease::release`] on every path. If a lease is dropped
/// without it (panic, aborted task), release is scheduled on the current
/// runtime instead.
pub struct SandboxLease {
    backend: Arc<dyn IsolationBackend>,
    handle: Option<SandboxHandle>,
}

impl SandboxLease {
    pub async fn acquire(
        backend: Arc<dyn IsolationBackend>,
        limits: &ResourceLimits,
    ) -> Result<Self> {
        let handle = backend.acquire(limits).await?;
        debug!("Acquired {} sandbox {}", backend.name(), handle.id());
        Ok(Self {
            backend,
            handle: Some(handle),
        })
    }

    pub fn handle(&self) -> Option<&SandboxHandle> {
        self.handle.as_ref()
    }

    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<RawOutput> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| BackendError::Execution("sandbox already released".to_string()))?;
        self.backend.execute(handle, request, cancel).await
    }

    pub async fn release(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => {
                let id = handle.id().to_string();
                self.backend.release(handle).await?;
                debug!("Released {} sandbox {}", self.backend.name(), id);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        warn!(
            "Sandbox {} dropped without release, scheduling cleanup",
            handle.id()
        );
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let backend = self.backend.clone();
                runtime.spawn(async move {
                    let id = handle.id().to_string();
                    if let Err(e) = backend.release(handle).await {
                        warn!("Deferred release of sandbox {} failed: {}", id, e);
                    }
                });
            }
            Err(_) => warn!(
                "No async runtime available to release sandbox {}",
                handle.id()
            ),
        }
    }
}
