// ABOUTME: Sandboxed code-execution broker for model-written programs
// ABOUTME: Persists artifacts, runs them in disposable isolated sandboxes and normalizes the outcome

pub mod artifacts;
pub mod backend;
pub mod broker;
pub mod factory;
pub mod normalizer;
pub mod research;
pub mod settings;
pub mod tools;
pub mod types;

pub use artifacts::{
    validate_name, ArtifactError, ArtifactStore, FileArtifactStore, SqliteArtifactStore,
};
pub use backend::{
    BackendError, CaptureBuffer, DockerBackend, IsolationBackend, ProcessBackend, SandboxHandle,
    SandboxLease,
};
pub use broker::{BrokerError, BrokerOptions, ExecutionBroker};
pub use normalizer::{normalize, DEFAULT_OUTPUT_LIMIT};
pub use research::{DisabledResearch, HttpResearchClient, ResearchClient, ResearchError};
pub use settings::{ArtifactBackend, BrokerSettings, ConfigError, IsolationKind};
pub use tools::{ToolCall, ToolDispatcher, ToolOutput};
pub use types::{
    CodeArtifact, ExecutionRequest, ExecutionResult, ExecutionStatus, RawOutput, ResourceLimits,
    Termination,
};

// Re-exported so callers can drive `submit_with_cancel` without a direct dependency
pub use tokio_util::sync::CancellationToken;
