// ABOUTME: Tool call protocol exposed to the planning loop
// ABOUTME: Tagged request/response enums and an explicit dispatcher over broker and research

use crate::broker::ExecutionBroker;
use crate::research::ResearchClient;
use crate::types::ExecutionResult;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// One tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolCall {
    Research {
        query: String,
        #[serde(default)]
        n_documents: Option<usize>,
    },
    Execute {
        name: String,
        source: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    ListArtifacts {
        /// Glob over artifact names, e.g. `*.py`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
    },
    RunArtifact {
        name: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    DeleteArtifact {
        name: String,
    },
}

impl ToolCall {
    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::Research { .. } => "research",
            Self::Execute { .. } => "execute",
            Self::ListArtifacts { .. } => "list_artifacts",
            Self::RunArtifact { .. } => "run_artifact",
            Self::DeleteArtifact { .. } => "delete_artifact",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output", rename_all = "snake_case")]
pub enum ToolOutput {
    Documents { documents: Vec<String> },
    Execution { result: ExecutionResult },
    Artifacts { names: Vec<String> },
    Deleted { name: String },
    Error { kind: String, message: String },
}

impl ToolOutput {
    pub fn error(kind: impl Into<String>, message: impl ToString) -> Self {
        Self::Error {
            kind: kind.into(),
            message: message.to_string(),
        }
    }
}

pub struct ToolDispatcher {
    broker: Arc<ExecutionBroker>,
    research: Arc<dyn ResearchClient>,
    default_documents: usize,
}

impl ToolDispatcher {
    pub fn new(
        broker: Arc<ExecutionBroker>,
        research: Arc<dyn ResearchClient>,
        default_documents: usize,
    ) -> Self {
        Self {
            broker,
            research,
            default_documents,
        }
    }

    fn timeout(&self, timeout_ms: Option<u64>) -> Duration {
        timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.broker.options().default_timeout)
    }

    async fn list_artifacts(&self, pattern: Option<&str>) -> ToolOutput {
        let pattern = match pattern.map(Pattern::new).transpose() {
            Ok(pattern) => pattern,
            Err(e) => return ToolOutput::error("invalid_request", format!("bad pattern: {}", e)),
        };

        match self.broker.list_artifacts().await {
            Ok(names) => ToolOutput::Artifacts {
                names: names
                    .into_iter()
                    .filter(|name| pattern.as_ref().map_or(true, |p| p.matches(name)))
                    .collect(),
            },
            Err(e) => ToolOutput::error(e.kind(), e),
        }
    }

    pub async fn dispatch(&self, call: ToolCall) -> ToolOutput {
        info!("Dispatching tool call: {}", call.tool_name());

        let output = match call {
            ToolCall::Research { query, n_documents } => match self
                .research
                .research(&query, n_documents.unwrap_or(self.default_documents))
                .await
            {
                Ok(documents) => ToolOutput::Documents { documents },
                Err(e) => ToolOutput::error(e.kind(), e),
            },
            ToolCall::Execute {
                name,
                source,
                args,
                timeout_ms,
            } => {
                let timeout = self.timeout(timeout_ms);
                execution(self.broker.submit(&name, &source, args, timeout).await)
            }
            ToolCall::ListArtifacts { pattern } => self.list_artifacts(pattern.as_deref()).await,
            ToolCall::RunArtifact {
                name,
                args,
                timeout_ms,
            } => {
                let timeout = self.timeout(timeout_ms);
                execution(self.broker.run_saved(&name, args, timeout).await)
            }
            ToolCall::DeleteArtifact { name } => match self.broker.delete_artifact(&name).await {
                Ok(()) => ToolOutput::Deleted { name },
                Err(e) => ToolOutput::error(e.kind(), e),
            },
        };

        if let ToolOutput::Error { kind, message } = &output {
            warn!("Tool call failed ({}): {}", kind, message);
        }
        output
    }
}

fn execution(result: crate::broker::Result<ExecutionResult>) -> ToolOutput {
    match result {
        Ok(result) => ToolOutput::Execution { result },
        Err(e) => ToolOutput::error(e.kind(), e),
    }
}
