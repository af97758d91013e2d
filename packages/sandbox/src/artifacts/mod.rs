// ABOUTME: Artifact store trait and shared validation for persisted source code
// ABOUTME: Defines the durable name -> source contract implemented by file and SQLite stores

use crate::types::CodeArtifact;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod fs;
pub mod sqlite;

pub use fs::FileArtifactStore;
pub use sqlite::SqliteArtifactStore;

/// Longest accepted artifact name
pub const MAX_NAME_LEN: usize = 128;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Invalid artifact name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Failed to write artifact: {0}")]
    WriteFailure(String),

    #[error("Failed to read artifact: {0}")]
    ReadFailure(String),

    #[error("Artifact not found: {0}")]
    NotFound(String),
}

impl ArtifactError {
    fn invalid(name: &str, reason: &str) -> Self {
        Self::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-readable category
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidName { .. } => "invalid_name",
            Self::WriteFailure(_) => "write_failure",
            Self::ReadFailure(_) => "read_failure",
            Self::NotFound(_) => "not_found",
        }
    }
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

/// Durable mapping from a logical name to a source blob
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist `source` under `name`, atomically replacing any previous version
    async fn save(&self, name: &str, source: &str) -> Result<CodeArtifact>;

    /// Load the current version of an artifact
    async fn load(&self, name: &str) -> Result<CodeArtifact>;

    /// Names of all stored artifacts, sorted
    async fn list(&self) -> Result<Vec<String>>;

    /// Remove an artifact
    async fn delete(&self, name: &str) -> Result<()>;

    /// Record that the artifact was executed at `at`
    async fn mark_run(&self, name: &str, at: DateTime<Utc>) -> Result<()>;

    /// Backend name for logging
    fn kind(&self) -> &'static str;
}

/// Check that `name` is a filesystem-safe identifier
///
/// Allowed: 1..=128 characters from `[A-Za-z0-9_.-]`, not starting with `.`
/// and never containing `..`. This rules out separators, NUL bytes and any
/// form of path traversal.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ArtifactError::invalid(name, "name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ArtifactError::invalid(
            name,
            &format!("name is longer than {} characters", MAX_NAME_LEN),
        ));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(ArtifactError::invalid(
            name,
            &format!("character {:?} is not allowed", bad),
        ));
    }
    if name.starts_with('.') {
        return Err(ArtifactError::invalid(name, "name must not start with '.'"));
    }
    if name.contains("..") {
        return Err(ArtifactError::invalid(name, "name must not contain '..'"));
    }
    Ok(())
}
