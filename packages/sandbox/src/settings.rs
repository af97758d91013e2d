// ABOUTME: Broker configuration loaded from KNAPSACK_* environment variables
// ABOUTME: Resource ceilings are required; everything else has a documented default

use crate::backend::docker::DockerConfig;
use crate::backend::process::ProcessConfig;
use crate::broker::BrokerOptions;
use crate::normalizer::DEFAULT_OUTPUT_LIMIT;
use crate::types::ResourceLimits;
use knapsack_config::constants::*;
use knapsack_config::{env_or, optional_env, parse_words, required_env, EnvError};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error("Invalid artifact backend: {0} (expected 'filesystem' or 'sqlite')")]
    InvalidArtifactBackend(String),
    #[error("Invalid isolation backend: {0} (expected 'docker' or 'process')")]
    InvalidIsolationBackend(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactBackend {
    Filesystem,
    Sqlite,
}

impl FromStr for ArtifactBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "filesystem" | "fs" => Ok(ArtifactBackend::Filesystem),
            "sqlite" => Ok(ArtifactBackend::Sqlite),
            _ => Err(ConfigError::InvalidArtifactBackend(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationKind {
    Docker,
    Process,
}

impl FromStr for IsolationKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(IsolationKind::Docker),
            "process" => Ok(IsolationKind::Process),
            _ => Err(ConfigError::InvalidIsolationBackend(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub artifact_backend: ArtifactBackend,
    pub scratchpad_dir: PathBuf,
    pub database_url: String,

    pub isolation_backend: IsolationKind,
    pub sandbox_image: String,
    pub interpreter: Vec<String>,
    pub sandbox_workdir: String,
    pub image_pull_timeout: Duration,

    pub memory_limit_bytes: u64,
    pub default_timeout: Duration,
    pub cpu_cores: Option<f64>,
    pub pids_limit: Option<i64>,
    pub max_concurrent: usize,

    pub output_limit: usize,
    pub capture_limit: usize,

    pub research_url: Option<String>,
    pub research_namespace: String,
    pub research_top_k: usize,
    pub research_timeout: Duration,
}

impl BrokerSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let artifact_backend = env_or::<String>(KNAPSACK_ARTIFACT_BACKEND, "filesystem".into())?
            .parse::<ArtifactBackend>()?;
        let scratchpad_dir = env_or(KNAPSACK_SCRATCHPAD_DIR, PathBuf::from("./scratchpad"))?;
        let database_url = env_or(
            KNAPSACK_DATABASE_URL,
            format!("sqlite://{}", scratchpad_dir.join("artifacts.db").display()),
        )?;

        let isolation_backend = env_or::<String>(KNAPSACK_ISOLATION_BACKEND, "docker".into())?
            .parse::<IsolationKind>()?;
        let interpreter =
            parse_words(KNAPSACK_INTERPRETER).unwrap_or_else(|| vec!["python".to_string()]);

        let settings = Self {
            artifact_backend,
            scratchpad_dir,
            database_url,
            isolation_backend,
            sandbox_image: env_or(KNAPSACK_SANDBOX_IMAGE, "prefect-sandbox".to_string())?,
            interpreter,
            sandbox_workdir: env_or(KNAPSACK_SANDBOX_WORKDIR, "/app/scratchpad".to_string())?,
            image_pull_timeout: Duration::from_secs(env_or(KNAPSACK_IMAGE_PULL_TIMEOUT_SECS, 600)?),
            memory_limit_bytes: required_env(KNAPSACK_MEMORY_LIMIT_BYTES)?,
            default_timeout: Duration::from_millis(required_env(KNAPSACK_DEFAULT_TIMEOUT_MS)?),
            cpu_cores: optional_env(KNAPSACK_CPU_CORES)?,
            pids_limit: optional_env(KNAPSACK_PIDS_LIMIT)?,
            max_concurrent: env_or(KNAPSACK_MAX_CONCURRENT_SANDBOXES, 4)?,
            output_limit: env_or(KNAPSACK_OUTPUT_LIMIT_BYTES, DEFAULT_OUTPUT_LIMIT)?,
            capture_limit: env_or(KNAPSACK_CAPTURE_LIMIT_BYTES, 1024 * 1024)?,
            research_url: optional_env(KNAPSACK_RESEARCH_URL)?,
            research_namespace: env_or(KNAPSACK_RESEARCH_NAMESPACE, "knapsack".to_string())?,
            research_top_k: env_or(KNAPSACK_RESEARCH_TOP_K, 3)?,
            research_timeout: Duration::from_secs(env_or(KNAPSACK_RESEARCH_TIMEOUT_SECS, 30)?),
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_limit_bytes == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero",
                KNAPSACK_MEMORY_LIMIT_BYTES
            )));
        }
        if self.default_timeout.is_zero() {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero",
                KNAPSACK_DEFAULT_TIMEOUT_MS
            )));
        }
        if let Some(cores) = self.cpu_cores {
            if !(cores > 0.0 && cores.is_finite()) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a positive number, got {}",
                    KNAPSACK_CPU_CORES, cores
                )));
            }
        }
        if matches!(self.pids_limit, Some(n) if n <= 0) {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero",
                KNAPSACK_PIDS_LIMIT
            )));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero",
                KNAPSACK_MAX_CONCURRENT_SANDBOXES
            )));
        }
        if self.output_limit == 0 || self.capture_limit == 0 {
            return Err(ConfigError::Invalid(
                "output and capture limits must be greater than zero".to_string(),
            ));
        }
        if self.research_top_k == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero",
                KNAPSACK_RESEARCH_TOP_K
            )));
        }
        Ok(())
    }

    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory_limit_bytes: self.memory_limit_bytes,
            cpu_cores: self.cpu_cores,
            pids_limit: self.pids_limit,
        }
    }

    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            limits: self.limits(),
            output_limit: self.output_limit,
            default_timeout: self.default_timeout,
            max_concurrent: self.max_concurrent,
        }
    }

    pub fn docker_config(&self) -> DockerConfig {
        DockerConfig {
            image: self.sandbox_image.clone(),
            interpreter: self.interpreter.clone(),
            workdir: self.sandbox_workdir.clone(),
            pull_timeout: self.image_pull_timeout,
            capture_limit: self.capture_limit,
        }
    }

    pub fn process_config(&self) -> ProcessConfig {
        ProcessConfig {
            interpreter: self.interpreter.clone(),
            capture_limit: self.capture_limit,
            enforce_memory_limit: true,
            root: None,
        }
    }
}
