// ABOUTME: Builds the configured artifact store, isolation backend and research client
// ABOUTME: Turns BrokerSettings into ready trait objects for the broker and dispatcher

use crate::artifacts::{ArtifactError, ArtifactStore, FileArtifactStore, SqliteArtifactStore};
use crate::backend::{BackendError, DockerBackend, IsolationBackend, ProcessBackend};
use crate::research::{DisabledResearch, HttpResearchClient, ResearchClient, ResearchError};
use crate::settings::{ArtifactBackend, BrokerSettings, IsolationKind};
use std::sync::Arc;
use tracing::{info, warn};

pub async fn build_store(
    settings: &BrokerSettings,
) -> Result<Arc<dyn ArtifactStore>, ArtifactError> {
    let store: Arc<dyn ArtifactStore> = match settings.artifact_backend {
        ArtifactBackend::Filesystem => {
            Arc::new(FileArtifactStore::open(&settings.scratchpad_dir).await?)
        }
        ArtifactBackend::Sqlite => {
            if let Some(path) = settings
                .database_url
                .strip_prefix("sqlite://")
                .and_then(|p| std::path::Path::new(p).parent())
                .filter(|p| !p.as_os_str().is_empty())
            {
                tokio::fs::create_dir_all(path)
                    .await
                    .map_err(|e| ArtifactError::WriteFailure(e.to_string()))?;
            }
            Arc::new(SqliteArtifactStore::open(&settings.database_url).await?)
        }
    };
    info!("Using {} artifact store", store.kind());
    Ok(store)
}

/// Build the isolation backend
///
/// For Docker this also removes containers orphaned by an earlier crash. An
/// unreachable daemon is not fatal here: the broker reports it per request.
pub async fn build_backend(
    settings: &BrokerSettings,
) -> Result<Arc<dyn IsolationBackend>, BackendError> {
    match settings.isolation_backend {
        IsolationKind::Docker => {
            let backend = DockerBackend::connect(settings.docker_config());
            if backend.is_available().await {
                if let Err(e) = backend.reap_orphans().await {
                    warn!("Failed to reap orphaned sandbox containers: {}", e);
                }
            } else {
                warn!("Docker daemon is not reachable; executions will fail until it is");
            }
            info!("Using docker isolation (image {})", settings.sandbox_image);
            Ok(Arc::new(backend))
        }
        IsolationKind::Process => {
            warn!("Using process isolation: sandboxed code has host network access");
            Ok(Arc::new(ProcessBackend::new(settings.process_config())?))
        }
    }
}

pub fn build_research(settings: &BrokerSettings) -> Result<Arc<dyn ResearchClient>, ResearchError> {
    match &settings.research_url {
        Some(url) => Ok(Arc::new(HttpResearchClient::new(
            url.clone(),
            settings.research_namespace.clone(),
            settings.research_timeout,
        )?)),
        None => {
            info!("No research service configured; research tool disabled");
            Ok(Arc::new(DisabledResearch))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceLimits;
    use serial_test::serial;
    use std::time::Duration;
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> BrokerSettings {
        BrokerSettings {
            artifact_backend: ArtifactBackend::Filesystem,
            scratchpad_dir: dir.path().join("scratchpad"),
            database_url: format!("sqlite://{}", dir.path().join("db/artifacts.db").display()),
            isolation_backend: IsolationKind::Process,
            sandbox_image: "prefect-sandbox".to_string(),
            interpreter: vec!["sh".to_string()],
            sandbox_workdir: "/app/scratchpad".to_string(),
            image_pull_timeout: Duration::from_secs(600),
            memory_limit_bytes: 1 << 28,
            default_timeout: Duration::from_secs(5),
            cpu_cores: None,
            pids_limit: None,
            max_concurrent: 2,
            output_limit: 1024,
            capture_limit: 4096,
            research_url: None,
            research_namespace: "knapsack".to_string(),
            research_top_k: 3,
            research_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_builds_filesystem_store() {
        let dir = TempDir::new().unwrap();
        let store = build_store(&settings(&dir)).await.unwrap();
        assert_eq!(store.kind(), "filesystem");
        assert!(dir.path().join("scratchpad").is_dir());
    }

    #[tokio::test]
    async fn test_builds_sqlite_store_in_new_directory() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings(&dir);
        settings.artifact_backend = ArtifactBackend::Sqlite;

        let store = build_store(&settings).await.unwrap();
        assert_eq!(store.kind(), "sqlite");
        store.save("a.py", "x").await.unwrap();
        assert!(dir.path().join("db/artifacts.db").exists());
    }

    #[tokio::test]
    async fn test_builds_process_backend_and_disabled_research() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);

        let backend = build_backend(&settings).await.unwrap();
        assert_eq!(backend.name(), "process");

        let research = build_research(&settings).unwrap();
        assert!(research.research("q", 1).await.is_err());
    }

    #[tokio::test]
    #[serial]
    async fn test_missing_docker_socket_is_not_fatal_at_startup() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings(&dir);
        settings.isolation_backend = IsolationKind::Docker;

        let previous = std::env::var("DOCKER_HOST").ok();
        std::env::set_var("DOCKER_HOST", "unix:///nonexistent/knapsack-docker.sock");

        let backend = build_backend(&settings).await;
        let acquired = match &backend {
            Ok(backend) => Some(
                backend
                    .acquire(&ResourceLimits::with_memory(64 * 1024 * 1024))
                    .await,
            ),
            Err(_) => None,
        };

        match previous {
            Some(value) => std::env::set_var("DOCKER_HOST", value),
            None => std::env::remove_var("DOCKER_HOST"),
        }

        assert_eq!(backend.unwrap().name(), "docker");
        let err = acquired.unwrap().unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)), "{:?}", err);
    }
}
