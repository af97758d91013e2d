// ABOUTME: Docker isolation backend: one locked-down container per sandbox
// ABOUTME: Uses bollard to create, exec into, kill and remove networkless containers

use super::{BackendError, CaptureBuffer, IsolationBackend, Resource, Result, SandboxHandle};
use crate::types::{CodeArtifact, ExecutionRequest, RawOutput, ResourceLimits, Termination};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
        RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::HostConfig,
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Label set on every container this backend creates
pub const MANAGED_LABEL: &str = "knapsack.sandbox.managed";

/// How often a running exec is checked for exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Output still accepted after the exec has exited
const EXIT_DRAIN: Duration = Duration::from_millis(250);

/// Static settings for the Docker backend
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Image with the interpreter and libraries preinstalled
    pub image: String,
    /// Command used to run an artifact, e.g. `["python"]`
    pub interpreter: Vec<String>,
    /// Directory inside the container that receives the artifact
    pub workdir: String,
    pub pull_timeout: Duration,
    /// Per-stream byte ceiling for captured output
    pub capture_limit: usize,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "prefect-sandbox".to_string(),
            interpreter: vec!["python".to_string()],
            workdir: "/app/scratchpad".to_string(),
            pull_timeout: Duration::from_secs(600),
            capture_limit: 1024 * 1024,
        }
    }
}

pub struct DockerBackend {
    /// Created on first use; a failed connection is retried on the next request
    client: OnceCell<Docker>,
    config: DockerConfig,
    /// Images known to be present locally, with the time they were confirmed
    image_cache: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
}

impl DockerBackend {
    /// Backend for the local daemon described by the standard environment
    ///
    /// No connection is made here. A missing or unreachable daemon surfaces as
    /// [`BackendError::Unavailable`] from whichever call first needs it.
    pub fn connect(config: DockerConfig) -> Self {
        Self {
            client: OnceCell::new(),
            config,
            image_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_client(client: Docker, config: DockerConfig) -> Self {
        Self {
            client: OnceCell::new_with(Some(client)),
            config,
            image_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn client(&self) -> Result<&Docker> {
        self.client
            .get_or_try_init(|| async {
                Docker::connect_with_defaults().map_err(|e| {
                    BackendError::Unavailable(format!("Docker daemon not reachable: {}", e))
                })
            })
            .await
    }

    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    pub async fn is_available(&self) -> bool {
        match self.client().await {
            Ok(client) => client.ping().await.is_ok(),
            Err(_) => false,
        }
    }

    fn container_config(&self, limits: &ResourceLimits) -> Config<String> {
        let labels = HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]);

        Config {
            image: Some(self.config.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(self.config.workdir.clone()),
            labels: Some(labels),
            network_disabled: Some(true),
            host_config: Some(host_config(limits)),
            ..Default::default()
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client().await?.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(BackendError::Image(e.to_string())),
        }
    }

    async fn ensure_image(&self) -> Result<()> {
        let image = self.config.image.as_str();

        if self.image_cache.read().await.contains_key(image) {
            if self.image_exists(image).await? {
                return Ok(());
            }
            self.image_cache.write().await.remove(image);
            info!("Image {} was removed externally, dropping from cache", image);
        }

        if !self.image_exists(image).await? {
            self.pull_image(image).await?;
        }

        self.image_cache
            .write()
            .await
            .insert(image.to_string(), chrono::Utc::now());
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(
            "Pulling image: {} (timeout: {:?})",
            image, self.config.pull_timeout
        );

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client().await?.create_image(Some(options), None, None);

        let pull = async {
            let mut last_status = String::new();
            while let Some(result) = stream.next().await {
                let info = result.map_err(|e| {
                    BackendError::Image(format!("Failed to pull image {}: {}", image, e))
                })?;
                if let Some(error) = info.error {
                    return Err(BackendError::Image(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
                if let Some(status) = info.status {
                    if status != last_status {
                        debug!("Pull status: {}", status);
                        last_status = status;
                    }
                }
            }
            Ok(())
        };

        match tokio::time::timeout(self.config.pull_timeout, pull).await {
            Ok(result) => {
                result?;
                info!("Successfully pulled image: {}", image);
                Ok(())
            }
            Err(_) => Err(BackendError::Image(format!(
                "Timeout pulling image {} after {:?}",
                image, self.config.pull_timeout
            ))),
        }
    }

    async fn upload_source(&self, container_id: &str, artifact: &CodeArtifact) -> Result<()> {
        let archive = source_tar(&artifact.name, &artifact.source)?;
        let options = UploadToContainerOptions {
            path: self.config.workdir.clone(),
            ..Default::default()
        };

        self.client()
            .await?
            .upload_to_container(container_id, Some(options), archive.into())
            .await
            .map_err(|e| BackendError::Container(e.to_string()))
    }

    async fn kill(&self, container_id: &str) {
        let options = KillContainerOptions { signal: "SIGKILL" };
        let killed = match self.client().await {
            Ok(client) => client
                .kill_container(container_id, Some(options))
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match killed {
            Ok(()) => debug!("Killed container {}", container_id),
            Err(e) => warn!("Failed to kill container {}: {}", container_id, e),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self
            .client()
            .await?
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Container {} already gone", container_id);
                Ok(())
            }
            Err(e) => Err(BackendError::Container(e.to_string())),
        }
    }

    /// Remove managed containers left behind by an earlier process
    pub async fn reap_orphans(&self) -> Result<Vec<String>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}=true", MANAGED_LABEL)],
        )]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client()
            .await?
            .list_containers(Some(options))
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let mut reaped = Vec::new();
        for id in containers.into_iter().filter_map(|c| c.id) {
            match self.remove(&id).await {
                Ok(()) => reaped.push(id),
                Err(e) => warn!("Failed to remove orphaned container {}: {}", id, e),
            }
        }

        if !reaped.is_empty() {
            info!("Removed {} orphaned sandbox containers", reaped.len());
        }
        Ok(reaped)
    }
}

/// Security and resource settings applied to every sandbox container
fn host_config(limits: &ResourceLimits) -> HostConfig {
    let memory = i64::try_from(limits.memory_limit_bytes).unwrap_or(i64::MAX);

    HostConfig {
        memory: Some(memory),
        // Equal to memory: no swap on top of the ceiling
        memory_swap: Some(memory),
        nano_cpus: limits.cpu_cores.map(|c| (c * 1_000_000_000.0) as i64),
        pids_limit: limits.pids_limit,
        network_mode: Some("none".to_string()),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        privileged: Some(false),
        auto_remove: Some(false),
        ..Default::default()
    }
}

/// In-memory tar holding a single file
fn source_tar(name: &str, source: &str) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(source.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, name, source.as_bytes())?;
    builder.into_inner()
}

fn capture(msg: LogOutput, stdout: &mut CaptureBuffer, stderr: &mut CaptureBuffer) {
    match msg {
        LogOutput::StdOut { message } | LogOutput::Console { message } => stdout.push(&message),
        LogOutput::StdErr { message } => stderr.push(&message),
        LogOutput::StdIn { .. } => {}
    }
}

fn classify(e: bollard::errors::Error) -> BackendError {
    use bollard::errors::Error;
    match e {
        Error::DockerResponseServerError { .. } => BackendError::Container(e.to_string()),
        other => BackendError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl IsolationBackend for DockerBackend {
    async fn acquire(&self, limits: &ResourceLimits) -> Result<SandboxHandle> {
        self.client()
            .await?
            .ping()
            .await
            .map_err(|e| BackendError::Unavailable(format!("Docker daemon not reachable: {}", e)))?;

        self.ensure_image().await?;

        let name = format!("knapsack-{}", uuid::Uuid::new_v4());
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        let client = self.client().await?;
        let container = client
            .create_container(Some(options), self.container_config(limits))
            .await
            .map_err(classify)?;

        let handle = SandboxHandle::container(container.id.clone());

        if let Err(e) = client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            // Created but never started: remove before reporting
            if let Err(cleanup) = self.remove(&container.id).await {
                warn!("Failed to remove unstarted container {}: {}", name, cleanup);
            }
            return Err(classify(e));
        }

        info!("Started sandbox container {} ({})", name, container.id);
        Ok(handle)
    }

    async fn execute(
        &self,
        handle: &SandboxHandle,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<RawOutput> {
        let Resource::Container(container_id) = &handle.resource else {
            return Err(BackendError::Execution(format!(
                "handle {} does not belong to the docker backend",
                handle.id()
            )));
        };

        let client = self.client().await?;
        self.upload_source(container_id, &request.artifact).await?;

        let mut cmd = self.config.interpreter.clone();
        cmd.push(request.artifact.name.clone());
        cmd.extend(request.args.iter().cloned());

        let exec = client
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    working_dir: Some(self.config.workdir.clone()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(classify)?;

        let started = Instant::now();
        let mut output = match client
            .start_exec(&exec.id, None)
            .await
            .map_err(classify)?
        {
            StartExecResults::Attached { output, .. } => output,
            StartExecResults::Detached => {
                return Err(BackendError::Execution(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        };

        let mut stdout = CaptureBuffer::new(self.config.capture_limit);
        let mut stderr = CaptureBuffer::new(self.config.capture_limit);
        let deadline = tokio::time::sleep(request.timeout);
        tokio::pin!(deadline);
        let mut exit_poll = tokio::time::interval(EXIT_POLL_INTERVAL);
        exit_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The stream stays open while any process holds the exec's stdout, so
        // exit is detected by polling rather than by end of stream alone.
        let termination = loop {
            tokio::select! {
                _ = &mut deadline => break Termination::TimedOut,
                _ = cancel.cancelled() => break Termination::Cancelled,
                msg = output.next() => match msg {
                    Some(Ok(msg)) => capture(msg, &mut stdout, &mut stderr),
                    Some(Err(e)) => return Err(BackendError::Execution(e.to_string())),
                    None => break Termination::Exited,
                },
                _ = exit_poll.tick() => {
                    let state = client.inspect_exec(&exec.id).await.map_err(classify)?;
                    if state.running == Some(false) {
                        let drain = async {
                            while let Some(Ok(msg)) = output.next().await {
                                capture(msg, &mut stdout, &mut stderr);
                            }
                        };
                        if tokio::time::timeout(EXIT_DRAIN, drain).await.is_err() {
                            debug!("Exec {} exited with output still attached", exec.id);
                        }
                        break Termination::Exited;
                    }
                }
            }
        };
        let duration = started.elapsed();

        let exit_code = match termination {
            Termination::Exited => client
                .inspect_exec(&exec.id)
                .await
                .map_err(classify)?
                .exit_code,
            Termination::TimedOut | Termination::Cancelled => {
                info!(
                    "Killing sandbox container {} ({:?})",
                    container_id, termination
                );
                self.kill(container_id).await;
                None
            }
        };

        let (stdout, stdout_overflowed) = stdout.into_parts();
        let (stderr, stderr_overflowed) = stderr.into_parts();

        Ok(RawOutput {
            exit_code,
            signal: None,
            stdout,
            stderr,
            stdout_overflowed,
            stderr_overflowed,
            duration,
            termination,
        })
    }

    async fn release(&self, handle: SandboxHandle) -> Result<()> {
        match &handle.resource {
            Resource::Container(container_id) => {
                self.remove(container_id).await?;
                debug!("Removed sandbox container {}", container_id);
                Ok(())
            }
            _ => Err(BackendError::Execution(format!(
                "handle {} does not belong to the docker backend",
                handle.id()
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}
