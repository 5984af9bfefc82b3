//! Container lifecycle operations invoked by remote callers.

mod requests;
mod services;
mod upload;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use common::{OpResult, EXECUTION_END};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

pub use requests::{pull_target, BuildRequest, CancelRequest, ContainerRequest, RunRequest, TagRequest};
use requests::required;
pub use services::UpdaterRequest;
use upload::{apply_chunk, upload_paths, UploadChunk};

use crate::config::AgentConfig;
use crate::logsink::LogSink;
use crate::registry::{OperationHandle, OperationKey, OperationRegistry};
use crate::rpc::RpcError;
use crate::runtime::{
    BuildSpec, ContainerRuntime, ErrorKind, Outcome, PruneTarget, RegistryAuth, RestartPolicy,
    RunSpec, RuntimeError, MSG_CONTAINER_EXITED,
};
use crate::stream::{CancellableStream, ChunkStream, StreamEnd};

pub const MSG_ALREADY_RUNNING: &str = "Container already running";
pub const MSG_STILL_RUNNING: &str = "Container still running and not force stopped";
pub const MSG_CONTAINER_NOT_FOUND: &str = "Container not found";
pub const MSG_IMAGE_ABSENT: &str = "Image not found";
pub const MSG_NOTHING_TO_CANCEL: &str = "No active build stream was found";
pub const MSG_BUILD_INCOMPLETE: &str = "Stream ended abruptly without success";

const LOG_TAIL: usize = 500;
const DEFAULT_CALLER: &str = "device";
const ONE_WIRE_DEVICES: &str = "/sys/bus/w1/devices";

/// Result of removing a container, before it is turned into a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    Removed,
    Absent,
    StillRunning,
}

pub struct LifecycleExecutor {
    config: Arc<AgentConfig>,
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<OperationRegistry>,
    sink: LogSink,
    device_name: Option<String>,
}

impl LifecycleExecutor {
    pub fn new(
        config: Arc<AgentConfig>,
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<OperationRegistry>,
        sink: LogSink,
        device_name: Option<String>,
    ) -> Self {
        Self { config, runtime, registry, sink, device_name }
    }

    pub async fn is_running(&self) -> bool {
        self.runtime.ping().await.is_ok()
    }

    /// Run an app container to completion.
    pub async fn run(&self, req: RunRequest) -> Result<Value, RpcError> {
        let image_name = required(&req.image_name, || format!("Missing image name. Given: {req:?}"))?;
        let container = required(&req.container_name, || format!("Missing container name. Given: {req:?}"))?;

        match self.remove_inner(container, false, false).await {
            Ok(Removal::StillRunning) => {
                return Ok(OpResult::with_message(true, MSG_ALREADY_RUNNING).to_value());
            }
            Ok(_) => {}
            Err(e) => {
                info!(container, error = %e, "failed to remove container before run");
                return Ok(OpResult::with_message(true, MSG_ALREADY_RUNNING).to_value());
            }
        }

        let stage = req.stage.as_deref().unwrap_or("PROD");
        let app_name = req.app_name.as_deref().unwrap_or(container);
        let spec = RunSpec {
            image: self.config.image_ref(image_name),
            name: container.to_string(),
            env: self.run_environment(req.environment.as_ref()),
            binds: self.run_binds(stage, app_name),
            restart: if stage == "DEV" { RestartPolicy::No } else { RestartPolicy::UnlessStopped },
            labels: BTreeMap::from([("real".to_string(), "True".to_string())]),
            privileged: true,
            host_network: true,
            devices: vec!["/dev:/dev".to_string()],
        };
        let auth = self.auth(req.caller_authid.as_deref());

        let mut retries = 0;
        loop {
            self.sink.notify_start(container).await;
            info!(container, image = %spec.image, "running container");
            let err = match self.runtime.run_container(&spec, Some(&auth)).await {
                Ok(0) => break,
                Ok(code) => {
                    info!(container, exit_code = code, "container exited");
                    self.sink.publish_message(container, MSG_CONTAINER_EXITED).await;
                    break;
                }
                Err(e) => e,
            };
            match (err.kind(), err.run_outcome()) {
                (ErrorKind::ImageNotFound, Outcome::Fatal(reason)) => {
                    info!(container, error = %err, "image not found");
                    self.sink.publish_message(container, &reason).await;
                    break;
                }
                (_, Outcome::Retryable(reason)) if retries < self.config.agent.run_retry_limit => {
                    retries += 1;
                    info!(container, %reason, retry = retries, "container name in use, removing and retrying");
                    if let Err(e) = self.runtime.remove_container(container, true).await {
                        if e.removal_outcome(true) != Outcome::AlreadyAbsent {
                            warn!(container, error = %e, "implicit removal before retry failed");
                        }
                    }
                }
                (_, Outcome::Retryable(reason)) | (_, Outcome::Fatal(reason)) => {
                    warn!(container, error = %err, "run failed");
                    self.sink.publish_message(container, &reason).await;
                    return Err(RpcError::new(reason));
                }
                (_, Outcome::Success) | (_, Outcome::AlreadyAbsent) => break,
            }
        }
        info!(container, "run ended");
        Ok(Value::String(EXECUTION_END.to_string()))
    }

    pub async fn remove_container(&self, req: ContainerRequest) -> Result<OpResult, RpcError> {
        let container = required(&req.container_name, || {
            "Container name is missing from docker_remove_container request".to_string()
        })?;
        let force = req.force.unwrap_or(true);
        let removal = self.remove_inner(container, force, true).await?;
        Ok(match removal {
            Removal::Removed => OpResult::ok(),
            Removal::Absent => OpResult::with_message(true, MSG_CONTAINER_NOT_FOUND),
            Removal::StillRunning => OpResult::with_message(true, MSG_STILL_RUNNING),
        })
    }

    async fn remove_inner(&self, container: &str, force: bool, announce: bool) -> Result<Removal, RpcError> {
        info!(container, force, "removing container");
        let err = match self.runtime.remove_container(container, force).await {
            Ok(()) => {
                if announce {
                    let message = format!("Successfully removed the container: {container}");
                    self.sink.publish_message(container, &message).await;
                }
                return Ok(Removal::Removed);
            }
            Err(e) => e,
        };
        let err = match err.removal_outcome(force) {
            Outcome::AlreadyAbsent => return Ok(Removal::Absent),
            Outcome::Success => return Ok(Removal::StillRunning),
            Outcome::Retryable(_) => {
                info!(container, "container is restarting, retrying removal with force");
                match self.runtime.remove_container(container, true).await {
                    Ok(()) => return Ok(Removal::Removed),
                    Err(e) if e.removal_outcome(true) == Outcome::AlreadyAbsent => return Ok(Removal::Absent),
                    Err(e) => e,
                }
            }
            Outcome::Fatal(_) => err,
        };
        Err(self.fail(container, err.message()).await)
    }

    pub async fn remove_image(&self, req: ContainerRequest) -> Result<OpResult, RpcError> {
        let image_name = required(&req.image_name, || format!("Missing image name. Given: {req:?}"))?;
        let image = self.config.image_ref(image_name);
        info!(%image, "removing image");
        match self.runtime.remove_image(&image).await {
            Ok(()) => Ok(OpResult::ok()),
            Err(e) if e.image_removal_outcome() == Outcome::AlreadyAbsent => {
                Ok(OpResult::with_message(true, MSG_IMAGE_ABSENT))
            }
            Err(e) => match req.container_name.as_deref() {
                Some(container) => Err(self.fail(container, e.message()).await),
                None => {
                    error!(%image, error = %e, "failed to remove image");
                    Err(e.into())
                }
            },
        }
    }

    pub async fn tag(&self, req: TagRequest) -> Result<OpResult, RpcError> {
        let image_name = required(&req.image_name, || format!("Missing image name. Given: {req:?}"))?;
        let new_name = required(&req.new_image_name, || format!("Missing new image name. Given: {req:?}"))?;
        let version = required(&req.version, || format!("Missing version. Given: {req:?}"))?;

        let source = self.config.image_ref(image_name);
        let repo = self.config.image_ref(new_name.split(':').next().unwrap_or(new_name));
        let tag = version.to_lowercase();
        info!(%source, %repo, %tag, "tagging image");
        match self.runtime.tag_image(&source, &repo, &tag).await {
            Ok(()) => Ok(OpResult::ok()),
            Err(e) => match req.container_name.as_deref() {
                Some(container) => Err(self.fail(container, e.message()).await),
                None => Err(e.into()),
            },
        }
    }

    pub async fn pull(&self, req: ContainerRequest) -> Result<OpResult, RpcError> {
        let image_name = required(&req.image_name, || format!("Missing image name. Given data: {req:?}"))?;
        let container = req
            .container_name
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or_else(|| pull_target(image_name));
        let image = self.config.image_ref(image_name);
        let caller = req.caller_authid.as_deref();
        info!(%image, container = %container, "pulling image");

        let key = OperationKey::new(caller.unwrap_or(DEFAULT_CALLER), format!("pull:{container}"));
        let started = self.runtime.pull_image(&image, Some(self.auth(caller)));
        let end = match self.track(key, started, &container).await {
            Ok(end) => end,
            Err(e) => return Err(self.fail(&container, e.message()).await),
        };
        match end {
            StreamEnd::Completed { .. } => Ok(OpResult::ok()),
            StreamEnd::Cancelled => Err(RpcError::new(format!("Pull of {image} was cancelled"))),
            StreamEnd::Failed(message) => Err(self.fail(&container, &message).await),
        }
    }

    pub async fn push(&self, req: ContainerRequest) -> Result<OpResult, RpcError> {
        let image_name = required(&req.image_name, || format!("Missing image name. Given data: {req:?}"))?;
        let container = required(&req.container_name, || format!("Missing container name. Given data: {req:?}"))?
            .to_lowercase();
        let image = self.config.image_ref(image_name);
        let caller = req.caller_authid.as_deref();
        info!(%image, "pushing image");

        let key = OperationKey::new(caller.unwrap_or(DEFAULT_CALLER), format!("push:{container}"));
        let started = self.runtime.push_image(&image, Some(self.auth(caller)));
        let end = match self.track(key, started, &container).await {
            Ok(end) => end,
            Err(e) => return Err(self.fail(&container, e.message()).await),
        };
        match end {
            StreamEnd::Completed { .. } => Ok(OpResult::ok()),
            StreamEnd::Cancelled => Err(RpcError::new(format!("Push of {image} was cancelled"))),
            StreamEnd::Failed(message) => Err(self.fail(&container, &message).await),
        }
    }

    /// Build an app image, superseding any build already running for the
    /// same account and container.
    pub async fn build(&self, req: BuildRequest) -> Result<OpResult, RpcError> {
        let container = required(&req.container_name, || format!("Missing container name. Given: {req:?}"))?;
        let account = required(&req.account_id, || {
            "The container name and the account id is required to build".to_string()
        })?;
        let image_name = required(&req.image_name, || format!("Missing image name. Given: {req:?}"))?;
        let app_name = req.name.as_deref().unwrap_or(container);
        let app_type = req.app_type.as_deref().unwrap_or("APP");

        if let Err(e) = self.remove_inner(container, true, false).await {
            info!(container, error = %e, "could not remove container before build");
        }

        let spec = BuildSpec {
            context_dir: self.config.agent.base_dir.join(app_type).join(app_name),
            dockerfile: "Dockerfile".to_string(),
            tag: self.config.image_ref(image_name),
            squash: req.squash.unwrap_or(false),
            auth: Some(self.auth(req.caller_authid.as_deref())),
        };
        info!(tag = %spec.tag, context = %spec.context_dir.display(), "building image");
        let started = self.runtime.build_image(spec);
        let end = match self.track(OperationKey::new(account, container), started, container).await {
            Ok(end) => end,
            Err(e) => return Err(self.fail(container, e.message()).await),
        };

        match end {
            StreamEnd::Completed { last } if build_succeeded(last.as_ref()) => {
                info!(container, "build finished");
                Ok(OpResult::ok())
            }
            StreamEnd::Completed { last } => {
                error!(container, last = ?last, "build stream ended without a tag");
                Err(self.fail(container, MSG_BUILD_INCOMPLETE).await)
            }
            StreamEnd::Cancelled => {
                info!(container, "build cancelled");
                Err(RpcError::new(format!("Build of {container} was cancelled")))
            }
            StreamEnd::Failed(message) => Err(self.fail(container, &message).await),
        }
    }

    /// Cancel the build running for `(account_id, container_name)`. Having
    /// nothing to cancel is reported in the reply, not as an error.
    pub async fn build_cancel(&self, req: CancelRequest) -> Result<OpResult, RpcError> {
        let (Some(container), Some(account)) = (req.container_name.as_deref(), req.account_id.as_deref()) else {
            return Err(RpcError::new("The container name and the account id is required to cancel a build"));
        };
        let key = OperationKey::new(account, container);
        if !self.registry.cancel(&key) {
            info!(operation = %key, "no active build stream");
            return Ok(OpResult::with_message(false, MSG_NOTHING_TO_CANCEL));
        }
        let app_name = req.name.as_deref().unwrap_or(container);
        self.sink
            .publish_message(container, &format!("Successfully stopped build for {app_name}"))
            .await;
        Ok(OpResult::ok())
    }

    pub async fn ps(&self) -> Result<Value, RpcError> {
        Ok(self.runtime.list_containers().await?)
    }

    pub async fn images(&self) -> Result<Value, RpcError> {
        Ok(self.runtime.list_images().await?)
    }

    pub async fn stats(&self) -> Result<Value, RpcError> {
        Ok(self.runtime.container_stats().await?)
    }

    pub async fn logs(&self, req: ContainerRequest) -> Result<Value, RpcError> {
        let container = required(&req.container_name, || format!("Missing container name. Given data: {req:?}"))?;
        let logs = self
            .runtime
            .container_logs(container, LOG_TAIL)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => RpcError::new("container is not running"),
                _ => RpcError::from(e),
            })?;
        self.sink.publish_raw(container, Value::String(logs.clone())).await;
        Ok(Value::String(logs))
    }

    pub async fn prune(&self, target: PruneTarget) -> Result<Value, RpcError> {
        self.runtime.prune(target).await.map_err(|e| {
            error!(%target, error = %e, "prune failed");
            RpcError::from(e)
        })
    }

    pub async fn prune_all(&self) -> Result<OpResult, RpcError> {
        for target in [PruneTarget::Volumes, PruneTarget::Containers, PruneTarget::Networks, PruneTarget::Images] {
            self.prune(target).await?;
        }
        Ok(OpResult::ok())
    }

    /// Apply one chunk of an app archive upload.
    pub async fn write_data(&self, chunk: &str, filename: &str) -> Result<Value, RpcError> {
        if filename.is_empty() || filename.contains('/') || filename.contains("..") {
            return Err(RpcError::new(format!("invalid upload filename {filename:?}")));
        }
        let parsed = UploadChunk::parse(chunk).map_err(|e| RpcError::new(format!("invalid upload chunk: {e}")))?;
        let (archive, target) = upload_paths(&self.config.agent.base_dir, filename);
        tokio::task::spawn_blocking(move || apply_chunk(&archive, &target, parsed))
            .await
            .map_err(|e| RpcError::new(e.to_string()))?
            .map_err(|e| RpcError::new(format!("write_data failed for {filename}: {e}")))?;
        Ok(Value::Bool(true))
    }

    /// Take `key`, cancelling whatever held it, and only then start the
    /// producer. Its chunks are forwarded to `target`'s log topic and the key
    /// is released when the stream ends or fails to start.
    async fn track(
        &self,
        key: OperationKey,
        started: impl Future<Output = Result<ChunkStream, RuntimeError>>,
        target: &str,
    ) -> Result<StreamEnd, RuntimeError> {
        let (handle, flag) = self.registry.start(key, OperationHandle::cancel_flag);
        let stream = match started.await {
            Ok(stream) => stream,
            Err(e) => {
                self.registry.complete(&handle);
                return Err(e);
            }
        };
        debug!(operation = %handle.key(), id = handle.id(), "stream attached");
        let end = CancellableStream::new(stream, flag).forward_to(&self.sink, target).await;
        self.registry.complete(&handle);
        Ok(end)
    }

    async fn fail(&self, target: &str, message: &str) -> RpcError {
        error!(target_name = %target, error = %message, "operation failed");
        self.sink.publish_message(target, message).await;
        RpcError::new(message)
    }

    fn auth(&self, caller: Option<&str>) -> RegistryAuth {
        RegistryAuth {
            username: caller.unwrap_or(DEFAULT_CALLER).to_string(),
            password: self.config.secret.clone(),
            server: self.config.registry_server(),
        }
    }

    fn run_environment(&self, environment: Option<&Map<String, Value>>) -> Vec<String> {
        let mut vars = BTreeMap::new();
        for (key, entry) in environment.into_iter().flatten() {
            let value = entry.get("value").unwrap_or(entry);
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            vars.insert(key.clone(), text);
        }
        vars.insert("SWARM_KEY".to_string(), self.config.swarm_key.to_string());
        vars.insert("DEVICE_NAME".to_string(), self.device_name.clone().unwrap_or_default());
        vars.insert("DEVICE_SERIAL_NUMBER".to_string(), self.config.serial_number.clone());
        vars.into_iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    fn run_binds(&self, stage: &str, app_name: &str) -> Vec<String> {
        let base = &self.config.agent.base_dir;
        let mut binds = vec![
            format!("{}:/data/:rw", base.join("data").join("APP").join(stage).join(app_name).display()),
            format!("{}/:/shared/:rw", base.join("data").join("shared").display()),
            "/var/run/docker.sock:/var/run/docker.sock:ro".to_string(),
            "/boot:/boot:rw".to_string(),
        ];
        if Path::new(ONE_WIRE_DEVICES).exists() {
            binds.push(format!("{ONE_WIRE_DEVICES}:{ONE_WIRE_DEVICES}:rw"));
        }
        binds
    }
}

fn build_succeeded(last: Option<&Value>) -> bool {
    last.and_then(|chunk| chunk.get("stream"))
        .and_then(Value::as_str)
        .is_some_and(|s| s.starts_with("Successfully tagged"))
}
