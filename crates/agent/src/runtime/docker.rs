use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::errors::Error as BollardError;
use bollard::models::{BuildInfo, ContainerCreateBody, DeviceMapping, HostConfig, RestartPolicyNameEnum};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
    ListContainersOptionsBuilder, ListImagesOptions, LogsOptionsBuilder, PruneContainersOptions,
    PruneImagesOptions, PruneNetworksOptions, PruneVolumesOptions, PushImageOptionsBuilder,
    RemoveContainerOptionsBuilder, RemoveImageOptionsBuilder, StartContainerOptions,
    StatsOptionsBuilder, TagImageOptionsBuilder, WaitContainerOptions,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::channel::mpsc;
use futures::{SinkExt, Stream, StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::{
    split_reference, BuildSpec, ContainerRuntime, PruneTarget, RegistryAuth, RestartPolicy,
    RunSpec, RuntimeError,
};
use crate::stream::ChunkStream;

const DOCKER_TIMEOUT_SECS: u64 = 120;
const CHUNK_BUFFER: usize = 64;

impl From<BollardError> for RuntimeError {
    fn from(e: BollardError) -> Self {
        match e {
            BollardError::DockerResponseServerError { status_code, message } => {
                RuntimeError::from_response(Some(status_code), message)
            }
            BollardError::DockerStreamError { error } => RuntimeError::from_response(None, error),
            other => RuntimeError::from_response(None, other.to_string()),
        }
    }
}

impl RegistryAuth {
    fn credentials(&self) -> DockerCredentials {
        DockerCredentials {
            username: Some(self.username.clone()),
            password: Some(self.password.clone()),
            serveraddress: Some(self.server.clone()),
            ..Default::default()
        }
    }
}

/// [`ContainerRuntime`] backed by the local Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect(host: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = match host {
            Some(h) if h.starts_with("unix://") || h.starts_with('/') => {
                Docker::connect_with_socket(h, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(h) => Docker::connect_with_http(h, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }?;
        Ok(Self { docker })
    }

    async fn ensure_image(&self, image: &str, auth: Option<&RegistryAuth>) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        info!(%image, "image missing locally, pulling");
        let (repo, tag) = split_reference(image);
        let options = CreateImageOptionsBuilder::new().from_image(repo).tag(tag).build();
        let mut pull = Box::pin(self.docker.create_image(Some(options), None, auth.map(RegistryAuth::credentials)));
        while let Some(info) = pull.try_next().await.map_err(|e| RuntimeError::from(e).in_image_pull())? {
            if let Some(err) = info.error_detail.and_then(|d| d.message) {
                return Err(RuntimeError::from_response(None, err).in_image_pull());
            }
        }
        Ok(())
    }

    async fn create_and_start(&self, spec: &RunSpec, auth: Option<&RegistryAuth>) -> Result<(), RuntimeError> {
        self.ensure_image(&spec.image, auth).await?;
        let options = CreateContainerOptionsBuilder::new().name(&spec.name).build();
        self.docker.create_container(Some(options), create_body(spec)).await?;
        self.docker
            .start_container(&spec.name, None::<StartContainerOptions>)
            .await?;
        Ok(())
    }
}

fn create_body(spec: &RunSpec) -> ContainerCreateBody {
    let restart = match spec.restart {
        RestartPolicy::No => RestartPolicyNameEnum::NO,
        RestartPolicy::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
        RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
    };
    let devices = spec
        .devices
        .iter()
        .map(|mapping| {
            let (host, container) = mapping.split_once(':').unwrap_or((mapping.as_str(), mapping.as_str()));
            DeviceMapping {
                path_on_host: Some(host.to_string()),
                path_in_container: Some(container.to_string()),
                cgroup_permissions: Some("rwm".to_string()),
            }
        })
        .collect::<Vec<_>>();
    ContainerCreateBody {
        image: Some(spec.image.clone()),
        env: if spec.env.is_empty() { None } else { Some(spec.env.clone()) },
        labels: Some(spec.labels.clone().into_iter().collect::<HashMap<_, _>>()),
        host_config: Some(HostConfig {
            binds: Some(spec.binds.clone()),
            network_mode: spec.host_network.then(|| "host".to_string()),
            privileged: Some(spec.privileged),
            devices: if devices.is_empty() { None } else { Some(devices) },
            restart_policy: Some(bollard::models::RestartPolicy {
                name: Some(restart),
                maximum_retry_count: None,
            }),
            ..HostConfig::default()
        }),
        ..ContainerCreateBody::default()
    }
}

fn to_chunk<T: Serialize>(info: &T) -> Result<Value, RuntimeError> {
    serde_json::to_value(info).map_err(|e| RuntimeError::other(e.to_string()))
}

/// `BuildInfo` only deserializes, so its fields are copied into the same
/// shape the daemon sent.
fn build_chunk(info: &BuildInfo) -> Result<Value, RuntimeError> {
    let mut chunk = Map::new();
    let mut put = |key: &str, value: Option<Value>| {
        if let Some(value) = value {
            chunk.insert(key.to_string(), value);
        }
    };
    put("stream", info.stream.clone().map(Value::String));
    put("status", info.status.clone().map(Value::String));
    put("error", info.error.clone().map(Value::String));
    put(
        "errorDetail",
        info.error_detail.as_ref().map(|d| json!({ "code": d.code, "message": d.message })),
    );
    put("aux", info.aux.as_ref().map(|aux| json!({ "ID": aux.id })));
    Ok(Value::Object(chunk))
}

/// Drive a daemon progress stream on its own task, handing chunks to the
/// consumer through a bounded channel. The task stops once the consumer
/// drops its end.
async fn forward<T, S>(
    stream: S,
    mut tx: mpsc::Sender<Result<Value, RuntimeError>>,
    encode: fn(&T) -> Result<Value, RuntimeError>,
) where
    S: Stream<Item = Result<T, BollardError>>,
{
    futures::pin_mut!(stream);
    while let Some(item) = stream.next().await {
        let chunk = item.map_err(RuntimeError::from).and_then(|info| encode(&info));
        if tx.send(chunk).await.is_err() {
            debug!("chunk consumer went away, stopping producer");
            break;
        }
    }
}

fn tar_directory(dir: &Path) -> Result<Vec<u8>, RuntimeError> {
    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_dir_all(".", dir)
        .map_err(|e| RuntimeError::other(format!("failed to pack {}: {e}", dir.display())))?;
    builder
        .into_inner()
        .map_err(|e| RuntimeError::other(format!("failed to pack {}: {e}", dir.display())))
}

fn container_entry(raw: Value) -> Value {
    let name = raw["Names"]
        .get(0)
        .and_then(Value::as_str)
        .map(|n| n.trim_start_matches('/').to_string());
    json!({
        "id": raw["Id"],
        "name": name,
        "image": raw["Image"],
        "image_id": raw["ImageID"],
        "status": raw["State"],
        "labels": raw["Labels"],
        "attrs": raw,
    })
}

fn image_entry(raw: Value) -> Value {
    let short_id = raw["Id"]
        .as_str()
        .map(|id| id.trim_start_matches("sha256:").chars().take(12).collect::<String>());
    json!({
        "short_id": short_id,
        "tags": raw["RepoTags"],
        "labels": raw["Labels"],
        "attrs": raw,
    })
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn run_container(&self, spec: &RunSpec, auth: Option<&RegistryAuth>) -> Result<i64, RuntimeError> {
        self.create_and_start(spec, auth).await?;
        info!(container = %spec.name, "container started, waiting for exit");

        let mut wait = Box::pin(self.docker.wait_container(&spec.name, None::<WaitContainerOptions>));
        let mut code = 0;
        while let Some(item) = wait.next().await {
            match item {
                Ok(response) => code = response.status_code,
                Err(BollardError::DockerContainerWaitError { code: exit, .. }) => code = exit,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(code)
    }

    async fn start_detached(&self, spec: &RunSpec, auth: Option<&RegistryAuth>) -> Result<(), RuntimeError> {
        self.create_and_start(spec, auth).await?;
        info!(container = %spec.name, "container started");
        Ok(())
    }

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptionsBuilder::new().force(force).v(true).build();
        self.docker.remove_container(name, Some(options)).await?;
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        let options = RemoveImageOptionsBuilder::new().force(true).build();
        self.docker.remove_image(image, Some(options), None).await?;
        Ok(())
    }

    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> Result<(), RuntimeError> {
        let options = TagImageOptionsBuilder::new().repo(repo).tag(tag).build();
        self.docker.tag_image(image, Some(options)).await?;
        Ok(())
    }

    async fn build_image(&self, spec: BuildSpec) -> Result<ChunkStream, RuntimeError> {
        let dir = spec.context_dir.clone();
        let context = tokio::task::spawn_blocking(move || tar_directory(&dir))
            .await
            .map_err(|e| RuntimeError::other(e.to_string()))??;
        let options = BuildImageOptionsBuilder::new()
            .dockerfile(&spec.dockerfile)
            .t(&spec.tag)
            .rm(true)
            .forcerm(true)
            .squash(spec.squash)
            .build();
        let credentials = spec.auth.as_ref().map(|auth| {
            let mut map = HashMap::new();
            map.insert(auth.server.clone(), auth.credentials());
            map
        });

        let docker = self.docker.clone();
        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        tokio::spawn(async move {
            let stream = docker.build_image(options, credentials, Some(bollard::body_full(context.into())));
            forward(stream, tx, build_chunk).await;
        });
        Ok(rx.boxed())
    }

    async fn pull_image(&self, image: &str, auth: Option<RegistryAuth>) -> Result<ChunkStream, RuntimeError> {
        let (repo, tag) = split_reference(image);
        let options = CreateImageOptionsBuilder::new().from_image(repo).tag(tag).build();
        let docker = self.docker.clone();
        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        tokio::spawn(async move {
            let stream = docker.create_image(Some(options), None, auth.as_ref().map(RegistryAuth::credentials));
            forward(stream, tx, to_chunk).await;
        });
        Ok(rx.boxed())
    }

    async fn push_image(&self, image: &str, auth: Option<RegistryAuth>) -> Result<ChunkStream, RuntimeError> {
        let (repo, tag) = split_reference(image);
        let repo = repo.to_string();
        let options = PushImageOptionsBuilder::new().tag(tag).build();
        let docker = self.docker.clone();
        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        tokio::spawn(async move {
            let stream = docker.push_image(&repo, Some(options), auth.as_ref().map(RegistryAuth::credentials));
            forward(stream, tx, to_chunk).await;
        });
        Ok(rx.boxed())
    }

    async fn list_containers(&self) -> Result<Value, RuntimeError> {
        let options = ListContainersOptionsBuilder::new().all(true).build();
        let containers = self.docker.list_containers(Some(options)).await?;
        let entries = containers
            .iter()
            .map(to_chunk)
            .map(|raw| raw.map(container_entry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Value::Array(entries))
    }

    async fn list_images(&self) -> Result<Value, RuntimeError> {
        let images = self.docker.list_images(None::<ListImagesOptions>).await?;
        let entries = images
            .iter()
            .map(to_chunk)
            .map(|raw| raw.map(image_entry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Value::Array(entries))
    }

    async fn container_logs(&self, name: &str, tail: usize) -> Result<String, RuntimeError> {
        let options = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .tail(&tail.to_string())
            .build();
        let output: Vec<_> = self.docker.logs(name, Some(options)).try_collect().await?;
        Ok(output.iter().map(ToString::to_string).collect())
    }

    async fn container_stats(&self) -> Result<Value, RuntimeError> {
        let options = ListContainersOptionsBuilder::new().all(false).build();
        let running = self.docker.list_containers(Some(options)).await?;
        let mut stats = Vec::with_capacity(running.len());
        for container in running {
            let Some(id) = container.id else { continue };
            let options = StatsOptionsBuilder::new().stream(false).build();
            let mut sample = Box::pin(self.docker.stats(&id, Some(options)));
            if let Some(item) = sample.try_next().await? {
                stats.push(to_chunk(&item)?);
            }
        }
        Ok(Value::Array(stats))
    }

    async fn prune(&self, target: PruneTarget) -> Result<Value, RuntimeError> {
        info!(%target, "pruning");
        match target {
            PruneTarget::Images => to_chunk(&self.docker.prune_images(None::<PruneImagesOptions>).await?),
            PruneTarget::Containers => to_chunk(&self.docker.prune_containers(None::<PruneContainersOptions>).await?),
            PruneTarget::Volumes => to_chunk(&self.docker.prune_volumes(None::<PruneVolumesOptions>).await?),
            PruneTarget::Networks => to_chunk(&self.docker.prune_networks(None::<PruneNetworksOptions>).await?),
        }
    }
}
