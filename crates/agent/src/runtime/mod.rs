//! Container runtime boundary.
//!
//! Everything the agent needs from the container daemon goes through
//! [`ContainerRuntime`]. Daemon errors are classified into
//! [`RuntimeError`] as they cross this boundary.

mod docker;
pub(crate) mod error;
#[cfg(test)]
pub mod testing;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

pub use docker::DockerRuntime;
pub use error::{ErrorKind, Outcome, RuntimeError, MSG_CONTAINER_EXITED};

use crate::stream::ChunkStream;

/// Registry login used for pulls, pushes, builds and runs.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    pub server: String,
}

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("server", &self.server)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    No,
    UnlessStopped,
    Always,
}

/// Everything needed to create, start and wait for an app container.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub image: String,
    pub name: String,
    pub env: Vec<String>,
    pub binds: Vec<String>,
    pub restart: RestartPolicy,
    pub labels: BTreeMap<String, String>,
    pub privileged: bool,
    pub host_network: bool,
    pub devices: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub context_dir: PathBuf,
    pub dockerfile: String,
    pub tag: String,
    pub squash: bool,
    pub auth: Option<RegistryAuth>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneTarget {
    Images,
    Containers,
    Volumes,
    Networks,
}

impl fmt::Display for PruneTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PruneTarget::Images => "images",
            PruneTarget::Containers => "containers",
            PruneTarget::Volumes => "volumes",
            PruneTarget::Networks => "networks",
        };
        f.write_str(s)
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Create, start and wait for a container. Returns its exit code.
    async fn run_container(&self, spec: &RunSpec, auth: Option<&RegistryAuth>) -> Result<i64, RuntimeError>;

    /// Create and start a container without waiting for it.
    async fn start_detached(&self, spec: &RunSpec, auth: Option<&RegistryAuth>) -> Result<(), RuntimeError>;

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), RuntimeError>;

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError>;

    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> Result<(), RuntimeError>;

    async fn build_image(&self, spec: BuildSpec) -> Result<ChunkStream, RuntimeError>;

    async fn pull_image(&self, image: &str, auth: Option<RegistryAuth>) -> Result<ChunkStream, RuntimeError>;

    async fn push_image(&self, image: &str, auth: Option<RegistryAuth>) -> Result<ChunkStream, RuntimeError>;

    async fn list_containers(&self) -> Result<Value, RuntimeError>;

    async fn list_images(&self) -> Result<Value, RuntimeError>;

    async fn container_logs(&self, name: &str, tail: usize) -> Result<String, RuntimeError>;

    async fn container_stats(&self) -> Result<Value, RuntimeError>;

    async fn prune(&self, target: PruneTarget) -> Result<Value, RuntimeError>;
}

/// Split `repo[:tag]`, keeping a registry port as part of the repository.
pub fn split_reference(image: &str) -> (&str, &str) {
    match image.rfind(':') {
        Some(idx) if !image[idx + 1..].contains('/') => (&image[..idx], &image[idx + 1..]),
        _ => (image, "latest"),
    }
}
