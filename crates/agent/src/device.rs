//! Device-level procedures and the on-join housekeeping that touches the
//! host filesystem.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{now_iso, DeviceInfo};
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::executor::{ContainerRequest, LifecycleExecutor};
use crate::rpc::RpcError;
use crate::session::Session;

pub const AGENT_CONTAINER: &str = "svc_mgmt_agent";

/// Short architecture tag used in agent image names.
pub fn machine_arch() -> &'static str {
    if std::env::consts::ARCH == "x86_64" {
        "x86"
    } else {
        "arm"
    }
}

/// Create the application directories under `base`.
pub async fn ensure_app_dirs(base: &Path) -> io::Result<()> {
    for dir in [base.join("APP").join("PROD"), base.join("APP").join("DEV"), base.join("SERVICE")] {
        tokio::fs::create_dir_all(&dir).await?;
    }
    Ok(())
}

/// What [`BootFiles::sync`] rewrote.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BootSync {
    pub config_written: bool,
    pub cmdline_written: bool,
}

/// `config.txt` and `cmdline.txt` in the boot partition.
#[derive(Debug, Clone)]
pub struct BootFiles {
    dir: PathBuf,
}

impl BootFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Bring the boot files in line with what the directory holds for this
    /// device. Empty or missing values leave the file untouched.
    pub async fn sync(&self, info: &DeviceInfo) -> io::Result<BootSync> {
        Ok(BootSync {
            config_written: self.sync_file("config.txt", info.boot_config.as_deref()).await?,
            cmdline_written: self.sync_file("cmdline.txt", info.cmdline.as_deref()).await?,
        })
    }

    async fn sync_file(&self, name: &str, desired: Option<&str>) -> io::Result<bool> {
        let Some(desired) = desired.filter(|d| !d.is_empty()) else {
            return Ok(false);
        };
        let path = self.dir.join(name);
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(current) => current,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };
        if current == desired {
            debug!(path = %path.display(), "boot file unchanged");
            return Ok(false);
        }
        tokio::fs::write(&path, desired).await?;
        info!(path = %path.display(), "boot file updated");
        Ok(true)
    }
}

/// Handshake, readme, reboot, restart and self-update.
pub struct DeviceOps {
    config: Arc<AgentConfig>,
    session: Arc<dyn Session>,
    executor: Arc<LifecycleExecutor>,
}

impl DeviceOps {
    pub fn new(config: Arc<AgentConfig>, session: Arc<dyn Session>, executor: Arc<LifecycleExecutor>) -> Self {
        Self { config, session, executor }
    }

    pub fn handshake(&self) -> Value {
        json!({ "tsp": now_iso(), "id": self.config.serial_number })
    }

    pub fn readme(&self) -> Value {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();
        json!({
            "name": "mgmt-agent",
            "version": env!("CARGO_PKG_VERSION"),
            "serial_number": self.config.serial_number,
            "hostname": host,
        })
    }

    pub async fn system_reboot(&self) -> Result<Value, RpcError> {
        warn!("system rebooting now");
        let status = Command::new("systemctl")
            .arg("reboot")
            .status()
            .await
            .map_err(|e| RpcError::new(format!("failed to run systemctl reboot: {e}")))?;
        Ok(json!(status.code().unwrap_or(-1)))
    }

    /// Leave the session. The transport then closes and the process exits
    /// for the supervisor to restart it.
    pub async fn restart(&self) -> Result<Value, RpcError> {
        info!("agent restart requested");
        self.session.leave().await?;
        Ok(Value::Null)
    }

    pub async fn update(&self) -> Result<Value, RpcError> {
        let image = format!("{}_{AGENT_CONTAINER}:latest", machine_arch());
        info!(%image, "updating agent");
        self.executor
            .pull(ContainerRequest {
                image_name: Some(image),
                container_name: Some(AGENT_CONTAINER.to_string()),
                ..Default::default()
            })
            .await?;
        self.restart().await
    }
}
