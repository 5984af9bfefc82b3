//! Agent-owned service containers: the app log shipper started on join and
//! the one-shot host updater.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

use super::{BuildRequest, LifecycleExecutor, DEFAULT_CALLER};
use crate::device::machine_arch;
use crate::rpc::RpcError;
use crate::runtime::{RestartPolicy, RunSpec};

pub const APP_LOGS_CONTAINER: &str = "svc_app_logs";
pub const UPDATER_CONTAINER: &str = "reswarm_updater";
pub const MSG_NO_UPDATE_SCRIPT: &str = "no update script found";

const DOCKER_SOCKET_RO: &str = "/var/run/docker.sock:/var/run/docker.sock:ro";

/// `updater` arguments. Both fields arrive JSON-encoded inside a string;
/// an already decoded value is accepted as well.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdaterRequest {
    #[serde(default)]
    pub volumes: Option<Value>,
    #[serde(default)]
    pub update_script: Option<Value>,
}

impl UpdaterRequest {
    pub fn script(&self) -> Option<String> {
        match self.update_script.as_ref()? {
            Value::String(raw) if raw.is_empty() => None,
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::String(decoded)) => Some(decoded),
                _ => Some(raw.clone()),
            },
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn volumes(&self) -> Result<Vec<String>, RpcError> {
        let decoded = match &self.volumes {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(Value::String(raw)) if raw.is_empty() => return Ok(Vec::new()),
            Some(Value::String(raw)) => serde_json::from_str::<Value>(raw)
                .map_err(|e| RpcError::new(format!("invalid updater volumes {raw:?}: {e}")))?,
            Some(other) => other.clone(),
        };
        match decoded {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|v| v.as_str().filter(|s| !s.is_empty()).map(str::to_string))
                .collect()),
            other => Err(RpcError::new(format!("updater volumes must be a list, got {other}"))),
        }
    }
}

/// Shell script and Dockerfile for one updater run.
pub fn updater_files(script: &str, stamp: &str) -> (String, String, String) {
    let file_name = format!("{stamp}.sh");
    let body = format!("{script}\nsleep 10");
    let dockerfile = format!(
        "FROM busybox:latest\n\
         COPY {file_name} ./{file_name}\n\
         COPY Dockerfile ./Dockerfile\n\
         RUN chmod +x {file_name}\n\
         RUN echo '##############  UPDATER v{stamp} ###############'\n\
         CMD [\"sh\", \"/{file_name}\"]\n"
    );
    (file_name, body, dockerfile)
}

/// Host paths are mounted read-write under `/volumes`.
pub fn updater_binds(volumes: &[String]) -> Vec<String> {
    let mut binds = vec![DOCKER_SOCKET_RO.to_string()];
    binds.extend(
        volumes
            .iter()
            .map(|v| format!("{v}:/volumes/{}:rw", v.trim_start_matches('/'))),
    );
    binds
}

impl LifecycleExecutor {
    /// Replace the log shipper container. Development devices run it by hand.
    pub async fn start_app_logs(&self) -> Result<(), RpcError> {
        if self.config.dev_mode {
            info!("development mode, not starting {APP_LOGS_CONTAINER}");
            return Ok(());
        }
        info!("starting {APP_LOGS_CONTAINER} service");
        if let Err(e) = self.remove_inner(APP_LOGS_CONTAINER, true, false).await {
            warn!(error = %e, "failed to stop {APP_LOGS_CONTAINER}");
        }
        let config = &self.config;
        let env = BTreeMap::from([
            ("SERIAL_NUMBER", config.serial_number.clone()),
            ("ENV", config.stage().to_string()),
            ("DEVICE_KEY", config.device_key.to_string()),
            ("SWARM_KEY", config.swarm_key.to_string()),
            ("DEVICE_SECRET", config.secret.clone()),
            ("DEVICE_ENDPOINT_URL", config.device_endpoint_url.clone()),
        ]);
        let spec = RunSpec {
            image: config.image_ref(&format!("{}_{APP_LOGS_CONTAINER}", machine_arch())),
            name: APP_LOGS_CONTAINER.to_string(),
            env: env.into_iter().map(|(k, v)| format!("{k}={v}")).collect(),
            binds: vec![
                format!("{}:/app/config:rw", config.agent.base_dir.join("config").display()),
                DOCKER_SOCKET_RO.to_string(),
            ],
            restart: RestartPolicy::Always,
            labels: BTreeMap::from([("real".to_string(), "True".to_string())]),
            privileged: false,
            host_network: true,
            devices: Vec::new(),
        };
        self.runtime.start_detached(&spec, Some(&self.auth(None))).await?;
        info!("{APP_LOGS_CONTAINER} service started");
        Ok(())
    }

    /// Build a throwaway busybox image around `update_script` and run it
    /// privileged with the requested host paths mounted.
    pub async fn run_updater(&self, req: UpdaterRequest) -> Result<Value, RpcError> {
        if let Err(e) = self.remove_inner(UPDATER_CONTAINER, true, false).await {
            warn!(error = %e, "could not remove previous updater");
        }
        info!(?req, "starting updater");
        let volumes = req.volumes()?;
        let Some(script) = req.script() else {
            return Ok(Value::String(MSG_NO_UPDATE_SCRIPT.to_string()));
        };

        let dir = self.config.agent.base_dir.join("SERVICE").join(UPDATER_CONTAINER);
        let (file_name, body, dockerfile) = updater_files(&script, &common::now_compact());
        let files = [(file_name.as_str(), body.as_str()), ("Dockerfile", dockerfile.as_str())];
        write_files(&dir, &files).await.map_err(|e| {
            RpcError::new(format!("could not stage updater in {}: {e}", dir.display()))
        })?;

        self.build(BuildRequest {
            name: Some(UPDATER_CONTAINER.to_string()),
            image_name: Some(UPDATER_CONTAINER.to_string()),
            container_name: Some(UPDATER_CONTAINER.to_string()),
            account_id: Some(DEFAULT_CALLER.to_string()),
            app_type: Some("SERVICE".to_string()),
            ..Default::default()
        })
        .await?;

        let spec = RunSpec {
            image: self.config.image_ref(UPDATER_CONTAINER),
            name: UPDATER_CONTAINER.to_string(),
            env: vec![format!("DEVICE_SERIAL_NUMBER={}", self.config.serial_number)],
            binds: updater_binds(&volumes),
            restart: RestartPolicy::No,
            labels: BTreeMap::from([("real".to_string(), "True".to_string())]),
            privileged: true,
            host_network: true,
            devices: Vec::new(),
        };
        if let Err(e) = self.runtime.start_detached(&spec, Some(&self.auth(None))).await {
            error!(error = %e, "error starting updater");
            self.sink.publish_update(UPDATER_CONTAINER, e.message()).await;
            return Err(e.into());
        }
        Ok(Value::String(UPDATER_CONTAINER.to_string()))
    }
}

async fn write_files(dir: &Path, files: &[(&str, &str)]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    for (name, content) in files {
        tokio::fs::write(dir.join(name), content).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn updater_arguments_decode_from_strings() {
        let req: UpdaterRequest = serde_json::from_value(json!({
            "volumes": "[\"/etc\", \"/bin\", \"\"]",
            "update_script": "\"ls -la /volumes/etc/\"",
        }))
        .unwrap();
        assert_eq!(req.volumes().unwrap(), vec!["/etc", "/bin"]);
        assert_eq!(req.script().as_deref(), Some("ls -la /volumes/etc/"));

        let plain: UpdaterRequest =
            serde_json::from_value(json!({"volumes": ["/opt"], "update_script": "reboot"})).unwrap();
        assert_eq!(plain.volumes().unwrap(), vec!["/opt"]);
        assert_eq!(plain.script().as_deref(), Some("reboot"));

        let empty: UpdaterRequest =
            serde_json::from_value(json!({"volumes": "", "update_script": ""})).unwrap();
        assert!(empty.volumes().unwrap().is_empty());
        assert!(empty.script().is_none());

        let bad: UpdaterRequest = serde_json::from_value(json!({"volumes": "{\"a\": 1}"})).unwrap();
        assert!(bad.volumes().is_err());
    }

    #[test]
    fn updater_image_runs_the_staged_script() {
        let (file_name, body, dockerfile) = updater_files("echo hi", "20240101_120000");
        assert_eq!(file_name, "20240101_120000.sh");
        assert_eq!(body, "echo hi\nsleep 10");
        assert!(dockerfile.starts_with("FROM busybox:latest\n"));
        assert!(dockerfile.contains("COPY 20240101_120000.sh ./20240101_120000.sh\n"));
        assert!(dockerfile.ends_with("CMD [\"sh\", \"/20240101_120000.sh\"]\n"));
    }

    #[test]
    fn updater_mounts_volumes_under_prefix() {
        let binds = updater_binds(&["/etc".to_string()]);
        assert_eq!(binds, vec![DOCKER_SOCKET_RO.to_string(), "/etc:/volumes/etc:rw".to_string()]);
    }
}
