use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{info, warn};

use crate::rpc::RpcError;

const ENTRY_MARKER: &str = "# WPA2:";
const CONF_HEADER: &str = "ctrl_interface=DIR=/var/run/wpa_supplicant GROUP=netdev\nupdate_config=1\ncountry=DE\n";

#[derive(Debug, thiserror::Error)]
pub enum WifiError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },
}

/// One access point seen by a scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WifiCell {
    pub ssid: String,
    pub mac: String,
    pub signal: Option<String>,
    pub frequency: Option<String>,
    pub channel: Option<String>,
    pub encryption: Option<String>,
}

#[async_trait]
pub trait WifiControl: Send + Sync {
    async fn scan(&self) -> Result<Vec<WifiCell>, WifiError>;

    async fn current_ssid(&self) -> Result<Option<String>, WifiError>;

    async fn restart_interface(&self) -> Result<(), WifiError>;
}

/// [`WifiControl`] using `iw` and `ip`.
#[derive(Debug, Clone)]
pub struct IwWifi {
    interface: String,
}

impl IwWifi {
    pub fn new(interface: impl Into<String>) -> Self {
        Self { interface: interface.into() }
    }

    async fn run(program: &str, args: &[&str]) -> Result<String, WifiError> {
        let command = format!("{program} {}", args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| WifiError::Spawn { command: command.clone(), source })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(WifiError::Command { command, stderr });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl WifiControl for IwWifi {
    async fn scan(&self) -> Result<Vec<WifiCell>, WifiError> {
        let out = Self::run("iw", &["dev", &self.interface, "scan"]).await?;
        Ok(parse_iw_scan(&out))
    }

    async fn current_ssid(&self) -> Result<Option<String>, WifiError> {
        let out = Self::run("iw", &["dev", &self.interface, "info"]).await?;
        Ok(parse_current_ssid(&out))
    }

    async fn restart_interface(&self) -> Result<(), WifiError> {
        Self::run("ip", &["link", "set", &self.interface, "down"]).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        Self::run("ip", &["link", "set", &self.interface, "up"]).await?;
        Ok(())
    }
}

pub fn parse_iw_scan(output: &str) -> Vec<WifiCell> {
    let mut cells = Vec::new();
    let mut current: Option<WifiCell> = None;
    let mut privacy = false;
    for raw in output.lines() {
        let line = raw.trim();
        if let Some(rest) = raw.strip_prefix("BSS ") {
            if let Some(cell) = current.take() {
                cells.push(finish_cell(cell, privacy));
            }
            privacy = false;
            let mac = rest.split(['(', ' ']).next().unwrap_or_default().to_string();
            current = Some(WifiCell { mac, ..Default::default() });
            continue;
        }
        let Some(cell) = current.as_mut() else { continue };
        if let Some(v) = line.strip_prefix("SSID:") {
            cell.ssid = v.trim().to_string();
        } else if let Some(v) = line.strip_prefix("freq:") {
            cell.frequency = Some(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix("signal:") {
            cell.signal = Some(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix("DS Parameter set: channel") {
            cell.channel = Some(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix("* primary channel:") {
            cell.channel.get_or_insert_with(|| v.trim().to_string());
        } else if line.starts_with("RSN:") {
            cell.encryption = Some("wpa2".to_string());
        } else if line.starts_with("WPA:") {
            cell.encryption.get_or_insert_with(|| "wpa".to_string());
        } else if line.starts_with("capability:") && line.contains("Privacy") {
            privacy = true;
        }
    }
    if let Some(cell) = current {
        cells.push(finish_cell(cell, privacy));
    }
    cells
}

fn finish_cell(mut cell: WifiCell, privacy: bool) -> WifiCell {
    if privacy && cell.encryption.is_none() {
        cell.encryption = Some("wep".to_string());
    }
    cell
}

pub fn parse_current_ssid(info: &str) -> Option<String> {
    info.lines()
        .map(str::trim)
        .find_map(|l| l.strip_prefix("ssid "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Render a network entry for `wpa_supplicant.conf`.
pub fn network_block(ssid: &str, psk: &str, priority: &str, id: &str) -> String {
    format!(
        "\n{ENTRY_MARKER} {ssid}\nnetwork={{\n    id_str=\"{id}\"\n    ssid=\"{ssid}\"\n    psk=\"{psk}\"\n    priority={priority}\n    proto=RSN\n    key_mgmt=WPA-PSK\n    pairwise=CCMP\n    auth_alg=OPEN\n}}\n"
    )
}

/// Drop the entry for `ssid`. Returns `None` when there is no such entry.
pub fn remove_network(conf: &str, ssid: &str) -> Option<String> {
    let needle = format!("ssid=\"{ssid}\"");
    let mut segments: Vec<&str> = conf.split(ENTRY_MARKER).collect();
    let idx = segments.iter().skip(1).rposition(|s| s.contains(&needle))? + 1;
    segments.remove(idx);
    Some(segments.join(ENTRY_MARKER))
}

/// SSIDs of every saved network.
pub fn saved_networks(conf: &str) -> Vec<String> {
    conf.lines()
        .map(str::trim)
        .filter_map(|l| l.strip_prefix("ssid=\""))
        .filter_map(|l| l.strip_suffix('"'))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddWifiRequest {
    #[serde(default)]
    pub ssid: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub priority: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoveWifiRequest {
    #[serde(default)]
    pub ssid: Option<String>,
}

/// Wifi procedures backed by a supplicant config file and a [`WifiControl`].
pub struct WifiService {
    control: Arc<dyn WifiControl>,
    conf_path: PathBuf,
}

impl WifiService {
    pub fn new(control: Arc<dyn WifiControl>, conf_path: PathBuf) -> Self {
        Self { control, conf_path }
    }

    async fn read_conf(&self) -> Result<String, RpcError> {
        match tokio::fs::read_to_string(&self.conf_path).await {
            Ok(conf) => Ok(conf),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(RpcError::new(format!("failed to read {}: {e}", self.conf_path.display()))),
        }
    }

    async fn write_conf(&self, conf: &str) -> Result<(), RpcError> {
        tokio::fs::write(&self.conf_path, conf)
            .await
            .map_err(|e| RpcError::new(format!("failed to write {}: {e}", self.conf_path.display())))
    }

    pub async fn add(&self, req: AddWifiRequest) -> Result<Value, RpcError> {
        let (Some(ssid), Some(password), Some(priority)) = (&req.ssid, &req.password, &req.priority) else {
            return Err(RpcError::new(format!(
                "Missing parameters; ssid: {:?}, password: {}, priority: {:?}",
                req.ssid,
                if req.password.is_some() { "<set>" } else { "None" },
                req.priority
            )));
        };
        if [ssid.as_str(), password.as_str()].iter().any(|v| v.contains(['"', '\n'])) {
            return Err(RpcError::new("ssid and password must not contain quotes or newlines"));
        }
        let priority = match priority {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        let mut conf = self.read_conf().await?;
        if let Some(pruned) = remove_network(&conf, ssid) {
            info!(%ssid, "replacing saved network");
            conf = pruned;
        }
        if conf.trim().is_empty() {
            conf = CONF_HEADER.to_string();
        }
        let block = network_block(ssid, password, &priority, &uuid::Uuid::new_v4().to_string());
        conf.push_str(&block);
        self.write_conf(&conf).await?;
        info!(%ssid, "network added");
        Ok(Value::String(block))
    }

    pub async fn remove(&self, req: RemoveWifiRequest) -> Result<Value, RpcError> {
        let ssid = req.ssid.ok_or_else(|| RpcError::new("missing ssid parameter in request"))?;
        let conf = self.read_conf().await?;
        let pruned = remove_network(&conf, &ssid)
            .ok_or_else(|| RpcError::new("wlan entry was not found in wpa config"))?;
        self.write_conf(&pruned).await?;
        info!(%ssid, "network removed");
        Ok(json!(saved_networks(&pruned)))
    }

    pub async fn get(&self) -> Result<Value, RpcError> {
        let saved = saved_networks(&self.read_conf().await?);
        let current = match self.control.current_ssid().await {
            Ok(ssid) => ssid.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "could not read current network");
                String::new()
            }
        };
        Ok(json!({ "saved_networks": saved, "current_network": current }))
    }

    pub async fn scan(&self) -> Result<Value, RpcError> {
        match self.control.scan().await {
            Ok(cells) => Ok(json!(cells)),
            Err(e) => {
                warn!(error = %e, "wifi scan failed");
                Ok(json!([]))
            }
        }
    }

    pub async fn restart(&self) -> Result<Value, RpcError> {
        self.control
            .restart_interface()
            .await
            .map_err(|e| RpcError::new(e.to_string()))?;
        Ok(Value::String("ok".to_string()))
    }
}


#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Wifi control with no networks in range.
    pub struct IdleWifi;

    #[async_trait]
    impl WifiControl for IdleWifi {
        async fn scan(&self) -> Result<Vec<WifiCell>, WifiError> {
            Ok(vec![])
        }

        async fn current_ssid(&self) -> Result<Option<String>, WifiError> {
            Ok(None)
        }

        async fn restart_interface(&self) -> Result<(), WifiError> {
            Ok(())
        }
    }
}
