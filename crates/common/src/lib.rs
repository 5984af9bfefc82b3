use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Prefix of every management procedure the agent registers.
pub const MGMT_PREFIX: &str = "re.mgmt";
/// Prefix of the wifi procedures, kept apart from the management namespace.
pub const WIFI_PREFIX: &str = "svc_wifi";
/// Prefix of the per-target log topics.
pub const LOGS_PREFIX: &str = "reswarm.logs";
/// Prefix of the firewall error topics.
pub const NETWORK_PREFIX: &str = "reswarm.network";
/// Prefix of the host updater's error topic.
pub const UPDATES_PREFIX: &str = "reswarm.updates";

pub const TESTAMENT_PROCEDURE: &str = "wamp.session.add_testament";
pub const TESTAMENT_TOPIC: &str = "reswarm.api.testament_device";
pub const UPDATE_DEVICE_PROCEDURE: &str = "reswarm.devices.update_device";
pub const DEVICE_SYNC_PROCEDURE: &str = "reswarm.containers.device_sync";

/// Sentinel returned by `docker_run` once the container has finished.
pub const EXECUTION_END: &str = "EXECUTION_END";

/// Who this device is on the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub serial_number: String,
    pub swarm_key: u64,
    pub device_key: u64,
}

impl DeviceIdentity {
    /// Authentication id used during the WAMP-CRA join.
    pub fn auth_id(&self) -> String {
        format!("{}-{}", self.swarm_key, self.device_key)
    }

    pub fn mgmt_topic(&self, procedure: &str) -> String {
        format!("{MGMT_PREFIX}.{}.{procedure}", self.serial_number)
    }

    pub fn wifi_topic(&self, procedure: &str) -> String {
        format!("{WIFI_PREFIX}.{}.{procedure}", self.serial_number)
    }

    pub fn log_topic(&self, target: &str) -> String {
        format!("{LOGS_PREFIX}.{}.{target}", self.serial_number)
    }

    pub fn network_topic(&self, procedure: &str) -> String {
        format!("{NETWORK_PREFIX}.{}.{procedure}", self.serial_number)
    }

    pub fn updates_topic(&self, target: &str) -> String {
        format!("{UPDATES_PREFIX}.{}.{target}", self.serial_number)
    }

    pub fn testament(&self) -> TestamentPayload {
        TestamentPayload {
            tsp: now_iso(),
            device_key: self.device_key,
            swarm_key: self.swarm_key,
            serial_number: self.serial_number.clone(),
        }
    }

    pub fn status_update(&self, status: DeviceStatus) -> DeviceStatusUpdate {
        DeviceStatusUpdate {
            swarm_key: self.swarm_key,
            device_key: self.device_key,
            status,
            boot_config_applied: None,
            firewall_applied: None,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.serial_number, self.swarm_key, self.device_key)
    }
}

/// Published by the router on our behalf once the session dies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestamentPayload {
    pub tsp: String,
    pub device_key: u64,
    pub swarm_key: u64,
    pub serial_number: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatusUpdate {
    pub swarm_key: u64,
    pub device_key: u64,
    pub status: DeviceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_config_applied: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firewall_applied: Option<bool>,
}

/// Device record returned by the directory after a status update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub boot_config: Option<String>,
    #[serde(default)]
    pub cmdline: Option<String>,
    #[serde(default)]
    pub architecture: Option<String>,
}

/// Result shape shared by the lifecycle procedures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OpResult {
    pub fn ok() -> Self {
        Self { success: true, message: None }
    }

    pub fn with_message(success: bool, message: impl Into<String>) -> Self {
        Self { success, message: Some(message.into()) }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// What lands on a log topic for build/pull/push progress and failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub chunk: Value,
}

impl LogEnvelope {
    pub fn build(chunk: Value) -> Self {
        Self { kind: "build".to_string(), chunk }
    }
}

/// Local wall clock in the ISO-8601 shape the directory expects.
pub fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// UTC timestamp usable in file names.
pub fn now_compact() -> String {
    chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity() -> DeviceIdentity {
        DeviceIdentity { serial_number: "abc123".into(), swarm_key: 7, device_key: 42 }
    }

    #[test]
    fn topics_follow_namespaces() {
        let id = identity();
        assert_eq!(id.mgmt_topic("docker_run"), "re.mgmt.abc123.docker_run");
        assert_eq!(id.wifi_topic("scan_wifi"), "svc_wifi.abc123.scan_wifi");
        assert_eq!(id.log_topic("my_app"), "reswarm.logs.abc123.my_app");
        assert_eq!(id.updates_topic("reswarm_updater"), "reswarm.updates.abc123.reswarm_updater");
        assert_eq!(id.auth_id(), "7-42");
    }

    #[test]
    fn op_result_omits_missing_message() {
        assert_eq!(OpResult::ok().to_value(), json!({"success": true}));
        assert_eq!(
            OpResult::with_message(true, "Container not found").to_value(),
            json!({"success": true, "message": "Container not found"})
        );
    }

    #[test]
    fn status_update_uses_wire_names() {
        let update = identity().status_update(DeviceStatus::Connected);
        let v = serde_json::to_value(update).unwrap();
        assert_eq!(v["status"], "CONNECTED");
        assert!(v.get("boot_config_applied").is_none());
    }

    #[test]
    fn envelope_carries_type_field() {
        let v = serde_json::to_value(LogEnvelope::build(json!("boom"))).unwrap();
        assert_eq!(v, json!({"type": "build", "chunk": "boom"}));
    }

    #[test]
    fn device_info_tolerates_sparse_records() {
        let info: DeviceInfo = serde_json::from_value(json!({"name": "pi-4"})).unwrap();
        assert_eq!(info.name.as_deref(), Some("pi-4"));
        assert!(info.boot_config.is_none());
    }
}
