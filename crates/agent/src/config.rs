use std::path::{Path, PathBuf};

use common::DeviceIdentity;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/home/pirate/config/device-config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid device configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("{var} must be a number, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub serial_number: String,
    pub swarm_key: u64,
    pub device_key: u64,
    pub secret: String,
    pub device_endpoint_url: String,
    #[serde(default = "default_realm")]
    pub realm: String,
    #[serde(default)]
    pub ssl_verify: bool,
    #[serde(default = "default_registry_url")]
    pub docker_registry_url: String,
    #[serde(default = "default_main_repository")]
    pub docker_main_repository: String,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    /// Set when the process runs with `ENV=DEV`.
    #[serde(skip)]
    pub dev_mode: bool,
}

/// Connection retry knobs for the session transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// -1 retries forever.
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    #[serde(default = "default_initial_retry_delay")]
    pub initial_retry_delay_secs: f64,
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: f64,
    #[serde(default = "default_retry_growth")]
    pub retry_delay_growth: f64,
    #[serde(default = "default_retry_jitter")]
    pub retry_delay_jitter: f64,
    #[serde(default = "default_handshake_timeout")]
    pub open_handshake_timeout_ms: u64,
    /// How often the router is called once joined. 0 disables the check.
    #[serde(default = "default_auto_ping_interval")]
    pub auto_ping_interval_secs: u64,
    /// A liveness call left unanswered this long drops the connection.
    #[serde(default = "default_auto_ping_timeout")]
    pub auto_ping_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_retry_delay_secs: default_initial_retry_delay(),
            max_retry_delay_secs: default_max_retry_delay(),
            retry_delay_growth: default_retry_growth(),
            retry_delay_jitter: default_retry_jitter(),
            open_handshake_timeout_ms: default_handshake_timeout(),
            auto_ping_interval_secs: default_auto_ping_interval(),
            auto_ping_timeout_secs: default_auto_ping_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_registration_backoff")]
    pub registration_backoff_ms: u64,
    #[serde(default = "default_run_retry_limit")]
    pub run_retry_limit: u32,
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_boot_dir")]
    pub boot_dir: PathBuf,
    #[serde(default = "default_wpa_conf")]
    pub wpa_supplicant_conf: PathBuf,
    #[serde(default = "default_wifi_interface")]
    pub wifi_interface: String,
    #[serde(default)]
    pub docker_host: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            registration_backoff_ms: default_registration_backoff(),
            run_retry_limit: default_run_retry_limit(),
            base_dir: default_base_dir(),
            boot_dir: default_boot_dir(),
            wpa_supplicant_conf: default_wpa_conf(),
            wifi_interface: default_wifi_interface(),
            docker_host: None,
        }
    }
}

fn default_realm() -> String {
    "realm1".to_string()
}
fn default_registry_url() -> String {
    "registry.reswarm.io/".to_string()
}
fn default_main_repository() -> String {
    "apps/".to_string()
}
fn default_max_retries() -> i64 {
    -1
}
fn default_initial_retry_delay() -> f64 {
    1.0
}
fn default_max_retry_delay() -> f64 {
    4.0
}
fn default_retry_growth() -> f64 {
    2.0
}
fn default_retry_jitter() -> f64 {
    0.1
}
fn default_handshake_timeout() -> u64 {
    2000
}
fn default_auto_ping_interval() -> u64 {
    300
}
fn default_auto_ping_timeout() -> u64 {
    3600
}
fn default_registration_backoff() -> u64 {
    1000
}
fn default_run_retry_limit() -> u32 {
    1
}
fn default_base_dir() -> PathBuf {
    PathBuf::from("/home/pirate")
}
fn default_boot_dir() -> PathBuf {
    PathBuf::from("/boot")
}
fn default_wpa_conf() -> PathBuf {
    PathBuf::from("/etc/wpa_supplicant/wpa_supplicant.conf")
}
fn default_wifi_interface() -> String {
    "wlan0".to_string()
}

/// Where to look for the device configuration when `--config` is absent.
pub fn default_config_path() -> PathBuf {
    let system = PathBuf::from(DEFAULT_CONFIG_PATH);
    if system.exists() {
        return system;
    }
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mgmt-agent")
        .join("device-config.toml")
}

impl AgentConfig {
    /// Resolve the configuration from the process environment and, outside
    /// DEV mode, the configuration file.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let lookup = |key: &str| std::env::var(key).ok();
        let dev_mode = lookup("ENV").as_deref() == Some("DEV");
        let mut config = if dev_mode {
            Self::from_lookup(lookup)?
        } else {
            let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
            let raw =
                std::fs::read_to_string(&path).map_err(|source| ConfigError::Io { path, source })?;
            let mut config = Self::from_toml_str(&raw)?;
            config.apply_overrides(lookup)?;
            config
        };
        config.dev_mode = dev_mode;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Build the whole configuration from environment-style lookups.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &'static str| lookup(key).ok_or(ConfigError::Missing(key));
        Ok(Self {
            serial_number: required("SERIAL_NUMBER")?,
            swarm_key: parse_number("SWARM_KEY", &required("SWARM_KEY")?)?,
            device_key: parse_number("DEVICE_KEY", &required("DEVICE_KEY")?)?,
            secret: required("SECRET")?,
            device_endpoint_url: required("DEVICE_ENDPOINT_URL")?,
            realm: lookup("REALM").unwrap_or_else(default_realm),
            ssl_verify: lookup("SSL_VERIFY").map(|v| truthy(&v)).unwrap_or(false),
            docker_registry_url: lookup("DOCKER_REGISTRY_URL").unwrap_or_else(default_registry_url),
            docker_main_repository: lookup("DOCKER_MAIN_REPOSITORY")
                .unwrap_or_else(default_main_repository),
            transport: TransportConfig::default(),
            agent: AgentSettings::default(),
            dev_mode: true,
        })
    }

    /// Individual env vars take precedence over file values.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("SERIAL_NUMBER") {
            self.serial_number = v;
        }
        if let Some(v) = lookup("SECRET") {
            self.secret = v;
        }
        if let Some(v) = lookup("SWARM_KEY") {
            self.swarm_key = parse_number("SWARM_KEY", &v)?;
        }
        if let Some(v) = lookup("DEVICE_KEY") {
            self.device_key = parse_number("DEVICE_KEY", &v)?;
        }
        if let Some(v) = lookup("DEVICE_ENDPOINT_URL") {
            self.device_endpoint_url = v;
        }
        if let Some(v) = lookup("DOCKER_REGISTRY_URL") {
            self.docker_registry_url = v;
        }
        if let Some(v) = lookup("DOCKER_MAIN_REPOSITORY") {
            self.docker_main_repository = v;
        }
        if let Some(v) = lookup("SSL_VERIFY") {
            self.ssl_verify = truthy(&v);
        }
        Ok(())
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            serial_number: self.serial_number.clone(),
            swarm_key: self.swarm_key,
            device_key: self.device_key,
        }
    }

    /// Fully qualified, lower-cased reference of an app image.
    pub fn image_ref(&self, image_name: &str) -> String {
        format!(
            "{}{}{}",
            self.docker_registry_url,
            self.docker_main_repository,
            image_name.to_lowercase()
        )
    }

    /// Registry host used as the credential server address.
    pub fn registry_server(&self) -> String {
        self.docker_registry_url.trim_end_matches('/').to_string()
    }

    pub fn stage(&self) -> &'static str {
        if self.dev_mode {
            "DEV"
        } else {
            "PROD"
        }
    }

    /// Copy that is safe to print.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.secret = "<redacted>".to_string();
        copy
    }
}

fn parse_number(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidNumber { var, value: value.to_string() })
}

fn truthy(v: &str) -> bool {
    v == "1" || v.eq_ignore_ascii_case("true")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
serial_number = "abc123"
swarm_key = 7
device_key = 42
secret = "s3cret"
device_endpoint_url = "wss://cb.reswarm.io/ws"

[agent]
run_retry_limit = 2
"#;

    #[test]
    fn file_values_and_defaults() {
        let cfg = AgentConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.realm, "realm1");
        assert_eq!(cfg.docker_registry_url, "registry.reswarm.io/");
        assert_eq!(cfg.transport.max_retries, -1);
        assert_eq!(cfg.transport.auto_ping_interval_secs, 300);
        assert_eq!(cfg.transport.auto_ping_timeout_secs, 3600);
        assert_eq!(cfg.agent.run_retry_limit, 2);
        assert_eq!(cfg.agent.registration_backoff_ms, 1000);
        assert_eq!(cfg.identity().auth_id(), "7-42");
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut cfg = AgentConfig::from_toml_str(SAMPLE).unwrap();
        let env: HashMap<&str, &str> =
            [("SWARM_KEY", "9"), ("DOCKER_MAIN_REPOSITORY", "other/")].into();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.swarm_key, 9);
        assert_eq!(cfg.docker_main_repository, "other/");
        assert_eq!(cfg.serial_number, "abc123");
    }

    #[test]
    fn bad_numeric_override_is_rejected() {
        let mut cfg = AgentConfig::from_toml_str(SAMPLE).unwrap();
        let err = cfg
            .apply_overrides(|k| (k == "DEVICE_KEY").then(|| "x".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { var: "DEVICE_KEY", .. }));
    }

    #[test]
    fn dev_lookup_requires_identity() {
        let err = AgentConfig::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SERIAL_NUMBER")));
    }

    #[test]
    fn image_refs_are_lowercased_and_prefixed() {
        let cfg = AgentConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.image_ref("MyApp_1:latest"), "registry.reswarm.io/apps/myapp_1:latest");
        assert_eq!(cfg.registry_server(), "registry.reswarm.io");
        assert_eq!(cfg.redacted().secret, "<redacted>");
    }
}
