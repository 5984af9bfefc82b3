use serde::Deserialize;
use serde_json::{Map, Value};

use crate::rpc::RpcError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub image_name: Option<String>,
    #[serde(default)]
    pub container_name: Option<String>,
    /// `{KEY: {"value": ...}}` as sent by the app configuration.
    #[serde(default)]
    pub environment: Option<Map<String, Value>>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub caller_authid: Option<String>,
}

/// Arguments of the procedures that address a single container or image.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerRequest {
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub image_name: Option<String>,
    #[serde(default)]
    pub caller_authid: Option<String>,
    #[serde(default)]
    pub force: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TagRequest {
    #[serde(default)]
    pub image_name: Option<String>,
    #[serde(default)]
    pub new_image_name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub container_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub image_name: Option<String>,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub app_type: Option<String>,
    #[serde(default)]
    pub caller_authid: Option<String>,
    /// Squash the new layers into one. Needs an experimental daemon.
    #[serde(default)]
    pub squash: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Borrow a required field or fail with `message`.
pub fn required<'a>(field: &'a Option<String>, message: impl FnOnce() -> String) -> Result<&'a str, RpcError> {
    field
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RpcError::new(message()))
}

/// Container name for a pull when none was given:
/// `arch_account_app:tag` becomes `arch_app`.
pub fn pull_target(image_name: &str) -> String {
    let lowered = image_name.to_lowercase();
    let untagged = lowered.split(':').next().unwrap_or(&lowered);
    let mut parts: Vec<&str> = untagged.split('_').collect();
    if parts.len() > 1 {
        parts.remove(1);
    }
    parts.join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_target_drops_second_segment_and_tag() {
        assert_eq!(pull_target("Arm_1234_MyApp:latest"), "arm_myapp");
        assert_eq!(pull_target("arm_svc_mgmt_agent:latest"), "arm_mgmt_agent");
        assert_eq!(pull_target("single"), "single");
    }

    #[test]
    fn required_rejects_missing_and_empty() {
        let missing: Option<String> = None;
        assert_eq!(required(&missing, || "no".into()).unwrap_err().message(), "no");
        assert!(required(&Some(String::new()), || "empty".into()).is_err());
        assert_eq!(required(&Some("x".into()), || unreachable!()).unwrap(), "x");
    }
}
