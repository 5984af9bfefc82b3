use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::DeviceIdentity;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{error, info};

use crate::rpc::RpcError;
use crate::session::Session;

#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },
}

/// Parsed `ufw status numbered`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallStatus {
    pub status: String,
    pub rules: BTreeMap<u32, String>,
}

impl FirewallStatus {
    pub fn to_value(&self) -> Value {
        let rules: serde_json::Map<String, Value> = self
            .rules
            .iter()
            .map(|(n, rule)| (n.to_string(), Value::String(rule.clone())))
            .collect();
        json!({ "status": self.status, "rules": rules })
    }
}

#[async_trait]
pub trait Firewall: Send + Sync {
    async fn set_enabled(&self, enabled: bool) -> Result<(), FirewallError>;

    /// Add a rule such as `allow 22/tcp`.
    async fn add_rule(&self, rule: &str, dry_run: bool) -> Result<String, FirewallError>;

    async fn status(&self) -> Result<FirewallStatus, FirewallError>;

    async fn listening(&self) -> Result<Vec<String>, FirewallError>;

    async fn reset(&self) -> Result<String, FirewallError>;
}

/// [`Firewall`] driven through the `ufw` command line.
#[derive(Debug, Clone)]
pub struct Ufw {
    binary: String,
}

impl Default for Ufw {
    fn default() -> Self {
        Self { binary: "ufw".to_string() }
    }
}

impl Ufw {
    async fn run(&self, args: &[&str]) -> Result<String, FirewallError> {
        let command = format!("{} {}", self.binary, args.join(" "));
        info!(%command, "firewall command");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|source| FirewallError::Spawn { command: command.clone(), source })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(FirewallError::Command { command, stderr });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Firewall for Ufw {
    async fn set_enabled(&self, enabled: bool) -> Result<(), FirewallError> {
        let action = if enabled { "enable" } else { "disable" };
        self.run(&["--force", action]).await.map(|_| ())
    }

    async fn add_rule(&self, rule: &str, dry_run: bool) -> Result<String, FirewallError> {
        let mut args: Vec<&str> = Vec::new();
        if dry_run {
            args.push("--dry-run");
        }
        args.extend(rule.split_whitespace());
        self.run(&args).await
    }

    async fn status(&self) -> Result<FirewallStatus, FirewallError> {
        Ok(parse_status(&self.run(&["status", "numbered"]).await?))
    }

    async fn listening(&self) -> Result<Vec<String>, FirewallError> {
        let out = self.run(&["show", "listening"]).await?;
        Ok(out.lines().map(str::trim_end).filter(|l| !l.is_empty()).map(str::to_string).collect())
    }

    async fn reset(&self) -> Result<String, FirewallError> {
        self.run(&["--force", "reset"]).await
    }
}

pub fn parse_status(output: &str) -> FirewallStatus {
    let mut status = "inactive".to_string();
    let mut rules = BTreeMap::new();
    for line in output.lines() {
        let line = line.trim();
        if let Some(s) = line.strip_prefix("Status:") {
            status = s.trim().to_string();
        } else if let Some(rest) = line.strip_prefix('[') {
            let Some((num, rule)) = rest.split_once(']') else { continue };
            if let Ok(n) = num.trim().parse::<u32>() {
                rules.insert(n, rule.split_whitespace().collect::<Vec<_>>().join(" "));
            }
        }
    }
    FirewallStatus { status, rules }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnableRequest {
    #[serde(default)]
    pub enable: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AllowRequest {
    #[serde(default)]
    pub allow: Option<bool>,
    #[serde(default)]
    pub services: Option<Vec<String>>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApplyRequest {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub allow: Option<Vec<String>>,
    #[serde(default)]
    pub deny: Option<Vec<String>>,
}

/// Firewall procedures; failures are also published on
/// `reswarm.network.{serial}.{procedure}`.
pub struct FirewallService {
    firewall: Arc<dyn Firewall>,
    session: Arc<dyn Session>,
    identity: DeviceIdentity,
}

impl FirewallService {
    pub fn new(firewall: Arc<dyn Firewall>, session: Arc<dyn Session>, identity: DeviceIdentity) -> Self {
        Self { firewall, session, identity }
    }

    async fn report(&self, procedure: &str, err: FirewallError) -> RpcError {
        let message = err.to_string();
        error!(procedure, error = %message, "firewall error");
        let topic = self.identity.network_topic(procedure);
        if let Err(e) = self.session.publish(&topic, Value::String(message.clone())).await {
            info!(%topic, error = %e, "could not publish firewall error");
        }
        RpcError::new(message)
    }

    pub async fn status(&self) -> Result<Value, RpcError> {
        match self.firewall.status().await {
            Ok(status) => Ok(status.to_value()),
            Err(e) => Err(self.report("ufw_status", e).await),
        }
    }

    pub async fn listening(&self) -> Result<Value, RpcError> {
        match self.firewall.listening().await {
            Ok(lines) => Ok(json!(lines)),
            Err(e) => Err(self.report("ufw_listening", e).await),
        }
    }

    /// Switch the firewall on or off; a failure is reported but the current
    /// status is still returned.
    pub async fn enable(&self, req: EnableRequest) -> Result<Value, RpcError> {
        let enabled = req.enable.unwrap_or(true);
        info!(enabled, "setting firewall state");
        if let Err(e) = self.firewall.set_enabled(enabled).await {
            self.report("ufw_enable", e).await;
        }
        self.status().await.map(|s| s["status"].clone())
    }

    pub async fn allow(&self, req: AllowRequest) -> Result<Value, RpcError> {
        let services = req.services.ok_or_else(|| RpcError::new("No services found!"))?;
        let action = if req.allow == Some(false) { "deny" } else { "allow" };
        for service in &services {
            let rule = format!("{action} {service}");
            if let Err(e) = self.firewall.add_rule(&rule, req.dry_run).await {
                return Err(self.report("ufw_allow", e).await);
            }
        }
        self.status().await.map(|s| s["rules"].clone())
    }

    pub async fn reset(&self) -> Result<Value, RpcError> {
        match self.firewall.reset().await {
            Ok(out) => Ok(Value::String(out)),
            Err(e) => Err(self.report("ufw_reset", e).await),
        }
    }

    /// Apply `{enabled, allow, deny}` in one go.
    pub async fn apply(&self, req: ApplyRequest) -> Result<Value, RpcError> {
        let (Some(enabled), Some(allow), Some(deny)) = (req.enabled, req.allow, req.deny) else {
            return Ok(Value::String("Enable: invalid\nAllow: invalid\n Deny: invalid".to_string()));
        };
        let enabled = self.enable(EnableRequest { enable: Some(enabled) }).await?;
        let allowed = self
            .allow(AllowRequest { allow: Some(true), services: Some(allow), dry_run: false })
            .await?;
        let denied = self
            .allow(AllowRequest { allow: Some(false), services: Some(deny), dry_run: false })
            .await?;
        Ok(Value::String(format!("Enable: {enabled}\nAllow: {allowed}\n Deny: {denied}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::RecordingSession;
    use std::sync::Mutex;

    const STATUS: &str = "Status: active

     To                         Action      From
     --                         ------      ----
[ 1] 22/tcp                     ALLOW IN    Anywhere
[ 2] 8080                       DENY IN     10.0.0.0/8
";

    #[derive(Default)]
    struct FakeFirewall {
        rules: Mutex<Vec<String>>,
        refuse: Option<&'static str>,
    }

    #[async_trait]
    impl Firewall for FakeFirewall {
        async fn set_enabled(&self, _enabled: bool) -> Result<(), FirewallError> {
            Err(FirewallError::Command { command: "ufw --force enable".into(), stderr: "ERROR: need root".into() })
        }

        async fn add_rule(&self, rule: &str, _dry_run: bool) -> Result<String, FirewallError> {
            if Some(rule) == self.refuse {
                return Err(FirewallError::Command { command: format!("ufw {rule}"), stderr: "bad port".into() });
            }
            self.rules.lock().unwrap().push(rule.to_string());
            Ok("Rule added".into())
        }

        async fn status(&self) -> Result<FirewallStatus, FirewallError> {
            Ok(parse_status(STATUS))
        }

        async fn listening(&self) -> Result<Vec<String>, FirewallError> {
            Ok(vec![])
        }

        async fn reset(&self) -> Result<String, FirewallError> {
            Ok("Resetting all rules to installed defaults.".into())
        }
    }

    fn service(fw: FakeFirewall) -> (Arc<FakeFirewall>, Arc<RecordingSession>, FirewallService) {
        let fw = Arc::new(fw);
        let session = Arc::new(RecordingSession::new());
        let identity = DeviceIdentity { serial_number: "SN1".into(), swarm_key: 1, device_key: 2 };
        (fw.clone(), session.clone(), FirewallService::new(fw, session, identity))
    }

    #[test]
    fn parses_numbered_status() {
        let status = parse_status(STATUS);
        assert_eq!(status.status, "active");
        assert_eq!(status.rules[&1], "22/tcp ALLOW IN Anywhere");
        assert_eq!(status.rules[&2], "8080 DENY IN 10.0.0.0/8");
        assert_eq!(parse_status("Status: inactive\n").rules.len(), 0);
    }

    #[tokio::test]
    async fn enable_failure_is_published_not_raised() {
        let (_fw, session, svc) = service(FakeFirewall::default());
        let out = svc.enable(EnableRequest { enable: Some(true) }).await.unwrap();
        assert_eq!(out, json!("active"));
        assert_eq!(session.published_on("reswarm.network.SN1.ufw_enable").len(), 1);
    }

    #[tokio::test]
    async fn apply_adds_allow_and_deny_rules() {
        let (fw, _session, svc) = service(FakeFirewall::default());
        let req = ApplyRequest { enabled: Some(true), allow: Some(vec!["22/tcp".into()]), deny: Some(vec!["8080".into()]) };
        let out = svc.apply(req).await.unwrap();
        assert!(out.as_str().unwrap().starts_with("Enable: \"active\""));
        assert_eq!(*fw.rules.lock().unwrap(), vec!["allow 22/tcp", "deny 8080"]);
    }

    #[tokio::test]
    async fn apply_with_partial_request_is_invalid() {
        let (fw, _session, svc) = service(FakeFirewall::default());
        let out = svc.apply(ApplyRequest { enabled: Some(true), ..Default::default() }).await.unwrap();
        assert_eq!(out, json!("Enable: invalid\nAllow: invalid\n Deny: invalid"));
        assert!(fw.rules.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn refused_rule_fails_and_is_published() {
        let (_fw, session, svc) = service(FakeFirewall { refuse: Some("deny 99999"), ..Default::default() });
        let req = AllowRequest { allow: Some(false), services: Some(vec!["99999".into()]), dry_run: false };
        assert!(svc.allow(req).await.unwrap_err().message().contains("bad port"));
        assert_eq!(session.published_on("reswarm.network.SN1.ufw_allow").len(), 1);
        assert!(svc.allow(AllowRequest::default()).await.is_err());
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Firewall that accepts everything and reports itself inactive.
    pub struct IdleFirewall;

    #[async_trait]
    impl Firewall for IdleFirewall {
        async fn set_enabled(&self, _enabled: bool) -> Result<(), FirewallError> {
            Ok(())
        }

        async fn add_rule(&self, _rule: &str, _dry_run: bool) -> Result<String, FirewallError> {
            Ok("Rule added".into())
        }

        async fn status(&self) -> Result<FirewallStatus, FirewallError> {
            Ok(FirewallStatus { status: "inactive".into(), rules: BTreeMap::new() })
        }

        async fn listening(&self) -> Result<Vec<String>, FirewallError> {
            Ok(vec![])
        }

        async fn reset(&self) -> Result<String, FirewallError> {
            Ok(String::new())
        }
    }
}
