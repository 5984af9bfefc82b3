use std::sync::Arc;
use std::time::Duration;

use common::{
    DeviceIdentity, DeviceInfo, DeviceStatus, DEVICE_SYNC_PROCEDURE, TESTAMENT_PROCEDURE, TESTAMENT_TOPIC,
    UPDATE_DEVICE_PROCEDURE,
};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

use super::{Session, SessionEvent, SessionState};
use crate::config::AgentConfig;
use crate::device::{ensure_app_dirs, BootFiles, DeviceOps};
use crate::executor::LifecycleExecutor;
use crate::firewall::{Firewall, FirewallService};
use crate::logsink::LogSink;
use crate::registry::OperationRegistry;
use crate::rpc::catalogue::{procedures, ProcedureContext};
use crate::rpc::RegistrationLayer;
use crate::runtime::ContainerRuntime;
use crate::wifi::{WifiControl, WifiService};

/// Bound on the best-effort status notification sent while leaving.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// Host-side collaborators handed to every session's procedures.
#[derive(Clone)]
pub struct Collaborators {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub firewall: Arc<dyn Firewall>,
    pub wifi: Arc<dyn WifiControl>,
}

/// What the run loop should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit(i32),
}

/// Drives the session lifecycle:
/// `Disconnected -> Joining -> Joined -> Leaving -> Disconnected`.
///
/// Only this type mutates session state, one event at a time. A transport
/// level disconnect or connect failure ends the process with a non-zero
/// code; a local shutdown leaves gracefully and exits with 0.
pub struct SessionController {
    config: Arc<AgentConfig>,
    identity: DeviceIdentity,
    collaborators: Collaborators,
    registry: Arc<OperationRegistry>,
    registration: RegistrationLayer,
    state: SessionState,
    session: Option<Arc<dyn Session>>,
    sync_boot: bool,
}

impl SessionController {
    pub fn new(config: Arc<AgentConfig>, collaborators: Collaborators, registry: Arc<OperationRegistry>) -> Self {
        let registration = RegistrationLayer::new(Duration::from_millis(config.agent.registration_backoff_ms));
        Self {
            identity: config.identity(),
            config,
            collaborators,
            registry,
            registration,
            state: SessionState::Disconnected,
            session: None,
            sync_boot: std::env::consts::ARCH != "x86_64",
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Consume transport events until one of them ends the process.
    pub async fn run(mut self, mut events: UnboundedReceiver<SessionEvent>) -> i32 {
        while let Some(event) = events.recv().await {
            if let Flow::Exit(code) = self.handle(event).await {
                return code;
            }
        }
        warn!("session event channel closed");
        self.teardown(false).await;
        1
    }

    pub async fn handle(&mut self, event: SessionEvent) -> Flow {
        info!(state = %self.state, ?event, "session event");
        match event {
            SessionEvent::Connecting => {
                if self.session.is_some() {
                    warn!("connecting while a session is still attached, tearing it down");
                    self.teardown(false).await;
                }
                self.state = SessionState::Joining;
                Flow::Continue
            }
            SessionEvent::Joined(session) => {
                if self.session.is_some() {
                    self.teardown(false).await;
                }
                self.state = SessionState::Joining;
                self.on_join(session).await;
                Flow::Continue
            }
            SessionEvent::Left { reason } => {
                info!(%reason, "session left");
                self.teardown(false).await;
                Flow::Continue
            }
            SessionEvent::Disconnected { was_clean } => {
                error!(was_clean, "transport disconnected, exiting");
                self.teardown(false).await;
                Flow::Exit(1)
            }
            SessionEvent::ConnectFailure { reason } => {
                error!(%reason, "could not connect, exiting");
                self.teardown(false).await;
                Flow::Exit(1)
            }
            SessionEvent::Shutdown => {
                info!("shutdown requested, leaving session");
                self.teardown(true).await;
                Flow::Exit(0)
            }
        }
    }

    async fn on_join(&mut self, session: Arc<dyn Session>) {
        info!(device = %self.identity, "session joined");

        let testament = serde_json::to_value(self.identity.testament()).unwrap_or(Value::Null);
        match session
            .call(TESTAMENT_PROCEDURE, vec![json!(TESTAMENT_TOPIC), json!([testament]), json!({})], Map::new())
            .await
        {
            Ok(id) => info!(testament = ?id, "testament registered"),
            Err(e) => error!(error = %e, "error adding testament"),
        }

        let info = self.announce(session.as_ref()).await;
        if self.sync_boot {
            if let Err(e) = BootFiles::new(&self.config.agent.boot_dir).sync(&info).await {
                error!(error = %e, "boot configuration sync failed");
            }
        }
        if let Err(e) = ensure_app_dirs(&self.config.agent.base_dir).await {
            error!(error = %e, "could not create application directories");
        }

        self.session = Some(session.clone());
        self.state = SessionState::Joined;

        let ctx = self.procedure_context(session.clone(), info.name);
        let executor = ctx.executor.clone();
        tokio::spawn(async move {
            if let Err(e) = executor.start_app_logs().await {
                error!(error = %e, "could not start the app log service");
            }
        });
        match self.registration.register_all(session.as_ref(), procedures(&ctx)).await {
            Ok(count) => {
                info!(count, "all procedures registered");
                let key = json!(self.identity.device_key);
                if let Err(e) = session.call(DEVICE_SYNC_PROCEDURE, vec![key], Map::new()).await {
                    error!(error = %e, "device sync failed");
                }
            }
            Err(e) => error!(error = %e, "registration incomplete, waiting for a new session"),
        }
    }

    /// Report `CONNECTED` and return what the directory knows about us.
    async fn announce(&self, session: &dyn Session) -> DeviceInfo {
        let mut update = self.identity.status_update(DeviceStatus::Connected);
        update.boot_config_applied = Some(true);
        update.firewall_applied = Some(true);
        let payload = serde_json::to_value(update).unwrap_or(Value::Null);
        match session.call(UPDATE_DEVICE_PROCEDURE, vec![payload], Map::new()).await {
            Ok(result) => device_info(result).unwrap_or_default(),
            Err(e) => {
                error!(error = %e, "could not update device");
                DeviceInfo::default()
            }
        }
    }

    fn procedure_context(&self, session: Arc<dyn Session>, device_name: Option<String>) -> ProcedureContext {
        let sink = LogSink::new(session.clone(), self.identity.clone());
        let executor = Arc::new(LifecycleExecutor::new(
            self.config.clone(),
            self.collaborators.runtime.clone(),
            self.registry.clone(),
            sink,
            device_name,
        ));
        ProcedureContext {
            identity: self.identity.clone(),
            executor: executor.clone(),
            firewall: Arc::new(FirewallService::new(
                self.collaborators.firewall.clone(),
                session.clone(),
                self.identity.clone(),
            )),
            wifi: Arc::new(WifiService::new(
                self.collaborators.wifi.clone(),
                self.config.agent.wpa_supplicant_conf.clone(),
            )),
            device: Arc::new(DeviceOps::new(self.config.clone(), session, executor)),
        }
    }

    /// Notify the directory, stop every live stream and drop the session.
    async fn teardown(&mut self, leave: bool) {
        self.state = SessionState::Leaving;
        if let Some(session) = self.session.take() {
            let update = serde_json::to_value(self.identity.status_update(DeviceStatus::Disconnected))
                .unwrap_or(Value::Null);
            let notify = session.call(UPDATE_DEVICE_PROCEDURE, vec![update], Map::new());
            match tokio::time::timeout(NOTIFY_TIMEOUT, notify).await {
                Ok(Ok(_)) => info!("device marked disconnected"),
                Ok(Err(e)) => warn!(error = %e, "could not mark device disconnected"),
                Err(_) => warn!("timed out marking device disconnected"),
            }
            let cancelled = self.registry.cancel_all();
            if cancelled > 0 {
                info!(cancelled, "cancelled live operations");
            }
            if leave {
                if let Err(e) = session.leave().await {
                    warn!(error = %e, "leave failed");
                }
            }
            session.disconnect().await;
        } else {
            self.registry.cancel_all();
        }
        self.state = SessionState::Disconnected;
    }
}

/// The directory answers with either a device record or a one-element list
/// holding it.
fn device_info(result: Vec<Value>) -> Option<DeviceInfo> {
    let first = result.into_iter().next()?;
    let record = match first {
        Value::Array(items) => items.into_iter().next()?,
        other => other,
    };
    match serde_json::from_value(record) {
        Ok(info) => Some(info),
        Err(e) => {
            warn!(error = %e, "unexpected device record");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::testing::IdleFirewall;
    use crate::registry::OperationKey;
    use crate::rpc::catalogue::CATALOGUE;
    use crate::runtime::testing::ScriptedRuntime;
    use crate::runtime::{RestartPolicy, RuntimeError};
    use crate::session::testing::RecordingSession;
    use crate::wifi::testing::IdleWifi;
    use futures::channel::mpsc;
    use futures::{SinkExt, StreamExt};

    struct Harness {
        _dir: tempfile::TempDir,
        runtime: Arc<ScriptedRuntime>,
        registry: Arc<OperationRegistry>,
        controller: SessionController,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let raw = format!(
            r#"
serial_number = "SN1"
swarm_key = 7
device_key = 42
secret = "s3cret"
device_endpoint_url = "wss://router.local/ws"

[agent]
registration_backoff_ms = 5
base_dir = "{base}"
boot_dir = "{base}/boot"
wpa_supplicant_conf = "{base}/wpa.conf"
"#,
            base = dir.path().display()
        );
        let config = Arc::new(AgentConfig::from_toml_str(&raw).unwrap());
        let runtime = Arc::new(ScriptedRuntime::new());
        let registry = Arc::new(OperationRegistry::new());
        let collaborators = Collaborators {
            runtime: runtime.clone(),
            firewall: Arc::new(IdleFirewall),
            wifi: Arc::new(IdleWifi),
        };
        let mut controller = SessionController::new(config, collaborators, registry.clone());
        controller.sync_boot = false;
        Harness { _dir: dir, runtime, registry, controller }
    }

    async fn join(h: &mut Harness) -> Arc<RecordingSession> {
        let session = Arc::new(RecordingSession::new());
        assert_eq!(h.controller.handle(SessionEvent::Connecting).await, Flow::Continue);
        assert_eq!(h.controller.state(), SessionState::Joining);
        assert_eq!(h.controller.handle(SessionEvent::Joined(session.clone())).await, Flow::Continue);
        session
    }

    #[tokio::test]
    async fn join_registers_testament_then_procedures_then_syncs() {
        let mut h = harness();
        let session = join(&mut h).await;

        assert_eq!(h.controller.state(), SessionState::Joined);
        assert_eq!(
            session.call_names(),
            vec![TESTAMENT_PROCEDURE, UPDATE_DEVICE_PROCEDURE, DEVICE_SYNC_PROCEDURE]
        );
        let calls = session.calls();
        assert_eq!(calls[0].1[0], json!(TESTAMENT_TOPIC));
        assert_eq!(calls[0].1[1][0]["device_key"], json!(42));
        assert_eq!(calls[1].1[0]["status"], json!("CONNECTED"));
        assert_eq!(calls[2].1, vec![json!(42)]);
        assert_eq!(session.registered_topics().len(), CATALOGUE.len());
        assert!(h._dir.path().join("APP/PROD").is_dir());
    }

    #[tokio::test]
    async fn directory_record_drives_boot_sync_and_device_name() {
        let mut h = harness();
        h.controller.sync_boot = true;
        let boot = h._dir.path().join("boot");
        std::fs::create_dir(&boot).unwrap();
        std::fs::write(boot.join("config.txt"), "dtparam=audio=on\n").unwrap();

        let session = Arc::new(RecordingSession::new());
        session.respond_to(
            UPDATE_DEVICE_PROCEDURE,
            vec![json!([{"name": "pi-4", "boot_config": "dtparam=audio=off\n", "cmdline": ""}])],
        );
        h.controller.handle(SessionEvent::Joined(session.clone())).await;

        assert_eq!(std::fs::read_to_string(boot.join("config.txt")).unwrap(), "dtparam=audio=off\n");
        assert!(!boot.join("cmdline.txt").exists());

        let args = vec![json!({"image_name": "app:latest", "container_name": "app"})];
        let out = session.invoke("re.mgmt.SN1.docker_run", args).await.unwrap();
        assert_eq!(out, json!(common::EXECUTION_END));
        let run = h.runtime.runs().pop().unwrap();
        assert!(run.env.contains(&"DEVICE_NAME=pi-4".to_string()));
    }

    #[tokio::test]
    async fn join_starts_the_app_log_service() {
        let mut h = harness();
        join(&mut h).await;

        for _ in 0..100 {
            if !h.runtime.detached().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let spec = h.runtime.detached().pop().unwrap();
        assert_eq!(spec.name, "svc_app_logs");
        assert_eq!(spec.restart, RestartPolicy::Always);
        assert!(spec.env.contains(&"DEVICE_KEY=42".to_string()));
        assert!(h.runtime.calls().contains(&"remove_container:svc_app_logs:true".to_string()));
    }

    #[tokio::test]
    async fn failed_testament_does_not_block_join() {
        let mut h = harness();
        let session = Arc::new(RecordingSession::new());
        session.fail_calls_to(TESTAMENT_PROCEDURE);
        session.fail_calls_to(UPDATE_DEVICE_PROCEDURE);
        h.controller.handle(SessionEvent::Joined(session.clone())).await;

        assert_eq!(session.registered_topics().len(), CATALOGUE.len());
        assert!(session.call_names().contains(&DEVICE_SYNC_PROCEDURE.to_string()));
    }

    #[tokio::test]
    async fn refused_registration_skips_sync_and_disconnects() {
        let mut h = harness();
        let session = Arc::new(RecordingSession::new());
        session.reject_registration_of("re.mgmt.SN1.ufw_enable");
        h.controller.handle(SessionEvent::Joined(session.clone())).await;

        assert_eq!(session.disconnect_count(), 1);
        assert!(!session.call_names().contains(&DEVICE_SYNC_PROCEDURE.to_string()));
        assert!(!session.registered_topics().contains(&"re.mgmt.SN1.ufw_status".to_string()));
    }

    #[tokio::test]
    async fn disconnect_cancels_live_builds_and_exits() {
        let mut h = harness();
        let session = join(&mut h).await;

        let mut feeds = Vec::new();
        let mut builds = Vec::new();
        for container in ["app_a", "app_b"] {
            let (tx, rx) = mpsc::channel::<Result<Value, RuntimeError>>(4);
            h.runtime.push_stream(rx.boxed());
            feeds.push(tx);
            let s = session.clone();
            let args = vec![json!({
                "name": container,
                "image_name": format!("arm_1_{container}:latest"),
                "container_name": container,
                "account_id": "acct",
            })];
            builds.push(tokio::spawn(async move { s.invoke("re.mgmt.SN1.docker_build", args).await }));
            for _ in 0..100 {
                if h.registry.contains(&OperationKey::new("acct", container)) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        assert_eq!(h.registry.len(), 2);

        assert_eq!(h.controller.handle(SessionEvent::Disconnected { was_clean: false }).await, Flow::Exit(1));
        assert!(h.registry.is_empty());
        assert_eq!(h.controller.state(), SessionState::Disconnected);
        let last = session.calls().pop().unwrap();
        assert_eq!(last.0, UPDATE_DEVICE_PROCEDURE);
        assert_eq!(last.1[0]["status"], json!("DISCONNECTED"));

        // The blocked reads return at the next chunk boundary.
        for tx in &mut feeds {
            tx.send(Ok(json!({"stream": "Step 2/5"}))).await.unwrap();
        }
        for build in builds {
            let err = build.await.unwrap().unwrap_err();
            assert!(err.message().contains("cancelled"), "{}", err.message());
        }
    }

    #[tokio::test]
    async fn shutdown_leaves_gracefully() {
        let mut h = harness();
        let session = join(&mut h).await;

        assert_eq!(h.controller.handle(SessionEvent::Shutdown).await, Flow::Exit(0));
        assert!(session.has_left());
        assert_eq!(session.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn leave_keeps_running_and_allows_rejoin() {
        let mut h = harness();
        let first = join(&mut h).await;

        let flow = h.controller.handle(SessionEvent::Left { reason: "wamp.close.normal".into() }).await;
        assert_eq!(flow, Flow::Continue);
        assert_eq!(h.controller.state(), SessionState::Disconnected);
        assert!(h.controller.session.is_none());
        assert!(!first.has_left());

        let second = join(&mut h).await;
        assert_eq!(h.controller.state(), SessionState::Joined);
        assert_eq!(second.registered_topics().len(), CATALOGUE.len());
    }

    #[tokio::test]
    async fn connect_failure_exits() {
        let mut h = harness();
        let flow = h.controller.handle(SessionEvent::ConnectFailure { reason: "refused".into() }).await;
        assert_eq!(flow, Flow::Exit(1));
    }

    #[test]
    fn device_info_accepts_record_or_list() {
        let info = device_info(vec![json!([{"name": "pi-4", "boot_config": "x"}])]).unwrap();
        assert_eq!(info.name.as_deref(), Some("pi-4"));
        let info = device_info(vec![json!({"name": "pi-5"})]).unwrap();
        assert_eq!(info.name.as_deref(), Some("pi-5"));
        assert!(device_info(vec![]).is_none());
    }
}
