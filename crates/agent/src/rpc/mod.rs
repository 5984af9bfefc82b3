//! Remote procedure registration and invocation plumbing.

pub mod catalogue;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::runtime::RuntimeError;
use crate::session::{Session, SessionError};

/// What a remote caller sees when a procedure fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RpcError {
    message: String,
}

impl RpcError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<RuntimeError> for RpcError {
    fn from(e: RuntimeError) -> Self {
        Self::new(e.message())
    }
}

impl From<SessionError> for RpcError {
    fn from(e: SessionError) -> Self {
        Self::new(e.to_string())
    }
}

pub type Handler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// Functional grouping used for registration logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Area {
    Apps,
    Config,
    Device,
    Firewall,
    Wifi,
    Stats,
    Lifecycle,
    Prune,
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Area::Apps => "apps",
            Area::Config => "config",
            Area::Device => "device",
            Area::Firewall => "firewall",
            Area::Wifi => "wifi",
            Area::Stats => "stats",
            Area::Lifecycle => "container lifecycle",
            Area::Prune => "prune",
        };
        f.write_str(s)
    }
}

pub struct Procedure {
    pub name: &'static str,
    pub topic: String,
    pub area: Area,
    pub handler: Handler,
}

impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Procedure")
            .field("name", &self.name)
            .field("topic", &self.topic)
            .field("area", &self.area)
            .finish()
    }
}

/// Wrap `f` so every invocation runs on its own worker task, leaving the
/// session's event path free. Failures are logged and returned to the caller.
pub fn in_worker<F, Fut>(label: &'static str, f: F) -> Handler
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    Arc::new(move |args| {
        let work = f(args);
        Box::pin(async move {
            info!(procedure = label, "invoked");
            match tokio::spawn(work).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => {
                    warn!(procedure = label, error = %e, "procedure failed");
                    Err(e)
                }
                Err(join) => {
                    error!(procedure = label, error = %join, "procedure worker aborted");
                    Err(RpcError::new(format!("{label} aborted: {join}")))
                }
            }
        })
    })
}

/// Wrap a cheap handler that runs directly on the event path.
pub fn inline<F, Fut>(label: &'static str, f: F) -> Handler
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    Arc::new(move |args| {
        let work = f(args);
        Box::pin(async move {
            info!(procedure = label, "invoked");
            work.await
        })
    })
}

/// Deserialize the first positional argument, treating a missing one as `{}`.
pub fn request<T: DeserializeOwned>(args: &[Value]) -> Result<T, RpcError> {
    let raw = args
        .first()
        .filter(|v| !v.is_null())
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(raw).map_err(|e| RpcError::new(format!("invalid arguments: {e}")))
}

/// Positional string argument at `idx`.
pub fn arg_str(args: &[Value], idx: usize, name: &str) -> Result<String, RpcError> {
    args.get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RpcError::new(format!("missing argument {name}")))
}

#[derive(Debug, thiserror::Error)]
#[error("failed to register {procedure} on {topic}: {source}")]
pub struct RegistrationError {
    pub procedure: &'static str,
    pub topic: String,
    #[source]
    pub source: SessionError,
}

/// Registers the procedure catalogue on a freshly joined session.
#[derive(Debug, Clone)]
pub struct RegistrationLayer {
    backoff: Duration,
}

impl RegistrationLayer {
    pub fn new(backoff: Duration) -> Self {
        Self { backoff }
    }

    /// Register every procedure in order. The first refusal disconnects the
    /// session, waits out the backoff and aborts the remaining registrations.
    pub async fn register_all(&self, session: &dyn Session, procedures: Vec<Procedure>) -> Result<usize, RegistrationError> {
        let total = procedures.len();
        let mut area = None;
        for (idx, procedure) in procedures.into_iter().enumerate() {
            if area != Some(procedure.area) {
                info!(area = %procedure.area, "registering procedures");
                area = Some(procedure.area);
            }
            match session.register(&procedure.topic, procedure.handler).await {
                Ok(()) => info!(topic = %procedure.topic, "registered"),
                Err(source) => {
                    warn!(topic = %procedure.topic, error = %source, "registration refused, disconnecting");
                    session.disconnect().await;
                    tokio::time::sleep(self.backoff).await;
                    info!(
                        topic = %procedure.topic,
                        pending = total - idx,
                        "waiting for registration"
                    );
                    return Err(RegistrationError { procedure: procedure.name, topic: procedure.topic, source });
                }
            }
        }
        Ok(total)
    }
}
