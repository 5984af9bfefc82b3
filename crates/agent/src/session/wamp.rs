//! [`Session`] over a WAMP router, using `wamp_async`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde_json::{Map, Value};
use sha2::Sha256;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use wamp_async::{
    Arg, AuthenticationChallengeResponse, AuthenticationMethod, Client, ClientConfig, WampArgs, WampDict, WampError,
    WampKwArgs,
};

use super::{Session, SessionError, SessionEvent};
use crate::config::{AgentConfig, TransportConfig};
use crate::rpc::Handler;

/// WAMP-CRA signature: base64(HMAC-SHA256(secret, challenge)).
pub fn sign_challenge(secret: &str, challenge: &str) -> Result<String, SessionError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| SessionError::Transport(format!("invalid secret: {e}")))?;
    mac.update(challenge.as_bytes());
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// The challenge string of a WAMP-CRA `CHALLENGE.extra`.
fn cra_challenge(extra: &WampDict) -> Result<&str, WampError> {
    match extra.get("challenge") {
        Some(Arg::String(challenge)) => Ok(challenge),
        _ => Err(WampError::UnknownError("missing CRA challenge".to_string())),
    }
}

/// Exponential connect backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    initial: f64,
    max: f64,
    growth: f64,
    jitter: f64,
    max_retries: i64,
}

impl From<&TransportConfig> for RetryPolicy {
    fn from(t: &TransportConfig) -> Self {
        Self {
            initial: t.initial_retry_delay_secs,
            max: t.max_retry_delay_secs,
            growth: t.retry_delay_growth,
            jitter: t.retry_delay_jitter,
            max_retries: t.max_retries,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` once the
    /// retries are used up. `sample` in `[0, 1)` picks the jitter.
    pub fn delay(&self, attempt: u32, sample: f64) -> Option<Duration> {
        if self.max_retries >= 0 && i64::from(attempt) > self.max_retries {
            return None;
        }
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = (self.initial * self.growth.powi(exp)).min(self.max);
        let jittered = base * (1.0 + self.jitter * (2.0 * sample - 1.0));
        Some(Duration::from_secs_f64(jittered.max(0.0)))
    }
}

/// Router meta procedure used as a liveness check. Any answer, including an
/// authorization error, proves the router is still there.
const LIVENESS_PROCEDURE: &str = "wamp.session.count";

/// Call the router every `every` and return once a call is left
/// unanswered for `timeout`. A closed session stops the checks.
async fn keep_alive<F, Fut>(every: Duration, timeout: Duration, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(), SessionError>>,
{
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match tokio::time::timeout(timeout, check()).await {
            Ok(Err(SessionError::Closed)) => std::future::pending::<()>().await,
            Ok(_) => debug!("router answered liveness check"),
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "router did not answer liveness check");
                return;
            }
        }
    }
}

/// A joined WAMP session. Dropping the client ends its event loop, which
/// the transport reports as [`SessionEvent::Disconnected`].
pub struct WampSession {
    client: RwLock<Option<Client<'static>>>,
    events: UnboundedSender<SessionEvent>,
}

fn transport(e: WampError) -> SessionError {
    SessionError::Transport(e.to_string())
}

#[async_trait]
impl Session for WampSession {
    async fn register(&self, topic: &str, handler: Handler) -> Result<(), SessionError> {
        let guard = self.client.read().await;
        let client = guard.as_ref().ok_or(SessionError::Closed)?;
        client
            .register(topic, move |args: Option<WampArgs>, _kwargs: Option<WampKwArgs>| {
                let handler = handler.clone();
                async move {
                    match handler(args.unwrap_or_default()).await {
                        Ok(value) => Ok((Some(vec![value]), None)),
                        Err(e) => Err(WampError::UnknownError(e.message().to_string())),
                    }
                }
            })
            .await
            .map(|id| debug!(topic, registration = ?id, "registered"))
            .map_err(|e| SessionError::Rejected(e.to_string()))
    }

    async fn call(&self, procedure: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Vec<Value>, SessionError> {
        let guard = self.client.read().await;
        let client = guard.as_ref().ok_or(SessionError::Closed)?;
        let kwargs = (!kwargs.is_empty()).then_some(kwargs);
        let (result, _) = client.call(procedure, Some(args), kwargs).await.map_err(transport)?;
        Ok(result.unwrap_or_default())
    }

    async fn publish(&self, topic: &str, payload: Value) -> Result<(), SessionError> {
        let guard = self.client.read().await;
        let client = guard.as_ref().ok_or(SessionError::Closed)?;
        client.publish(topic, Some(vec![payload]), None, false).await.map_err(transport)?;
        Ok(())
    }

    async fn leave(&self) -> Result<(), SessionError> {
        {
            let mut guard = self.client.write().await;
            let client = guard.as_mut().ok_or(SessionError::Closed)?;
            client.leave_realm().await.map_err(transport)?;
        }
        let _ = self.events.send(SessionEvent::Left { reason: "wamp.close.normal".to_string() });
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(client) = self.client.write().await.take() {
            client.disconnect().await;
        }
    }
}

/// Connects, joins and reports lifecycle events to the controller.
pub struct WampTransport {
    config: Arc<AgentConfig>,
    events: UnboundedSender<SessionEvent>,
}

impl WampTransport {
    pub fn new(config: Arc<AgentConfig>, events: UnboundedSender<SessionEvent>) -> Self {
        Self { config, events }
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("session controller is gone");
        }
    }

    /// Run one connection to completion.
    pub async fn run(self) {
        let policy = RetryPolicy::from(&self.config.transport);
        let handshake = Duration::from_millis(self.config.transport.open_handshake_timeout_ms);
        let url = self.config.device_endpoint_url.clone();
        let mut attempt = 0u32;

        let (mut client, event_loop, rpc_queue) = loop {
            self.emit(SessionEvent::Connecting);
            let options = ClientConfig::default().set_ssl_verify(self.config.ssl_verify);
            let reason = match tokio::time::timeout(handshake, Client::connect(&url, Some(options))).await {
                Ok(Ok((client, (event_loop, rpc_queue)))) => break (client, event_loop, rpc_queue),
                Ok(Err(e)) => e.to_string(),
                Err(_) => "opening handshake timed out".to_string(),
            };
            attempt += 1;
            let sample: f64 = rand::thread_rng().gen();
            match policy.delay(attempt, sample) {
                Some(delay) => {
                    warn!(%url, attempt, error = %reason, delay_ms = delay.as_millis() as u64, "connect failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    self.emit(SessionEvent::ConnectFailure { reason });
                    return;
                }
            }
        };
        info!(%url, "connected");

        let event_loop = tokio::spawn(event_loop);
        if let Some(mut queue) = rpc_queue {
            tokio::spawn(async move {
                while let Some(invocation) = queue.recv().await {
                    tokio::spawn(invocation);
                }
            });
        }

        let identity = self.config.identity();
        let secret = self.config.secret.clone();
        let joined = client
            .join_realm_with_authentication(
                self.config.realm.clone(),
                vec![AuthenticationMethod::WampCra],
                identity.auth_id(),
                move |_method, extra| {
                    let secret = secret.clone();
                    async move {
                        let challenge = cra_challenge(&extra)?;
                        let signature = sign_challenge(&secret, challenge)
                            .map_err(|e| WampError::UnknownError(e.to_string()))?;
                        Ok(AuthenticationChallengeResponse::with_signature(signature))
                    }
                },
            )
            .await;
        if let Err(e) = joined {
            error!(realm = %self.config.realm, error = %e, "join failed");
            client.disconnect().await;
            self.emit(SessionEvent::ConnectFailure { reason: e.to_string() });
            return;
        }
        info!(realm = %self.config.realm, authid = %identity.auth_id(), "joined realm");

        let session = Arc::new(WampSession { client: RwLock::new(Some(client)), events: self.events.clone() });
        self.emit(SessionEvent::Joined(session.clone()));

        let transport = &self.config.transport;
        let every = Duration::from_secs(transport.auto_ping_interval_secs);
        let timeout = Duration::from_secs(transport.auto_ping_timeout_secs);
        let check = || {
            let session = session.clone();
            async move { session.call(LIVENESS_PROCEDURE, Vec::new(), Map::new()).await.map(drop) }
        };
        let watchdog = async {
            if every.is_zero() {
                std::future::pending::<()>().await;
            }
            keep_alive(every, timeout, check).await;
        };

        let was_clean = tokio::select! {
            ended = event_loop => match ended {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!(error = %e, "event loop ended with error");
                    false
                }
                Err(e) => {
                    warn!(error = %e, "event loop aborted");
                    false
                }
            },
            () = watchdog => {
                session.disconnect().await;
                false
            }
        };
        self.emit(SessionEvent::Disconnected { was_clean });
    }
}
