use std::sync::Arc;

use common::{DeviceIdentity, LogEnvelope};
use serde_json::{Map, Value};
use tracing::debug;

use crate::session::Session;

/// Publishes progress and failures to `reswarm.logs.{serial}.{target}`.
/// Publishing never fails the caller; errors are only logged.
#[derive(Clone)]
pub struct LogSink {
    session: Arc<dyn Session>,
    identity: DeviceIdentity,
}

impl LogSink {
    pub fn new(session: Arc<dyn Session>, identity: DeviceIdentity) -> Self {
        Self { session, identity }
    }

    pub fn topic(&self, target: &str) -> String {
        self.identity.log_topic(target)
    }

    /// Wrap a progress chunk in a build envelope and publish it.
    pub async fn publish_chunk(&self, target: &str, chunk: Value) {
        self.publish_envelope(target, LogEnvelope::build(chunk)).await;
    }

    /// Publish a user-facing message in a build envelope.
    pub async fn publish_message(&self, target: &str, message: &str) {
        self.publish_envelope(target, LogEnvelope::build(Value::String(message.to_string()))).await;
    }

    /// Publish `payload` as is.
    pub async fn publish_raw(&self, target: &str, payload: Value) {
        let topic = self.topic(target);
        if let Err(e) = self.session.publish(&topic, payload).await {
            debug!(%topic, error = %e, "log publish failed");
        }
    }

    /// Report a host update failure on the updates topic.
    pub async fn publish_update(&self, target: &str, message: &str) {
        let topic = self.identity.updates_topic(target);
        if let Err(e) = self.session.publish(&topic, Value::String(message.to_string())).await {
            debug!(%topic, error = %e, "update publish failed");
        }
    }

    /// Tell log followers a container is (re)starting.
    pub async fn notify_start(&self, container: &str) {
        let procedure = self.topic("notify_start_container");
        if let Err(e) = self
            .session
            .call(&procedure, vec![Value::String(container.to_string())], Map::new())
            .await
        {
            debug!(%procedure, error = %e, "start notification failed");
        }
    }

    async fn publish_envelope(&self, target: &str, envelope: LogEnvelope) {
        match serde_json::to_value(envelope) {
            Ok(payload) => self.publish_raw(target, payload).await,
            Err(e) => debug!(target_name = %target, error = %e, "unserialisable log envelope"),
        }
    }
}
