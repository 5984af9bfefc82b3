use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{Session, SessionError};
use crate::rpc::{Handler, RpcError};

/// In-memory session that records everything the agent does with it.
#[derive(Default)]
pub struct RecordingSession {
    handlers: Mutex<Vec<(String, Handler)>>,
    published: Mutex<Vec<(String, Value)>>,
    calls: Mutex<Vec<(String, Vec<Value>)>>,
    responses: Mutex<HashMap<String, Vec<Value>>>,
    failing_calls: Mutex<HashSet<String>>,
    reject_topic: Mutex<Option<String>>,
    left: AtomicBool,
    disconnects: AtomicUsize,
}

impl RecordingSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registration of `topic` is refused by the fake router.
    pub fn reject_registration_of(&self, topic: &str) {
        *self.reject_topic.lock().unwrap() = Some(topic.to_string());
    }

    pub fn respond_to(&self, procedure: &str, result: Vec<Value>) {
        self.responses.lock().unwrap().insert(procedure.to_string(), result);
    }

    pub fn fail_calls_to(&self, procedure: &str) {
        self.failing_calls.lock().unwrap().insert(procedure.to_string());
    }

    pub fn registered_topics(&self) -> Vec<String> {
        self.handlers.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Value> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_names(&self) -> Vec<String> {
        self.calls().into_iter().map(|(name, _)| name).collect()
    }

    pub fn has_left(&self) -> bool {
        self.left.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Invoke a registered procedure as a remote caller would.
    pub async fn invoke(&self, topic: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let handler = self
            .handlers
            .lock()
            .unwrap()
            .iter()
            .find(|(t, _)| t == topic)
            .map(|(_, h)| h.clone())
            .unwrap_or_else(|| panic!("no procedure registered on {topic}"));
        handler(args).await
    }
}

#[async_trait]
impl Session for RecordingSession {
    async fn register(&self, topic: &str, handler: Handler) -> Result<(), SessionError> {
        if self.reject_topic.lock().unwrap().as_deref() == Some(topic) {
            return Err(SessionError::Rejected(format!("wamp.error.procedure_already_exists: {topic}")));
        }
        self.handlers.lock().unwrap().push((topic.to_string(), handler));
        Ok(())
    }

    async fn call(&self, procedure: &str, args: Vec<Value>, _kwargs: Map<String, Value>) -> Result<Vec<Value>, SessionError> {
        self.calls.lock().unwrap().push((procedure.to_string(), args));
        if self.failing_calls.lock().unwrap().contains(procedure) {
            return Err(SessionError::Rejected(format!("{procedure} failed")));
        }
        Ok(self.responses.lock().unwrap().get(procedure).cloned().unwrap_or_default())
    }

    async fn publish(&self, topic: &str, payload: Value) -> Result<(), SessionError> {
        self.published.lock().unwrap().push((topic.to_string(), payload));
        Ok(())
    }

    async fn leave(&self) -> Result<(), SessionError> {
        self.left.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}
