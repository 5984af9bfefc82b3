//! Transport-agnostic session model.
//!
//! The controller only ever sees [`Session`] and [`SessionEvent`]; the WAMP
//! adapter in [`wamp`] is the single place that knows the wire protocol.

mod controller;
#[cfg(test)]
pub mod testing;
pub mod wamp;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

pub use controller::{Collaborators, SessionController};

use crate::rpc::Handler;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("router rejected request: {0}")]
    Rejected(String),
}

/// A joined session on the messaging router.
#[async_trait]
pub trait Session: Send + Sync {
    async fn register(&self, topic: &str, handler: Handler) -> Result<(), SessionError>;

    async fn call(&self, procedure: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Vec<Value>, SessionError>;

    async fn publish(&self, topic: &str, payload: Value) -> Result<(), SessionError>;

    /// Ask the router to end the session gracefully.
    async fn leave(&self) -> Result<(), SessionError>;

    /// Drop the underlying connection.
    async fn disconnect(&self);
}

/// Lifecycle notifications delivered by the transport.
pub enum SessionEvent {
    Connecting,
    Joined(Arc<dyn Session>),
    Left { reason: String },
    Disconnected { was_clean: bool },
    ConnectFailure { reason: String },
    /// Local request to stop, e.g. SIGTERM.
    Shutdown,
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Connecting => f.write_str("Connecting"),
            SessionEvent::Joined(_) => f.write_str("Joined"),
            SessionEvent::Left { reason } => write!(f, "Left({reason})"),
            SessionEvent::Disconnected { was_clean } => write!(f, "Disconnected(clean={was_clean})"),
            SessionEvent::ConnectFailure { reason } => write!(f, "ConnectFailure({reason})"),
            SessionEvent::Shutdown => f.write_str("Shutdown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Joining,
    Joined,
    Leaving,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Joining => "joining",
            SessionState::Joined => "joined",
            SessionState::Leaving => "leaving",
        };
        f.write_str(s)
    }
}
