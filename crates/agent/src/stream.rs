use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::debug;

use crate::logsink::LogSink;
use crate::runtime::RuntimeError;

/// Chunks produced by a long-running runtime call (build, pull, push).
pub type ChunkStream = BoxStream<'static, Result<Value, RuntimeError>>;

/// Shared cancellation flag. Setting it never interrupts a read that is
/// already in flight; the consumer observes it at the next chunk boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a forwarded stream came to an end.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEnd {
    Completed { last: Option<Value> },
    Cancelled,
    Failed(String),
}

/// A chunk stream that stops yielding once its flag is set.
pub struct CancellableStream {
    inner: ChunkStream,
    flag: CancelFlag,
    cancelled: bool,
}

impl CancellableStream {
    pub fn new(inner: ChunkStream, flag: CancelFlag) -> Self {
        Self { inner, flag, cancelled: false }
    }

    /// Consume the stream, publishing each chunk to `target`'s log topic.
    /// An error item or an error-bearing chunk ends the stream as failed.
    pub async fn forward_to(mut self, sink: &LogSink, target: &str) -> StreamEnd {
        let mut last = None;
        while let Some(item) = self.next().await {
            match item {
                Ok(chunk) => {
                    debug!(target_name = %target, %chunk, "stream chunk");
                    if let Some(message) = chunk_error(&chunk) {
                        return StreamEnd::Failed(message);
                    }
                    sink.publish_chunk(target, chunk.clone()).await;
                    last = Some(chunk);
                }
                Err(e) => return StreamEnd::Failed(e.message().to_string()),
            }
        }
        if self.cancelled {
            StreamEnd::Cancelled
        } else {
            StreamEnd::Completed { last }
        }
    }
}

impl Stream for CancellableStream {
    type Item = Result<Value, RuntimeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancelled || self.flag.is_cancelled() {
            self.cancelled = true;
            return Poll::Ready(None);
        }
        match self.inner.poll_next_unpin(cx) {
            // A chunk that arrives after cancellation is dropped.
            Poll::Ready(Some(_)) if self.flag.is_cancelled() => {
                self.cancelled = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

/// Error text carried by a daemon progress chunk, if any.
pub fn chunk_error(chunk: &Value) -> Option<String> {
    if let Some(err) = chunk.get("error").filter(|v| !v.is_null()) {
        return Some(as_text(err));
    }
    let detail = chunk.get("errorDetail").or_else(|| chunk.get("error_detail"));
    if let Some(detail) = detail.filter(|v| !v.is_null()) {
        let message = detail
            .get("message")
            .filter(|v| !v.is_null())
            .or_else(|| chunk.get("message").filter(|v| !v.is_null()))
            .map(as_text)
            .unwrap_or_else(|| "unknown error".to_string());
        return Some(message);
    }
    None
}

fn as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
