use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use super::{BuildSpec, ContainerRuntime, PruneTarget, RegistryAuth, RunSpec, RuntimeError};
use crate::stream::ChunkStream;

/// In-memory runtime that replays queued results and records every call.
/// Empty queues fall back to success.
#[derive(Default)]
pub struct ScriptedRuntime {
    calls: Mutex<Vec<String>>,
    removals: Mutex<VecDeque<Result<(), RuntimeError>>>,
    runs: Mutex<VecDeque<Result<i64, RuntimeError>>>,
    image_removals: Mutex<VecDeque<Result<(), RuntimeError>>>,
    streams: Mutex<VecDeque<Result<ChunkStream, RuntimeError>>>,
    runs_seen: Mutex<Vec<RunSpec>>,
    builds_seen: Mutex<Vec<BuildSpec>>,
    detached_seen: Mutex<Vec<RunSpec>>,
    stream_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    unreachable: AtomicBool,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_removal(&self, result: Result<(), RuntimeError>) {
        self.removals.lock().unwrap().push_back(result);
    }

    pub fn push_run(&self, result: Result<i64, RuntimeError>) {
        self.runs.lock().unwrap().push_back(result);
    }

    pub fn push_image_removal(&self, result: Result<(), RuntimeError>) {
        self.image_removals.lock().unwrap().push_back(result);
    }

    /// Next build, pull or push returns this stream.
    pub fn push_stream(&self, stream: ChunkStream) {
        self.streams.lock().unwrap().push_back(Ok(stream));
    }

    /// Next build, pull or push fails before producing a stream.
    pub fn push_stream_failure(&self, err: RuntimeError) {
        self.streams.lock().unwrap().push_back(Err(err));
    }

    pub fn push_chunks(&self, chunks: Vec<Result<Value, RuntimeError>>) {
        self.push_stream(futures::stream::iter(chunks).boxed());
    }

    /// Called on entry to every build, pull and push, before the stream
    /// is handed out.
    pub fn on_stream_start(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.stream_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn set_unreachable(&self) {
        self.unreachable.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn runs(&self) -> Vec<RunSpec> {
        self.runs_seen.lock().unwrap().clone()
    }

    pub fn builds(&self) -> Vec<BuildSpec> {
        self.builds_seen.lock().unwrap().clone()
    }

    pub fn detached(&self) -> Vec<RunSpec> {
        self.detached_seen.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_stream(&self) -> Result<ChunkStream, RuntimeError> {
        if let Some(hook) = self.stream_hook.lock().unwrap().as_ref() {
            hook();
        }
        self.streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(futures::stream::empty().boxed()))
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RuntimeError::other("daemon unreachable"));
        }
        Ok(())
    }

    async fn run_container(&self, spec: &RunSpec, _auth: Option<&RegistryAuth>) -> Result<i64, RuntimeError> {
        self.record(format!("run_container:{}", spec.name));
        self.runs_seen.lock().unwrap().push(spec.clone());
        self.runs.lock().unwrap().pop_front().unwrap_or(Ok(0))
    }

    async fn start_detached(&self, spec: &RunSpec, _auth: Option<&RegistryAuth>) -> Result<(), RuntimeError> {
        self.record(format!("start_detached:{}", spec.name));
        self.detached_seen.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), RuntimeError> {
        self.record(format!("remove_container:{name}:{force}"));
        self.removals.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.record(format!("remove_image:{image}"));
        self.image_removals.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> Result<(), RuntimeError> {
        self.record(format!("tag_image:{image}->{repo}:{tag}"));
        Ok(())
    }

    async fn build_image(&self, spec: BuildSpec) -> Result<ChunkStream, RuntimeError> {
        self.record(format!("build_image:{}", spec.tag));
        self.builds_seen.lock().unwrap().push(spec);
        self.next_stream()
    }

    async fn pull_image(&self, image: &str, _auth: Option<RegistryAuth>) -> Result<ChunkStream, RuntimeError> {
        self.record(format!("pull_image:{image}"));
        self.next_stream()
    }

    async fn push_image(&self, image: &str, _auth: Option<RegistryAuth>) -> Result<ChunkStream, RuntimeError> {
        self.record(format!("push_image:{image}"));
        self.next_stream()
    }

    async fn list_containers(&self) -> Result<Value, RuntimeError> {
        self.record("list_containers".into());
        Ok(json!([]))
    }

    async fn list_images(&self) -> Result<Value, RuntimeError> {
        self.record("list_images".into());
        Ok(json!([]))
    }

    async fn container_logs(&self, name: &str, tail: usize) -> Result<String, RuntimeError> {
        self.record(format!("logs:{name}:{tail}"));
        Ok(format!("logs of {name}\n"))
    }

    async fn container_stats(&self) -> Result<Value, RuntimeError> {
        Ok(json!([]))
    }

    async fn prune(&self, target: PruneTarget) -> Result<Value, RuntimeError> {
        self.record(format!("prune:{target}"));
        Ok(json!({}))
    }
}
