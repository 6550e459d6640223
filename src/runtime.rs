//! Worker-runtime collaborator seams.
//!
//! The core does not implement the runtime (process pools, spawning,
//! cgroups); it drives one through these traits and receives streamed worker
//! output back on [`ResponseStream`], from the runtime's own threads.

use std::sync::Arc;

use thiserror::Error;

use crate::severity::WorkerLevel;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime refused to queue the event.
    #[error("queue refused event {event:?}: {reason}")]
    QueueFull { event: String, reason: String },

    /// Profile document missing or unreadable from the runtime's core storage.
    #[error("profile {profile:?} unavailable: {reason}")]
    ProfileUnavailable { profile: String, reason: String },

    /// Anything else the runtime reports.
    #[error("runtime failure: {0}")]
    Other(String),
}

/// Reply stream handed to the runtime on enqueue.
///
/// Called from worker threads; implementations must absorb calls arriving
/// after completion.
pub trait ResponseStream: Send + Sync {
    /// One output chunk from the worker: a self-describing packed value.
    fn write(&self, chunk: &[u8]);

    /// The worker stream ended normally.
    fn close(&self);

    /// The runtime reports a failure; a later `close` still follows.
    fn error(&self, code: i32, message: &str);
}

/// Request stream returned by enqueue. The dispatcher writes exactly one
/// header+payload chunk and closes it so the worker sees end-of-input.
pub trait RequestStream {
    fn write(&mut self, chunk: &[u8]) -> Result<(), RuntimeError>;

    fn close(self: Box<Self>) -> Result<(), RuntimeError>;
}

/// A named application inside the runtime.
pub trait AppHandle: Send + Sync {
    fn start(&self) -> Result<(), RuntimeError>;

    /// Idempotent; also invoked when the registry entry is dropped.
    fn stop(&self);

    /// The runtime's self-reported state document.
    fn info(&self) -> serde_json::Value;

    /// Queue `event` for execution. `queue` overrides the target worker name
    /// for pool-sharded apps.
    fn enqueue(
        &self,
        event: &str,
        response: Arc<dyn ResponseStream>,
        queue: Option<&str>,
    ) -> Result<Box<dyn RequestStream>, RuntimeError>;
}

/// The cohabiting worker-pool runtime.
pub trait WorkerRuntime: Send + Sync {
    /// Resolve (or create) the app object for `name` under `profile`.
    fn app(&self, name: &str, profile: &str) -> Result<Arc<dyn AppHandle>, RuntimeError>;

    /// Fetch the JSON profile stored under `name` in the runtime's `core`
    /// storage, `profiles` collection. Only consulted on multiple-start.
    fn profile(&self, name: &str) -> Result<serde_json::Value, RuntimeError>;
}

/// Node-provided sink the runtime logs through. Must never fail back into
/// the runtime.
pub trait WorkerLogger: Send + Sync {
    /// Minimum level the node currently wants to see.
    fn verbosity(&self) -> WorkerLevel;

    fn emit(&self, level: WorkerLevel, app: &str, message: &str);
}
