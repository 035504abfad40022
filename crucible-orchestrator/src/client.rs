use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crucible_core::WorkerName;

use crate::error::OrchestratorError;

/// Last-observed lifecycle phase of a worker container, as reported by the
/// control plane. This is the orchestrator's view; the pool keeps its own
/// state machine on top of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerPhase {
    /// Accepted but not yet running.
    Pending,
    /// The container process is running.
    Running,
    /// Exited cleanly.
    Succeeded,
    /// Exited with an error or was evicted.
    Failed,
    /// The control plane could not report a phase.
    Unknown,
}

impl WorkerPhase {
    /// Whether this phase means the worker will never serve a request.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// One observed (name, phase, ready) triple from a list or watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerObservation {
    pub name: WorkerName,
    pub phase: WorkerPhase,
    /// Whether the container is ready to accept exec calls.
    pub ready: bool,
}

/// Manifest for a new worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Image the executor container runs.
    pub image: String,

    /// Opaque resource requests/limits, passed through to the backend.
    #[serde(default)]
    pub resources: serde_json::Value,

    /// Extra backend-specific manifest fields, passed through verbatim.
    #[serde(default)]
    pub spec_extra: serde_json::Value,

    /// Identity of the broker instance that owns this worker, attached as
    /// a label so orphans of a crashed broker can be found and adopted.
    pub owner: String,
}

/// Result of an exec'd process inside a worker.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub exit_code: i64,
}

impl ExecOutput {
    /// Whether the remote process exited zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A (re)subscription to worker state.
///
/// `snapshot` re-emits the current state of every matching worker at
/// subscription time, so a consumer that re-subscribes after a disconnect
/// can diff the snapshot against its tracked state and lose no transition.
/// `events` then yields live transitions until the stream breaks.
pub struct WorkerWatch {
    pub snapshot: Vec<WorkerObservation>,
    pub events: BoxStream<'static, Result<WorkerObservation, OrchestratorError>>,
}

/// Thin capability over the container orchestrator.
///
/// Implementations are pluggable; the rest of the broker only ever sees
/// this trait. All calls are subject to the caller's deadline.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Submit a worker manifest. Non-blocking: returns once the control
    /// plane has accepted the request, not when the worker is ready.
    async fn create_worker(
        &self,
        name: &WorkerName,
        spec: &WorkerSpec,
    ) -> Result<(), OrchestratorError>;

    /// Subscribe to state transitions of workers whose name starts with
    /// `prefix`. See [`WorkerWatch`] for reconnect semantics.
    async fn watch_workers(&self, prefix: &str) -> Result<WorkerWatch, OrchestratorError>;

    /// Run `argv` inside the worker, streaming `stdin` in and collecting
    /// stdout/stderr. Blocks until the remote process exits.
    async fn exec(
        &self,
        name: &WorkerName,
        argv: &[String],
        stdin: Option<Bytes>,
    ) -> Result<ExecOutput, OrchestratorError>;

    /// Best-effort, idempotent removal request. A missing worker is
    /// success.
    async fn delete_worker(&self, name: &WorkerName) -> Result<(), OrchestratorError>;
}

/// Generate a fresh worker name: the configured prefix plus six random
/// lowercase alphanumerics.
#[must_use]
pub fn generate_worker_name(prefix: &str) -> WorkerName {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    WorkerName::new(format!("{prefix}{suffix}"))
}
