//! In-memory [`Orchestrator`] backend.
//!
//! Simulates a control plane with a per-worker filesystem and an
//! interpreter for the command shapes the workspace manager execs. Tests
//! script code-execution results, inject create failures, and sever watch
//! streams to exercise reconnect paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crucible_core::{ContentHash, WorkerName};
use crucible_orchestrator::{
    ExecOutput, Orchestrator, OrchestratorError, WorkerObservation, WorkerPhase, WorkerSpec,
    WorkerWatch,
};

/// A code-execution result scripted by a test, plus files the "program"
/// leaves behind in the worker's workspace.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRun {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
    pub writes: Vec<(String, Bytes)>,
}

impl ScriptedRun {
    #[must_use]
    pub fn stdout(text: &str) -> Self {
        Self {
            stdout: text.as_bytes().to_vec(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn exit(code: i64, stderr: &str) -> Self {
        Self {
            exit_code: code,
            stderr: stderr.as_bytes().to_vec(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_write(mut self, path: &str, bytes: impl Into<Bytes>) -> Self {
        self.writes.push((path.to_owned(), bytes.into()));
        self
    }
}

#[derive(Debug)]
struct MemWorker {
    phase: WorkerPhase,
    ready: bool,
    files: BTreeMap<String, Bytes>,
}

type EventSender = mpsc::UnboundedSender<Result<WorkerObservation, OrchestratorError>>;

/// In-memory orchestrator. Cloning shares the backing state.
#[derive(Clone, Default)]
pub struct MemoryOrchestrator {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    workers: DashMap<String, MemWorker>,
    watchers: Mutex<Vec<(String, EventSender)>>,
    scripted_runs: Mutex<std::collections::VecDeque<ScriptedRun>>,
    /// Promote new workers straight to running/ready, as a healthy cluster
    /// would within moments.
    auto_ready: AtomicBool,
    /// Fail the next N create calls with a retryable error.
    fail_creates: AtomicU32,
}

impl MemoryOrchestrator {
    #[must_use]
    pub fn new() -> Self {
        let orch = Self::default();
        orch.inner.auto_ready.store(true, Ordering::SeqCst);
        orch
    }

    /// A backend where workers stay `Pending` until [`make_ready`] is
    /// called, for tests that drive readiness by hand.
    #[must_use]
    pub fn manual() -> Self {
        Self::default()
    }

    /// Queue a result for the next code-execution exec.
    pub fn script_run(&self, run: ScriptedRun) {
        self.inner.scripted_runs.lock().unwrap().push_back(run);
    }

    /// Make the next `n` create calls fail with a retryable error.
    pub fn fail_next_creates(&self, n: u32) {
        self.inner.fail_creates.store(n, Ordering::SeqCst);
    }

    /// Promote a worker to running/ready and notify watchers.
    pub fn make_ready(&self, name: &WorkerName) {
        if let Some(mut w) = self.inner.workers.get_mut(name.as_str()) {
            w.phase = WorkerPhase::Running;
            w.ready = true;
        }
        self.broadcast(name, WorkerPhase::Running, true);
    }

    /// Kill a worker out from under the pool and notify watchers.
    pub fn fail_worker(&self, name: &WorkerName) {
        if let Some(mut w) = self.inner.workers.get_mut(name.as_str()) {
            w.phase = WorkerPhase::Failed;
            w.ready = false;
        }
        self.broadcast(name, WorkerPhase::Failed, false);
    }

    /// Sever every open watch stream, forcing consumers to re-subscribe.
    pub fn disconnect_watchers(&self) {
        self.inner.watchers.lock().unwrap().clear();
    }

    /// Place a file directly into a worker's workspace (as prior session
    /// residue, or as output of a scripted program).
    pub fn put_file(&self, name: &WorkerName, path: &str, bytes: impl Into<Bytes>) {
        if let Some(mut w) = self.inner.workers.get_mut(name.as_str()) {
            w.files.insert(path.to_owned(), bytes.into());
        }
    }

    /// Read a file back out of a worker's workspace.
    #[must_use]
    pub fn file(&self, name: &WorkerName, path: &str) -> Option<Bytes> {
        self.inner
            .workers
            .get(name.as_str())
            .and_then(|w| w.files.get(path).cloned())
    }

    /// Paths currently present in a worker's workspace.
    #[must_use]
    pub fn file_list(&self, name: &WorkerName) -> Vec<String> {
        self.inner
            .workers
            .get(name.as_str())
            .map(|w| w.files.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of workers the control plane still knows about.
    #[must_use]
    pub fn worker_names(&self) -> Vec<String> {
        self.inner
            .workers
            .iter()
            .map(|e| e.key().clone())
            .collect()
    }

    fn broadcast(&self, name: &WorkerName, phase: WorkerPhase, ready: bool) {
        let mut watchers = self.inner.watchers.lock().unwrap();
        watchers.retain(|(prefix, tx)| {
            if !name.in_pool(prefix) {
                return true;
            }
            tx.send(Ok(WorkerObservation {
                name: name.clone(),
                phase,
                ready,
            }))
            .is_ok()
        });
    }
}

#[async_trait]
impl Orchestrator for MemoryOrchestrator {
    async fn create_worker(
        &self,
        name: &WorkerName,
        _spec: &WorkerSpec,
    ) -> Result<(), OrchestratorError> {
        let failures = &self.inner.fail_creates;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(OrchestratorError::Unavailable("injected create failure".into()));
        }

        use dashmap::mapref::entry::Entry;
        match self.inner.workers.entry(name.as_str().to_owned()) {
            Entry::Occupied(_) => {
                return Err(OrchestratorError::AlreadyExists(name.as_str().to_owned()))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemWorker {
                    phase: WorkerPhase::Pending,
                    ready: false,
                    files: BTreeMap::new(),
                });
            }
        }
        self.broadcast(name, WorkerPhase::Pending, false);
        if self.inner.auto_ready.load(Ordering::SeqCst) {
            self.make_ready(name);
        }
        Ok(())
    }

    async fn watch_workers(&self, prefix: &str) -> Result<WorkerWatch, OrchestratorError> {
        let snapshot = self
            .inner
            .workers
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| WorkerObservation {
                name: WorkerName::new(e.key().clone()),
                phase: e.value().phase,
                ready: e.value().ready,
            })
            .collect();

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .watchers
            .lock()
            .unwrap()
            .push((prefix.to_owned(), tx));

        Ok(WorkerWatch {
            snapshot,
            events: Box::pin(UnboundedReceiverStream::new(rx)),
        })
    }

    async fn exec(
        &self,
        name: &WorkerName,
        argv: &[String],
        stdin: Option<Bytes>,
    ) -> Result<ExecOutput, OrchestratorError> {
        {
            let worker = self
                .inner
                .workers
                .get(name.as_str())
                .ok_or_else(|| OrchestratorError::NotFound(name.as_str().to_owned()))?;
            if worker.phase != WorkerPhase::Running {
                return Err(OrchestratorError::Exec(format!(
                    "worker {name} is not running"
                )));
            }
        }

        let args: Vec<&str> = argv.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["cat", path] => Ok(self.read_file(name, path)),
            ["rm", "-f", "--", path] => {
                if let Some(mut w) = self.inner.workers.get_mut(name.as_str()) {
                    w.files.remove(*path);
                }
                Ok(ok_output())
            }
            ["sh", "-c", script] if script.contains("sha256sum") => Ok(self.list_files(name)),
            ["sh", "-c", script] if script.contains("cat >") => {
                let Some(path) = last_quoted_word(script) else {
                    return Err(OrchestratorError::Exec(format!(
                        "unparseable upload command: {script}"
                    )));
                };
                let body = stdin.unwrap_or_default();
                if let Some(mut w) = self.inner.workers.get_mut(name.as_str()) {
                    w.files.insert(path, body);
                }
                Ok(ok_output())
            }
            ["sh", "-c", _script] => {
                let run = self
                    .inner
                    .scripted_runs
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_default();
                if let Some(mut w) = self.inner.workers.get_mut(name.as_str()) {
                    for (path, bytes) in &run.writes {
                        w.files.insert(path.clone(), bytes.clone());
                    }
                }
                Ok(ExecOutput {
                    stdout: Bytes::from(run.stdout),
                    stderr: Bytes::from(run.stderr),
                    exit_code: run.exit_code,
                })
            }
            other => Err(OrchestratorError::Exec(format!(
                "unsupported command: {other:?}"
            ))),
        }
    }

    async fn delete_worker(&self, name: &WorkerName) -> Result<(), OrchestratorError> {
        if self.inner.workers.remove(name.as_str()).is_some() {
            self.broadcast(name, WorkerPhase::Succeeded, false);
        }
        Ok(())
    }
}

impl MemoryOrchestrator {
    fn read_file(&self, name: &WorkerName, path: &str) -> ExecOutput {
        match self.file(name, path) {
            Some(bytes) => ExecOutput {
                stdout: bytes,
                stderr: Bytes::new(),
                exit_code: 0,
            },
            None => ExecOutput {
                stdout: Bytes::new(),
                stderr: Bytes::from(format!("cat: {path}: No such file or directory")),
                exit_code: 1,
            },
        }
    }

    fn list_files(&self, name: &WorkerName) -> ExecOutput {
        let mut out = String::new();
        if let Some(w) = self.inner.workers.get(name.as_str()) {
            for (path, bytes) in &w.files {
                out.push_str(ContentHash::of(bytes).as_str());
                out.push_str("  ");
                out.push_str(path);
                out.push('\n');
            }
        }
        ExecOutput {
            stdout: Bytes::from(out),
            stderr: Bytes::new(),
            exit_code: 0,
        }
    }
}

fn ok_output() -> ExecOutput {
    ExecOutput {
        stdout: Bytes::new(),
        stderr: Bytes::new(),
        exit_code: 0,
    }
}

/// Extract the content of the last single-quoted word in a shell snippet.
fn last_quoted_word(script: &str) -> Option<String> {
    let mut parts = script.rsplit('\'');
    let _trailing = parts.next()?;
    parts.next().map(str::to_owned)
}
