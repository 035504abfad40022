pub mod client;
pub mod error;
pub mod retry;

pub use client::{
    generate_worker_name, ExecOutput, Orchestrator, WorkerObservation, WorkerPhase, WorkerSpec,
    WorkerWatch,
};
pub use error::OrchestratorError;
pub use retry::{with_retries, RetryStrategy};
