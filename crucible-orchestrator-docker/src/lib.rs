//! Docker backend for the [`Orchestrator`] capability.
//!
//! Workers are plain containers named with the pool's prefix and labelled
//! with the owning broker instance. Watching is a list followed by the
//! daemon's event stream, so a re-subscription after a dropped connection
//! re-emits current state and no transition is lost.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::system::EventsOptions;
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crucible_core::WorkerName;
use crucible_orchestrator::{
    ExecOutput, Orchestrator, OrchestratorError, WorkerObservation, WorkerPhase, WorkerSpec,
    WorkerWatch,
};

/// Label carrying the owning broker instance id.
const OWNER_LABEL: &str = "crucible.owner";

/// Resource knobs understood by this backend, decoded from the opaque
/// `WorkerSpec::resources` JSON.
#[derive(Debug, Default, Deserialize)]
struct DockerResources {
    #[serde(default)]
    memory_bytes: Option<i64>,
    #[serde(default)]
    nano_cpus: Option<i64>,
}

/// Backend-specific manifest extras, decoded from `WorkerSpec::spec_extra`.
#[derive(Debug, Default, Deserialize)]
struct DockerSpecExtra {
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    network_mode: Option<String>,
    #[serde(default)]
    security_opt: Vec<String>,
}

/// Orchestrator implementation over a local or remote Docker daemon.
#[derive(Clone)]
pub struct DockerOrchestrator {
    docker: Docker,
}

impl DockerOrchestrator {
    /// Connect using the standard environment (`DOCKER_HOST` or the local
    /// socket) and verify the daemon answers.
    pub async fn connect() -> Result<Self, OrchestratorError> {
        let docker = Docker::connect_with_local_defaults().map_err(map_err)?;
        docker.ping().await.map_err(map_err)?;
        Ok(Self { docker })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<WorkerObservation>, OrchestratorError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(map_err)?;

        let mut observations = Vec::new();
        for container in containers {
            let Some(name) = container
                .names
                .iter()
                .flatten()
                .map(|n| n.trim_start_matches('/'))
                .find(|n| n.starts_with(prefix))
            else {
                continue;
            };
            let phase = phase_from_state(container.state.as_deref());
            observations.push(WorkerObservation {
                name: WorkerName::new(name),
                ready: phase == WorkerPhase::Running,
                phase,
            });
        }
        Ok(observations)
    }
}

#[async_trait]
impl Orchestrator for DockerOrchestrator {
    async fn create_worker(
        &self,
        name: &WorkerName,
        spec: &WorkerSpec,
    ) -> Result<(), OrchestratorError> {
        let resources: DockerResources =
            serde_json::from_value(spec.resources.clone()).unwrap_or_default();
        let extra: DockerSpecExtra =
            serde_json::from_value(spec.spec_extra.clone()).unwrap_or_default();

        let host_config = bollard::models::HostConfig {
            memory: resources.memory_bytes,
            nano_cpus: resources.nano_cpus,
            network_mode: extra.network_mode,
            security_opt: if extra.security_opt.is_empty() {
                None
            } else {
                Some(extra.security_opt)
            },
            ..Default::default()
        };

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            env: if extra.env.is_empty() {
                None
            } else {
                Some(extra.env)
            },
            labels: Some(HashMap::from([(
                OWNER_LABEL.to_owned(),
                spec.owner.clone(),
            )])),
            working_dir: Some("/workspace".to_owned()),
            host_config: Some(host_config),
            ..Default::default()
        };

        debug!(worker = %name, image = %spec.image, "creating worker container");
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str().to_owned(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(map_err)?;

        self.docker
            .start_container::<String>(name.as_str(), None)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn watch_workers(&self, prefix: &str) -> Result<WorkerWatch, OrchestratorError> {
        let snapshot = self.list(prefix).await?;

        let filters = HashMap::from([("type".to_owned(), vec!["container".to_owned()])]);
        let events = self.docker.events(Some(EventsOptions::<String> {
            filters,
            ..Default::default()
        }));

        let prefix = prefix.to_owned();
        let events = events.filter_map(move |message| {
            let prefix = prefix.clone();
            async move {
                let message = match message {
                    Ok(m) => m,
                    Err(e) => return Some(Err(map_err(e))),
                };
                let name = message
                    .actor
                    .as_ref()
                    .and_then(|a| a.attributes.as_ref())
                    .and_then(|attrs| attrs.get("name"))?;
                if !name.starts_with(&prefix) {
                    return None;
                }
                let phase = match message.action.as_deref() {
                    Some("create") => WorkerPhase::Pending,
                    Some("start") => WorkerPhase::Running,
                    Some("die" | "kill" | "stop" | "destroy" | "oom") => WorkerPhase::Failed,
                    _ => return None,
                };
                Some(Ok(WorkerObservation {
                    name: WorkerName::new(name.clone()),
                    ready: phase == WorkerPhase::Running,
                    phase,
                }))
            }
        });

        Ok(WorkerWatch {
            snapshot,
            events: Box::pin(events),
        })
    }

    async fn exec(
        &self,
        name: &WorkerName,
        argv: &[String],
        stdin: Option<Bytes>,
    ) -> Result<ExecOutput, OrchestratorError> {
        let exec = self
            .docker
            .create_exec(
                name.as_str(),
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdin: Some(stdin.is_some()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(map_err)?;

        let results = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(map_err)?;

        let (mut stdout, mut stderr) = (Vec::new(), Vec::new());
        match results {
            StartExecResults::Attached {
                output: mut stream,
                input: mut stdin_pipe,
            } => {
                if let Some(body) = stdin {
                    stdin_pipe
                        .write_all(&body)
                        .await
                        .map_err(|e| OrchestratorError::Exec(format!("stdin write: {e}")))?;
                    stdin_pipe
                        .shutdown()
                        .await
                        .map_err(|e| OrchestratorError::Exec(format!("stdin close: {e}")))?;
                }
                drop(stdin_pipe);

                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                        Ok(_) => {}
                        Err(e) => return Err(map_err(e)),
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(OrchestratorError::Exec(
                    "exec unexpectedly detached".to_owned(),
                ))
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await.map_err(map_err)?;
        Ok(ExecOutput {
            stdout: Bytes::from(stdout),
            stderr: Bytes::from(stderr),
            exit_code: inspect.exit_code.unwrap_or(-1),
        })
    }

    async fn delete_worker(&self, name: &WorkerName) -> Result<(), OrchestratorError> {
        let result = self
            .docker
            .remove_container(
                name.as_str(),
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        match result.map_err(map_err) {
            Ok(()) | Err(OrchestratorError::NotFound(_)) => Ok(()),
            Err(e) => {
                warn!(worker = %name, error = %e, "failed to remove worker container");
                Err(e)
            }
        }
    }
}

fn phase_from_state(state: Option<&str>) -> WorkerPhase {
    match state {
        Some("created" | "restarting") => WorkerPhase::Pending,
        Some("running" | "paused") => WorkerPhase::Running,
        Some("exited" | "dead" | "removing") => WorkerPhase::Failed,
        _ => WorkerPhase::Unknown,
    }
}

fn map_err(err: bollard::errors::Error) -> OrchestratorError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => OrchestratorError::NotFound(message),
            409 => OrchestratorError::AlreadyExists(message),
            code if code >= 500 => OrchestratorError::Unavailable(message),
            code => OrchestratorError::Backend(format!("status {code}: {message}")),
        },
        other => OrchestratorError::Connection(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_mapping_covers_docker_states() {
        assert_eq!(phase_from_state(Some("created")), WorkerPhase::Pending);
        assert_eq!(phase_from_state(Some("running")), WorkerPhase::Running);
        assert_eq!(phase_from_state(Some("exited")), WorkerPhase::Failed);
        assert_eq!(phase_from_state(Some("dead")), WorkerPhase::Failed);
        assert_eq!(phase_from_state(None), WorkerPhase::Unknown);
    }

    #[test]
    fn server_errors_map_to_kinds() {
        let err = map_err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such container".into(),
        });
        assert!(matches!(err, OrchestratorError::NotFound(_)));

        let err = map_err(bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "name already in use".into(),
        });
        assert!(matches!(err, OrchestratorError::AlreadyExists(_)));

        let err = map_err(bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "daemon error".into(),
        });
        assert!(err.is_retryable());
    }

    #[test]
    fn resource_json_is_tolerated() {
        let resources: DockerResources =
            serde_json::from_value(serde_json::json!({"memory_bytes": 512, "nano_cpus": 1000}))
                .unwrap();
        assert_eq!(resources.memory_bytes, Some(512));

        // Unknown shapes fall back to no limits rather than failing create.
        let fallback: DockerResources =
            serde_json::from_value(serde_json::json!({"limits": {"cpu": "1"}}))
                .unwrap_or_default();
        assert_eq!(fallback.memory_bytes, None);
    }
}
