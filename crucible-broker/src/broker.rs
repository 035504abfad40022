use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crucible_core::{
    expiry_from, validate_workspace_path, BrokerError, ChatId, ContentHash, FileMetadata,
    WorkerName,
};
use crucible_orchestrator::Orchestrator;
use crucible_pool::Pool;
use crucible_store::FileStore;
use crucible_tools::{
    invocation_program, parse_run_output, parse_tool, validate_input, CustomTool, ToolRunOutcome,
};
use crucible_workspace::{shell_quote, WorkspaceManager};

use crate::request::{ExecuteRequest, ExecuteResult};

/// Service-level knobs.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Reject execute requests without a `chat_id`.
    pub require_chat_id: bool,
    /// Session key used when `chat_id` is optional and absent.
    pub default_chat_id: String,
    /// Download quota applied when a request does not set one
    /// (`None` = unlimited).
    pub global_max_downloads: Option<u64>,
    /// Cap on captured stdout/stderr; output beyond it is cut and marked.
    pub output_limit_bytes: usize,
    /// How long `acquire` may wait for a ready worker.
    pub acquire_timeout: Duration,
    /// Bound on one user-code execution.
    pub exec_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            require_chat_id: true,
            default_chat_id: "default".to_owned(),
            global_max_downloads: None,
            output_limit_bytes: 1024 * 1024,
            acquire_timeout: Duration::from_secs(60),
            exec_timeout: Duration::from_secs(60),
        }
    }
}

/// Appended where captured output was cut at the configured limit.
pub const TRUNCATION_SENTINEL: &str = "\n[output truncated]";

/// The code execution service: orchestrates the pool, the workspace
/// manager, the file store, and the custom-tool pipeline.
pub struct Broker {
    pool: Pool,
    orchestrator: Arc<dyn Orchestrator>,
    store: Arc<FileStore>,
    workspace: WorkspaceManager,
    config: BrokerConfig,
}

impl Broker {
    pub fn new(
        pool: Pool,
        orchestrator: Arc<dyn Orchestrator>,
        store: Arc<FileStore>,
        config: BrokerConfig,
    ) -> Self {
        let workspace = WorkspaceManager::new(Arc::clone(&orchestrator), Arc::clone(&store));
        Self {
            pool,
            orchestrator,
            store,
            workspace,
            config,
        }
    }

    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Run user code in a fresh worker with the declared workspace.
    #[instrument(skip(self, request), fields(chat_id))]
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResult, BrokerError> {
        let chat_id = self.resolve_chat_id(request.chat_id.as_deref())?;
        tracing::Span::current().record("chat_id", chat_id.as_str());

        let files = parse_file_map(&request.files)?;
        validate_env(&request.env)?;
        let expires_at = expiry_from(request.expires_days, request.expires_seconds, Utc::now());
        let quota = request.max_downloads.or(self.config.global_max_downloads);

        let worker = self
            .pool
            .acquire(chat_id.clone(), self.config.acquire_timeout)
            .await?;
        info!(worker = %worker, "worker acquired");

        let result = self
            .run_in_worker(
                &worker,
                &chat_id,
                &request,
                &files,
                quota,
                expires_at,
            )
            .await;

        // Single-use: the worker is destroyed no matter how the request
        // went.
        self.pool.release(worker).await;
        result
    }

    async fn run_in_worker(
        &self,
        worker: &WorkerName,
        chat_id: &ChatId,
        request: &ExecuteRequest,
        files: &BTreeMap<String, ContentHash>,
        quota: Option<u64>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ExecuteResult, BrokerError> {
        self.workspace
            .project(worker, chat_id, files, request.persistent_workspace)
            .await
            .map_err(|e| match e {
                crucible_workspace::WorkspaceError::InvalidPath(s) => {
                    BrokerError::InvalidArgument(s)
                }
                other => BrokerError::WorkspaceProjectionFailed(other.to_string()),
            })?;

        let output = self
            .exec_user_code(worker, &request.source_code, &request.env)
            .await?;
        debug!(exit_code = output.exit_code, "user code finished");

        let outcome = self
            .workspace
            .extract(worker, chat_id, files, quota, expires_at)
            .await
            .map_err(|e| BrokerError::ExecutionFailed(format!("workspace extraction: {e}")))?;

        Ok(ExecuteResult {
            stdout: self.cap_output(&output.stdout),
            stderr: self.cap_output(&output.stderr),
            exit_code: output.exit_code,
            files: outcome.files,
            files_metadata: outcome.files_metadata,
            chat_id: chat_id.clone(),
        })
    }

    async fn exec_user_code(
        &self,
        worker: &WorkerName,
        source_code: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<crucible_orchestrator::ExecOutput, BrokerError> {
        let argv = run_command(env);
        let stdin = Bytes::from(source_code.as_bytes().to_vec());
        let run = self.orchestrator.exec(worker, &argv, Some(stdin));
        match tokio::time::timeout(self.config.exec_timeout, run).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(BrokerError::ExecutionFailed(e.to_string())),
            Err(_) => {
                // Abort by killing the worker: the exec channel dies with
                // it, and release will only have a corpse to clean up.
                warn!(worker = %worker, "execution deadline hit, destroying worker");
                let _ = self.orchestrator.delete_worker(worker).await;
                Err(BrokerError::ExecutionFailed(format!(
                    "execution exceeded {:?}",
                    self.config.exec_timeout
                )))
            }
        }
    }

    /// Parse a tool source into its name, description, and input schema.
    pub fn parse_custom_tool(&self, tool_source_code: &str) -> Result<CustomTool, BrokerError> {
        Ok(parse_tool(tool_source_code)?)
    }

    /// Run a custom tool in a fresh worker and return its JSON result.
    #[instrument(skip_all)]
    pub async fn execute_custom_tool(
        &self,
        tool_source_code: &str,
        tool_input_json: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<String, BrokerError> {
        let tool = parse_tool(tool_source_code)?;
        let args = validate_input(&tool, tool_input_json)?;
        validate_env(env)?;
        let program = invocation_program(tool_source_code, &tool.name, &args);

        let chat_id = ChatId::new(self.config.default_chat_id.clone());
        let worker = self
            .pool
            .acquire(chat_id, self.config.acquire_timeout)
            .await?;
        info!(worker = %worker, tool = %tool.name, "running custom tool");

        let result = self.exec_user_code(&worker, &program, env).await;
        self.pool.release(worker).await;

        let output = result?;
        match parse_run_output(&output.stdout, &output.stderr, output.exit_code) {
            ToolRunOutcome::Output(json) => Ok(json),
            ToolRunOutcome::Unserializable => Err(BrokerError::InvalidToolOutput(
                "tool returned a value that does not serialize to JSON".to_owned(),
            )),
            ToolRunOutcome::Raised(stderr) => Err(BrokerError::ExecutionFailed(stderr)),
        }
    }

    /// Store an uploaded file under the session.
    pub async fn upload(
        &self,
        chat_id: Option<&str>,
        filename: &str,
        data: Bytes,
        max_downloads: Option<u64>,
        expires_days: Option<u64>,
        expires_seconds: Option<u64>,
    ) -> Result<(ChatId, ContentHash, FileMetadata), BrokerError> {
        let chat_id = self.resolve_chat_id(chat_id)?;
        let quota = max_downloads.or(self.config.global_max_downloads);
        let expires_at = expiry_from(expires_days, expires_seconds, Utc::now());
        let (hash, meta) = self
            .store
            .put(&chat_id, filename, data, quota, expires_at)
            .await?;
        Ok((chat_id, hash, meta))
    }

    /// Read a file back for a user-facing download; consumes one download.
    pub async fn download(
        &self,
        chat_id: &str,
        filename: &str,
        file_hash: &str,
    ) -> Result<(FileMetadata, Bytes), BrokerError> {
        let chat_id = ChatId::from(chat_id);
        let hash = ContentHash::parse(file_hash)
            .map_err(|_| BrokerError::NotFound(format!("{chat_id}/{file_hash}/{filename}")))?;
        Ok(self.store.get(&chat_id, filename, &hash, true).await?)
    }

    /// Kill a stored file immediately.
    pub async fn expire(
        &self,
        chat_id: &str,
        filename: &str,
        file_hash: &str,
    ) -> Result<(), BrokerError> {
        let chat_id = ChatId::from(chat_id);
        let hash = ContentHash::parse(file_hash)
            .map_err(|_| BrokerError::NotFound(format!("{chat_id}/{file_hash}/{filename}")))?;
        Ok(self.store.expire(&chat_id, filename, &hash).await?)
    }

    fn resolve_chat_id(&self, chat_id: Option<&str>) -> Result<ChatId, BrokerError> {
        match chat_id {
            Some(id) if !id.is_empty() => Ok(ChatId::from(id)),
            _ if self.config.require_chat_id => Err(BrokerError::InvalidArgument(
                "chat_id is required".to_owned(),
            )),
            _ => Ok(ChatId::new(self.config.default_chat_id.clone())),
        }
    }

    fn cap_output(&self, raw: &Bytes) -> String {
        let limit = self.config.output_limit_bytes;
        if raw.len() <= limit {
            return String::from_utf8_lossy(raw).into_owned();
        }
        let mut text = String::from_utf8_lossy(&raw[..limit]).into_owned();
        text.push_str(TRUNCATION_SENTINEL);
        text
    }
}

/// Command that runs the user program: the image's interpreter reading the
/// source from stdin, with the request environment merged in.
fn run_command(env: &BTreeMap<String, String>) -> Vec<String> {
    let mut script = String::from("cd /workspace && exec env");
    for (key, value) in env {
        script.push(' ');
        script.push_str(&shell_quote(&format!("{key}={value}")));
    }
    script.push_str(" python3 -");
    vec!["sh".to_owned(), "-c".to_owned(), script]
}

fn parse_file_map(
    files: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, ContentHash>, BrokerError> {
    let mut parsed = BTreeMap::new();
    for (path, hash) in files {
        validate_workspace_path(path)?;
        parsed.insert(path.clone(), ContentHash::parse(hash)?);
    }
    Ok(parsed)
}

fn validate_env(env: &BTreeMap<String, String>) -> Result<(), BrokerError> {
    for (key, value) in env {
        if key.is_empty()
            || key.contains('=')
            || key.bytes().any(|b| b.is_ascii_control())
            || value.bytes().any(|b| b == 0)
        {
            return Err(BrokerError::InvalidArgument(format!(
                "invalid environment variable name {key:?}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crucible_orchestrator_memory::{MemoryOrchestrator, ScriptedRun};
    use crucible_pool::{PoolConfig, PoolStats};

    use super::*;

    async fn setup(config: BrokerConfig) -> (tempfile::TempDir, MemoryOrchestrator, Broker) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let orch = MemoryOrchestrator::new();
        let orchestrator: Arc<dyn Orchestrator> = Arc::new(orch.clone());
        let pool = Pool::spawn(
            Arc::clone(&orchestrator),
            PoolConfig {
                target: 2,
                worker_name_prefix: "exec-".to_owned(),
                tick_interval: Duration::from_millis(20),
                watch_reconnect_backoff: Duration::from_millis(10),
                ..PoolConfig::default()
            },
        );
        let broker = Broker::new(pool, orchestrator, store, config);
        (dir, orch, broker)
    }

    fn request(chat: &str, source: &str) -> ExecuteRequest {
        ExecuteRequest {
            source_code: source.to_owned(),
            chat_id: Some(chat.to_owned()),
            ..ExecuteRequest::default()
        }
    }

    async fn wait_for_stats(broker: &Broker, predicate: impl Fn(PoolStats) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if predicate(broker.pool().stats().await.unwrap()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pool should reach the expected state");
    }

    #[tokio::test]
    async fn hello_world_round_trip() {
        let (_dir, orch, broker) = setup(BrokerConfig::default()).await;
        orch.script_run(ScriptedRun::stdout("Hello, World!\n"));

        let result = broker
            .execute(request("s1", "print('Hello, World!')"))
            .await
            .unwrap();

        assert_eq!(result.stdout, "Hello, World!\n");
        assert_eq!(result.stderr, "");
        assert_eq!(result.exit_code, 0);
        assert!(result.files.is_empty());
        assert!(result.files_metadata.is_empty());
        assert_eq!(result.chat_id.as_str(), "s1");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_success() {
        let (_dir, orch, broker) = setup(BrokerConfig::default()).await;
        orch.script_run(ScriptedRun::exit(3, ""));

        let result = broker
            .execute(request("s3", "import sys; sys.exit(3)"))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, "");
        assert_eq!(result.stderr, "");
    }

    #[tokio::test]
    async fn missing_chat_id_honors_the_policy() {
        let (_dir, _orch, broker) = setup(BrokerConfig::default()).await;
        let err = broker
            .execute(ExecuteRequest {
                source_code: "print(1)".to_owned(),
                ..ExecuteRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidArgument(_)));

        let (_dir, orch, broker) = setup(BrokerConfig {
            require_chat_id: false,
            ..BrokerConfig::default()
        })
        .await;
        orch.script_run(ScriptedRun::stdout(""));
        let result = broker
            .execute(ExecuteRequest {
                source_code: "print(1)".to_owned(),
                ..ExecuteRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(result.chat_id.as_str(), "default");
    }

    #[tokio::test]
    async fn produced_files_are_extracted_and_downloadable() {
        let (_dir, orch, broker) = setup(BrokerConfig::default()).await;
        orch.script_run(ScriptedRun::stdout("").with_write("/workspace/out.txt", "x"));

        let result = broker
            .execute(request(
                "s2",
                "with open('/workspace/out.txt','w') as f: f.write('x')",
            ))
            .await
            .unwrap();

        let expected = ContentHash::of(b"x");
        assert_eq!(result.files["/workspace/out.txt"], expected);
        assert!(result.files_metadata.contains_key("/workspace/out.txt"));

        let (_, bytes) = broker
            .download("s2", "out.txt", expected.as_str())
            .await
            .unwrap();
        assert_eq!(bytes, Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn declared_files_are_projected_before_execution() {
        let (_dir, orch, broker) = setup(BrokerConfig::default()).await;
        let (_, hash, _) = broker
            .upload(Some("s1"), "data.csv", Bytes::from_static(b"a,b\n1,2\n"), None, None, None)
            .await
            .unwrap();

        orch.script_run(ScriptedRun::stdout("3\n"));
        let mut req = request("s1", "print(open('data.csv').read())");
        req.files
            .insert("/workspace/data.csv".to_owned(), hash.to_string());
        let result = broker.execute(req).await.unwrap();

        assert_eq!(result.stdout, "3\n");
        // The projected input is part of the final workspace map.
        assert_eq!(result.files["/workspace/data.csv"], hash);
        // Projection must not have consumed the (unlimited) quota scheme;
        // a user download still works.
        broker.download("s1", "data.csv", hash.as_str()).await.unwrap();
    }

    #[tokio::test]
    async fn upload_applies_the_global_quota_default() {
        let (_dir, _orch, broker) = setup(BrokerConfig {
            global_max_downloads: Some(2),
            ..BrokerConfig::default()
        })
        .await;

        let (_, hash, meta) = broker
            .upload(Some("s1"), "f.txt", Bytes::from_static(b"x"), None, None, None)
            .await
            .unwrap();
        assert_eq!(meta.remaining_downloads, Some(2));

        broker.download("s1", "f.txt", hash.as_str()).await.unwrap();
        broker.download("s1", "f.txt", hash.as_str()).await.unwrap();
        let err = broker
            .download("s1", "f.txt", hash.as_str())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::QuotaExhausted(_)));
    }

    #[tokio::test]
    async fn download_with_malformed_hash_is_not_found() {
        let (_dir, _orch, broker) = setup(BrokerConfig::default()).await;
        let err = broker.download("s1", "f.txt", "BADHASH").await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }

    #[tokio::test]
    async fn long_output_is_capped_with_a_sentinel() {
        let (_dir, orch, broker) = setup(BrokerConfig {
            output_limit_bytes: 16,
            ..BrokerConfig::default()
        })
        .await;
        orch.script_run(ScriptedRun::stdout(&"x".repeat(100)));

        let result = broker.execute(request("s1", "print('x' * 100)")).await.unwrap();
        assert_eq!(result.stdout.len(), 16 + TRUNCATION_SENTINEL.len());
        assert!(result.stdout.ends_with(TRUNCATION_SENTINEL));
    }

    #[tokio::test]
    async fn bad_file_hashes_are_rejected_before_acquiring() {
        let (_dir, _orch, broker) = setup(BrokerConfig::default()).await;
        let mut req = request("s1", "print(1)");
        req.files
            .insert("/workspace/a.txt".to_owned(), "nothex".to_owned());
        let err = broker.execute(req).await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn workers_are_destroyed_after_every_request() {
        let (_dir, orch, broker) = setup(BrokerConfig::default()).await;
        orch.script_run(ScriptedRun::stdout(""));
        broker.execute(request("s1", "print(1)")).await.unwrap();

        wait_for_stats(&broker, |stats| {
            stats.assigned == 0 && stats.terminating == 0 && stats.ready == stats.target
        })
        .await;
    }

    #[tokio::test]
    async fn custom_tool_end_to_end() {
        let (_dir, orch, broker) = setup(BrokerConfig::default()).await;
        let source = "def greet(name: str) -> str:\n  \"\"\"Greet.\n  :param name: who\n  :return: greeting\n  \"\"\"\n  return 'hi '+name";

        let tool = broker.parse_custom_tool(source).unwrap();
        assert_eq!(tool.name, "greet");
        assert_eq!(
            tool.input_schema["properties"]["name"]["type"],
            serde_json::json!("string")
        );

        orch.script_run(ScriptedRun::stdout(&format!(
            "{}\n\"hi world\"\n",
            crucible_tools::runner::RESULT_SENTINEL
        )));
        let output = broker
            .execute_custom_tool(source, r#"{"name": "world"}"#, &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(output, "\"hi world\"");
    }

    #[tokio::test]
    async fn custom_tool_failure_modes() {
        let (_dir, orch, broker) = setup(BrokerConfig::default()).await;
        let source = "def f(x: int) -> str:\n    \"\"\"Doc.\"\"\"\n    return object()\n";

        // Bad input never reaches a worker.
        let err = broker
            .execute_custom_tool(source, r#"{"x": "not an int"}"#, &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidArgument(_)));

        // Unparseable source is an invalid tool.
        let err = broker
            .execute_custom_tool("x = 1", "{}", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidTool(_)));

        // Unserializable return value.
        orch.script_run(ScriptedRun::exit(
            crucible_tools::runner::UNSERIALIZABLE_EXIT,
            "tool returned an unserializable value",
        ));
        let err = broker
            .execute_custom_tool(source, r#"{"x": 1}"#, &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidToolOutput(_)));

        // A raising tool surfaces its stderr.
        orch.script_run(ScriptedRun::exit(1, "Traceback: boom"));
        let err = broker
            .execute_custom_tool(source, r#"{"x": 1}"#, &BTreeMap::new())
            .await
            .unwrap_err();
        match err {
            BrokerError::ExecutionFailed(stderr) => assert!(stderr.contains("boom")),
            other => panic!("expected ExecutionFailed, got {other:?}"),
        }
    }

    #[test]
    fn run_command_merges_env_safely() {
        let env = BTreeMap::from([
            ("A".to_owned(), "plain".to_owned()),
            ("B".to_owned(), "with 'quote'".to_owned()),
        ]);
        let argv = run_command(&env);
        assert_eq!(argv[0], "sh");
        assert_eq!(
            argv[2],
            "cd /workspace && exec env 'A=plain' 'B=with '\\''quote'\\''' python3 -"
        );
    }

    #[test]
    fn env_names_are_validated() {
        let bad = BTreeMap::from([("A=B".to_owned(), "x".to_owned())]);
        assert!(validate_env(&bad).is_err());
        let ok = BTreeMap::from([("PATH".to_owned(), "/bin".to_owned())]);
        assert!(validate_env(&ok).is_ok());
    }
}
