//! Service configuration, read from `APP_`-prefixed environment variables.
//!
//! Defaults are chosen so the broker comes up against a local Docker daemon
//! with no configuration at all.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {detail}")]
    Invalid { var: String, detail: String },
}

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server listens on.
    pub http_listen_addr: String,
    /// Image the executor workers run.
    pub executor_image: String,
    /// Opaque resource block for the executor container, passed through to
    /// the orchestrator backend.
    pub executor_container_resources: serde_json::Value,
    /// Extra worker manifest fields, passed through verbatim.
    pub executor_pod_spec_extra: serde_json::Value,
    /// Root of the file store.
    pub file_storage_path: PathBuf,
    /// Warm pool target length.
    pub executor_pod_queue_target_length: usize,
    /// Worker names are this prefix plus a random suffix.
    pub executor_pod_name_prefix: String,
    /// Allow execute requests from anywhere. When off, the ingress guard
    /// admits only allowlisted hosts/addresses (loopback is always in).
    pub public_spawn_enabled: bool,
    /// Host-header allowlist for the ingress guard.
    pub internal_host_allowlist: Vec<String>,
    /// Peer-address allowlist for the ingress guard.
    pub internal_ip_allowlist: Vec<String>,
    /// Reject execute requests without a `chat_id`.
    pub require_chat_id: bool,
    /// Default download quota for stored files; 0 means unlimited.
    pub global_max_downloads: u64,
    /// Upload / workspace file size cap in bytes.
    pub file_size_limit: u64,
    /// Bound on a single user-code execution, seconds.
    pub execution_timeout_seconds: u64,
    /// Bound on waiting for a ready worker, seconds.
    pub acquire_timeout_seconds: u64,
    /// Captured stdout/stderr cap, bytes.
    pub output_limit_bytes: usize,
    /// Period of the background reclamation sweep, seconds.
    pub reclaim_interval_seconds: u64,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            http_listen_addr: env_or("APP_HTTP_LISTEN_ADDR", "0.0.0.0:50081"),
            executor_image: env_or("APP_EXECUTOR_IMAGE", "localhost/code-executor:local"),
            executor_container_resources: env_json("APP_EXECUTOR_CONTAINER_RESOURCES")?,
            executor_pod_spec_extra: env_json("APP_EXECUTOR_POD_SPEC_EXTRA")?,
            file_storage_path: PathBuf::from(env_or("APP_FILE_STORAGE_PATH", "/tmp/crucible")),
            executor_pod_queue_target_length: env_parse("APP_EXECUTOR_POD_QUEUE_TARGET_LENGTH", 5)?,
            executor_pod_name_prefix: env_or("APP_EXECUTOR_POD_NAME_PREFIX", "code-executor-"),
            public_spawn_enabled: env_parse("APP_PUBLIC_SPAWN_ENABLED", false)?,
            internal_host_allowlist: env_list("APP_INTERNAL_HOST_ALLOWLIST"),
            internal_ip_allowlist: env_list("APP_INTERNAL_IP_ALLOWLIST"),
            require_chat_id: env_parse("APP_REQUIRE_CHAT_ID", true)?,
            global_max_downloads: env_parse("APP_GLOBAL_MAX_DOWNLOADS", 0)?,
            file_size_limit: env_size("APP_FILE_SIZE_LIMIT", 1 << 30)?,
            execution_timeout_seconds: env_parse("APP_EXECUTION_TIMEOUT_SECONDS", 60)?,
            acquire_timeout_seconds: env_parse("APP_ACQUIRE_TIMEOUT_SECONDS", 60)?,
            output_limit_bytes: env_parse("APP_OUTPUT_LIMIT_BYTES", 1024 * 1024)?,
            reclaim_interval_seconds: env_parse("APP_RECLAIM_INTERVAL_SECONDS", 3600)?,
        })
    }

    /// The quota default as the store expects it: 0 becomes unlimited.
    #[must_use]
    pub fn global_max_downloads_option(&self) -> Option<u64> {
        (self.global_max_downloads > 0).then_some(self.global_max_downloads)
    }
}

fn env_or(var: &str, default: &str) -> String {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_owned(),
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var: var.to_owned(),
            detail: e.to_string(),
        }),
        _ => Ok(default),
    }
}

fn env_json(var: &str) -> Result<serde_json::Value, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => {
            serde_json::from_str(&value).map_err(|e| ConfigError::Invalid {
                var: var.to_owned(),
                detail: e.to_string(),
            })
        }
        _ => Ok(serde_json::Value::Null),
    }
}

fn env_list(var: &str) -> Vec<String> {
    std::env::var(var)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parse a size with an optional binary suffix (`512Mi`, `1Gi`, `64Ki`).
fn env_size(var: &str, default: u64) -> Result<u64, ConfigError> {
    let Ok(value) = std::env::var(var) else {
        return Ok(default);
    };
    if value.is_empty() {
        return Ok(default);
    }
    parse_size(&value).ok_or_else(|| ConfigError::Invalid {
        var: var.to_owned(),
        detail: format!("not a size literal: {value:?}"),
    })
}

fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let (num, shift) = if let Some(n) = value.strip_suffix("Gi") {
        (n, 30)
    } else if let Some(n) = value.strip_suffix("Mi") {
        (n, 20)
    } else if let Some(n) = value.strip_suffix("Ki") {
        (n, 10)
    } else {
        (value, 0)
    };
    num.trim().parse::<u64>().ok().map(|n| n << shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_literals_parse() {
        assert_eq!(parse_size("1Gi"), Some(1 << 30));
        assert_eq!(parse_size("512Mi"), Some(512 << 20));
        assert_eq!(parse_size("64Ki"), Some(64 << 10));
        assert_eq!(parse_size("12345"), Some(12345));
        assert_eq!(parse_size("big"), None);
    }

    #[test]
    fn defaults_come_up_without_environment() {
        // Scoped to variables this test does not set.
        let config = Config::from_env().unwrap();
        assert_eq!(config.executor_pod_name_prefix, "code-executor-");
        assert_eq!(config.executor_pod_queue_target_length, 5);
        assert!(config.require_chat_id);
        assert_eq!(config.global_max_downloads_option(), None);
    }
}
