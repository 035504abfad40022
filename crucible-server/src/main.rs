use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use crucible_broker::{Broker, BrokerConfig};
use crucible_orchestrator::{Orchestrator, WorkerSpec};
use crucible_orchestrator_docker::DockerOrchestrator;
use crucible_pool::{Pool, PoolConfig};
use crucible_server::api::guard::IngressGuard;
use crucible_server::api::{self, AppState};
use crucible_server::config::Config;
use crucible_store::FileStore;

/// Crucible code execution broker.
#[derive(Parser, Debug)]
#[command(name = "crucible-server", about = "Sandboxed code execution broker")]
struct Cli {
    /// Override the HTTP listen address.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let store = Arc::new(FileStore::open(&config.file_storage_path).await?);
    info!(path = %config.file_storage_path.display(), "file store opened");

    let orchestrator: Arc<dyn Orchestrator> = Arc::new(DockerOrchestrator::connect().await?);

    let owner = format!("crucible-{}", uuid::Uuid::new_v4());
    let pool = Pool::spawn(
        Arc::clone(&orchestrator),
        PoolConfig {
            target: config.executor_pod_queue_target_length,
            worker_name_prefix: config.executor_pod_name_prefix.clone(),
            worker_spec: WorkerSpec {
                image: config.executor_image.clone(),
                resources: config.executor_container_resources.clone(),
                spec_extra: config.executor_pod_spec_extra.clone(),
                owner,
            },
            ..PoolConfig::default()
        },
    );

    let broker = Arc::new(Broker::new(
        pool,
        orchestrator,
        Arc::clone(&store),
        BrokerConfig {
            require_chat_id: config.require_chat_id,
            global_max_downloads: config.global_max_downloads_option(),
            output_limit_bytes: config.output_limit_bytes,
            acquire_timeout: Duration::from_secs(config.acquire_timeout_seconds),
            exec_timeout: Duration::from_secs(config.execution_timeout_seconds),
            ..BrokerConfig::default()
        },
    ));

    // Periodic reclamation of expired and exhausted files.
    {
        let store = Arc::clone(&store);
        let period = Duration::from_secs(config.reclaim_interval_seconds);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = store.reclaim().await {
                    tracing::warn!(error = %e, "reclamation sweep failed");
                }
            }
        });
    }

    let state = AppState {
        broker,
        guard: Arc::new(IngressGuard {
            public_spawn_enabled: config.public_spawn_enabled,
            host_allowlist: config.internal_host_allowlist.clone(),
            ip_allowlist: config.internal_ip_allowlist.clone(),
        }),
        body_limit: usize::try_from(config.file_size_limit).unwrap_or(usize::MAX),
    };
    let app = api::router(state)
        .into_make_service_with_connect_info::<std::net::SocketAddr>();

    let addr = cli.listen.unwrap_or(config.http_listen_addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, "crucible-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("crucible-server shut down");
    Ok(())
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM, then return to trigger graceful
/// shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
