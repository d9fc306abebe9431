//! modelgate - serves one pluggable model component over REST, binary RPC,
//! columnar frames and CloudEvents.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use modelgate_core::components::InMemoryStateStore;
use modelgate_core::config::{Protocol, load_effective};
use modelgate_core::lifecycle::{DrainResult, LifecycleConfig, LifecycleManager};
use modelgate_server::admin::{AdminServer, AdminServerConfig};
use modelgate_server::app::Gateway;
use modelgate_server::columnar::ColumnarServer;
use modelgate_server::ports::{admin_port, columnar_port, http_port, rpc_port};
use modelgate_server::rest::{self, RestState};
use modelgate_server::rpc::RpcServer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Listener ports come from `MODELGATE_*_PORT` (see `ports`).
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Bind address for every listener
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// YAML configuration file. Without it, MODELGATE_CONFIG,
    /// /etc/modelgate/config.yaml and ./config.yaml are tried in turn.
    #[arg(long, env = "MODELGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides the configured protocol (seldon_http, seldonfeedback_http, kfserving_http)
    #[arg(long, env = "MODELGATE_PROTOCOL")]
    protocol: Option<Protocol>,

    /// `ce-source` stamped on reply events
    #[arg(long, env = "MODELGATE_EVENT_SOURCE")]
    event_source: Option<String>,

    /// `ce-type` stamped on reply events
    #[arg(long, env = "MODELGATE_EVENT_TYPE")]
    event_type: Option<String>,

    /// Where reply events are POSTed
    #[arg(long)]
    reply_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Phase 1: Observability
    // The guard flushes buffered log lines on exit.
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .json()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Phase 2: Configuration
    let (mut config, source) = load_effective(cli.config.as_deref())?;
    match &source {
        Some(path) => info!(path = %path.display(), "Loaded configuration"),
        None => info!("No configuration file found, using defaults"),
    }
    if let Some(protocol) = cli.protocol {
        config.protocol = protocol;
    }
    if let Some(event_source) = cli.event_source {
        config.events.source = event_source;
    }
    if let Some(event_type) = cli.event_type {
        config.events.event_type = event_type;
    }
    if let Some(reply_url) = cli.reply_url {
        config.delivery.reply_url = Some(reply_url);
    }
    let max_body_bytes = config.limits.max_body_bytes;

    // Phase 3: Lifecycle and gateway
    let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::from_env()));
    let shutdown = lifecycle.shutdown_token();
    let gateway = Gateway::build(config, lifecycle.clone(), Arc::new(InMemoryStateStore::new()))?;
    lifecycle.mark_config_loaded();
    setup_signal_handlers(lifecycle.clone());

    info!(
        component = gateway.service.dispatcher().name(),
        protocol = %gateway.service.protocol(),
        event_method = gateway.events.method().as_str(),
        reply_url = gateway.reply_url().as_deref().unwrap_or("none"),
        drain_timeout_secs = lifecycle.config().drain_timeout.as_secs(),
        "modelgate starting"
    );

    // Phase 4: Admin server, so probes answer while the component loads
    let admin = AdminServer::with_config(
        lifecycle.clone(),
        gateway.registry.clone(),
        AdminServerConfig {
            port: admin_port(),
            bind_addr: cli.bind.clone(),
        },
    );
    let admin_shutdown = shutdown.clone();
    let admin_task = tokio::spawn(async move {
        if let Err(e) = admin.run(admin_shutdown).await {
            error!(error = %e, "Admin server error");
        }
    });

    // Phase 5: Bind inference listeners
    let rest_listener = TcpListener::bind((cli.bind.as_str(), http_port())).await?;
    let rpc_listener = TcpListener::bind((cli.bind.as_str(), rpc_port())).await?;
    let columnar_listener = TcpListener::bind((cli.bind.as_str(), columnar_port())).await?;

    let rest_router = rest::router(RestState::from_gateway(&gateway), max_body_bytes);
    let rest_task = tokio::spawn(rest::serve(rest_listener, rest_router, shutdown.clone()));
    let rpc_task = tokio::spawn(RpcServer::new(&gateway).serve(rpc_listener, shutdown.clone()));
    let columnar_task =
        tokio::spawn(ColumnarServer::new(&gateway).serve(columnar_listener, shutdown.clone()));

    // Phase 6: Load the component, then report ready
    let load_result = gateway.load_component().await;
    match &load_result {
        Ok(()) => lifecycle.mark_ready(),
        Err(e) => {
            error!(error = %e, "Component failed to load");
            lifecycle.begin_shutdown();
        }
    }

    // Phase 7: Wait for shutdown
    shutdown.cancelled().await;

    info!(
        active_requests = lifecycle.active_request_count(),
        drain_timeout_secs = lifecycle.config().drain_timeout.as_secs(),
        "Waiting for active requests to drain"
    );
    let drain_result = lifecycle.drain_requests().await;

    for (name, result) in [
        ("rest", rest_task.await.map(|r| r.map_err(|e| e.to_string()))),
        ("rpc", rpc_task.await.map(|r| r.map_err(|e| e.to_string()))),
        ("columnar", columnar_task.await.map(|r| r.map_err(|e| e.to_string()))),
    ] {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(surface = name, error = %e, "Listener stopped with error"),
            Err(e) => warn!(surface = name, error = %e, "Listener task failed"),
        }
    }
    if let Err(e) = admin_task.await {
        warn!(error = %e, "Admin task failed");
    }

    lifecycle.mark_stopped();
    load_result?;

    match drain_result {
        DrainResult::Complete => {
            info!("All requests drained, shutting down cleanly");
            Ok(())
        }
        DrainResult::Timeout { remaining } => {
            Err(format!("Drain timeout exceeded with {remaining} remaining requests").into())
        }
    }
}

/// SIGINT and SIGTERM both begin a graceful shutdown, which cancels the
/// lifecycle's shutdown token.
fn setup_signal_handlers(lifecycle: Arc<LifecycleManager>) {
    let lifecycle_sigint = lifecycle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT, initiating graceful shutdown");
                lifecycle_sigint.begin_shutdown();
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, initiating graceful shutdown");
                lifecycle.begin_shutdown();
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGTERM"),
        }
    });

    #[cfg(not(unix))]
    drop(lifecycle);
}
