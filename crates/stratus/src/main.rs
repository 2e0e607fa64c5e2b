use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use stratus_core::{AgentRequest, EnforcerConfig};
use stratus_enforcer::{AutoscaleEnforcer, EnforcerError, HttpNodeApi};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "stratus", about = "Stratus autoscale-enforcer scheduler plugin")]
struct Cli {
    /// Path to the enforcer configuration document (YAML)
    #[arg(long, default_value = "/etc/stratus/config.yaml")]
    config: PathBuf,

    /// Address for the agent-facing HTTP listener
    #[arg(long, default_value = "0.0.0.0:10299")]
    bind: String,

    /// Base URL of the orchestrator API server
    #[arg(long, default_value = "http://127.0.0.1:6443")]
    api_url: String,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting stratus autoscale-enforcer");

    let raw = std::fs::read_to_string(&cli.config).map_err(|e| {
        miette::miette!(
            "Failed to read config file '{}': {}",
            cli.config.display(),
            e
        )
    })?;
    let conf = EnforcerConfig::from_yaml(&raw)?;

    let node_api = Arc::new(HttpNodeApi::new(&cli.api_url));
    let enforcer = Arc::new(AutoscaleEnforcer::new(conf, node_api)?);

    let app = Router::new()
        .route("/api/v1/agent", post(handle_agent_request))
        .route("/state", get(dump_state))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(enforcer);

    let listener = tokio::net::TcpListener::bind(&cli.bind)
        .await
        .map_err(|e| miette::miette!("Failed to bind '{}': {}", cli.bind, e))?;
    info!("Agent endpoint listening on {}", cli.bind);

    let token = CancellationToken::new();
    let server_token = token.clone();
    let server_handle = tokio::spawn(async move {
        let shutdown = async move { server_token.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("Agent endpoint error: {}", e);
        }
    });

    let sig = shutdown_signal().await;
    info!("Received {}, shutting down gracefully...", sig);
    token.cancel();

    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), server_handle).await;
    info!("Shutdown complete");

    Ok(())
}

/// Wait for either SIGINT (ctrl-c) or SIGTERM, returning which one fired.
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

/// POST /api/v1/agent
async fn handle_agent_request(
    State(enforcer): State<Arc<AutoscaleEnforcer>>,
    Json(req): Json<AgentRequest>,
) -> Response {
    match enforcer.handle_agent_request(req).await {
        Ok(outcome) => {
            if let Some(pod) = &outcome.migrate {
                // Submission of the migration request itself belongs to the
                // surrounding operator tooling, outside the plugin lock.
                info!(pod = %pod, "pod selected for migration");
            }
            Json(outcome.response).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// GET /state
async fn dump_state(State(enforcer): State<Arc<AutoscaleEnforcer>>) -> Response {
    Json(enforcer.dump_state().await).into_response()
}

fn error_response(e: EnforcerError) -> Response {
    let status = match &e {
        EnforcerError::PodNotFound { .. } => StatusCode::NOT_FOUND,
        EnforcerError::RequestOutOfBounds { .. }
        | EnforcerError::InvalidVmPod { .. }
        | EnforcerError::InvalidPodSpec { .. }
        | EnforcerError::Core(_) => StatusCode::BAD_REQUEST,
        EnforcerError::Api { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string()).into_response()
}
