// Nest Reconcile - Web Server
// REST surface over the Reconciler, for hosts that trigger runs remotely

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nest_reconcile::{CleansingConfig, CleansingError, Reconciler, Store};

#[derive(Parser, Debug)]
#[command(name = "nest-reconcile-server", version)]
struct Args {
    #[arg(long, default_value = "nest.sqlite")]
    db: PathBuf,

    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "0.0.0.0:3000")]
    bind: String,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    reconciler: Arc<Reconciler>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Response {
        (
            StatusCode::OK,
            Json(Self {
                success: true,
                data: Some(data),
                error: None,
            }),
        )
            .into_response()
    }
}

fn error_response(context: &str, err: CleansingError) -> Response {
    let status = match err {
        CleansingError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        CleansingError::TransactionConflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error!(error = %err, "{}", context);

    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(err.to_string()),
        }),
    )
        .into_response()
}

#[derive(Deserialize)]
struct ReconcileParams {
    #[serde(default)]
    force: bool,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check(State(state): State<AppState>) -> Response {
    ApiResponse::ok(serde_json::json!({
        "status": "OK",
        "version": nest_reconcile::VERSION,
        "state": state.reconciler.state(),
    }))
}

/// GET /api/stats - Entity counts and pending duplicate groups
async fn get_stats(State(state): State<AppState>) -> Response {
    match state.reconciler.entity_counts().await {
        Ok(counts) => ApiResponse::ok(counts),
        Err(e) => error_response("Error getting stats", e),
    }
}

/// POST /api/reconcile?force=true - Run a (gated) reconciliation
async fn reconcile(State(state): State<AppState>, Query(params): Query<ReconcileParams>) -> Response {
    match state.reconciler.reconcile_all(params.force).await {
        Ok(outcome) => ApiResponse::ok(outcome),
        Err(e) => error_response("Reconciliation failed", e),
    }
}

/// POST /api/reclaim - Vacuum and re-analyze the store
async fn reclaim(State(state): State<AppState>) -> Response {
    match state.reconciler.reclaim_store().await {
        Ok(outcome) => ApiResponse::ok(outcome),
        Err(e) => error_response("Reclaim failed", e),
    }
}

fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(get_stats))
        .route("/reconcile", post(reconcile))
        .route("/reclaim", post(reclaim))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    )
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => CleansingConfig::from_file(path)?,
        None => CleansingConfig::default(),
    };
    let store = Store::open(&args.db).with_context(|| format!("Failed to open store: {:?}", args.db))?;
    info!(db = ?args.db, "store opened");

    let state = AppState {
        reconciler: Arc::new(Reconciler::new(store, config)),
    };

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", args.bind))?;
    info!(addr = %args.bind, "server running");

    axum::serve(listener, router(state))
        .await
        .context("Server terminated")?;

    Ok(())
}
