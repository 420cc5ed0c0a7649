//! # Server Configuration
//!
//! Router, shared state and OpenAPI document for the status surface.

use std::sync::Arc;

use axum::{
    Router,
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::handlers;
use crate::scheduler::MetricsScheduler;
use crate::telemetry::{TraceContext, with_trace_context};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub scheduler: MetricsScheduler,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/status", get(handlers::status))
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context))
        .layer(TraceLayer::new_for_http())
}

/// Scope each request in a trace context taken from `x-request-id`, or a fresh one.
async fn trace_context(mut request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let context = TraceContext { trace_id };
    request.extensions_mut().insert(context.clone());

    with_trace_context(context, next.run(request)).await
}

/// Serve the router until `shutdown` fires.
pub async fn run_server(state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = state.config.bind_addr()?;
    let profile = state.config.profile.clone();
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, %profile, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::status,
        crate::handlers::healthz,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthResponse,
            crate::error::ApiError,
            crate::scheduler::SchedulerStatus,
            crate::scheduler::TickSummary,
            crate::freshness::FreshnessPolicy,
        )
    ),
    info(
        title = "Metrics Refresher API",
        description = "Status surface of the post metrics refresh scheduler",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
