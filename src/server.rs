/// HTTP server setup and routing
use crate::{
    api::middleware::{require_admin_token, track_requests},
    context::AppContext,
    db,
    error::{BotError, BotResult},
    metrics,
};
use axum::{
    extract::State,
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the admin application router
pub fn build_router(ctx: AppContext) -> Router {
    // Everything except /health sits behind the admin token
    let protected = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(crate::api::routes())
        .route_layer(middleware::from_fn_with_state(ctx.clone(), require_admin_token));

    Router::new()
        .route("/health", get(health_check))
        .merge(protected)
        .route_layer(middleware::from_fn(track_requests))
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .fallback(not_found)
}

/// Health check handler
async fn health_check(State(ctx): State<AppContext>) -> (StatusCode, Json<serde_json::Value>) {
    let (status, code) = match db::test_connection(&ctx.db).await {
        Ok(()) => ("ok", StatusCode::OK),
        Err(e) => {
            tracing::error!("Health check database query failed: {}", e);
            ("degraded", StatusCode::SERVICE_UNAVAILABLE)
        }
    };

    (
        code,
        Json(json!({
            "status": status,
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
}

/// 404 handler
async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "NotFound",
            "message": "Endpoint not found"
        })),
    )
}

/// Start the HTTP server
pub async fn serve(ctx: AppContext) -> BotResult<()> {
    let addr = format!("{}:{}", ctx.config.admin_api.host, ctx.config.admin_api.port);
    info!("Admin API listening on {}", addr);

    let app = build_router(ctx);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| BotError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| BotError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}
