pub mod handlers;
pub mod state;
pub mod types;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::config::GatewayConfig;
use state::AppState;

/// Build the complete router
pub fn build_router(state: Arc<AppState>) -> Router {
    // ==========================================================================
    // Processor callbacks (signature-authenticated)
    // ==========================================================================
    let webhook_routes = Router::new().route("/stripe", post(handlers::processor_webhook));

    // ==========================================================================
    // Poster / contractor routes (X-User-ID required)
    // ==========================================================================
    let api_routes = Router::new()
        .route("/checkout/{draft_id}", post(handlers::checkout_draft))
        .route("/jobs/{job_id}/release", post(handlers::release_job))
        .route(
            "/pm-requests/{pm_request_id}/release",
            post(handlers::release_pm_request),
        )
        .route("/jobs/{job_id}/refund", post(handlers::refund_job));

    // ==========================================================================
    // Admin routes (X-User-Role: admin)
    // ==========================================================================
    let admin_routes = Router::new()
        .route("/payout-trace/{user_id}", get(handlers::get_payout_trace))
        .route(
            "/reconciliation/summary",
            get(handlers::get_reconciliation_summary),
        )
        .route("/reconciliation/audit", get(handlers::run_audit))
        .route("/reconciliation/trend", get(handlers::audit_trend))
        .route(
            "/transfers/{external_id}/reconcile",
            post(handlers::reconcile_transfer),
        );

    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/webhooks", webhook_routes)
        .nest("/api/v1", api_routes)
        .nest("/admin/v1", admin_routes)
        .with_state(state)
}

/// Start HTTP Gateway server
pub async fn run_server(config: &GatewayConfig, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        tracing::error!(%addr, error = %e, "Failed to bind gateway address");
        e
    })?;

    tracing::info!(%addr, "Gateway listening");
    tracing::info!("Webhooks:  /webhooks/stripe");
    tracing::info!("API:       /api/v1/*");
    tracing::info!("Admin API: /admin/v1/* (admin role required)");

    axum::serve(listener, app).await?;
    Ok(())
}
