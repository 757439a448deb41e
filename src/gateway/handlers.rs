//! HTTP handlers
//!
//! Handlers translate requests into [`Command`]s or read-side queries and
//! map typed outcomes onto the response envelope: success is 200, a
//! guard rejection or illegal transition is 409 with the outcome in
//! `data`, infrastructure errors go through [`ApiError`].

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::state::AppState;
use super::types::{
    ApiError, ApiResponse, SIGNATURE_HEADER, actor_from_headers, error_codes, require_admin,
};
use crate::commands::{Command, CommandResult};
use crate::funding::CheckoutDraft;
use crate::money::Currency;
use crate::reconcile::{ReconcileOutcome, payout_trace, reconciliation_summary};
use crate::refund::RefundOutcome;
use crate::release::ReleaseOutcome;

type ApiResult = Result<Response, ApiError>;

fn ok<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse::success(data))).into_response()
}

fn conflict<T: Serialize>(msg: &str, data: T) -> Response {
    (StatusCode::CONFLICT, Json(ApiResponse::conflict(msg, data))).into_response()
}

fn unexpected(result: CommandResult) -> ApiError {
    warn!(?result, "Command returned an unexpected result kind");
    ApiError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        error_codes::INTERNAL_ERROR,
        "unexpected command result",
    )
}

fn release_response(outcome: ReleaseOutcome) -> Response {
    match outcome {
        ReleaseOutcome::Rejected { code } => conflict(code.code(), outcome),
        ReleaseOutcome::Released(_) => ok(outcome),
    }
}

// ============================================================================
// System
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub timestamp_ms: u64,
    pub git_hash: &'static str,
}

/// Liveness plus a database ping when PostgreSQL is configured
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ApiResponse<HealthResponse>>) {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    if let Some(db) = &state.pg_db
        && let Err(e) = db.health_check().await
    {
        warn!(error = %e, "Health check: database unreachable");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse {
                code: error_codes::SERVICE_UNAVAILABLE,
                msg: "unavailable".to_string(),
                data: None,
            }),
        );
    }

    (
        StatusCode::OK,
        Json(ApiResponse::success(HealthResponse {
            timestamp_ms: now_ms,
            git_hash: env!("GIT_HASH"),
        })),
    )
}

// ============================================================================
// Webhooks
// ============================================================================

/// Processor event delivery. The raw body is needed for the signature.
pub async fn processor_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let outcome = state.gate.handle(&body, signature).await?;
    Ok(ok(outcome))
}

// ============================================================================
// Poster / contractor operations
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub amount_cents: i64,
    #[serde(default)]
    pub currency: Option<Currency>,
}

pub async fn checkout_draft(
    State(state): State<Arc<AppState>>,
    Path(draft_id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult {
    let actor = actor_from_headers(&headers)?;
    if req.amount_cents <= 0 {
        return Err(ApiError::bad_request("amount_cents must be positive"));
    }

    let result = state
        .bus
        .dispatch(Command::CheckoutDraft(CheckoutDraft {
            draft_id,
            poster_id: actor.user_id,
            amount_cents: req.amount_cents,
            currency: req.currency.unwrap_or(state.default_currency),
        }))
        .await?;
    match result {
        CommandResult::Checkout(checkout) => Ok(ok(checkout)),
        other => Err(unexpected(other)),
    }
}

pub async fn release_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult {
    let actor = actor_from_headers(&headers)?;
    match state.bus.dispatch(Command::ReleaseJob { job_id, actor }).await? {
        CommandResult::Release(outcome) => Ok(release_response(outcome)),
        other => Err(unexpected(other)),
    }
}

pub async fn release_pm_request(
    State(state): State<Arc<AppState>>,
    Path(pm_request_id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult {
    let actor = actor_from_headers(&headers)?;
    match state
        .bus
        .dispatch(Command::ReleasePmRequest {
            pm_request_id,
            actor,
        })
        .await?
    {
        CommandResult::Release(outcome) => Ok(release_response(outcome)),
        other => Err(unexpected(other)),
    }
}

// ============================================================================
// Admin operations
// ============================================================================

pub async fn refund_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult {
    require_admin(&headers)?;
    match state.bus.dispatch(Command::RefundJob { job_id }).await? {
        CommandResult::Refund(outcome) => match outcome {
            RefundOutcome::Rejected { code } => Ok(conflict(code.code(), outcome)),
            _ => Ok(ok(outcome)),
        },
        other => Err(unexpected(other)),
    }
}

pub async fn reconcile_transfer(
    State(state): State<Arc<AppState>>,
    Path(external_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    require_admin(&headers)?;
    match state
        .bus
        .dispatch(Command::ReconcileTransfer { external_id })
        .await?
    {
        CommandResult::Reconcile(outcome) => match outcome {
            ReconcileOutcome::Conflict { .. } => Ok(conflict("illegal_transition", outcome)),
            _ => Ok(ok(outcome)),
        },
        other => Err(unexpected(other)),
    }
}

pub async fn get_payout_trace(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult {
    require_admin(&headers)?;
    let trace = payout_trace(state.store.as_ref(), user_id).await?;
    Ok(ok(trace))
}

#[derive(Debug, Default, Deserialize)]
pub struct WindowQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub currency: Option<Currency>,
}

impl WindowQuery {
    /// Explicit bounds, or the configured lookback ending now
    fn bounds(&self, state: &AppState) -> Result<(DateTime<Utc>, DateTime<Utc>), ApiError> {
        let to = self.to.unwrap_or_else(Utc::now);
        let from = self.from.unwrap_or(to - state.audit_lookback());
        if from >= to {
            return Err(ApiError::bad_request("from must be before to"));
        }
        Ok((from, to))
    }
}

pub async fn get_reconciliation_summary(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<WindowQuery>,
) -> ApiResult {
    require_admin(&headers)?;
    let to = q.to.unwrap_or_else(Utc::now);
    if let Some(from) = q.from
        && from >= to
    {
        return Err(ApiError::bad_request("from must be before to"));
    }
    let summary = reconciliation_summary(
        state.store.as_ref(),
        state.processor.as_ref(),
        q.currency.unwrap_or(state.default_currency),
        q.from,
        to,
        state.reconciliation.variance_warning_cents,
    )
    .await?;
    Ok(ok(summary))
}

pub async fn run_audit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<WindowQuery>,
) -> ApiResult {
    require_admin(&headers)?;
    let (from, to) = q.bounds(&state)?;
    match state.bus.dispatch(Command::RunAudit { from, to }).await? {
        CommandResult::Audit(report) => Ok(ok(report)),
        other => Err(unexpected(other)),
    }
}

pub async fn audit_trend(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<WindowQuery>,
) -> ApiResult {
    require_admin(&headers)?;
    let (from, to) = q.bounds(&state)?;
    let trend = state.auditor.trend(from, to).await?;
    Ok(ok(trend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandBus;
    use crate::config::{EscrowConfig, ReconciliationConfig};
    use crate::gateway::types::{USER_ID_HEADER, USER_ROLE_HEADER};
    use crate::processor::mock::MockProcessor;
    use crate::store::MemoryEscrowStore;
    use crate::webhook::WebhookGate;
    use axum::http::HeaderValue;

    fn state() -> Arc<AppState> {
        let store = Arc::new(MemoryEscrowStore::new());
        let processor = Arc::new(MockProcessor::new());
        let bus = Arc::new(CommandBus::new(
            store.clone(),
            processor.clone(),
            EscrowConfig::default(),
        ));
        let gate = Arc::new(WebhookGate::new(store.clone(), "whsec_test".into(), 300));
        Arc::new(AppState::new(
            bus,
            gate,
            store,
            processor,
            ReconciliationConfig::default(),
            None,
        ))
    }

    fn headers(role: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            USER_ID_HEADER,
            HeaderValue::from_str(&Uuid::new_v4().to_string()).unwrap(),
        );
        h.insert(USER_ROLE_HEADER, HeaderValue::from_str(role).unwrap());
        h
    }

    #[tokio::test]
    async fn test_health_ok_without_database() {
        let (status, Json(body)) = health_check(State(state())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.code, error_codes::SUCCESS);
    }

    #[tokio::test]
    async fn test_webhook_without_signature_is_400() {
        let err = processor_webhook(State(state()), HeaderMap::new(), Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_release_unknown_job_is_conflict() {
        let resp = release_job(State(state()), Path(Uuid::new_v4()), headers("user"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_refund_requires_admin() {
        let err = refund_job(State(state()), Path(Uuid::new_v4()), headers("user"))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_refund_unknown_job_is_conflict() {
        let resp = refund_job(State(state()), Path(Uuid::new_v4()), headers("admin"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_checkout_uses_caller_as_poster() {
        let resp = checkout_draft(
            State(state()),
            Path(Uuid::new_v4()),
            headers("user"),
            Json(CheckoutRequest {
                amount_cents: 25_000,
                currency: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_checkout_rejects_non_positive_amount() {
        let err = checkout_draft(
            State(state()),
            Path(Uuid::new_v4()),
            headers("user"),
            Json(CheckoutRequest {
                amount_cents: 0,
                currency: Some(Currency::Usd),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_reconcile_unknown_transfer_is_404() {
        let err = reconcile_transfer(State(state()), Path("tr_missing".into()), headers("admin"))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_audit_rejects_inverted_window() {
        let now = Utc::now();
        let q = WindowQuery {
            from: Some(now),
            to: Some(now - chrono::Duration::hours(1)),
            currency: None,
        };
        let err = run_audit(State(state()), headers("admin"), Query(q))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_summary_on_empty_books() {
        let resp = get_reconciliation_summary(
            State(state()),
            headers("admin"),
            Query(WindowQuery::default()),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
