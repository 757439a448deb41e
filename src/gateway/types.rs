//! API response envelope, error codes and caller identity

use axum::{
    Json,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use uuid::Uuid;

use crate::actor::{Actor, ActorRole};
use crate::error::EscrowError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const SIGNATURE_HEADER: &str = "stripe-signature";

// ============================================================================
// Unified API Response Format
// ============================================================================

/// Unified API response wrapper
///
/// - code: 0 = success, non-zero = error code
/// - msg: short message description
/// - data: payload; also present on 409 so callers see the typed outcome
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: error_codes::SUCCESS,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    /// Guard rejection or illegal transition, with the outcome attached
    pub fn conflict(msg: impl Into<String>, data: T) -> Self {
        Self {
            code: error_codes::CONFLICT,
            msg: msg.into(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, msg: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

/// Standard API error codes
pub mod error_codes {
    pub const SUCCESS: i32 = 0;

    // Client errors (1xxx)
    pub const INVALID_PARAMETER: i32 = 1001;

    // Auth errors (2xxx)
    pub const MISSING_AUTH: i32 = 2001;
    pub const AUTH_FAILED: i32 = 2002;
    pub const FORBIDDEN: i32 = 2003;

    // Resource errors (4xxx)
    pub const NOT_FOUND: i32 = 4004;
    pub const CONFLICT: i32 = 4009;

    // Server errors (5xxx)
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const SERVICE_UNAVAILABLE: i32 = 5001;
    pub const PROCESSOR_ERROR: i32 = 5002;
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: i32,
    pub msg: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: i32, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            msg: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error_codes::INVALID_PARAMETER, msg)
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, error_codes::FORBIDDEN, "admin role required")
    }
}

impl From<EscrowError> for ApiError {
    fn from(e: EscrowError) -> Self {
        let code = match &e {
            EscrowError::InvalidPayload(_) => error_codes::INVALID_PARAMETER,
            EscrowError::InvalidSignature => error_codes::AUTH_FAILED,
            EscrowError::NotFound(_) => error_codes::NOT_FOUND,
            EscrowError::Processor(_) => error_codes::PROCESSOR_ERROR,
            EscrowError::Database(_) | EscrowError::Config(_) | EscrowError::Internal(_) => {
                error_codes::INTERNAL_ERROR
            }
        };
        if e.http_status() >= 500 {
            tracing::error!(error = %e, code = e.code(), "Request failed");
        }
        let status =
            StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, code, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::<()>::error(self.code, self.msg))).into_response()
    }
}

// ============================================================================
// Caller identity
// ============================================================================

/// Caller identity set by the upstream auth layer
pub fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, ApiError> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::UNAUTHORIZED,
                error_codes::MISSING_AUTH,
                "missing X-User-ID",
            )
        })?;
    let user_id = Uuid::parse_str(user_id).map_err(|_| {
        ApiError::new(
            StatusCode::UNAUTHORIZED,
            error_codes::AUTH_FAILED,
            "malformed X-User-ID",
        )
    })?;

    let role = match headers.get(USER_ROLE_HEADER).and_then(|v| v.to_str().ok()) {
        Some(r) if r.eq_ignore_ascii_case("admin") => ActorRole::Admin,
        _ => ActorRole::User,
    };
    Ok(Actor { user_id, role })
}

pub fn require_admin(headers: &HeaderMap) -> Result<Actor, ApiError> {
    let actor = actor_from_headers(headers)?;
    if actor.is_admin() {
        Ok(actor)
    } else {
        Err(ApiError::forbidden())
    }
}
