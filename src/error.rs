//! Infrastructure error type
//!
//! Only failures that must abort the surrounding transaction live here.
//! Expected business rejections are returned as typed outcomes by each
//! component and never travel through this enum.

use thiserror::Error;

use crate::processor::ProcessorError;

#[derive(Error, Debug, Clone)]
pub enum EscrowError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Payment processor error: {0}")]
    Processor(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Webhook signature invalid")]
    InvalidSignature,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal system error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            EscrowError::Database(_) => "DATABASE_ERROR",
            EscrowError::Processor(_) => "PROCESSOR_ERROR",
            EscrowError::InvalidPayload(_) => "INVALID_PAYLOAD",
            EscrowError::InvalidSignature => "INVALID_SIGNATURE",
            EscrowError::NotFound(_) => "NOT_FOUND",
            EscrowError::Config(_) => "CONFIG_ERROR",
            EscrowError::Internal(_) => "SYSTEM_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            EscrowError::InvalidPayload(_) | EscrowError::InvalidSignature => 400,
            EscrowError::NotFound(_) => 404,
            EscrowError::Processor(_) => 502,
            EscrowError::Database(_) | EscrowError::Config(_) | EscrowError::Internal(_) => 500,
        }
    }
}

impl From<sqlx::Error> for EscrowError {
    fn from(e: sqlx::Error) -> Self {
        EscrowError::Database(e.to_string())
    }
}

impl From<ProcessorError> for EscrowError {
    fn from(e: ProcessorError) -> Self {
        EscrowError::Processor(e.to_string())
    }
}

impl From<serde_json::Error> for EscrowError {
    fn from(e: serde_json::Error) -> Self {
        EscrowError::InvalidPayload(e.to_string())
    }
}
