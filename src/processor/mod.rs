//! Payment Processor Seam
//!
//! The external processor is opaque: this subsystem only creates charges,
//! retrieves transfers, creates refunds and reads the balance snapshot.
//! Everything else arrives through the inbound event feed.
//!
//! Calls are not cancellable mid-flight. Callers make them inside the
//! database transaction they justify, so a failure leaves nothing
//! committed.

pub mod stripe;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::money::Currency;

pub use stripe::StripeClient;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    #[error("HTTP transport error: {0}")]
    Http(String),

    #[error("Processor request timed out")]
    Timeout,

    #[error("Processor rejected request ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to decode processor response: {0}")]
    Decode(String),
}

/// Create a payment intent for an escrow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    pub amount_cents: i64,
    pub currency: Currency,
    pub metadata: BTreeMap<String, String>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentIntentView {
    pub id: String,
    pub status: String,
    pub amount_cents: i64,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferView {
    pub id: String,
    pub amount_cents: i64,
    pub amount_reversed_cents: i64,
    pub reversed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRequest {
    /// Charge id (`ch_...`) or payment-intent id (`pi_...`)
    pub reference: String,
    /// `None` refunds the full captured amount
    pub amount_cents: Option<i64>,
    pub idempotency_key: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefundView {
    pub id: String,
    pub status: String,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BalanceSnapshot {
    pub currency: Currency,
    pub available_cents: i64,
    pub pending_cents: i64,
}

impl BalanceSnapshot {
    pub fn total_cents(&self) -> i64 {
        self.available_cents + self.pending_cents
    }
}

/// Capability set of the external payment processor
///
/// Constructed once at startup and injected into the services that need
/// it; there is no global client.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Get processor name for logging
    fn name(&self) -> &'static str;

    async fn create_charge(&self, req: &ChargeRequest)
    -> Result<PaymentIntentView, ProcessorError>;

    async fn retrieve_transfer(&self, transfer_id: &str) -> Result<TransferView, ProcessorError>;

    async fn create_refund(&self, req: &RefundRequest) -> Result<RefundView, ProcessorError>;

    async fn retrieve_balance(&self, currency: Currency)
    -> Result<BalanceSnapshot, ProcessorError>;
}
