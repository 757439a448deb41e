//! Refund Guard
//!
//! Ordered pre-flight checks, first match wins:
//!
//! 1. payout already RELEASED          -> `refund_after_release`
//! 2. any payout leg SENT              -> `refund_after_partial_release`
//! 3. DISPUTED with no resolved case   -> `disputed`
//! 4. no charge / intent reference     -> `missing_stripe_ref`
//!
//! Guards 1 and 2 have no override. The dispute lookup only runs when
//! guards 1 and 2 pass and the job is DISPUTED.

use serde::Serialize;

use crate::error::EscrowError;
use crate::escrow::{JobFinancials, JobStatus, PaymentStatus, PayoutStatus};
use crate::store::StoreTx;
use crate::transfer::TransferStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundRejection {
    NotFound,
    RefundAfterRelease,
    RefundAfterPartialRelease,
    Disputed,
    MissingStripeRef,
    NotFunded,
}

impl RefundRejection {
    pub fn code(&self) -> &'static str {
        match self {
            RefundRejection::NotFound => "not_found",
            RefundRejection::RefundAfterRelease => "refund_after_release",
            RefundRejection::RefundAfterPartialRelease => "refund_after_partial_release",
            RefundRejection::Disputed => "disputed",
            RefundRejection::MissingStripeRef => "missing_stripe_ref",
            RefundRejection::NotFunded => "not_funded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundDecision {
    /// Refund against this processor reference
    Proceed { reference: String },
    AlreadyRefunded,
    Reject(RefundRejection),
}

/// Evaluate the guards for a job locked by the caller's transaction
pub async fn evaluate(
    tx: &mut dyn StoreTx,
    job: &JobFinancials,
) -> Result<RefundDecision, EscrowError> {
    if job.payout_status == PayoutStatus::Released {
        return Ok(RefundDecision::Reject(RefundRejection::RefundAfterRelease));
    }

    let legs = tx.transfers_for_job(job.id).await?;
    if legs.iter().any(|leg| leg.status == TransferStatus::Sent) {
        return Ok(RefundDecision::Reject(
            RefundRejection::RefundAfterPartialRelease,
        ));
    }

    if job.status == JobStatus::Disputed && !tx.has_resolved_dispute(job.id).await? {
        return Ok(RefundDecision::Reject(RefundRejection::Disputed));
    }

    let Some(reference) = job.refund_reference() else {
        return Ok(RefundDecision::Reject(RefundRejection::MissingStripeRef));
    };

    match job.payment_status {
        PaymentStatus::Refunded => Ok(RefundDecision::AlreadyRefunded),
        PaymentStatus::Funded => Ok(RefundDecision::Proceed {
            reference: reference.to_string(),
        }),
        PaymentStatus::Unfunded | PaymentStatus::Failed => {
            Ok(RefundDecision::Reject(RefundRejection::NotFunded))
        }
    }
}
