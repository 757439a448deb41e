//! Refunds of held job escrow
//!
//! [`RefundService::refund_job`] is the operator path: guard, processor
//! refund, ledger. [`apply_charge_refunded`] is the event path that
//! mirrors a refund issued outside this service.

pub mod guard;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::EscrowError;
use crate::escrow::{EscrowStatus, JobFinancials, PaymentStatus, PayoutStatus};
use crate::ledger::{Bucket, Direction, EntryType, NewLedgerEntry};
use crate::processor::{PaymentProcessor, RefundRequest};
use crate::store::{EscrowStore, StoreTx};
use crate::webhook::event::ChargeObject;

pub use guard::{RefundDecision, RefundRejection, evaluate};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RefundOutcome {
    Refunded {
        refund_id: String,
        amount_cents: i64,
    },
    AlreadyRefunded,
    Rejected {
        code: RefundRejection,
    },
}

pub fn refund_idempotency_key(job_id: Uuid) -> String {
    format!("refund-job-{}", job_id)
}

pub struct RefundService {
    store: Arc<dyn EscrowStore>,
    processor: Arc<dyn PaymentProcessor>,
}

impl RefundService {
    pub fn new(store: Arc<dyn EscrowStore>, processor: Arc<dyn PaymentProcessor>) -> Self {
        Self { store, processor }
    }

    /// Refund a job's full escrow back to the poster
    pub async fn refund_job(&self, job_id: Uuid) -> Result<RefundOutcome, EscrowError> {
        let mut tx = self.store.begin().await?;

        let Some(job) = tx.lock_job(job_id).await? else {
            return Ok(RefundOutcome::Rejected {
                code: RefundRejection::NotFound,
            });
        };

        let reference = match guard::evaluate(tx.as_mut(), &job).await? {
            RefundDecision::Proceed { reference } => reference,
            RefundDecision::AlreadyRefunded => return Ok(RefundOutcome::AlreadyRefunded),
            RefundDecision::Reject(code) => {
                warn!(job_id = %job.id, code = code.code(), "Refund rejected");
                return Ok(RefundOutcome::Rejected { code });
            }
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("jobId".to_string(), job.id.to_string());
        metadata.insert("reason".to_string(), "job_refund".to_string());

        let refund = self
            .processor
            .create_refund(&RefundRequest {
                reference,
                amount_cents: None,
                idempotency_key: refund_idempotency_key(job.id),
                metadata,
            })
            .await?;

        record_refund(tx.as_mut(), &job, &refund.id, Utc::now()).await?;
        tx.commit().await?;

        info!(
            job_id = %job.id,
            refund_id = %refund.id,
            amount_cents = job.amount_cents,
            processor = self.processor.name(),
            "Job escrow refunded"
        );
        Ok(RefundOutcome::Refunded {
            refund_id: refund.id,
            amount_cents: job.amount_cents,
        })
    }
}

/// Ledger and status writes shared by both refund paths.
///
/// The ESCROW_REFUND entry is skipped when the escrow already has one, so
/// the operator path and the refund event converge on one entry.
pub async fn record_refund(
    tx: &mut dyn StoreTx,
    job: &JobFinancials,
    refund_ref: &str,
    at: DateTime<Utc>,
) -> Result<(), EscrowError> {
    let escrow = tx.lock_escrow_for(job.id, None).await?;

    let already_recorded = match &escrow {
        Some(e) => tx.ledger_entry_exists(e.id, EntryType::EscrowRefund).await?,
        None => false,
    };

    if !already_recorded {
        let amount_cents = escrow.as_ref().map_or(job.amount_cents, |e| e.amount_cents);
        let mut entry = NewLedgerEntry::new(
            job.poster_id,
            EntryType::EscrowRefund,
            Direction::Credit,
            Bucket::Paid,
            amount_cents,
            job.currency,
        )
        .job(job.id)
        .external_ref(refund_ref)
        .memo("job escrow refunded");
        if let Some(e) = &escrow {
            entry = entry.escrow(e.id);
        }
        tx.insert_ledger_entry(entry).await?;
    }

    tx.mark_job_refunded(job.id, refund_ref, at).await?;

    if let Some(e) = escrow
        && e.status == EscrowStatus::Funded
    {
        tx.close_escrow(e.id, EscrowStatus::Refunded, at).await?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeRefundOutcome {
    Recorded,
    AlreadyRefunded,
    UnknownJob,
}

/// Mirror a `charge refunded` event onto the job and its escrow
pub async fn apply_charge_refunded(
    tx: &mut dyn StoreTx,
    charge: &ChargeObject,
) -> Result<ChargeRefundOutcome, EscrowError> {
    let job_id = match charge
        .metadata
        .job_id
        .as_deref()
        .and_then(|s| Uuid::parse_str(s).ok())
    {
        Some(id) => Some(id),
        None => match charge.payment_intent.as_deref() {
            Some(pi) => tx.find_escrow_by_payment_ref(pi).await?.map(|e| e.job_id),
            None => None,
        },
    };

    let Some(job_id) = job_id else {
        warn!(charge = %charge.id, "Refund event with no resolvable job");
        return Ok(ChargeRefundOutcome::UnknownJob);
    };
    let Some(job) = tx.lock_job(job_id).await? else {
        warn!(charge = %charge.id, job_id = %job_id, "Refund event for unknown job");
        return Ok(ChargeRefundOutcome::UnknownJob);
    };

    if job.payment_status == PaymentStatus::Refunded {
        return Ok(ChargeRefundOutcome::AlreadyRefunded);
    }
    if job.payout_status == PayoutStatus::Released {
        // Money already moved out; record anyway so the auditor flags it.
        error!(
            job_id = %job.id,
            charge = %charge.id,
            "CRITICAL: processor refunded a released job"
        );
    }

    record_refund(tx, &job, &charge.refund_reference(), Utc::now()).await?;
    info!(job_id = %job.id, charge = %charge.id, "Processor refund recorded");
    Ok(ChargeRefundOutcome::Recorded)
}
