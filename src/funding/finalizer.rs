//! Funding Finalizer
//!
//! Turns a captured payment into a funded escrow plus one held-funds
//! ledger debit. Keyed by the processor payment reference, so two
//! different events describing the same capture fund once.
//!
//! Runs inside the caller's transaction (the webhook gate's), which owns
//! commit and rollback.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EscrowError;
use crate::escrow::{
    EscrowKind, InsertOutcome, NewEscrow, PaymentStatus, PmRequestStatus,
};
use crate::ids::EscrowId;
use crate::ledger::{Bucket, Direction, EntryType, NewLedgerEntry};
use crate::money::Currency;
use crate::store::StoreTx;
use crate::webhook::event::{PaymentIntentObject, PaymentMetadata};

const SUCCEEDED: &str = "succeeded";

/// Why a capture event did not fund anything
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FundingRejection {
    InvalidMetadata { reason: String },
    NotFound { entity: String },
    AmountMismatch { expected_cents: i64, captured_cents: i64 },
    PiNotSucceeded { status: String },
}

impl FundingRejection {
    pub fn code(&self) -> &'static str {
        match self {
            FundingRejection::InvalidMetadata { .. } => "INVALID_METADATA",
            FundingRejection::NotFound { .. } => "NOT_FOUND",
            FundingRejection::AmountMismatch { .. } => "AMOUNT_MISMATCH",
            FundingRejection::PiNotSucceeded { .. } => "PI_NOT_SUCCEEDED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FundingOutcome {
    Funded { escrow_id: EscrowId, idempotent: bool },
    Rejected(FundingRejection),
}

/// Owning entity named by payment metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingTarget {
    Job {
        job_id: Uuid,
        poster_id: Uuid,
    },
    PmRequest {
        pm_request_id: Uuid,
        job_id: Uuid,
        poster_id: Uuid,
    },
}

impl FundingTarget {
    pub fn job_id(&self) -> Uuid {
        match self {
            FundingTarget::Job { job_id, .. } | FundingTarget::PmRequest { job_id, .. } => *job_id,
        }
    }
}

fn required_uuid(value: Option<&str>, field: &str) -> Result<Uuid, FundingRejection> {
    let raw = value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| FundingRejection::InvalidMetadata {
            reason: format!("missing {}", field),
        })?;
    raw.parse().map_err(|_| FundingRejection::InvalidMetadata {
        reason: format!("malformed {}", field),
    })
}

/// Resolve the owner from metadata alone
pub fn resolve_target(meta: &PaymentMetadata) -> Result<FundingTarget, FundingRejection> {
    match meta.kind.as_deref() {
        Some("job_escrow") => Ok(FundingTarget::Job {
            job_id: required_uuid(meta.job_id.as_deref(), "jobId")?,
            poster_id: required_uuid(meta.poster_id.as_deref(), "posterId")?,
        }),
        Some("pm_escrow") => Ok(FundingTarget::PmRequest {
            pm_request_id: required_uuid(meta.pm_request_id.as_deref(), "pmRequestId")?,
            job_id: required_uuid(meta.job_id.as_deref(), "jobId")?,
            poster_id: required_uuid(meta.poster_id.as_deref(), "posterId")?,
        }),
        other => Err(FundingRejection::InvalidMetadata {
            reason: format!("unknown escrow type {:?}", other),
        }),
    }
}

/// What the owning row expects to be captured
struct Expectation {
    kind: EscrowKind,
    pm_request_id: Option<Uuid>,
    amount_cents: i64,
    currency: Currency,
    already_funded: bool,
}

async fn load_expectation(
    tx: &mut dyn StoreTx,
    target: FundingTarget,
) -> Result<Result<Expectation, FundingRejection>, EscrowError> {
    match target {
        FundingTarget::Job { job_id, poster_id } => {
            let Some(job) = tx.lock_job(job_id).await? else {
                return Ok(Err(FundingRejection::NotFound {
                    entity: format!("job {}", job_id),
                }));
            };
            if job.poster_id != poster_id {
                return Ok(Err(FundingRejection::InvalidMetadata {
                    reason: "posterId does not own job".to_string(),
                }));
            }
            Ok(Ok(Expectation {
                kind: EscrowKind::JobEscrow,
                pm_request_id: None,
                amount_cents: job.amount_cents,
                currency: job.currency,
                already_funded: job.payment_status == PaymentStatus::Funded,
            }))
        }
        FundingTarget::PmRequest {
            pm_request_id,
            job_id,
            poster_id,
        } => {
            let Some(pm) = tx.lock_pm_request(pm_request_id).await? else {
                return Ok(Err(FundingRejection::NotFound {
                    entity: format!("pm request {}", pm_request_id),
                }));
            };
            if pm.job_id != job_id || pm.poster_id != poster_id {
                return Ok(Err(FundingRejection::InvalidMetadata {
                    reason: "jobId/posterId do not match pm request".to_string(),
                }));
            }
            Ok(Ok(Expectation {
                kind: EscrowKind::PartsMaterials,
                pm_request_id: Some(pm_request_id),
                amount_cents: pm.approved_total_cents,
                currency: pm.currency,
                already_funded: pm.status.is_funded(),
            }))
        }
    }
}

/// Apply a `payment succeeded` capture.
pub async fn finalize_payment(
    tx: &mut dyn StoreTx,
    pi: &PaymentIntentObject,
) -> Result<FundingOutcome, EscrowError> {
    let target = match resolve_target(&pi.metadata) {
        Ok(target) => target,
        Err(rejection) => {
            warn!(payment_intent = %pi.id, reason = ?rejection, "Capture rejected");
            return Ok(FundingOutcome::Rejected(rejection));
        }
    };

    let expected = match load_expectation(tx, target).await? {
        Ok(expected) => expected,
        Err(rejection) => {
            warn!(payment_intent = %pi.id, reason = ?rejection, "Capture rejected");
            return Ok(FundingOutcome::Rejected(rejection));
        }
    };

    // Never auto-corrected: a currency mismatch is an amount mismatch.
    let captured = pi.captured_cents();
    let same_currency = pi.currency.parse::<Currency>().ok() == Some(expected.currency);
    if captured != expected.amount_cents || !same_currency {
        warn!(
            payment_intent = %pi.id,
            expected_cents = expected.amount_cents,
            captured_cents = captured,
            currency = %pi.currency,
            "AMOUNT_MISMATCH: capture does not match stored amount"
        );
        return Ok(FundingOutcome::Rejected(FundingRejection::AmountMismatch {
            expected_cents: expected.amount_cents,
            captured_cents: captured,
        }));
    }

    if pi.status != SUCCEEDED {
        return Ok(FundingOutcome::Rejected(FundingRejection::PiNotSucceeded {
            status: pi.status.clone(),
        }));
    }

    // One escrow per payment reference: once it exists, any later event
    // for the same capture is a no-op whatever the owner has become since.
    if let Some(escrow) = tx.find_escrow_by_payment_ref(&pi.id).await? {
        if expected.already_funded {
            info!(
                payment_intent = %pi.id,
                escrow_id = %escrow.id,
                "Capture already finalized (idempotent)"
            );
        } else {
            warn!(
                payment_intent = %pi.id,
                escrow_id = %escrow.id,
                escrow_status = %escrow.status,
                "Capture already recorded; owner no longer funded, leaving it untouched"
            );
        }
        return Ok(FundingOutcome::Funded {
            escrow_id: escrow.id,
            idempotent: true,
        });
    }

    let new = NewEscrow {
        job_id: target.job_id(),
        pm_request_id: expected.pm_request_id,
        kind: expected.kind,
        amount_cents: captured,
        currency: expected.currency,
        payment_intent_ref: pi.id.clone(),
    };
    let escrow = match tx.insert_escrow(new).await? {
        InsertOutcome::Inserted(escrow) => escrow,
        InsertOutcome::Conflict => {
            // A concurrent delivery of the same capture won the insert.
            let escrow = tx
                .find_escrow_by_payment_ref(&pi.id)
                .await?
                .ok_or_else(|| {
                    EscrowError::Internal(format!(
                        "escrow for {} vanished after unique conflict",
                        pi.id
                    ))
                })?;
            info!(
                payment_intent = %pi.id,
                escrow_id = %escrow.id,
                "Capture finalized concurrently (idempotent)"
            );
            return Ok(FundingOutcome::Funded {
                escrow_id: escrow.id,
                idempotent: true,
            });
        }
    };

    let now = Utc::now();
    let (entry_type, poster_id) = match target {
        FundingTarget::Job { job_id, poster_id } => {
            let moved = tx
                .mark_job_funded(job_id, &pi.id, pi.latest_charge.as_deref())
                .await?;
            if !moved {
                warn!(
                    job_id = %job_id,
                    payment_intent = %pi.id,
                    "Capture for a job not awaiting funding; escrow recorded, job untouched"
                );
            }
            (EntryType::EscrowFund, poster_id)
        }
        FundingTarget::PmRequest {
            pm_request_id,
            poster_id,
            ..
        } => {
            if !expected.already_funded {
                tx.set_pm_request_status(pm_request_id, PmRequestStatus::Funded, now)
                    .await?;
            }
            (EntryType::PmEscrowFunded, poster_id)
        }
    };

    if !tx.ledger_entry_exists(escrow.id, entry_type).await? {
        tx.insert_ledger_entry(
            NewLedgerEntry::new(
                poster_id,
                entry_type,
                Direction::Debit,
                Bucket::Held,
                escrow.amount_cents,
                escrow.currency,
            )
            .job(target.job_id())
            .escrow(escrow.id)
            .external_ref(pi.id.clone())
            .memo("escrow funded"),
        )
        .await?;
    }

    info!(
        payment_intent = %pi.id,
        escrow_id = %escrow.id,
        job_id = %target.job_id(),
        amount_cents = escrow.amount_cents,
        "Escrow funded"
    );

    Ok(FundingOutcome::Funded {
        escrow_id: escrow.id,
        idempotent: false,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentFailureOutcome {
    MarkedFailed,
    Unchanged,
}

/// Apply a `payment failed` / `payment canceled` event.
///
/// Only an UNFUNDED job moves to FAILED; a funded job is never
/// downgraded. Parts/materials requests stay APPROVED so the poster can
/// retry.
pub async fn record_payment_failure(
    tx: &mut dyn StoreTx,
    pi: &PaymentIntentObject,
) -> Result<PaymentFailureOutcome, EscrowError> {
    let Ok(FundingTarget::Job { job_id, .. }) = resolve_target(&pi.metadata) else {
        return Ok(PaymentFailureOutcome::Unchanged);
    };

    if tx.lock_job(job_id).await?.is_none() {
        warn!(job_id = %job_id, payment_intent = %pi.id, "Payment failure for unknown job");
        return Ok(PaymentFailureOutcome::Unchanged);
    }

    if tx.mark_job_payment_failed(job_id).await? {
        info!(job_id = %job_id, payment_intent = %pi.id, "Job payment failed");
        Ok(PaymentFailureOutcome::MarkedFailed)
    } else {
        Ok(PaymentFailureOutcome::Unchanged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(kind: &str, job: Option<Uuid>, pm: Option<Uuid>, poster: Option<Uuid>) -> PaymentMetadata {
        PaymentMetadata {
            kind: Some(kind.to_string()),
            job_id: job.map(|u| u.to_string()),
            pm_request_id: pm.map(|u| u.to_string()),
            poster_id: poster.map(|u| u.to_string()),
        }
    }

    #[test]
    fn test_resolve_job_target() {
        let (job, poster) = (Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(
            resolve_target(&meta("job_escrow", Some(job), None, Some(poster))),
            Ok(FundingTarget::Job {
                job_id: job,
                poster_id: poster
            })
        );
    }

    #[test]
    fn test_resolve_pm_target_requires_pm_id() {
        let rejection =
            resolve_target(&meta("pm_escrow", Some(Uuid::new_v4()), None, Some(Uuid::new_v4())))
                .unwrap_err();
        assert_eq!(rejection.code(), "INVALID_METADATA");
    }

    #[test]
    fn test_resolve_rejects_unknown_kind_and_bad_uuid() {
        assert!(resolve_target(&PaymentMetadata::default()).is_err());

        let mut bad = meta("job_escrow", None, None, Some(Uuid::new_v4()));
        bad.job_id = Some("not-a-uuid".to_string());
        assert_eq!(
            resolve_target(&bad),
            Err(FundingRejection::InvalidMetadata {
                reason: "malformed jobId".to_string()
            })
        );
    }

    #[test]
    fn test_rejection_codes() {
        assert_eq!(
            FundingRejection::AmountMismatch {
                expected_cents: 1,
                captured_cents: 2
            }
            .code(),
            "AMOUNT_MISMATCH"
        );
        assert_eq!(
            FundingRejection::PiNotSucceeded {
                status: "processing".into()
            }
            .code(),
            "PI_NOT_SUCCEEDED"
        );
    }
}
