//! Release Engine
//!
//! Moves held funds to recipients once the releasing party signs off.
//! Every precondition is a named rejection; a second release of the same
//! request is a successful no-op flagged `already_released`.
//!
//! All writes, and the processor refund for a large remainder, happen in
//! one transaction. A processor failure drops the transaction, so the
//! escrow stays FUNDED and the release can be retried.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::split::{JobSplit, RemainderDisposition, job_split, pm_split, remainder_disposition};
use crate::actor::Actor;
use crate::config::EscrowConfig;
use crate::error::EscrowError;
use crate::escrow::{
    Escrow, EscrowStatus, JobFinancials, JobStatus, PaymentStatus, PayoutStatus, PmRequest,
    PmRequestStatus,
};
use crate::ledger::{Bucket, Direction, EntryType, NewLedgerEntry};
use crate::processor::{PaymentProcessor, RefundRequest};
use crate::store::{EscrowStore, NewWalletCredit, StoreTx};
use crate::transfer::{NewTransferRecord, PayoutMethod, TransferRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseRejection {
    NotFound,
    InvalidStatus,
    Forbidden,
    EscrowMissing,
}

impl ReleaseRejection {
    pub fn code(&self) -> &'static str {
        match self {
            ReleaseRejection::NotFound => "NOT_FOUND",
            ReleaseRejection::InvalidStatus => "INVALID_STATUS",
            ReleaseRejection::Forbidden => "FORBIDDEN",
            ReleaseRejection::EscrowMissing => "ESCROW_MISSING",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseSummary {
    pub already_released: bool,
    pub release_amount_cents: i64,
    pub remainder_cents: i64,
    pub disposition: RemainderDisposition,
    /// Payout legs created by this call
    pub legs_created: usize,
}

impl ReleaseSummary {
    fn already_released() -> Self {
        Self {
            already_released: true,
            release_amount_cents: 0,
            remainder_cents: 0,
            disposition: RemainderDisposition::None,
            legs_created: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Released(ReleaseSummary),
    Rejected { code: ReleaseRejection },
}

impl ReleaseOutcome {
    fn reject(code: ReleaseRejection) -> Self {
        ReleaseOutcome::Rejected { code }
    }
}

pub fn remainder_refund_key(pm_request_id: Uuid) -> String {
    format!("pm-{}-remainder-refund", pm_request_id)
}

pub struct ReleaseEngine {
    store: Arc<dyn EscrowStore>,
    processor: Arc<dyn PaymentProcessor>,
    config: EscrowConfig,
}

impl ReleaseEngine {
    pub fn new(
        store: Arc<dyn EscrowStore>,
        processor: Arc<dyn PaymentProcessor>,
        config: EscrowConfig,
    ) -> Self {
        Self {
            store,
            processor,
            config,
        }
    }

    // ========================================================================
    // Parts / materials release
    // ========================================================================

    /// Release a verified parts/materials request to the contractor
    pub async fn release_pm_request(
        &self,
        pm_request_id: Uuid,
        actor: Actor,
    ) -> Result<ReleaseOutcome, EscrowError> {
        let mut tx = self.store.begin().await?;

        let Some(pm) = tx.lock_pm_request(pm_request_id).await? else {
            return Ok(ReleaseOutcome::reject(ReleaseRejection::NotFound));
        };

        if matches!(pm.status, PmRequestStatus::Released | PmRequestStatus::Closed) {
            return Ok(ReleaseOutcome::Released(ReleaseSummary::already_released()));
        }
        if pm.status != PmRequestStatus::Verified {
            return Ok(ReleaseOutcome::reject(ReleaseRejection::InvalidStatus));
        }
        if !actor.may_act_for(pm.poster_id) {
            warn!(pm_request_id = %pm.id, actor = %actor.user_id, "Release forbidden");
            return Ok(ReleaseOutcome::reject(ReleaseRejection::Forbidden));
        }

        let Some(escrow) = tx.lock_escrow_for(pm.job_id, Some(pm.id)).await? else {
            return Ok(ReleaseOutcome::reject(ReleaseRejection::EscrowMissing));
        };

        match escrow.status {
            EscrowStatus::Released => {
                // Escrow moved but the request did not: converge the request.
                let now = Utc::now();
                tx.set_pm_request_status(pm.id, PmRequestStatus::Released, now)
                    .await?;
                tx.set_pm_request_status(pm.id, PmRequestStatus::Closed, now)
                    .await?;
                tx.commit().await?;
                info!(pm_request_id = %pm.id, "Escrow already released (idempotent)");
                return Ok(ReleaseOutcome::Released(ReleaseSummary::already_released()));
            }
            EscrowStatus::Refunded => {
                return Ok(ReleaseOutcome::reject(ReleaseRejection::InvalidStatus));
            }
            EscrowStatus::Funded => {}
        }

        let Some(verified) = pm.verified_receipt_total_cents else {
            return Ok(ReleaseOutcome::reject(ReleaseRejection::InvalidStatus));
        };

        let summary = self
            .apply_pm_release(tx.as_mut(), &pm, &escrow, verified)
            .await?;
        tx.commit().await?;

        info!(
            pm_request_id = %pm.id,
            job_id = %pm.job_id,
            release_amount_cents = summary.release_amount_cents,
            remainder_cents = summary.remainder_cents,
            disposition = ?summary.disposition,
            "Parts/materials escrow released"
        );
        Ok(ReleaseOutcome::Released(summary))
    }

    async fn apply_pm_release(
        &self,
        tx: &mut dyn StoreTx,
        pm: &PmRequest,
        escrow: &Escrow,
        verified_cents: i64,
    ) -> Result<ReleaseSummary, EscrowError> {
        let now = Utc::now();
        let split = pm_split(pm.approved_total_cents, verified_cents);

        if !tx.close_escrow(escrow.id, EscrowStatus::Released, now).await? {
            return Ok(ReleaseSummary::already_released());
        }

        tx.insert_ledger_entry(
            NewLedgerEntry::new(
                pm.contractor_id,
                EntryType::PmRelease,
                Direction::Credit,
                Bucket::Pending,
                split.release_amount_cents,
                pm.currency,
            )
            .job(pm.job_id)
            .escrow(escrow.id)
            .memo("parts/materials release"),
        )
        .await?;

        let mut legs_created = 0;
        if split.release_amount_cents > 0
            && tx
                .find_transfer(pm.job_id, Some(pm.id), TransferRole::Contractor)
                .await?
                .is_none()
        {
            tx.insert_transfer(NewTransferRecord {
                job_id: pm.job_id,
                pm_request_id: Some(pm.id),
                role: TransferRole::Contractor,
                user_id: pm.contractor_id,
                amount_cents: split.release_amount_cents,
                currency: pm.currency,
                method: PayoutMethod::Stripe,
            })
            .await?;
            legs_created += 1;
        }

        let refund_reference = Some(escrow.payment_intent_ref.as_str()).filter(|r| !r.is_empty());
        let disposition = remainder_disposition(
            split.remainder_cents,
            self.config.wallet_credit_threshold(pm.currency),
            refund_reference.is_some(),
        );

        match (disposition, refund_reference) {
            (RemainderDisposition::None, _) => {}
            (RemainderDisposition::ProcessorRefund, Some(reference)) => {
                let mut metadata = BTreeMap::new();
                metadata.insert("pmRequestId".to_string(), pm.id.to_string());
                metadata.insert("reason".to_string(), "pm_remainder".to_string());

                let refund = self
                    .processor
                    .create_refund(&RefundRequest {
                        reference: reference.to_string(),
                        amount_cents: Some(split.remainder_cents),
                        idempotency_key: remainder_refund_key(pm.id),
                        metadata,
                    })
                    .await?;

                tx.insert_ledger_entry(
                    NewLedgerEntry::new(
                        pm.poster_id,
                        EntryType::PmRefund,
                        Direction::Credit,
                        Bucket::Paid,
                        split.remainder_cents,
                        pm.currency,
                    )
                    .job(pm.job_id)
                    .escrow(escrow.id)
                    .external_ref(refund.id)
                    .memo("parts/materials remainder refunded"),
                )
                .await?;
            }
            (RemainderDisposition::WalletCredit, _) | (RemainderDisposition::ProcessorRefund, None) => {
                tx.insert_ledger_entry(
                    NewLedgerEntry::new(
                        pm.poster_id,
                        EntryType::PmCredit,
                        Direction::Credit,
                        Bucket::Available,
                        split.remainder_cents,
                        pm.currency,
                    )
                    .job(pm.job_id)
                    .escrow(escrow.id)
                    .memo("parts/materials remainder credited"),
                )
                .await?;
                tx.insert_wallet_credit(NewWalletCredit {
                    user_id: pm.poster_id,
                    job_id: pm.job_id,
                    pm_request_id: Some(pm.id),
                    amount_cents: split.remainder_cents,
                    currency: pm.currency,
                    reason: "PM_REMAINDER".to_string(),
                })
                .await?;
            }
        }

        tx.set_pm_request_status(pm.id, PmRequestStatus::Released, now)
            .await?;
        tx.set_pm_request_status(pm.id, PmRequestStatus::Closed, now)
            .await?;

        Ok(ReleaseSummary {
            already_released: false,
            release_amount_cents: split.release_amount_cents,
            remainder_cents: split.remainder_cents,
            disposition,
            legs_created,
        })
    }

    // ========================================================================
    // Job release
    // ========================================================================

    /// Release a completed job's escrow to contractor, router and platform
    pub async fn release_job(&self, job_id: Uuid, actor: Actor) -> Result<ReleaseOutcome, EscrowError> {
        let mut tx = self.store.begin().await?;

        let Some(job) = tx.lock_job(job_id).await? else {
            return Ok(ReleaseOutcome::reject(ReleaseRejection::NotFound));
        };

        if job.payout_status == PayoutStatus::Released {
            return Ok(ReleaseOutcome::Released(ReleaseSummary::already_released()));
        }
        if job.status != JobStatus::Completed || job.payment_status != PaymentStatus::Funded {
            return Ok(ReleaseOutcome::reject(ReleaseRejection::InvalidStatus));
        }
        if !actor.may_act_for(job.poster_id) {
            warn!(job_id = %job.id, actor = %actor.user_id, "Release forbidden");
            return Ok(ReleaseOutcome::reject(ReleaseRejection::Forbidden));
        }

        let Some(escrow) = tx.lock_escrow_for(job.id, None).await? else {
            return Ok(ReleaseOutcome::reject(ReleaseRejection::EscrowMissing));
        };

        match escrow.status {
            EscrowStatus::Released => {
                tx.mark_job_payout_released(job.id, escrow.released_at.unwrap_or_else(Utc::now))
                    .await?;
                tx.commit().await?;
                info!(job_id = %job.id, "Escrow already released (idempotent)");
                return Ok(ReleaseOutcome::Released(ReleaseSummary::already_released()));
            }
            EscrowStatus::Refunded => {
                return Ok(ReleaseOutcome::reject(ReleaseRejection::InvalidStatus));
            }
            EscrowStatus::Funded => {}
        }

        let Some(contractor_id) = job.contractor_id else {
            return Ok(ReleaseOutcome::reject(ReleaseRejection::InvalidStatus));
        };

        let split = job_split(
            escrow.amount_cents,
            self.config.platform_fee_bps,
            self.config.router_fee_bps,
            job.router_id.is_some(),
        );

        let summary = self
            .apply_job_release(tx.as_mut(), &job, &escrow, contractor_id, split)
            .await?;
        tx.commit().await?;

        info!(
            job_id = %job.id,
            escrow_id = %escrow.id,
            contractor_cents = split.contractor_cents,
            router_cents = split.router_cents,
            platform_cents = split.platform_cents,
            "Job escrow released"
        );
        Ok(ReleaseOutcome::Released(summary))
    }

    async fn apply_job_release(
        &self,
        tx: &mut dyn StoreTx,
        job: &JobFinancials,
        escrow: &Escrow,
        contractor_id: Uuid,
        split: JobSplit,
    ) -> Result<ReleaseSummary, EscrowError> {
        let now = Utc::now();

        if !tx.close_escrow(escrow.id, EscrowStatus::Released, now).await? {
            return Ok(ReleaseSummary::already_released());
        }

        tx.insert_ledger_entry(
            NewLedgerEntry::new(
                job.poster_id,
                EntryType::EscrowRelease,
                Direction::Credit,
                Bucket::Held,
                escrow.amount_cents,
                escrow.currency,
            )
            .job(job.id)
            .escrow(escrow.id)
            .memo("job escrow released"),
        )
        .await?;

        let mut legs = vec![(
            TransferRole::Contractor,
            contractor_id,
            split.contractor_cents,
            EntryType::ContractorEarn,
        )];
        if let Some(router_id) = job.router_id {
            legs.push((
                TransferRole::Router,
                router_id,
                split.router_cents,
                EntryType::RouterEarn,
            ));
        }
        legs.push((
            TransferRole::Platform,
            self.config.platform_user_id,
            split.platform_cents,
            EntryType::PlatformFee,
        ));

        let mut legs_created = 0;
        for (role, user_id, amount_cents, entry_type) in legs {
            if amount_cents <= 0 {
                continue;
            }

            tx.insert_ledger_entry(
                NewLedgerEntry::new(
                    user_id,
                    entry_type,
                    Direction::Credit,
                    Bucket::Pending,
                    amount_cents,
                    escrow.currency,
                )
                .job(job.id)
                .escrow(escrow.id),
            )
            .await?;

            if tx.find_transfer(job.id, None, role).await?.is_some() {
                continue;
            }
            tx.insert_transfer(NewTransferRecord {
                job_id: job.id,
                pm_request_id: None,
                role,
                user_id,
                amount_cents,
                currency: escrow.currency,
                method: PayoutMethod::Stripe,
            })
            .await?;
            legs_created += 1;
        }

        tx.mark_job_payout_released(job.id, now).await?;

        Ok(ReleaseSummary {
            already_released: false,
            release_amount_cents: escrow.amount_cents,
            remainder_cents: 0,
            disposition: RemainderDisposition::None,
            legs_created,
        })
    }
}
