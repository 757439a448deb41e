//! In-memory store
//!
//! Used for local development when no `postgres_url` is configured and by
//! the flow tests. A transaction holds the state mutex for its whole
//! lifetime and works on a copy, so transactions are fully serialized and
//! a dropped transaction leaves the committed state untouched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{EscrowStore, NewWalletCredit, StoreTx};
use crate::error::EscrowError;
use crate::escrow::{
    DisputeCase, Escrow, EscrowStatus, InsertOutcome, JobFinancials, JobStatus, NewEscrow,
    NewJob, PaymentStatus, PayoutStatus, PmRequest, PmRequestStatus, WalletCredit,
};
use crate::ids::{EscrowId, LedgerEntryId, TransferRecordId, WalletCreditId};
use crate::ledger::{EntryType, LedgerEntry, NewLedgerEntry};
use crate::money::Currency;
use crate::transfer::{NewTransferRecord, TransferRecord, TransferRole, TransferStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub event_type: String,
    pub object_id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Committed contents of the store
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub jobs: HashMap<Uuid, JobFinancials>,
    pub pm_requests: HashMap<Uuid, PmRequest>,
    pub disputes: Vec<DisputeCase>,
    pub escrows: Vec<Escrow>,
    pub transfers: Vec<TransferRecord>,
    pub ledger: Vec<LedgerEntry>,
    pub webhook_events: HashMap<String, WebhookEventRecord>,
    pub wallet_credits: Vec<WalletCredit>,
}

/// Query counters, for asserting which reads a flow performed
#[derive(Debug, Default)]
pub struct StoreCounters {
    pub dispute_lookups: AtomicUsize,
    pub commits: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MemoryEscrowStore {
    state: Arc<Mutex<MemoryState>>,
    counters: Arc<StoreCounters>,
}

impl MemoryEscrowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> &StoreCounters {
        &self.counters
    }

    pub fn dispute_lookups(&self) -> usize {
        self.counters.dispute_lookups.load(Ordering::SeqCst)
    }

    /// Mutate committed state directly (fixtures)
    pub async fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut state = self.state.lock().await;
        f(&mut state)
    }

    /// Copy of the committed state
    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl EscrowStore for MemoryEscrowStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, EscrowError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            working,
            counters: self.counters.clone(),
        }))
    }

    async fn released_jobs(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<JobFinancials>, EscrowError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<JobFinancials> = state
            .jobs
            .values()
            .filter(|j| j.payout_status == PayoutStatus::Released)
            .filter(|j| match j.released_at {
                Some(at) => from.is_none_or(|f| at >= f) && to.is_none_or(|t| at < t),
                None => false,
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.released_at);
        Ok(jobs)
    }

    async fn escrows_for_job(&self, job_id: Uuid) -> Result<Vec<Escrow>, EscrowError> {
        let state = self.state.lock().await;
        Ok(state
            .escrows
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn transfers_for_job(&self, job_id: Uuid) -> Result<Vec<TransferRecord>, EscrowError> {
        let state = self.state.lock().await;
        Ok(state
            .transfers
            .iter()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn ledger_for_job(&self, job_id: Uuid) -> Result<Vec<LedgerEntry>, EscrowError> {
        let state = self.state.lock().await;
        Ok(state
            .ledger
            .iter()
            .filter(|e| e.job_id == Some(job_id))
            .cloned()
            .collect())
    }

    async fn transfers_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<TransferRecord>, EscrowError> {
        let state = self.state.lock().await;
        let mut transfers: Vec<TransferRecord> = state
            .transfers
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        transfers.sort_by_key(|t| std::cmp::Reverse(t.created_at));
        Ok(transfers)
    }

    async fn ledger_for_user(&self, user_id: Uuid) -> Result<Vec<LedgerEntry>, EscrowError> {
        let state = self.state.lock().await;
        Ok(state
            .ledger
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn ledger_between(
        &self,
        currency: Currency,
        from: Option<DateTime<Utc>>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, EscrowError> {
        let state = self.state.lock().await;
        Ok(state
            .ledger
            .iter()
            .filter(|e| e.currency == currency)
            .filter(|e| from.is_none_or(|f| e.created_at >= f) && e.created_at < to)
            .cloned()
            .collect())
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    counters: Arc<StoreCounters>,
}

impl MemoryTx {
    fn job_mut(&mut self, job_id: Uuid) -> Result<&mut JobFinancials, EscrowError> {
        self.working
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| EscrowError::NotFound(format!("job {}", job_id)))
    }

    fn transfer_mut(&mut self, id: TransferRecordId) -> Option<&mut TransferRecord> {
        self.working.transfers.iter_mut().find(|t| t.id == id)
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn insert_webhook_event(
        &mut self,
        event_id: &str,
        event_type: &str,
        object_id: Option<&str>,
    ) -> Result<bool, EscrowError> {
        if self.working.webhook_events.contains_key(event_id) {
            return Ok(false);
        }
        self.working.webhook_events.insert(
            event_id.to_string(),
            WebhookEventRecord {
                event_id: event_id.to_string(),
                event_type: event_type.to_string(),
                object_id: object_id.map(str::to_string),
                received_at: Utc::now(),
                processed_at: None,
            },
        );
        Ok(true)
    }

    async fn claim_webhook_event(&mut self, event_id: &str) -> Result<bool, EscrowError> {
        match self.working.webhook_events.get_mut(event_id) {
            Some(row) if row.processed_at.is_none() => {
                row.processed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn lock_job(&mut self, job_id: Uuid) -> Result<Option<JobFinancials>, EscrowError> {
        Ok(self.working.jobs.get(&job_id).cloned())
    }

    async fn claim_job_for_draft(&mut self, job: NewJob) -> Result<JobFinancials, EscrowError> {
        if let Some(existing) = self
            .working
            .jobs
            .values()
            .find(|j| j.draft_id == Some(job.draft_id))
        {
            return Ok(existing.clone());
        }

        let row = JobFinancials {
            id: Uuid::new_v4(),
            draft_id: Some(job.draft_id),
            poster_id: job.poster_id,
            contractor_id: None,
            router_id: None,
            status: JobStatus::Draft,
            payment_status: PaymentStatus::Unfunded,
            payout_status: PayoutStatus::Ready,
            amount_cents: job.amount_cents,
            currency: job.currency,
            stripe_payment_intent_id: None,
            stripe_charge_id: None,
            stripe_refund_id: None,
            released_at: None,
            refunded_at: None,
        };
        self.working.jobs.insert(row.id, row.clone());
        Ok(row)
    }

    async fn set_job_payment_intent(
        &mut self,
        job_id: Uuid,
        payment_intent_ref: &str,
    ) -> Result<(), EscrowError> {
        self.job_mut(job_id)?.stripe_payment_intent_id = Some(payment_intent_ref.to_string());
        Ok(())
    }

    async fn mark_job_funded(
        &mut self,
        job_id: Uuid,
        payment_intent_ref: &str,
        charge_ref: Option<&str>,
    ) -> Result<bool, EscrowError> {
        let job = self.job_mut(job_id)?;
        if !matches!(job.payment_status, PaymentStatus::Unfunded | PaymentStatus::Failed) {
            return Ok(false);
        }
        job.payment_status = PaymentStatus::Funded;
        job.stripe_payment_intent_id = Some(payment_intent_ref.to_string());
        if let Some(charge) = charge_ref {
            job.stripe_charge_id = Some(charge.to_string());
        }
        if job.status == JobStatus::Draft {
            job.status = JobStatus::Open;
        }
        Ok(true)
    }

    async fn mark_job_payment_failed(&mut self, job_id: Uuid) -> Result<bool, EscrowError> {
        let job = self.job_mut(job_id)?;
        if job.payment_status != PaymentStatus::Unfunded {
            return Ok(false);
        }
        job.payment_status = PaymentStatus::Failed;
        Ok(true)
    }

    async fn mark_job_refunded(
        &mut self,
        job_id: Uuid,
        refund_ref: &str,
        at: DateTime<Utc>,
    ) -> Result<(), EscrowError> {
        let job = self.job_mut(job_id)?;
        job.payment_status = PaymentStatus::Refunded;
        job.stripe_refund_id = Some(refund_ref.to_string());
        job.refunded_at = Some(at);
        Ok(())
    }

    async fn mark_job_payout_released(
        &mut self,
        job_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), EscrowError> {
        let job = self.job_mut(job_id)?;
        job.payout_status = PayoutStatus::Released;
        if job.released_at.is_none() {
            job.released_at = Some(at);
        }
        Ok(())
    }

    async fn has_resolved_dispute(&mut self, job_id: Uuid) -> Result<bool, EscrowError> {
        self.counters.dispute_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .working
            .disputes
            .iter()
            .any(|d| d.job_id == job_id && d.status.is_resolved()))
    }

    async fn lock_pm_request(&mut self, id: Uuid) -> Result<Option<PmRequest>, EscrowError> {
        Ok(self.working.pm_requests.get(&id).cloned())
    }

    async fn set_pm_request_status(
        &mut self,
        id: Uuid,
        status: PmRequestStatus,
        at: DateTime<Utc>,
    ) -> Result<(), EscrowError> {
        let pm = self
            .working
            .pm_requests
            .get_mut(&id)
            .ok_or_else(|| EscrowError::NotFound(format!("pm request {}", id)))?;
        pm.status = status;
        match status {
            PmRequestStatus::Funded => pm.funded_at = Some(at),
            PmRequestStatus::Released => pm.released_at = Some(at),
            PmRequestStatus::Closed => pm.closed_at = Some(at),
            _ => {}
        }
        Ok(())
    }

    async fn find_escrow_by_payment_ref(
        &mut self,
        payment_intent_ref: &str,
    ) -> Result<Option<Escrow>, EscrowError> {
        Ok(self
            .working
            .escrows
            .iter()
            .find(|e| e.payment_intent_ref == payment_intent_ref)
            .cloned())
    }

    async fn insert_escrow(
        &mut self,
        escrow: NewEscrow,
    ) -> Result<InsertOutcome<Escrow>, EscrowError> {
        if self
            .working
            .escrows
            .iter()
            .any(|e| e.payment_intent_ref == escrow.payment_intent_ref)
        {
            return Ok(InsertOutcome::Conflict);
        }
        let row = escrow.into_escrow(EscrowId::new(), Utc::now());
        self.working.escrows.push(row.clone());
        Ok(InsertOutcome::Inserted(row))
    }

    async fn lock_escrow_for(
        &mut self,
        job_id: Uuid,
        pm_request_id: Option<Uuid>,
    ) -> Result<Option<Escrow>, EscrowError> {
        Ok(self
            .working
            .escrows
            .iter()
            .find(|e| e.job_id == job_id && e.pm_request_id == pm_request_id)
            .cloned())
    }

    async fn close_escrow(
        &mut self,
        id: EscrowId,
        to: EscrowStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, EscrowError> {
        match self.working.escrows.iter_mut().find(|e| e.id == id) {
            Some(escrow) if escrow.status == EscrowStatus::Funded => {
                escrow.status = to;
                if to == EscrowStatus::Released {
                    escrow.released_at = Some(at);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ledger_entry_exists(
        &mut self,
        escrow_id: EscrowId,
        entry_type: EntryType,
    ) -> Result<bool, EscrowError> {
        Ok(self
            .working
            .ledger
            .iter()
            .any(|e| e.escrow_id == Some(escrow_id) && e.entry_type == entry_type))
    }

    async fn transfer_ledger_entry_exists(
        &mut self,
        transfer_record_id: TransferRecordId,
        entry_type: EntryType,
    ) -> Result<bool, EscrowError> {
        Ok(self
            .working
            .ledger
            .iter()
            .any(|e| e.transfer_record_id == Some(transfer_record_id) && e.entry_type == entry_type))
    }

    async fn insert_ledger_entry(
        &mut self,
        entry: NewLedgerEntry,
    ) -> Result<LedgerEntry, EscrowError> {
        entry
            .validate()
            .map_err(|e| EscrowError::Internal(e.to_string()))?;
        let row = entry.into_entry(LedgerEntryId::new(), Utc::now());
        self.working.ledger.push(row.clone());
        Ok(row)
    }

    async fn insert_wallet_credit(
        &mut self,
        credit: NewWalletCredit,
    ) -> Result<WalletCredit, EscrowError> {
        let row = WalletCredit {
            id: WalletCreditId::new(),
            user_id: credit.user_id,
            job_id: credit.job_id,
            pm_request_id: credit.pm_request_id,
            amount_cents: credit.amount_cents,
            currency: credit.currency,
            reason: credit.reason,
            created_at: Utc::now(),
        };
        self.working.wallet_credits.push(row.clone());
        Ok(row)
    }

    async fn transfers_for_job(
        &mut self,
        job_id: Uuid,
    ) -> Result<Vec<TransferRecord>, EscrowError> {
        Ok(self
            .working
            .transfers
            .iter()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn find_transfer(
        &mut self,
        job_id: Uuid,
        pm_request_id: Option<Uuid>,
        role: TransferRole,
    ) -> Result<Option<TransferRecord>, EscrowError> {
        Ok(self
            .working
            .transfers
            .iter()
            .find(|t| t.job_id == job_id && t.pm_request_id == pm_request_id && t.role == role)
            .cloned())
    }

    async fn insert_transfer(
        &mut self,
        transfer: NewTransferRecord,
    ) -> Result<TransferRecord, EscrowError> {
        let row = transfer.into_record(TransferRecordId::new(), Utc::now());
        self.working.transfers.push(row.clone());
        Ok(row)
    }

    async fn find_transfer_by_id(
        &mut self,
        id: TransferRecordId,
    ) -> Result<Option<TransferRecord>, EscrowError> {
        Ok(self.working.transfers.iter().find(|t| t.id == id).cloned())
    }

    async fn find_transfer_by_external_ref(
        &mut self,
        external_ref: &str,
    ) -> Result<Option<TransferRecord>, EscrowError> {
        Ok(self
            .working
            .transfers
            .iter()
            .find(|t| t.external_transfer_ref.as_deref() == Some(external_ref))
            .cloned())
    }

    async fn attach_external_ref(
        &mut self,
        id: TransferRecordId,
        external_ref: &str,
    ) -> Result<(), EscrowError> {
        if let Some(t) = self.transfer_mut(id)
            && t.external_transfer_ref.is_none()
        {
            t.external_transfer_ref = Some(external_ref.to_string());
            t.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn transition_transfer(
        &mut self,
        id: TransferRecordId,
        from: TransferStatus,
        to: TransferStatus,
        failure_reason: Option<&str>,
    ) -> Result<bool, EscrowError> {
        match self.transfer_mut(id) {
            Some(t) if t.status == from => {
                t.status = to;
                t.updated_at = Utc::now();
                if let Some(reason) = failure_reason {
                    t.failure_reason = Some(reason.to_string());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), EscrowError> {
        let MemoryTx {
            mut guard,
            working,
            counters,
        } = *self;
        *guard = working;
        counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
