//! Persistence seam
//!
//! Every state-changing operation runs inside one [`StoreTx`]. Dropping a
//! transaction without calling [`StoreTx::commit`] rolls it back, which is
//! how a processor failure or an infrastructure error leaves nothing
//! behind.
//!
//! Locking contract each backend must uphold:
//! - `lock_*` methods serialize concurrent writers on the same row
//!   (`SELECT ... FOR UPDATE`).
//! - `transition_transfer` is a compare-and-swap on the current status.
//! - `insert_escrow` and `insert_webhook_event` tolerate the unique
//!   constraint race instead of failing.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::EscrowError;
use crate::escrow::{
    Escrow, EscrowStatus, InsertOutcome, JobFinancials, NewEscrow, NewJob, PmRequest,
    PmRequestStatus, WalletCredit,
};
use crate::ids::{EscrowId, TransferRecordId};
use crate::ledger::{EntryType, LedgerEntry, NewLedgerEntry};
use crate::money::Currency;
use crate::transfer::{NewTransferRecord, TransferRecord, TransferRole, TransferStatus};

pub use memory::{MemoryEscrowStore, MemoryState};
pub use postgres::PgEscrowStore;

/// Remainder returned to a poster's wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWalletCredit {
    pub user_id: Uuid,
    pub job_id: Uuid,
    pub pm_request_id: Option<Uuid>,
    pub amount_cents: i64,
    pub currency: Currency,
    pub reason: String,
}

/// Store handle shared by all services
#[async_trait]
pub trait EscrowStore: Send + Sync {
    /// Open a transaction for one logical operation
    async fn begin(&self) -> Result<Box<dyn StoreTx>, EscrowError>;

    /// Jobs whose payout was released in `[from, to)`. An open bound is
    /// unbounded on that side.
    async fn released_jobs(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<JobFinancials>, EscrowError>;

    async fn escrows_for_job(&self, job_id: Uuid) -> Result<Vec<Escrow>, EscrowError>;

    async fn transfers_for_job(&self, job_id: Uuid) -> Result<Vec<TransferRecord>, EscrowError>;

    async fn ledger_for_job(&self, job_id: Uuid) -> Result<Vec<LedgerEntry>, EscrowError>;

    async fn transfers_for_user(&self, user_id: Uuid)
    -> Result<Vec<TransferRecord>, EscrowError>;

    async fn ledger_for_user(&self, user_id: Uuid) -> Result<Vec<LedgerEntry>, EscrowError>;

    /// Ledger entries in one currency created in `[from, to)`
    async fn ledger_between(
        &self,
        currency: Currency,
        from: Option<DateTime<Utc>>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, EscrowError>;
}

/// One database transaction
#[async_trait]
pub trait StoreTx: Send {
    // ---- webhook idempotency ----

    /// Insert-or-ignore the event row. Returns `true` when this call
    /// created it.
    async fn insert_webhook_event(
        &mut self,
        event_id: &str,
        event_type: &str,
        object_id: Option<&str>,
    ) -> Result<bool, EscrowError>;

    /// Set `processed_at` only where it is still null. `false` means the
    /// event was already processed or another delivery holds it.
    async fn claim_webhook_event(&mut self, event_id: &str) -> Result<bool, EscrowError>;

    // ---- jobs ----

    async fn lock_job(&mut self, job_id: Uuid) -> Result<Option<JobFinancials>, EscrowError>;

    /// Claim the job row for a checkout draft, re-reading on conflict
    async fn claim_job_for_draft(&mut self, job: NewJob) -> Result<JobFinancials, EscrowError>;

    async fn set_job_payment_intent(
        &mut self,
        job_id: Uuid,
        payment_intent_ref: &str,
    ) -> Result<(), EscrowError>;

    /// `UNFUNDED | FAILED -> FUNDED` only. Returns whether the row moved.
    async fn mark_job_funded(
        &mut self,
        job_id: Uuid,
        payment_intent_ref: &str,
        charge_ref: Option<&str>,
    ) -> Result<bool, EscrowError>;

    /// `UNFUNDED -> FAILED` only. Returns whether the row moved.
    async fn mark_job_payment_failed(&mut self, job_id: Uuid) -> Result<bool, EscrowError>;

    async fn mark_job_refunded(
        &mut self,
        job_id: Uuid,
        refund_ref: &str,
        at: DateTime<Utc>,
    ) -> Result<(), EscrowError>;

    async fn mark_job_payout_released(
        &mut self,
        job_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), EscrowError>;

    async fn has_resolved_dispute(&mut self, job_id: Uuid) -> Result<bool, EscrowError>;

    // ---- parts / materials requests ----

    async fn lock_pm_request(&mut self, id: Uuid) -> Result<Option<PmRequest>, EscrowError>;

    /// Move the request and stamp the timestamp column matching `status`
    async fn set_pm_request_status(
        &mut self,
        id: Uuid,
        status: PmRequestStatus,
        at: DateTime<Utc>,
    ) -> Result<(), EscrowError>;

    // ---- escrows ----

    async fn find_escrow_by_payment_ref(
        &mut self,
        payment_intent_ref: &str,
    ) -> Result<Option<Escrow>, EscrowError>;

    async fn insert_escrow(
        &mut self,
        escrow: NewEscrow,
    ) -> Result<InsertOutcome<Escrow>, EscrowError>;

    /// Lock the escrow backing a job (`pm_request_id = None`) or a
    /// parts/materials request
    async fn lock_escrow_for(
        &mut self,
        job_id: Uuid,
        pm_request_id: Option<Uuid>,
    ) -> Result<Option<Escrow>, EscrowError>;

    /// `FUNDED -> to`, stamping `released_at` for RELEASED. Returns
    /// whether the row moved.
    async fn close_escrow(
        &mut self,
        id: EscrowId,
        to: EscrowStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, EscrowError>;

    // ---- ledger ----

    async fn ledger_entry_exists(
        &mut self,
        escrow_id: EscrowId,
        entry_type: EntryType,
    ) -> Result<bool, EscrowError>;

    async fn transfer_ledger_entry_exists(
        &mut self,
        transfer_record_id: TransferRecordId,
        entry_type: EntryType,
    ) -> Result<bool, EscrowError>;

    async fn insert_ledger_entry(
        &mut self,
        entry: NewLedgerEntry,
    ) -> Result<LedgerEntry, EscrowError>;

    async fn insert_wallet_credit(
        &mut self,
        credit: NewWalletCredit,
    ) -> Result<WalletCredit, EscrowError>;

    // ---- payout legs ----

    async fn transfers_for_job(&mut self, job_id: Uuid)
    -> Result<Vec<TransferRecord>, EscrowError>;

    async fn find_transfer(
        &mut self,
        job_id: Uuid,
        pm_request_id: Option<Uuid>,
        role: TransferRole,
    ) -> Result<Option<TransferRecord>, EscrowError>;

    async fn insert_transfer(
        &mut self,
        transfer: NewTransferRecord,
    ) -> Result<TransferRecord, EscrowError>;

    async fn find_transfer_by_id(
        &mut self,
        id: TransferRecordId,
    ) -> Result<Option<TransferRecord>, EscrowError>;

    async fn find_transfer_by_external_ref(
        &mut self,
        external_ref: &str,
    ) -> Result<Option<TransferRecord>, EscrowError>;

    /// Attach the processor transfer id if none is set yet
    async fn attach_external_ref(
        &mut self,
        id: TransferRecordId,
        external_ref: &str,
    ) -> Result<(), EscrowError>;

    /// Compare-and-swap: `SET status = to WHERE status = from`
    async fn transition_transfer(
        &mut self,
        id: TransferRecordId,
        from: TransferStatus,
        to: TransferStatus,
        failure_reason: Option<&str>,
    ) -> Result<bool, EscrowError>;

    async fn commit(self: Box<Self>) -> Result<(), EscrowError>;
}
