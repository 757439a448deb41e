//! PostgreSQL store
//!
//! One `sqlx::Transaction` per logical operation. Row locks use
//! `FOR UPDATE`; payout legs use CAS updates; unique-constrained inserts
//! use `ON CONFLICT DO NOTHING` and let the caller re-read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::fmt::Display;
use std::str::FromStr;
use uuid::Uuid;

use super::{EscrowStore, NewWalletCredit, StoreTx};
use crate::error::EscrowError;
use crate::escrow::{
    Escrow, EscrowStatus, InsertOutcome, JobFinancials, JobStatus, NewEscrow, NewJob,
    PaymentStatus, PayoutStatus, PmRequest, PmRequestStatus, WalletCredit,
};
use crate::ids::{EscrowId, LedgerEntryId, TransferRecordId, WalletCreditId};
use crate::ledger::{EntryType, LedgerEntry, NewLedgerEntry};
use crate::money::Currency;
use crate::transfer::{NewTransferRecord, TransferRecord, TransferRole, TransferStatus};

const JOB_COLUMNS: &str = r#"
    id, draft_id, poster_id, contractor_id, router_id, status, payment_status,
    payout_status, amount_cents, currency, stripe_payment_intent_id,
    stripe_charge_id, stripe_refund_id, released_at, refunded_at
"#;

const PM_COLUMNS: &str = r#"
    id, job_id, poster_id, contractor_id, status, approved_total_cents,
    verified_receipt_total_cents, currency, funded_at, released_at, closed_at
"#;

const ESCROW_COLUMNS: &str = r#"
    id, job_id, pm_request_id, kind, amount_cents, currency, status,
    payment_intent_ref, created_at, released_at, webhook_processed_at
"#;

const TRANSFER_COLUMNS: &str = r#"
    id, job_id, pm_request_id, role, user_id, amount_cents, currency, method,
    status, external_transfer_ref, failure_reason, created_at, updated_at, released_at
"#;

const LEDGER_COLUMNS: &str = r#"
    id, created_at, user_id, job_id, escrow_id, transfer_record_id, entry_type,
    direction, bucket, amount_cents, currency, external_ref, memo
"#;

pub struct PgEscrowStore {
    pool: PgPool,
}

impl PgEscrowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Row mapping
// ============================================================================

/// Parse a TEXT column into a typed value
fn text_col<T>(row: &PgRow, col: &str) -> Result<T, EscrowError>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: String = row.try_get(col)?;
    raw.parse()
        .map_err(|e| EscrowError::Internal(format!("Invalid {} value {:?}: {}", col, raw, e)))
}

fn opt_text_col<T>(row: &PgRow, col: &str) -> Result<Option<T>, EscrowError>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|s| {
        s.parse()
            .map_err(|e| EscrowError::Internal(format!("Invalid {} value {:?}: {}", col, s, e)))
    })
    .transpose()
}

fn row_to_job(row: &PgRow) -> Result<JobFinancials, EscrowError> {
    Ok(JobFinancials {
        id: row.try_get("id")?,
        draft_id: row.try_get("draft_id")?,
        poster_id: row.try_get("poster_id")?,
        contractor_id: row.try_get("contractor_id")?,
        router_id: row.try_get("router_id")?,
        status: text_col::<JobStatus>(row, "status")?,
        payment_status: text_col::<PaymentStatus>(row, "payment_status")?,
        payout_status: text_col::<PayoutStatus>(row, "payout_status")?,
        amount_cents: row.try_get("amount_cents")?,
        currency: text_col::<Currency>(row, "currency")?,
        stripe_payment_intent_id: row.try_get("stripe_payment_intent_id")?,
        stripe_charge_id: row.try_get("stripe_charge_id")?,
        stripe_refund_id: row.try_get("stripe_refund_id")?,
        released_at: row.try_get("released_at")?,
        refunded_at: row.try_get("refunded_at")?,
    })
}

fn row_to_pm_request(row: &PgRow) -> Result<PmRequest, EscrowError> {
    Ok(PmRequest {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        poster_id: row.try_get("poster_id")?,
        contractor_id: row.try_get("contractor_id")?,
        status: text_col::<PmRequestStatus>(row, "status")?,
        approved_total_cents: row.try_get("approved_total_cents")?,
        verified_receipt_total_cents: row.try_get("verified_receipt_total_cents")?,
        currency: text_col::<Currency>(row, "currency")?,
        funded_at: row.try_get("funded_at")?,
        released_at: row.try_get("released_at")?,
        closed_at: row.try_get("closed_at")?,
    })
}

fn row_to_escrow(row: &PgRow) -> Result<Escrow, EscrowError> {
    Ok(Escrow {
        id: text_col::<EscrowId>(row, "id")?,
        job_id: row.try_get("job_id")?,
        pm_request_id: row.try_get("pm_request_id")?,
        kind: text_col(row, "kind")?,
        amount_cents: row.try_get("amount_cents")?,
        currency: text_col::<Currency>(row, "currency")?,
        status: text_col::<EscrowStatus>(row, "status")?,
        payment_intent_ref: row.try_get("payment_intent_ref")?,
        created_at: row.try_get("created_at")?,
        released_at: row.try_get("released_at")?,
        webhook_processed_at: row.try_get("webhook_processed_at")?,
    })
}

fn row_to_transfer(row: &PgRow) -> Result<TransferRecord, EscrowError> {
    Ok(TransferRecord {
        id: text_col::<TransferRecordId>(row, "id")?,
        job_id: row.try_get("job_id")?,
        pm_request_id: row.try_get("pm_request_id")?,
        role: text_col::<TransferRole>(row, "role")?,
        user_id: row.try_get("user_id")?,
        amount_cents: row.try_get("amount_cents")?,
        currency: text_col::<Currency>(row, "currency")?,
        method: text_col(row, "method")?,
        status: text_col::<TransferStatus>(row, "status")?,
        external_transfer_ref: row.try_get("external_transfer_ref")?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        released_at: row.try_get("released_at")?,
    })
}

fn row_to_ledger(row: &PgRow) -> Result<LedgerEntry, EscrowError> {
    Ok(LedgerEntry {
        id: text_col::<LedgerEntryId>(row, "id")?,
        created_at: row.try_get("created_at")?,
        user_id: row.try_get("user_id")?,
        job_id: row.try_get("job_id")?,
        escrow_id: opt_text_col::<EscrowId>(row, "escrow_id")?,
        transfer_record_id: opt_text_col::<TransferRecordId>(row, "transfer_record_id")?,
        entry_type: text_col::<EntryType>(row, "entry_type")?,
        direction: text_col(row, "direction")?,
        bucket: text_col(row, "bucket")?,
        amount_cents: row.try_get("amount_cents")?,
        currency: text_col::<Currency>(row, "currency")?,
        external_ref: row.try_get("external_ref")?,
        memo: row.try_get("memo")?,
    })
}

fn collect<T>(
    rows: Vec<PgRow>,
    map: fn(&PgRow) -> Result<T, EscrowError>,
) -> Result<Vec<T>, EscrowError> {
    rows.iter().map(map).collect()
}

// ============================================================================
// Read models
// ============================================================================

#[async_trait]
impl EscrowStore for PgEscrowStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, EscrowError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTx { tx }))
    }

    async fn released_jobs(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<JobFinancials>, EscrowError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE payout_status = 'RELEASED'
              AND released_at IS NOT NULL
              AND ($1::timestamptz IS NULL OR released_at >= $1)
              AND ($2::timestamptz IS NULL OR released_at < $2)
            ORDER BY released_at ASC
            "#
        ))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        collect(rows, row_to_job)
    }

    async fn escrows_for_job(&self, job_id: Uuid) -> Result<Vec<Escrow>, EscrowError> {
        let rows = sqlx::query(&format!(
            "SELECT {ESCROW_COLUMNS} FROM escrows WHERE job_id = $1 ORDER BY created_at"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        collect(rows, row_to_escrow)
    }

    async fn transfers_for_job(&self, job_id: Uuid) -> Result<Vec<TransferRecord>, EscrowError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfer_records WHERE job_id = $1 ORDER BY created_at"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        collect(rows, row_to_transfer)
    }

    async fn ledger_for_job(&self, job_id: Uuid) -> Result<Vec<LedgerEntry>, EscrowError> {
        let rows = sqlx::query(&format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_entries WHERE job_id = $1 ORDER BY created_at"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        collect(rows, row_to_ledger)
    }

    async fn transfers_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<TransferRecord>, EscrowError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TRANSFER_COLUMNS}
            FROM transfer_records
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT 500
            "#
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        collect(rows, row_to_transfer)
    }

    async fn ledger_for_user(&self, user_id: Uuid) -> Result<Vec<LedgerEntry>, EscrowError> {
        let rows = sqlx::query(&format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_entries WHERE user_id = $1 ORDER BY created_at"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        collect(rows, row_to_ledger)
    }

    async fn ledger_between(
        &self,
        currency: Currency,
        from: Option<DateTime<Utc>>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, EscrowError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {LEDGER_COLUMNS}
            FROM ledger_entries
            WHERE currency = $1
              AND ($2::timestamptz IS NULL OR created_at >= $2)
              AND created_at < $3
            ORDER BY created_at
            "#
        ))
        .bind(currency.as_str())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        collect(rows, row_to_ledger)
    }
}

// ============================================================================
// Transaction
// ============================================================================

struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn insert_webhook_event(
        &mut self,
        event_id: &str,
        event_type: &str,
        object_id: Option<&str>,
    ) -> Result<bool, EscrowError> {
        let result = sqlx::query(
            r#"
            INSERT INTO stripe_webhook_events (event_id, event_type, object_id, received_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(object_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_webhook_event(&mut self, event_id: &str) -> Result<bool, EscrowError> {
        let result = sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processed_at = NOW()
            WHERE event_id = $1 AND processed_at IS NULL
            "#,
        )
        .bind(event_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn lock_job(&mut self, job_id: Uuid) -> Result<Option<JobFinancials>, EscrowError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn claim_job_for_draft(&mut self, job: NewJob) -> Result<JobFinancials, EscrowError> {
        sqlx::query(
            r#"
            INSERT INTO jobs
                (id, draft_id, poster_id, status, payment_status, payout_status,
                 amount_cents, currency, created_at, updated_at)
            VALUES ($1, $2, $3, 'DRAFT', 'UNFUNDED', 'READY', $4, $5, NOW(), NOW())
            ON CONFLICT (draft_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job.draft_id)
        .bind(job.poster_id)
        .bind(job.amount_cents)
        .bind(job.currency.as_str())
        .execute(&mut *self.tx)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE draft_id = $1 FOR UPDATE"
        ))
        .bind(job.draft_id)
        .fetch_one(&mut *self.tx)
        .await?;

        row_to_job(&row)
    }

    async fn set_job_payment_intent(
        &mut self,
        job_id: Uuid,
        payment_intent_ref: &str,
    ) -> Result<(), EscrowError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET stripe_payment_intent_id = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(payment_intent_ref)
        .bind(job_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn mark_job_funded(
        &mut self,
        job_id: Uuid,
        payment_intent_ref: &str,
        charge_ref: Option<&str>,
    ) -> Result<bool, EscrowError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET payment_status = 'FUNDED',
                stripe_payment_intent_id = $1,
                stripe_charge_id = COALESCE($2, stripe_charge_id),
                status = CASE WHEN status = 'DRAFT' THEN 'OPEN' ELSE status END,
                updated_at = NOW()
            WHERE id = $3 AND payment_status IN ('UNFUNDED', 'FAILED')
            "#,
        )
        .bind(payment_intent_ref)
        .bind(charge_ref)
        .bind(job_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_job_payment_failed(&mut self, job_id: Uuid) -> Result<bool, EscrowError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET payment_status = 'FAILED', updated_at = NOW()
            WHERE id = $1 AND payment_status = 'UNFUNDED'
            "#,
        )
        .bind(job_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_job_refunded(
        &mut self,
        job_id: Uuid,
        refund_ref: &str,
        at: DateTime<Utc>,
    ) -> Result<(), EscrowError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET payment_status = 'REFUNDED', stripe_refund_id = $1,
                refunded_at = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(refund_ref)
        .bind(at)
        .bind(job_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn mark_job_payout_released(
        &mut self,
        job_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), EscrowError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET payout_status = 'RELEASED',
                released_at = COALESCE(released_at, $1),
                updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(at)
        .bind(job_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn has_resolved_dispute(&mut self, job_id: Uuid) -> Result<bool, EscrowError> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM dispute_cases
                WHERE job_id = $1 AND status IN ('DECIDED', 'CLOSED')
            )
            "#,
        )
        .bind(job_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(exists)
    }

    async fn lock_pm_request(&mut self, id: Uuid) -> Result<Option<PmRequest>, EscrowError> {
        let row = sqlx::query(&format!(
            "SELECT {PM_COLUMNS} FROM pm_requests WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(row_to_pm_request).transpose()
    }

    async fn set_pm_request_status(
        &mut self,
        id: Uuid,
        status: PmRequestStatus,
        at: DateTime<Utc>,
    ) -> Result<(), EscrowError> {
        sqlx::query(
            r#"
            UPDATE pm_requests
            SET status = $1,
                funded_at = CASE WHEN $1 = 'FUNDED' THEN $2 ELSE funded_at END,
                released_at = CASE WHEN $1 = 'RELEASED' THEN $2 ELSE released_at END,
                closed_at = CASE WHEN $1 = 'CLOSED' THEN $2 ELSE closed_at END,
                updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(status.as_str())
        .bind(at)
        .bind(id)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn find_escrow_by_payment_ref(
        &mut self,
        payment_intent_ref: &str,
    ) -> Result<Option<Escrow>, EscrowError> {
        let row = sqlx::query(&format!(
            "SELECT {ESCROW_COLUMNS} FROM escrows WHERE payment_intent_ref = $1"
        ))
        .bind(payment_intent_ref)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(row_to_escrow).transpose()
    }

    async fn insert_escrow(
        &mut self,
        escrow: NewEscrow,
    ) -> Result<InsertOutcome<Escrow>, EscrowError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO escrows
                (id, job_id, pm_request_id, kind, amount_cents, currency, status,
                 payment_intent_ref, created_at, webhook_processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'FUNDED', $7, NOW(), NOW())
            ON CONFLICT (payment_intent_ref) DO NOTHING
            RETURNING {ESCROW_COLUMNS}
            "#
        ))
        .bind(EscrowId::new().to_string())
        .bind(escrow.job_id)
        .bind(escrow.pm_request_id)
        .bind(escrow.kind.as_str())
        .bind(escrow.amount_cents)
        .bind(escrow.currency.as_str())
        .bind(&escrow.payment_intent_ref)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => Ok(InsertOutcome::Inserted(row_to_escrow(&row)?)),
            None => Ok(InsertOutcome::Conflict),
        }
    }

    async fn lock_escrow_for(
        &mut self,
        job_id: Uuid,
        pm_request_id: Option<Uuid>,
    ) -> Result<Option<Escrow>, EscrowError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {ESCROW_COLUMNS}
            FROM escrows
            WHERE job_id = $1 AND pm_request_id IS NOT DISTINCT FROM $2
            ORDER BY created_at
            LIMIT 1
            FOR UPDATE
            "#
        ))
        .bind(job_id)
        .bind(pm_request_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(row_to_escrow).transpose()
    }

    async fn close_escrow(
        &mut self,
        id: EscrowId,
        to: EscrowStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, EscrowError> {
        let result = sqlx::query(
            r#"
            UPDATE escrows
            SET status = $1,
                released_at = CASE WHEN $1 = 'RELEASED' THEN $2 ELSE released_at END
            WHERE id = $3 AND status = 'FUNDED'
            "#,
        )
        .bind(to.as_str())
        .bind(at)
        .bind(id.to_string())
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn ledger_entry_exists(
        &mut self,
        escrow_id: EscrowId,
        entry_type: EntryType,
    ) -> Result<bool, EscrowError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM ledger_entries WHERE escrow_id = $1 AND entry_type = $2)",
        )
        .bind(escrow_id.to_string())
        .bind(entry_type.as_str())
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(exists)
    }

    async fn transfer_ledger_entry_exists(
        &mut self,
        transfer_record_id: TransferRecordId,
        entry_type: EntryType,
    ) -> Result<bool, EscrowError> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM ledger_entries
                WHERE transfer_record_id = $1 AND entry_type = $2
            )
            "#,
        )
        .bind(transfer_record_id.to_string())
        .bind(entry_type.as_str())
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(exists)
    }

    async fn insert_ledger_entry(
        &mut self,
        entry: NewLedgerEntry,
    ) -> Result<LedgerEntry, EscrowError> {
        entry
            .validate()
            .map_err(|e| EscrowError::Internal(e.to_string()))?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO ledger_entries
                (id, created_at, user_id, job_id, escrow_id, transfer_record_id,
                 entry_type, direction, bucket, amount_cents, currency, external_ref, memo)
            VALUES ($1, NOW(), $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {LEDGER_COLUMNS}
            "#
        ))
        .bind(LedgerEntryId::new().to_string())
        .bind(entry.user_id)
        .bind(entry.job_id)
        .bind(entry.escrow_id.map(|id| id.to_string()))
        .bind(entry.transfer_record_id.map(|id| id.to_string()))
        .bind(entry.entry_type.as_str())
        .bind(entry.direction.as_str())
        .bind(entry.bucket.as_str())
        .bind(entry.amount_cents)
        .bind(entry.currency.as_str())
        .bind(&entry.external_ref)
        .bind(&entry.memo)
        .fetch_one(&mut *self.tx)
        .await?;

        row_to_ledger(&row)
    }

    async fn insert_wallet_credit(
        &mut self,
        credit: NewWalletCredit,
    ) -> Result<WalletCredit, EscrowError> {
        let id = WalletCreditId::new();
        let created_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            INSERT INTO wallet_credits
                (id, user_id, job_id, pm_request_id, amount_cents, currency, reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            RETURNING created_at
            "#,
        )
        .bind(id.to_string())
        .bind(credit.user_id)
        .bind(credit.job_id)
        .bind(credit.pm_request_id)
        .bind(credit.amount_cents)
        .bind(credit.currency.as_str())
        .bind(&credit.reason)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(WalletCredit {
            id,
            user_id: credit.user_id,
            job_id: credit.job_id,
            pm_request_id: credit.pm_request_id,
            amount_cents: credit.amount_cents,
            currency: credit.currency,
            reason: credit.reason,
            created_at,
        })
    }

    async fn transfers_for_job(
        &mut self,
        job_id: Uuid,
    ) -> Result<Vec<TransferRecord>, EscrowError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfer_records WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_all(&mut *self.tx)
        .await?;

        collect(rows, row_to_transfer)
    }

    async fn find_transfer(
        &mut self,
        job_id: Uuid,
        pm_request_id: Option<Uuid>,
        role: TransferRole,
    ) -> Result<Option<TransferRecord>, EscrowError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {TRANSFER_COLUMNS}
            FROM transfer_records
            WHERE job_id = $1 AND pm_request_id IS NOT DISTINCT FROM $2 AND role = $3
            "#
        ))
        .bind(job_id)
        .bind(pm_request_id)
        .bind(role.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn insert_transfer(
        &mut self,
        transfer: NewTransferRecord,
    ) -> Result<TransferRecord, EscrowError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO transfer_records
                (id, job_id, pm_request_id, role, user_id, amount_cents, currency,
                 method, status, created_at, updated_at, released_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'PENDING', NOW(), NOW(), NOW())
            RETURNING {TRANSFER_COLUMNS}
            "#
        ))
        .bind(TransferRecordId::new().to_string())
        .bind(transfer.job_id)
        .bind(transfer.pm_request_id)
        .bind(transfer.role.as_str())
        .bind(transfer.user_id)
        .bind(transfer.amount_cents)
        .bind(transfer.currency.as_str())
        .bind(transfer.method.as_str())
        .fetch_one(&mut *self.tx)
        .await?;

        row_to_transfer(&row)
    }

    async fn find_transfer_by_id(
        &mut self,
        id: TransferRecordId,
    ) -> Result<Option<TransferRecord>, EscrowError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfer_records WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn find_transfer_by_external_ref(
        &mut self,
        external_ref: &str,
    ) -> Result<Option<TransferRecord>, EscrowError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfer_records WHERE external_transfer_ref = $1"
        ))
        .bind(external_ref)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn attach_external_ref(
        &mut self,
        id: TransferRecordId,
        external_ref: &str,
    ) -> Result<(), EscrowError> {
        sqlx::query(
            r#"
            UPDATE transfer_records
            SET external_transfer_ref = $1, updated_at = NOW()
            WHERE id = $2 AND external_transfer_ref IS NULL
            "#,
        )
        .bind(external_ref)
        .bind(id.to_string())
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn transition_transfer(
        &mut self,
        id: TransferRecordId,
        from: TransferStatus,
        to: TransferStatus,
        failure_reason: Option<&str>,
    ) -> Result<bool, EscrowError> {
        let result = sqlx::query(
            r#"
            UPDATE transfer_records
            SET status = $1,
                failure_reason = COALESCE($2, failure_reason),
                updated_at = NOW()
            WHERE id = $3 AND status = $4
            "#,
        )
        .bind(to.as_str())
        .bind(failure_reason)
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> Result<(), EscrowError> {
        self.tx.commit().await?;
        Ok(())
    }
}
