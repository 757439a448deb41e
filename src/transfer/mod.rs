//! Payout Legs
//!
//! One [`TransferRecord`] per recipient role per job. The Release Engine
//! creates legs in `PENDING`; processor lifecycle events and the
//! reconciler move them through the [`state`] graph.
//!
//! # Concurrency
//!
//! Leg transitions are optimistic compare-and-swap updates
//! (`UPDATE ... WHERE status = <expected>`), never row locks. A CAS that
//! affects zero rows means someone else moved the leg first.

pub mod plan;
pub mod state;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::ids::TransferRecordId;
use crate::money::Currency;

pub use plan::{PlanStep, ProcessorTransferFacts, ReconcilePlan, build_plan};
pub use state::{PayoutMethod, TransferLifecycle, TransferRole, TransferStatus, is_allowed};

/// Persisted payout leg
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferRecord {
    pub id: TransferRecordId,
    pub job_id: Uuid,
    /// Parts/materials request this leg pays out, if any
    pub pm_request_id: Option<Uuid>,
    pub role: TransferRole,
    pub user_id: Uuid,
    pub amount_cents: i64,
    pub currency: Currency,
    pub method: PayoutMethod,
    pub status: TransferStatus,
    pub external_transfer_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

/// Leg to be scheduled by the Release Engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransferRecord {
    pub job_id: Uuid,
    pub pm_request_id: Option<Uuid>,
    pub role: TransferRole,
    pub user_id: Uuid,
    pub amount_cents: i64,
    pub currency: Currency,
    pub method: PayoutMethod,
}

impl NewTransferRecord {
    pub fn into_record(self, id: TransferRecordId, now: DateTime<Utc>) -> TransferRecord {
        TransferRecord {
            id,
            job_id: self.job_id,
            pm_request_id: self.pm_request_id,
            role: self.role,
            user_id: self.user_id,
            amount_cents: self.amount_cents,
            currency: self.currency,
            method: self.method,
            status: TransferStatus::Pending,
            external_transfer_ref: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            released_at: Some(now),
        }
    }
}
