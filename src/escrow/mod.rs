//! Held-funds pools and the financial projection of the rows that own them
//!
//! An [`Escrow`] is funded once by the Funding Finalizer and leaves
//! `FUNDED` at most once, either to `RELEASED` or to `REFUNDED`.
//! `released_at` is written exactly once.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::ids::{EscrowId, WalletCreditId};
use crate::money::Currency;

/// Implements `as_str` / `FromStr` / `Display` for a status-like enum
/// stored as TEXT.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = ::std::string::String;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(format!("Invalid {}: {}", stringify!($name), s)),
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }
    };
}
pub(crate) use text_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowKind {
    JobEscrow,
    PartsMaterials,
}

text_enum!(EscrowKind {
    JobEscrow => "JOB_ESCROW",
    PartsMaterials => "PARTS_MATERIALS",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowStatus {
    Funded,
    /// Terminal
    Released,
    /// Terminal
    Refunded,
}

text_enum!(EscrowStatus {
    Funded => "FUNDED",
    Released => "RELEASED",
    Refunded => "REFUNDED",
});

impl EscrowStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, EscrowStatus::Released | EscrowStatus::Refunded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Escrow {
    pub id: EscrowId,
    pub job_id: Uuid,
    pub pm_request_id: Option<Uuid>,
    pub kind: EscrowKind,
    pub amount_cents: i64,
    pub currency: Currency,
    pub status: EscrowStatus,
    /// Processor payment-intent id; unique across escrows
    pub payment_intent_ref: String,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub webhook_processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEscrow {
    pub job_id: Uuid,
    pub pm_request_id: Option<Uuid>,
    pub kind: EscrowKind,
    pub amount_cents: i64,
    pub currency: Currency,
    pub payment_intent_ref: String,
}

impl NewEscrow {
    pub fn into_escrow(self, id: EscrowId, now: DateTime<Utc>) -> Escrow {
        Escrow {
            id,
            job_id: self.job_id,
            pm_request_id: self.pm_request_id,
            kind: self.kind,
            amount_cents: self.amount_cents,
            currency: self.currency,
            status: EscrowStatus::Funded,
            payment_intent_ref: self.payment_intent_ref,
            created_at: now,
            released_at: None,
            webhook_processed_at: Some(now),
        }
    }
}

/// Result of an insert guarded by a unique constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome<T> {
    Inserted(T),
    /// Another writer got there first
    Conflict,
}

// ============================================================================
// Job financial projection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Unfunded,
    Funded,
    Failed,
    Refunded,
}

text_enum!(PaymentStatus {
    Unfunded => "UNFUNDED",
    Funded => "FUNDED",
    Failed => "FAILED",
    Refunded => "REFUNDED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStatus {
    Ready,
    Released,
}

text_enum!(PayoutStatus {
    Ready => "READY",
    Released => "RELEASED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Draft,
    Open,
    Assigned,
    InProgress,
    Completed,
    Disputed,
    Cancelled,
}

text_enum!(JobStatus {
    Draft => "DRAFT",
    Open => "OPEN",
    Assigned => "ASSIGNED",
    InProgress => "IN_PROGRESS",
    Completed => "COMPLETED",
    Disputed => "DISPUTED",
    Cancelled => "CANCELLED",
});

/// The columns of a job row this subsystem reads and writes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFinancials {
    pub id: Uuid,
    /// Checkout draft this job was claimed from
    pub draft_id: Option<Uuid>,
    pub poster_id: Uuid,
    pub contractor_id: Option<Uuid>,
    pub router_id: Option<Uuid>,
    pub status: JobStatus,
    pub payment_status: PaymentStatus,
    pub payout_status: PayoutStatus,
    pub amount_cents: i64,
    pub currency: Currency,
    pub stripe_payment_intent_id: Option<String>,
    pub stripe_charge_id: Option<String>,
    pub stripe_refund_id: Option<String>,
    pub released_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
}

impl JobFinancials {
    /// Reference the processor accepts for a refund, charge preferred
    pub fn refund_reference(&self) -> Option<&str> {
        self.stripe_charge_id
            .as_deref()
            .or(self.stripe_payment_intent_id.as_deref())
            .filter(|r| !r.is_empty())
    }
}

/// Job row claimed from a checkout draft before any processor call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub draft_id: Uuid,
    pub poster_id: Uuid,
    pub amount_cents: i64,
    pub currency: Currency,
}

// ============================================================================
// Parts / materials requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PmRequestStatus {
    Requested,
    Approved,
    Funded,
    ReceiptSubmitted,
    Verified,
    Released,
    Closed,
    Rejected,
    Cancelled,
}

text_enum!(PmRequestStatus {
    Requested => "REQUESTED",
    Approved => "APPROVED",
    Funded => "FUNDED",
    ReceiptSubmitted => "RECEIPT_SUBMITTED",
    Verified => "VERIFIED",
    Released => "RELEASED",
    Closed => "CLOSED",
    Rejected => "REJECTED",
    Cancelled => "CANCELLED",
});

impl PmRequestStatus {
    /// Funded at some point in its life
    pub fn is_funded(&self) -> bool {
        matches!(
            self,
            PmRequestStatus::Funded
                | PmRequestStatus::ReceiptSubmitted
                | PmRequestStatus::Verified
                | PmRequestStatus::Released
                | PmRequestStatus::Closed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PmRequest {
    pub id: Uuid,
    pub job_id: Uuid,
    pub poster_id: Uuid,
    pub contractor_id: Uuid,
    pub status: PmRequestStatus,
    pub approved_total_cents: i64,
    pub verified_receipt_total_cents: Option<i64>,
    pub currency: Currency,
    pub funded_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Disputes and wallet credits
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisputeStatus {
    Open,
    Voting,
    Decided,
    Closed,
}

text_enum!(DisputeStatus {
    Open => "OPEN",
    Voting => "VOTING",
    Decided => "DECIDED",
    Closed => "CLOSED",
});

impl DisputeStatus {
    /// Resolved terminal states lift the refund dispute guard
    pub fn is_resolved(&self) -> bool {
        matches!(self, DisputeStatus::Decided | DisputeStatus::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisputeCase {
    pub id: Uuid,
    pub job_id: Uuid,
    pub status: DisputeStatus,
}

/// Standalone record of a remainder returned to the poster's wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletCredit {
    pub id: WalletCreditId,
    pub user_id: Uuid,
    pub job_id: Uuid,
    pub pm_request_id: Option<Uuid>,
    pub amount_cents: i64,
    pub currency: Currency,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}
