//! Ledger - append-only record of monetary movements
//!
//! Entries are inserted once and never updated or deleted. Amounts are
//! always `>= 0`; the sign is carried by [`Direction`]. The signed sum of
//! a user's entries per [`Bucket`] is the source of truth for balances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::ids::{EscrowId, LedgerEntryId, TransferRecordId};
use crate::money::{Currency, MoneyError, ensure_non_negative};

/// Kind of monetary movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    EscrowFund,
    EscrowRelease,
    EscrowRefund,
    PmEscrowFunded,
    PmRelease,
    PmCredit,
    PmRefund,
    PlatformFee,
    BrokerFee,
    ContractorEarn,
    RouterEarn,
    Payout,
    Adjustment,
}

impl EntryType {
    pub const ALL: [EntryType; 13] = [
        EntryType::EscrowFund,
        EntryType::EscrowRelease,
        EntryType::EscrowRefund,
        EntryType::PmEscrowFunded,
        EntryType::PmRelease,
        EntryType::PmCredit,
        EntryType::PmRefund,
        EntryType::PlatformFee,
        EntryType::BrokerFee,
        EntryType::ContractorEarn,
        EntryType::RouterEarn,
        EntryType::Payout,
        EntryType::Adjustment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::EscrowFund => "ESCROW_FUND",
            EntryType::EscrowRelease => "ESCROW_RELEASE",
            EntryType::EscrowRefund => "ESCROW_REFUND",
            EntryType::PmEscrowFunded => "PM_ESCROW_FUNDED",
            EntryType::PmRelease => "PM_RELEASE",
            EntryType::PmCredit => "PM_CREDIT",
            EntryType::PmRefund => "PM_REFUND",
            EntryType::PlatformFee => "PLATFORM_FEE",
            EntryType::BrokerFee => "BROKER_FEE",
            EntryType::ContractorEarn => "CONTRACTOR_EARN",
            EntryType::RouterEarn => "ROUTER_EARN",
            EntryType::Payout => "PAYOUT",
            EntryType::Adjustment => "ADJUSTMENT",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntryType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Invalid ledger entry type: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "DEBIT",
            Direction::Credit => "CREDIT",
        }
    }

    /// +1 for credits, -1 for debits
    #[inline]
    pub fn sign(&self) -> i64 {
        match self {
            Direction::Debit => -1,
            Direction::Credit => 1,
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBIT" => Ok(Direction::Debit),
            "CREDIT" => Ok(Direction::Credit),
            _ => Err(format!("Invalid ledger direction: {}", s)),
        }
    }
}

/// Balance bucket an entry moves money in or out of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Bucket {
    Pending,
    Available,
    Paid,
    Held,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Pending => "PENDING",
            Bucket::Available => "AVAILABLE",
            Bucket::Paid => "PAID",
            Bucket::Held => "HELD",
        }
    }
}

impl FromStr for Bucket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Bucket::Pending),
            "AVAILABLE" => Ok(Bucket::Available),
            "PAID" => Ok(Bucket::Paid),
            "HELD" => Ok(Bucket::Held),
            _ => Err(format!("Invalid ledger bucket: {}", s)),
        }
    }
}

/// Persisted, immutable ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub created_at: DateTime<Utc>,
    pub user_id: Uuid,
    pub job_id: Option<Uuid>,
    pub escrow_id: Option<EscrowId>,
    pub transfer_record_id: Option<TransferRecordId>,
    pub entry_type: EntryType,
    pub direction: Direction,
    pub bucket: Bucket,
    pub amount_cents: i64,
    pub currency: Currency,
    pub external_ref: Option<String>,
    pub memo: Option<String>,
}

impl LedgerEntry {
    /// Amount with the direction applied
    #[inline]
    pub fn signed_amount(&self) -> i64 {
        self.direction.sign() * self.amount_cents
    }
}

/// Entry to be appended. Built by the funding, release, refund and
/// transfer-transition paths inside the transaction that justifies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub user_id: Uuid,
    pub job_id: Option<Uuid>,
    pub escrow_id: Option<EscrowId>,
    pub transfer_record_id: Option<TransferRecordId>,
    pub entry_type: EntryType,
    pub direction: Direction,
    pub bucket: Bucket,
    pub amount_cents: i64,
    pub currency: Currency,
    pub external_ref: Option<String>,
    pub memo: Option<String>,
}

impl NewLedgerEntry {
    pub fn new(
        user_id: Uuid,
        entry_type: EntryType,
        direction: Direction,
        bucket: Bucket,
        amount_cents: i64,
        currency: Currency,
    ) -> Self {
        Self {
            user_id,
            job_id: None,
            escrow_id: None,
            transfer_record_id: None,
            entry_type,
            direction,
            bucket,
            amount_cents,
            currency,
            external_ref: None,
            memo: None,
        }
    }

    pub fn job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn escrow(mut self, escrow_id: EscrowId) -> Self {
        self.escrow_id = Some(escrow_id);
        self
    }

    pub fn transfer_record(mut self, id: TransferRecordId) -> Self {
        self.transfer_record_id = Some(id);
        self
    }

    pub fn external_ref(mut self, external_ref: impl Into<String>) -> Self {
        self.external_ref = Some(external_ref.into());
        self
    }

    pub fn memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    /// Amount must be non-negative; direction carries the sign
    pub fn validate(&self) -> Result<(), MoneyError> {
        ensure_non_negative(self.amount_cents).map(|_| ())
    }

    /// Materialize the row a store persists
    pub fn into_entry(self, id: LedgerEntryId, created_at: DateTime<Utc>) -> LedgerEntry {
        LedgerEntry {
            id,
            created_at,
            user_id: self.user_id,
            job_id: self.job_id,
            escrow_id: self.escrow_id,
            transfer_record_id: self.transfer_record_id,
            entry_type: self.entry_type,
            direction: self.direction,
            bucket: self.bucket,
            amount_cents: self.amount_cents,
            currency: self.currency,
            external_ref: self.external_ref,
            memo: self.memo,
        }
    }
}

/// Signed totals per bucket for one user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BucketTotals {
    pub pending: i64,
    pub available: i64,
    pub paid: i64,
    pub held: i64,
}

impl BucketTotals {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Self {
        let mut totals = BucketTotals::default();
        for entry in entries {
            let slot = match entry.bucket {
                Bucket::Pending => &mut totals.pending,
                Bucket::Available => &mut totals.available,
                Bucket::Paid => &mut totals.paid,
                Bucket::Held => &mut totals.held,
            };
            *slot += entry.signed_amount();
        }
        totals
    }
}

/// Contribution of one movement to the cash the processor should be
/// holding for the platform.
///
/// Funding brings money in, refunds and payouts send it out, a reversal
/// adjustment brings a payout back. Everything else is an internal
/// reallocation and contributes zero.
pub fn processor_cash_flow(entry_type: EntryType, direction: Direction, amount_cents: i64) -> i64 {
    match (entry_type, direction) {
        (EntryType::EscrowFund | EntryType::PmEscrowFunded, _) => amount_cents,
        (EntryType::EscrowRefund | EntryType::PmRefund, _) => -amount_cents,
        (EntryType::Payout, Direction::Credit) => -amount_cents,
        (EntryType::Adjustment, Direction::Debit) => amount_cents,
        _ => 0,
    }
}

/// Sum of [`processor_cash_flow`] over a slice of entries
pub fn net_processor_cash<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> i64 {
    entries
        .into_iter()
        .map(|e| processor_cash_flow(e.entry_type, e.direction, e.amount_cents))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(entry_type: EntryType, direction: Direction, bucket: Bucket, amount: i64) -> LedgerEntry {
        NewLedgerEntry::new(Uuid::nil(), entry_type, direction, bucket, amount, Currency::Usd)
            .into_entry(LedgerEntryId::new(), Utc::now())
    }

    #[test]
    fn test_entry_type_string_roundtrip() {
        for t in EntryType::ALL {
            assert_eq!(t.as_str().parse::<EntryType>().unwrap(), t);
        }
        assert!("WIRE".parse::<EntryType>().is_err());
    }

    #[test]
    fn test_signed_amount() {
        assert_eq!(
            entry(EntryType::EscrowFund, Direction::Debit, Bucket::Held, 25_000).signed_amount(),
            -25_000
        );
        assert_eq!(
            entry(EntryType::Payout, Direction::Credit, Bucket::Paid, 900).signed_amount(),
            900
        );
    }

    #[test]
    fn test_bucket_totals() {
        let entries = vec![
            entry(EntryType::ContractorEarn, Direction::Credit, Bucket::Pending, 8_000),
            entry(EntryType::Payout, Direction::Credit, Bucket::Paid, 8_000),
            entry(EntryType::PmCredit, Direction::Credit, Bucket::Available, 300),
            entry(EntryType::Adjustment, Direction::Debit, Bucket::Paid, 1_000),
        ];
        let totals = BucketTotals::from_entries(&entries);
        assert_eq!(totals.pending, 8_000);
        assert_eq!(totals.paid, 7_000);
        assert_eq!(totals.available, 300);
        assert_eq!(totals.held, 0);
    }

    #[test]
    fn test_processor_cash_flow_table() {
        assert_eq!(processor_cash_flow(EntryType::EscrowFund, Direction::Debit, 100), 100);
        assert_eq!(processor_cash_flow(EntryType::PmEscrowFunded, Direction::Debit, 100), 100);
        assert_eq!(processor_cash_flow(EntryType::EscrowRefund, Direction::Credit, 40), -40);
        assert_eq!(processor_cash_flow(EntryType::Payout, Direction::Credit, 60), -60);
        assert_eq!(processor_cash_flow(EntryType::Adjustment, Direction::Debit, 60), 60);
        assert_eq!(processor_cash_flow(EntryType::ContractorEarn, Direction::Credit, 60), 0);
        assert_eq!(processor_cash_flow(EntryType::PmCredit, Direction::Credit, 60), 0);
    }

    #[test]
    fn test_validate_rejects_negative() {
        let bad = NewLedgerEntry::new(
            Uuid::nil(),
            EntryType::Adjustment,
            Direction::Debit,
            Bucket::Paid,
            -5,
            Currency::Usd,
        );
        assert!(bad.validate().is_err());
    }
}
