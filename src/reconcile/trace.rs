//! Payout trace: a user's legs next to their ledger evidence

use serde::Serialize;
use uuid::Uuid;

use super::auditor::has_payout_evidence;
use crate::error::EscrowError;
use crate::ids::TransferRecordId;
use crate::ledger::{BucketTotals, LedgerEntry};
use crate::store::EscrowStore;
use crate::transfer::{TransferRecord, TransferStatus};

#[derive(Debug, Clone, Serialize)]
pub struct PayoutTrace {
    pub user_id: Uuid,
    /// Newest first
    pub transfers: Vec<TransferRecord>,
    pub totals: BucketTotals,
    pub sent_legs_missing_ledger: Vec<TransferRecordId>,
    /// True when any SENT leg has no PAYOUT credit behind it
    pub missing_ledger_evidence: bool,
}

impl PayoutTrace {
    pub fn build(user_id: Uuid, transfers: Vec<TransferRecord>, ledger: &[LedgerEntry]) -> Self {
        let sent_legs_missing_ledger: Vec<TransferRecordId> = transfers
            .iter()
            .filter(|t| t.status == TransferStatus::Sent)
            .filter(|t| !has_payout_evidence(ledger, t.id))
            .map(|t| t.id)
            .collect();

        Self {
            user_id,
            transfers,
            totals: BucketTotals::from_entries(ledger),
            missing_ledger_evidence: !sent_legs_missing_ledger.is_empty(),
            sent_legs_missing_ledger,
        }
    }
}

pub async fn payout_trace(
    store: &dyn EscrowStore,
    user_id: Uuid,
) -> Result<PayoutTrace, EscrowError> {
    let transfers = store.transfers_for_user(user_id).await?;
    let ledger = store.ledger_for_user(user_id).await?;
    Ok(PayoutTrace::build(user_id, transfers, &ledger))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::LedgerEntryId;
    use crate::ledger::{Bucket, Direction, EntryType, NewLedgerEntry};
    use crate::money::Currency;
    use crate::transfer::{NewTransferRecord, PayoutMethod, TransferRole};
    use chrono::Utc;

    fn leg(user_id: Uuid, status: TransferStatus) -> TransferRecord {
        let mut leg = NewTransferRecord {
            job_id: Uuid::new_v4(),
            pm_request_id: None,
            role: TransferRole::Contractor,
            user_id,
            amount_cents: 5_000,
            currency: Currency::Usd,
            method: PayoutMethod::Stripe,
        }
        .into_record(TransferRecordId::new(), Utc::now());
        leg.status = status;
        leg
    }

    #[test]
    fn test_flags_sent_leg_without_payout() {
        let user = Uuid::new_v4();
        let paid = leg(user, TransferStatus::Sent);
        let unpaid = leg(user, TransferStatus::Sent);
        let pending = leg(user, TransferStatus::Pending);

        let ledger = vec![
            NewLedgerEntry::new(user, EntryType::ContractorEarn, Direction::Credit, Bucket::Pending, 15_000, Currency::Usd)
                .into_entry(LedgerEntryId::new(), Utc::now()),
            NewLedgerEntry::new(user, EntryType::Payout, Direction::Credit, Bucket::Paid, 5_000, Currency::Usd)
                .transfer_record(paid.id)
                .into_entry(LedgerEntryId::new(), Utc::now()),
        ];

        let trace = PayoutTrace::build(user, vec![paid, unpaid.clone(), pending], &ledger);
        assert!(trace.missing_ledger_evidence);
        assert_eq!(trace.sent_legs_missing_ledger, vec![unpaid.id]);
        assert_eq!(trace.totals.pending, 15_000);
        assert_eq!(trace.totals.paid, 5_000);
    }

    #[test]
    fn test_clean_trace() {
        let user = Uuid::new_v4();
        let trace = PayoutTrace::build(user, vec![leg(user, TransferStatus::Pending)], &[]);
        assert!(!trace.missing_ledger_evidence);
        assert_eq!(trace.totals, BucketTotals::default());
    }
}
