//! Processor balance vs internal ledger

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::EscrowError;
use crate::ledger::{LedgerEntry, net_processor_cash, processor_cash_flow};
use crate::money::Currency;
use crate::processor::{BalanceSnapshot, PaymentProcessor};
use crate::store::EscrowStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationSummary {
    pub currency: Currency,
    pub from: Option<DateTime<Utc>>,
    pub to: DateTime<Utc>,
    pub processor: BalanceSnapshot,
    /// Net processor cash implied by the whole ledger up to `to`
    pub internal_expected_cents: i64,
    /// processor total minus internal expected
    pub variance_cents: i64,
    pub variance_threshold_cents: i64,
    pub warning: bool,
    pub window_inflow_cents: i64,
    pub window_outflow_cents: i64,
}

/// Split cash flows into money in and money out
fn window_flows(entries: &[LedgerEntry]) -> (i64, i64) {
    entries.iter().fold((0, 0), |(inflow, outflow), e| {
        let flow = processor_cash_flow(e.entry_type, e.direction, e.amount_cents);
        if flow >= 0 {
            (inflow + flow, outflow)
        } else {
            (inflow, outflow - flow)
        }
    })
}

pub async fn reconciliation_summary(
    store: &dyn EscrowStore,
    processor: &dyn PaymentProcessor,
    currency: Currency,
    from: Option<DateTime<Utc>>,
    to: DateTime<Utc>,
    variance_threshold_cents: i64,
) -> Result<ReconciliationSummary, EscrowError> {
    let snapshot = processor.retrieve_balance(currency).await?;

    let all = store.ledger_between(currency, None, to).await?;
    let internal_expected_cents = net_processor_cash(&all);

    let window: Vec<LedgerEntry> = match from {
        Some(from) => all.into_iter().filter(|e| e.created_at >= from).collect(),
        None => all,
    };
    let (window_inflow_cents, window_outflow_cents) = window_flows(&window);

    let variance_cents = snapshot.total_cents() - internal_expected_cents;

    Ok(ReconciliationSummary {
        currency,
        from,
        to,
        processor: snapshot,
        internal_expected_cents,
        variance_cents,
        variance_threshold_cents,
        warning: variance_cents.abs() > variance_threshold_cents,
        window_inflow_cents,
        window_outflow_cents,
    })
}
