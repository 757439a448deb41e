//! Reconciliation plans
//!
//! Turns the processor's authoritative view of a transfer plus the stored
//! leg status into an ordered list of conditional updates.

use serde::Serialize;

use super::state::{TransferStatus, is_allowed};

/// Processor-side facts that decide the desired leg status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorTransferFacts {
    pub reversed: bool,
    pub amount_reversed_cents: i64,
}

impl ProcessorTransferFacts {
    pub fn desired_status(&self) -> TransferStatus {
        if self.reversed || self.amount_reversed_cents > 0 {
            TransferStatus::Reversed
        } else {
            TransferStatus::Sent
        }
    }
}

/// One conditional update: `SET status = to WHERE status = from`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    pub from: TransferStatus,
    pub to: TransferStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ReconcilePlan {
    Noop,
    Update { steps: Vec<PlanStep> },
    Illegal {
        from: TransferStatus,
        to: TransferStatus,
    },
}

impl ReconcilePlan {
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcilePlan::Noop => "noop",
            ReconcilePlan::Update { .. } => "update",
            ReconcilePlan::Illegal { .. } => "illegal",
        }
    }
}

/// Build the plan that moves a leg from `current` to `desired`.
///
/// PENDING -> REVERSED is not a single legal hop; it is planned as
/// PENDING -> SENT then SENT -> REVERSED.
pub fn build_plan(current: TransferStatus, desired: TransferStatus) -> ReconcilePlan {
    if current == desired {
        return ReconcilePlan::Noop;
    }

    if current == TransferStatus::Pending && desired == TransferStatus::Reversed {
        return ReconcilePlan::Update {
            steps: vec![
                PlanStep {
                    from: TransferStatus::Pending,
                    to: TransferStatus::Sent,
                },
                PlanStep {
                    from: TransferStatus::Sent,
                    to: TransferStatus::Reversed,
                },
            ],
        };
    }

    if !is_allowed(current, desired) {
        return ReconcilePlan::Illegal {
            from: current,
            to: desired,
        };
    }

    ReconcilePlan::Update {
        steps: vec![PlanStep {
            from: current,
            to: desired,
        }],
    }
}
