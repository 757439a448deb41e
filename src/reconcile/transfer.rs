//! Payout leg transitions driven by the processor
//!
//! Two entry points move a leg:
//! - [`apply_lifecycle_event`]: a transfer created/failed/reversed event,
//!   inside the webhook gate's transaction.
//! - [`TransferReconciler::reconcile_by_external_id`]: an operator pull
//!   of the processor's view, planned with [`build_plan`].
//!
//! Both apply status changes as compare-and-swap updates and never force
//! an illegal hop.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::EscrowError;
use crate::ids::TransferRecordId;
use crate::ledger::{Bucket, Direction, EntryType, NewLedgerEntry};
use crate::processor::PaymentProcessor;
use crate::store::{EscrowStore, StoreTx};
use crate::transfer::{
    ProcessorTransferFacts, ReconcilePlan, TransferLifecycle, TransferRecord, TransferStatus,
    build_plan, is_allowed,
};
use crate::webhook::event::TransferObject;

const DEFAULT_FAILURE_REASON: &str = "transfer_failed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TransitionOutcome {
    Applied {
        transfer_record_id: TransferRecordId,
        from: TransferStatus,
        to: TransferStatus,
    },
    Noop {
        transfer_record_id: TransferRecordId,
        status: TransferStatus,
    },
    /// Illegal hop, or the row moved under us
    Conflict {
        transfer_record_id: TransferRecordId,
        from: TransferStatus,
        to: TransferStatus,
    },
    UnknownTransfer { external_ref: String },
}

/// Locate the leg an event refers to, attaching the processor id when the
/// leg was found through metadata.
async fn locate_leg(
    tx: &mut dyn StoreTx,
    object: &TransferObject,
) -> Result<Option<TransferRecord>, EscrowError> {
    if let Some(leg) = tx.find_transfer_by_external_ref(&object.id).await? {
        return Ok(Some(leg));
    }

    let Some(id) = object
        .transfer_record_hint()
        .and_then(|hint| hint.parse::<TransferRecordId>().ok())
    else {
        return Ok(None);
    };

    let Some(mut leg) = tx.find_transfer_by_id(id).await? else {
        return Ok(None);
    };
    if leg.external_transfer_ref.is_none() {
        tx.attach_external_ref(leg.id, &object.id).await?;
        leg.external_transfer_ref = Some(object.id.clone());
    }
    Ok(Some(leg))
}

/// Apply a transfer lifecycle event to its payout leg
pub async fn apply_lifecycle_event(
    tx: &mut dyn StoreTx,
    lifecycle: TransferLifecycle,
    object: &TransferObject,
) -> Result<TransitionOutcome, EscrowError> {
    let Some(leg) = locate_leg(tx, object).await? else {
        warn!(transfer = %object.id, ?lifecycle, "Transfer event for unknown payout leg");
        return Ok(TransitionOutcome::UnknownTransfer {
            external_ref: object.id.clone(),
        });
    };

    let target = lifecycle.target_status();
    if leg.status == target {
        apply_leg_effects(tx, &leg, target).await?;
        return Ok(TransitionOutcome::Noop {
            transfer_record_id: leg.id,
            status: target,
        });
    }

    if !is_allowed(leg.status, target) {
        warn!(
            transfer_record_id = %leg.id,
            from = %leg.status,
            to = %target,
            "Illegal payout leg transition rejected"
        );
        return Ok(TransitionOutcome::Conflict {
            transfer_record_id: leg.id,
            from: leg.status,
            to: target,
        });
    }

    let failure_reason = (target == TransferStatus::Failed).then(|| {
        object
            .failure_message
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_FAILURE_REASON)
    });

    if !tx
        .transition_transfer(leg.id, leg.status, target, failure_reason)
        .await?
    {
        warn!(transfer_record_id = %leg.id, from = %leg.status, to = %target, "Payout leg moved concurrently");
        return Ok(TransitionOutcome::Conflict {
            transfer_record_id: leg.id,
            from: leg.status,
            to: target,
        });
    }

    apply_leg_effects(tx, &leg, target).await?;

    info!(
        transfer_record_id = %leg.id,
        from = %leg.status,
        to = %target,
        "Payout leg transitioned"
    );
    Ok(TransitionOutcome::Applied {
        transfer_record_id: leg.id,
        from: leg.status,
        to: target,
    })
}

/// Ledger writes that accompany a leg reaching `status`. Each is guarded
/// by an existence check on the leg.
async fn apply_leg_effects(
    tx: &mut dyn StoreTx,
    leg: &TransferRecord,
    status: TransferStatus,
) -> Result<(), EscrowError> {
    match status {
        TransferStatus::Sent => {
            if tx
                .transfer_ledger_entry_exists(leg.id, EntryType::Payout)
                .await?
            {
                return Ok(());
            }
            let mut entry = NewLedgerEntry::new(
                leg.user_id,
                EntryType::Payout,
                Direction::Credit,
                Bucket::Paid,
                leg.amount_cents,
                leg.currency,
            )
            .job(leg.job_id)
            .transfer_record(leg.id)
            .memo(format!("{} payout", leg.role));
            if let Some(external_ref) = &leg.external_transfer_ref {
                entry = entry.external_ref(external_ref.clone());
            }
            tx.insert_ledger_entry(entry).await?;
        }
        TransferStatus::Reversed => {
            // Only a leg that was paid out has money to claw back.
            if !tx
                .transfer_ledger_entry_exists(leg.id, EntryType::Payout)
                .await?
                || tx
                    .transfer_ledger_entry_exists(leg.id, EntryType::Adjustment)
                    .await?
            {
                return Ok(());
            }
            let mut entry = NewLedgerEntry::new(
                leg.user_id,
                EntryType::Adjustment,
                Direction::Debit,
                Bucket::Paid,
                leg.amount_cents,
                leg.currency,
            )
            .job(leg.job_id)
            .transfer_record(leg.id)
            .memo("payout reversed");
            if let Some(external_ref) = &leg.external_transfer_ref {
                entry = entry.external_ref(external_ref.clone());
            }
            tx.insert_ledger_entry(entry).await?;
        }
        TransferStatus::Pending | TransferStatus::Failed => {}
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Noop {
        transfer_record_id: TransferRecordId,
        status: TransferStatus,
    },
    Applied {
        transfer_record_id: TransferRecordId,
        before: TransferStatus,
        after: TransferStatus,
        plan: ReconcilePlan,
    },
    Conflict {
        transfer_record_id: TransferRecordId,
        from: TransferStatus,
        to: TransferStatus,
    },
}

pub struct TransferReconciler {
    store: Arc<dyn EscrowStore>,
    processor: Arc<dyn PaymentProcessor>,
}

impl TransferReconciler {
    pub fn new(store: Arc<dyn EscrowStore>, processor: Arc<dyn PaymentProcessor>) -> Self {
        Self { store, processor }
    }

    /// Pull the processor's view of one transfer and converge its leg
    pub async fn reconcile_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<ReconcileOutcome, EscrowError> {
        let mut tx = self.store.begin().await?;

        let leg = tx
            .find_transfer_by_external_ref(external_id)
            .await?
            .ok_or_else(|| EscrowError::NotFound(format!("transfer {}", external_id)))?;

        let view = self.processor.retrieve_transfer(external_id).await?;
        let desired = ProcessorTransferFacts {
            reversed: view.reversed,
            amount_reversed_cents: view.amount_reversed_cents,
        }
        .desired_status();

        let plan = build_plan(leg.status, desired);
        let steps = match &plan {
            ReconcilePlan::Noop => {
                apply_leg_effects(tx.as_mut(), &leg, leg.status).await?;
                tx.commit().await?;
                return Ok(ReconcileOutcome::Noop {
                    transfer_record_id: leg.id,
                    status: leg.status,
                });
            }
            ReconcilePlan::Illegal { from, to } => {
                warn!(
                    transfer_record_id = %leg.id,
                    external_id,
                    from = %from,
                    to = %to,
                    "Reconciliation needs an illegal transition"
                );
                return Ok(ReconcileOutcome::Conflict {
                    transfer_record_id: leg.id,
                    from: *from,
                    to: *to,
                });
            }
            ReconcilePlan::Update { steps } => steps.clone(),
        };

        for step in &steps {
            if !tx
                .transition_transfer(leg.id, step.from, step.to, None)
                .await?
            {
                // Dropping tx rolls back any earlier step.
                warn!(
                    transfer_record_id = %leg.id,
                    from = %step.from,
                    to = %step.to,
                    "Reconciliation step lost a race"
                );
                return Ok(ReconcileOutcome::Conflict {
                    transfer_record_id: leg.id,
                    from: step.from,
                    to: step.to,
                });
            }
            apply_leg_effects(tx.as_mut(), &leg, step.to).await?;
        }
        tx.commit().await?;

        info!(
            transfer_record_id = %leg.id,
            external_id,
            before = %leg.status,
            after = %desired,
            steps = steps.len(),
            "Payout leg reconciled"
        );
        Ok(ReconcileOutcome::Applied {
            transfer_record_id: leg.id,
            before: leg.status,
            after: desired,
            plan,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;
    use crate::processor::TransferView;
    use crate::processor::mock::MockProcessor;
    use crate::store::MemoryEscrowStore;
    use crate::transfer::{NewTransferRecord, PayoutMethod, TransferRole};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    async fn seed_leg(
        store: &MemoryEscrowStore,
        status: TransferStatus,
        external_ref: Option<&str>,
    ) -> TransferRecord {
        let mut leg = NewTransferRecord {
            job_id: Uuid::new_v4(),
            pm_request_id: None,
            role: TransferRole::Contractor,
            user_id: Uuid::new_v4(),
            amount_cents: 21_250,
            currency: Currency::Usd,
            method: PayoutMethod::Stripe,
        }
        .into_record(TransferRecordId::new(), Utc::now());
        leg.status = status;
        leg.external_transfer_ref = external_ref.map(str::to_string);
        let seeded = leg.clone();
        store.with_state(move |s| s.transfers.push(seeded)).await;
        leg
    }

    fn transfer_object(id: &str, hint: Option<TransferRecordId>) -> TransferObject {
        let mut metadata = BTreeMap::new();
        if let Some(hint) = hint {
            metadata.insert("transferRecordId".to_string(), hint.to_string());
        }
        TransferObject {
            id: id.to_string(),
            amount: 21_250,
            amount_reversed: 0,
            reversed: false,
            failure_message: None,
            metadata,
        }
    }

    async fn apply(
        store: &MemoryEscrowStore,
        lifecycle: TransferLifecycle,
        object: &TransferObject,
    ) -> TransitionOutcome {
        let mut tx = store.begin().await.unwrap();
        let outcome = apply_lifecycle_event(tx.as_mut(), lifecycle, object)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        outcome
    }

    async fn entries_of(store: &MemoryEscrowStore, entry_type: EntryType) -> usize {
        store
            .snapshot()
            .await
            .ledger
            .iter()
            .filter(|e| e.entry_type == entry_type)
            .count()
    }

    #[tokio::test]
    async fn test_created_event_attaches_ref_and_writes_payout_once() {
        let store = MemoryEscrowStore::new();
        let leg = seed_leg(&store, TransferStatus::Pending, None).await;
        let object = transfer_object("tr_1", Some(leg.id));

        let first = apply(&store, TransferLifecycle::Created, &object).await;
        assert!(matches!(first, TransitionOutcome::Applied { to: TransferStatus::Sent, .. }));

        let second = apply(&store, TransferLifecycle::Created, &object).await;
        assert!(matches!(second, TransitionOutcome::Noop { .. }));

        let state = store.snapshot().await;
        assert_eq!(state.transfers[0].external_transfer_ref.as_deref(), Some("tr_1"));
        assert_eq!(entries_of(&store, EntryType::Payout).await, 1);
    }

    #[tokio::test]
    async fn test_failed_event_records_reason() {
        let store = MemoryEscrowStore::new();
        seed_leg(&store, TransferStatus::Pending, Some("tr_2")).await;
        let mut object = transfer_object("tr_2", None);
        object.failure_message = Some("account_closed".into());

        apply(&store, TransferLifecycle::Failed, &object).await;

        let state = store.snapshot().await;
        assert_eq!(state.transfers[0].status, TransferStatus::Failed);
        assert_eq!(state.transfers[0].failure_reason.as_deref(), Some("account_closed"));
        assert_eq!(entries_of(&store, EntryType::Payout).await, 0);
    }

    #[tokio::test]
    async fn test_illegal_event_is_conflict_and_unchanged() {
        let store = MemoryEscrowStore::new();
        seed_leg(&store, TransferStatus::Failed, Some("tr_3")).await;

        let outcome = apply(&store, TransferLifecycle::Created, &transfer_object("tr_3", None)).await;
        assert!(matches!(
            outcome,
            TransitionOutcome::Conflict {
                from: TransferStatus::Failed,
                to: TransferStatus::Sent,
                ..
            }
        ));
        assert_eq!(store.snapshot().await.transfers[0].status, TransferStatus::Failed);
    }

    #[tokio::test]
    async fn test_reversal_after_failure_writes_no_adjustment() {
        let store = MemoryEscrowStore::new();
        seed_leg(&store, TransferStatus::Failed, Some("tr_4")).await;

        apply(&store, TransferLifecycle::Reversed, &transfer_object("tr_4", None)).await;

        assert_eq!(store.snapshot().await.transfers[0].status, TransferStatus::Reversed);
        assert_eq!(entries_of(&store, EntryType::Adjustment).await, 0);
    }

    #[tokio::test]
    async fn test_unknown_transfer() {
        let store = MemoryEscrowStore::new();
        let outcome = apply(&store, TransferLifecycle::Created, &transfer_object("tr_x", None)).await;
        assert_eq!(
            outcome,
            TransitionOutcome::UnknownTransfer {
                external_ref: "tr_x".into()
            }
        );
    }

    #[tokio::test]
    async fn test_reconcile_pending_to_reversed_in_two_steps() {
        let store = MemoryEscrowStore::new();
        let processor = Arc::new(MockProcessor::new());
        seed_leg(&store, TransferStatus::Pending, Some("tr_5")).await;
        processor.set_transfer(TransferView {
            id: "tr_5".into(),
            amount_cents: 21_250,
            amount_reversed_cents: 21_250,
            reversed: true,
        });

        let reconciler = TransferReconciler::new(Arc::new(store.clone()), processor.clone());
        let outcome = reconciler.reconcile_by_external_id("tr_5").await.unwrap();

        match outcome {
            ReconcileOutcome::Applied {
                before, after, plan, ..
            } => {
                assert_eq!(before, TransferStatus::Pending);
                assert_eq!(after, TransferStatus::Reversed);
                assert_eq!(plan.kind(), "update");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert_eq!(store.snapshot().await.transfers[0].status, TransferStatus::Reversed);
        assert_eq!(entries_of(&store, EntryType::Payout).await, 1);
        assert_eq!(entries_of(&store, EntryType::Adjustment).await, 1);
    }

    #[tokio::test]
    async fn test_reconcile_failed_to_sent_is_conflict() {
        let store = MemoryEscrowStore::new();
        let processor = Arc::new(MockProcessor::new());
        seed_leg(&store, TransferStatus::Failed, Some("tr_6")).await;
        processor.set_transfer(TransferView {
            id: "tr_6".into(),
            amount_cents: 21_250,
            amount_reversed_cents: 0,
            reversed: false,
        });

        let reconciler = TransferReconciler::new(Arc::new(store.clone()), processor);
        let outcome = reconciler.reconcile_by_external_id("tr_6").await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Conflict { .. }));
        assert_eq!(store.snapshot().await.transfers[0].status, TransferStatus::Failed);
    }

    #[tokio::test]
    async fn test_reconcile_unknown_external_id() {
        let store = MemoryEscrowStore::new();
        let reconciler =
            TransferReconciler::new(Arc::new(store), Arc::new(MockProcessor::new()));
        let err = reconciler.reconcile_by_external_id("tr_missing").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
