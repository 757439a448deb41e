//! Cross-module flows on the in-memory store and a mock processor

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::actor::Actor;
use crate::commands::{Command, CommandBus, CommandResult};
use crate::config::EscrowConfig;
use crate::escrow::{
    DisputeCase, DisputeStatus, EscrowKind, EscrowStatus, JobStatus, NewEscrow, PaymentStatus,
    PayoutStatus, PmRequest, PmRequestStatus,
};
use crate::funding::{CheckoutDraft, FundingOutcome, FundingRejection};
use crate::ids::EscrowId;
use crate::ledger::{Direction, EntryType};
use crate::money::Currency;
use crate::processor::TransferView;
use crate::processor::mock::MockProcessor;
use crate::reconcile::{ReconcileOutcome, TransitionOutcome};
use crate::refund::{RefundOutcome, RefundRejection};
use crate::release::{ReleaseOutcome, ReleaseSummary, RemainderDisposition};
use crate::store::MemoryEscrowStore;
use crate::transfer::{TransferRole, TransferStatus};
use crate::webhook::{EventEffect, GateOutcome, WebhookGate};

struct Harness {
    store: MemoryEscrowStore,
    processor: Arc<MockProcessor>,
    bus: CommandBus,
    gate: WebhookGate,
}

impl Harness {
    fn new() -> Self {
        let store = MemoryEscrowStore::new();
        let processor = Arc::new(MockProcessor::new());
        let bus = CommandBus::new(
            Arc::new(store.clone()),
            processor.clone(),
            EscrowConfig::default(),
        );
        let gate = WebhookGate::new(Arc::new(store.clone()), "whsec_test".into(), 300);
        Self {
            store,
            processor,
            bus,
            gate,
        }
    }

    async fn checkout(&self, poster_id: Uuid, amount_cents: i64) -> (Uuid, String) {
        match self
            .bus
            .dispatch(Command::CheckoutDraft(CheckoutDraft {
                draft_id: Uuid::new_v4(),
                poster_id,
                amount_cents,
                currency: Currency::Usd,
            }))
            .await
            .unwrap()
        {
            CommandResult::Checkout(c) => (c.job_id, c.payment_intent_id),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    async fn deliver(&self, event: serde_json::Value) -> GateOutcome {
        self.gate
            .process(event.to_string().as_bytes())
            .await
            .unwrap()
    }

    async fn release_job(&self, job_id: Uuid, actor: Actor) -> ReleaseOutcome {
        match self
            .bus
            .dispatch(Command::ReleaseJob { job_id, actor })
            .await
            .unwrap()
        {
            CommandResult::Release(outcome) => outcome,
            other => panic!("unexpected result: {:?}", other),
        }
    }

    async fn refund_job(&self, job_id: Uuid) -> RefundOutcome {
        match self.bus.dispatch(Command::RefundJob { job_id }).await.unwrap() {
            CommandResult::Refund(outcome) => outcome,
            other => panic!("unexpected result: {:?}", other),
        }
    }

    /// Job reaches COMPLETED with a contractor assigned
    async fn complete_job(&self, job_id: Uuid, contractor_id: Uuid) {
        self.store
            .with_state(move |s| {
                let job = s.jobs.get_mut(&job_id).unwrap();
                job.status = JobStatus::Completed;
                job.contractor_id = Some(contractor_id);
            })
            .await;
    }
}

fn capture_event(
    event_id: &str,
    pi: &str,
    job_id: Uuid,
    poster_id: Uuid,
    amount_cents: i64,
) -> serde_json::Value {
    json!({
        "id": event_id,
        "type": "payment_intent.succeeded",
        "created": 1_700_000_000,
        "data": {"object": {
            "id": pi,
            "status": "succeeded",
            "amount": amount_cents,
            "amount_received": amount_cents,
            "currency": "usd",
            "latest_charge": format!("ch_{}", pi),
            "metadata": {
                "type": "job_escrow",
                "jobId": job_id.to_string(),
                "posterId": poster_id.to_string()
            }
        }}
    })
}

fn transfer_event(event_id: &str, event_type: &str, tr: &str, leg_id: &str) -> serde_json::Value {
    json!({
        "id": event_id,
        "type": event_type,
        "data": {"object": {
            "id": tr,
            "amount": 21_250,
            "metadata": {"transferRecordId": leg_id}
        }}
    })
}

async fn funded_job(h: &Harness, poster_id: Uuid) -> Uuid {
    let (job_id, pi) = h.checkout(poster_id, 25_000).await;
    h.deliver(capture_event("evt_fund", &pi, job_id, poster_id, 25_000))
        .await;
    job_id
}

// ============================================================================
// Funding
// ============================================================================

#[tokio::test]
async fn test_fund_250_job_once_under_redelivery() {
    let h = Harness::new();
    let poster = Uuid::new_v4();
    let (job_id, pi) = h.checkout(poster, 25_000).await;

    let event = capture_event("evt_1", &pi, job_id, poster, 25_000);
    let first = h.deliver(event.clone()).await;
    assert!(matches!(
        first,
        GateOutcome::Processed {
            effect: EventEffect::Funding(FundingOutcome::Funded {
                idempotent: false,
                ..
            }),
            ..
        }
    ));

    let second = h.deliver(event).await;
    assert_eq!(
        second,
        GateOutcome::Duplicate {
            event_id: "evt_1".into()
        }
    );

    let state = h.store.snapshot().await;
    assert_eq!(state.escrows.len(), 1);
    assert_eq!(state.escrows[0].status, EscrowStatus::Funded);
    assert_eq!(state.escrows[0].amount_cents, 25_000);

    assert_eq!(state.ledger.len(), 1);
    let entry = &state.ledger[0];
    assert_eq!(entry.entry_type, EntryType::EscrowFund);
    assert_eq!(entry.direction, Direction::Debit);
    assert_eq!(entry.amount_cents, 25_000);

    let job = &state.jobs[&job_id];
    assert_eq!(job.payment_status, PaymentStatus::Funded);
    assert_eq!(job.status, JobStatus::Open);
}

#[tokio::test]
async fn test_second_event_for_same_capture_is_idempotent() {
    let h = Harness::new();
    let poster = Uuid::new_v4();
    let (job_id, pi) = h.checkout(poster, 25_000).await;

    h.deliver(capture_event("evt_a", &pi, job_id, poster, 25_000))
        .await;
    let outcome = h
        .deliver(capture_event("evt_b", &pi, job_id, poster, 25_000))
        .await;
    assert!(matches!(
        outcome,
        GateOutcome::Processed {
            effect: EventEffect::Funding(FundingOutcome::Funded {
                idempotent: true,
                ..
            }),
            ..
        }
    ));

    let state = h.store.snapshot().await;
    assert_eq!(state.escrows.len(), 1);
    assert_eq!(state.ledger.len(), 1);
    assert_eq!(state.webhook_events.len(), 2);
}

#[tokio::test]
async fn test_amount_mismatch_creates_no_escrow() {
    let h = Harness::new();
    let poster = Uuid::new_v4();
    let (job_id, pi) = h.checkout(poster, 25_000).await;

    let outcome = h
        .deliver(capture_event("evt_short", &pi, job_id, poster, 24_000))
        .await;
    match outcome {
        GateOutcome::Processed {
            effect: EventEffect::Funding(FundingOutcome::Rejected(rejection)),
            ..
        } => {
            assert_eq!(rejection.code(), "AMOUNT_MISMATCH");
            assert_eq!(
                rejection,
                FundingRejection::AmountMismatch {
                    expected_cents: 25_000,
                    captured_cents: 24_000
                }
            );
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let state = h.store.snapshot().await;
    assert!(state.escrows.is_empty());
    assert!(state.ledger.is_empty());
    assert_eq!(state.jobs[&job_id].payment_status, PaymentStatus::Unfunded);
    // The rejection is final: the event is marked processed.
    assert!(state.webhook_events["evt_short"].processed_at.is_some());
}

#[tokio::test]
async fn test_checkout_retry_reuses_claimed_job() {
    let h = Harness::new();
    let draft = CheckoutDraft {
        draft_id: Uuid::new_v4(),
        poster_id: Uuid::new_v4(),
        amount_cents: 5_000,
        currency: Currency::Usd,
    };

    h.processor.set_fail_charges(true);
    assert!(h.bus.dispatch(Command::CheckoutDraft(draft.clone())).await.is_err());
    assert_eq!(h.store.snapshot().await.jobs.len(), 1);

    h.processor.set_fail_charges(false);
    h.bus.dispatch(Command::CheckoutDraft(draft.clone())).await.unwrap();
    let reused = h.bus.dispatch(Command::CheckoutDraft(draft)).await.unwrap();
    assert!(matches!(
        reused,
        CommandResult::Checkout(crate::funding::CheckoutResult { reused: true, .. })
    ));
    assert_eq!(h.store.snapshot().await.jobs.len(), 1);
}

// ============================================================================
// Release, then the refund guards
// ============================================================================

#[tokio::test]
async fn test_release_splits_and_is_idempotent() {
    let h = Harness::new();
    let poster = Uuid::new_v4();
    let contractor = Uuid::new_v4();
    let job_id = funded_job(&h, poster).await;
    h.complete_job(job_id, contractor).await;

    let outcome = h.release_job(job_id, Actor::user(poster)).await;
    match outcome {
        ReleaseOutcome::Released(summary) => {
            assert!(!summary.already_released);
            assert_eq!(summary.release_amount_cents, 25_000);
            assert_eq!(summary.legs_created, 2);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let state = h.store.snapshot().await;
    assert_eq!(state.escrows[0].status, EscrowStatus::Released);
    assert_eq!(state.jobs[&job_id].payout_status, PayoutStatus::Released);
    let contractor_leg = state
        .transfers
        .iter()
        .find(|t| t.role == TransferRole::Contractor)
        .unwrap();
    assert_eq!(contractor_leg.amount_cents, 21_250);
    assert_eq!(contractor_leg.status, TransferStatus::Pending);
    let platform_leg = state
        .transfers
        .iter()
        .find(|t| t.role == TransferRole::Platform)
        .unwrap();
    assert_eq!(platform_leg.amount_cents, 3_750);
    let entries_after_first = state.ledger.len();

    for _ in 0..2 {
        let again = h.release_job(job_id, Actor::user(poster)).await;
        match again {
            ReleaseOutcome::Released(ReleaseSummary {
                already_released,
                release_amount_cents,
                remainder_cents,
                ..
            }) => {
                assert!(already_released);
                assert_eq!(release_amount_cents, 0);
                assert_eq!(remainder_cents, 0);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
    let state = h.store.snapshot().await;
    assert_eq!(state.ledger.len(), entries_after_first);
    assert_eq!(state.transfers.len(), 2);
}

#[tokio::test]
async fn test_release_by_stranger_is_forbidden() {
    let h = Harness::new();
    let poster = Uuid::new_v4();
    let job_id = funded_job(&h, poster).await;
    h.complete_job(job_id, Uuid::new_v4()).await;

    let outcome = h.release_job(job_id, Actor::user(Uuid::new_v4())).await;
    assert_eq!(
        outcome,
        ReleaseOutcome::Rejected {
            code: crate::release::ReleaseRejection::Forbidden
        }
    );
    assert_eq!(
        h.store.snapshot().await.escrows[0].status,
        EscrowStatus::Funded
    );
}

#[tokio::test]
async fn test_refund_after_release_never_reaches_processor() {
    let h = Harness::new();
    let poster = Uuid::new_v4();
    let job_id = funded_job(&h, poster).await;
    h.complete_job(job_id, Uuid::new_v4()).await;
    h.release_job(job_id, Actor::admin(Uuid::new_v4())).await;

    // Dispute state does not matter once payout is released.
    h.store
        .with_state(move |s| s.jobs.get_mut(&job_id).unwrap().status = JobStatus::Disputed)
        .await;

    let outcome = h.refund_job(job_id).await;
    assert_eq!(
        outcome,
        RefundOutcome::Rejected {
            code: RefundRejection::RefundAfterRelease
        }
    );
    assert_eq!(h.processor.refund_calls(), 0);
    assert_eq!(h.store.dispute_lookups(), 0);
}

#[tokio::test]
async fn test_sent_leg_blocks_refund_before_dispute_check() {
    let h = Harness::new();
    let poster = Uuid::new_v4();
    let job_id = funded_job(&h, poster).await;
    h.complete_job(job_id, Uuid::new_v4()).await;
    h.release_job(job_id, Actor::user(poster)).await;

    let leg_id = h
        .store
        .snapshot()
        .await
        .transfers
        .iter()
        .find(|t| t.role == TransferRole::Contractor)
        .unwrap()
        .id
        .to_string();
    let outcome = h
        .deliver(transfer_event("evt_tr", "transfer.created", "tr_1", &leg_id))
        .await;
    assert!(matches!(
        outcome,
        GateOutcome::Processed {
            effect: EventEffect::Transfer(TransitionOutcome::Applied {
                to: TransferStatus::Sent,
                ..
            }),
            ..
        }
    ));

    // Job-level projection lagging behind the leg.
    h.store
        .with_state(move |s| {
            let job = s.jobs.get_mut(&job_id).unwrap();
            job.payout_status = PayoutStatus::Ready;
            job.status = JobStatus::Disputed;
        })
        .await;

    let outcome = h.refund_job(job_id).await;
    assert_eq!(
        outcome,
        RefundOutcome::Rejected {
            code: RefundRejection::RefundAfterPartialRelease
        }
    );
    assert_eq!(h.processor.refund_calls(), 0);
    assert_eq!(h.store.dispute_lookups(), 0);
}

#[tokio::test]
async fn test_resolved_dispute_lifts_guard() {
    let h = Harness::new();
    let poster = Uuid::new_v4();
    let job_id = funded_job(&h, poster).await;
    h.store
        .with_state(move |s| s.jobs.get_mut(&job_id).unwrap().status = JobStatus::Disputed)
        .await;

    assert_eq!(
        h.refund_job(job_id).await,
        RefundOutcome::Rejected {
            code: RefundRejection::Disputed
        }
    );
    assert_eq!(h.store.dispute_lookups(), 1);

    // Decided dispute, but the job lost its processor references.
    h.store
        .with_state(move |s| {
            s.disputes.push(DisputeCase {
                id: Uuid::new_v4(),
                job_id,
                status: DisputeStatus::Decided,
            });
            let job = s.jobs.get_mut(&job_id).unwrap();
            job.stripe_charge_id = None;
            job.stripe_payment_intent_id = None;
        })
        .await;
    assert_eq!(
        h.refund_job(job_id).await,
        RefundOutcome::Rejected {
            code: RefundRejection::MissingStripeRef
        }
    );
    assert_eq!(h.processor.refund_calls(), 0);
}

#[tokio::test]
async fn test_refund_funded_job_then_release_is_rejected() {
    let h = Harness::new();
    let poster = Uuid::new_v4();
    let job_id = funded_job(&h, poster).await;

    let outcome = h.refund_job(job_id).await;
    assert!(matches!(
        outcome,
        RefundOutcome::Refunded {
            amount_cents: 25_000,
            ..
        }
    ));
    assert_eq!(h.refund_job(job_id).await, RefundOutcome::AlreadyRefunded);
    assert_eq!(h.processor.refund_calls(), 1);

    let state = h.store.snapshot().await;
    assert_eq!(state.escrows[0].status, EscrowStatus::Refunded);
    assert_eq!(
        state
            .ledger
            .iter()
            .filter(|e| e.entry_type == EntryType::EscrowRefund)
            .count(),
        1
    );

    h.complete_job(job_id, Uuid::new_v4()).await;
    assert!(matches!(
        h.release_job(job_id, Actor::user(poster)).await,
        ReleaseOutcome::Rejected { .. }
    ));
}

#[tokio::test]
async fn test_late_capture_copy_does_not_refund_twice() {
    let h = Harness::new();
    let poster = Uuid::new_v4();
    let (job_id, pi) = h.checkout(poster, 25_000).await;
    h.deliver(capture_event("evt_fund", &pi, job_id, poster, 25_000))
        .await;
    assert!(matches!(
        h.refund_job(job_id).await,
        RefundOutcome::Refunded { .. }
    ));
    let entries = h.store.snapshot().await.ledger.len();

    // Same capture, new event id, after the refund
    let outcome = h
        .deliver(capture_event("evt_fund_copy", &pi, job_id, poster, 25_000))
        .await;
    assert!(matches!(
        outcome,
        GateOutcome::Processed {
            effect: EventEffect::Funding(FundingOutcome::Funded {
                idempotent: true,
                ..
            }),
            ..
        }
    ));

    let state = h.store.snapshot().await;
    assert_eq!(state.jobs[&job_id].payment_status, PaymentStatus::Refunded);
    assert_eq!(state.escrows.len(), 1);
    assert_eq!(state.escrows[0].status, EscrowStatus::Refunded);
    assert_eq!(state.ledger.len(), entries);

    assert_eq!(h.refund_job(job_id).await, RefundOutcome::AlreadyRefunded);
    assert_eq!(h.processor.refund_calls(), 1);
}

// ============================================================================
// Parts / materials
// ============================================================================

fn pm_capture_event(event_id: &str, pi: &str, pm: &PmRequest, job_id: Uuid) -> serde_json::Value {
    json!({
        "id": event_id,
        "type": "payment_intent.succeeded",
        "data": {"object": {
            "id": pi,
            "status": "succeeded",
            "amount": pm.approved_total_cents,
            "amount_received": pm.approved_total_cents,
            "currency": "usd",
            "latest_charge": format!("ch_{}", pi),
            "metadata": {
                "type": "pm_escrow",
                "jobId": job_id.to_string(),
                "pmRequestId": pm.id.to_string(),
                "posterId": pm.poster_id.to_string()
            }
        }}
    })
}

async fn seed_approved_pm(h: &Harness, job_id: Uuid, poster_id: Uuid, approved: i64) -> PmRequest {
    let pm = PmRequest {
        id: Uuid::new_v4(),
        job_id,
        poster_id,
        contractor_id: Uuid::new_v4(),
        status: PmRequestStatus::Approved,
        approved_total_cents: approved,
        verified_receipt_total_cents: None,
        currency: Currency::Usd,
        funded_at: None,
        released_at: None,
        closed_at: None,
    };
    let seeded = pm.clone();
    h.store
        .with_state(move |s| {
            s.pm_requests.insert(seeded.id, seeded);
        })
        .await;
    pm
}

#[tokio::test]
async fn test_pm_capture_funds_request_once() {
    let h = Harness::new();
    let poster = Uuid::new_v4();
    let job_id = funded_job(&h, poster).await;
    let pm = seed_approved_pm(&h, job_id, poster, 8_000).await;

    let event = pm_capture_event("evt_pm_1", "pi_pm_1", &pm, job_id);
    let first = h.deliver(event.clone()).await;
    assert!(matches!(
        first,
        GateOutcome::Processed {
            effect: EventEffect::Funding(FundingOutcome::Funded {
                idempotent: false,
                ..
            }),
            ..
        }
    ));
    assert_eq!(
        h.deliver(event).await,
        GateOutcome::Duplicate {
            event_id: "evt_pm_1".into()
        }
    );
    let copy = h
        .deliver(pm_capture_event("evt_pm_2", "pi_pm_1", &pm, job_id))
        .await;
    assert!(matches!(
        copy,
        GateOutcome::Processed {
            effect: EventEffect::Funding(FundingOutcome::Funded {
                idempotent: true,
                ..
            }),
            ..
        }
    ));

    let state = h.store.snapshot().await;
    let pools: Vec<_> = state
        .escrows
        .iter()
        .filter(|e| e.pm_request_id == Some(pm.id))
        .collect();
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].kind, EscrowKind::PartsMaterials);
    assert_eq!(pools[0].status, EscrowStatus::Funded);
    assert_eq!(pools[0].amount_cents, 8_000);
    assert_eq!(state.pm_requests[&pm.id].status, PmRequestStatus::Funded);

    let funded: Vec<_> = state
        .ledger
        .iter()
        .filter(|e| e.entry_type == EntryType::PmEscrowFunded)
        .collect();
    assert_eq!(funded.len(), 1);
    assert_eq!(funded[0].direction, Direction::Debit);
    assert_eq!(funded[0].amount_cents, 8_000);
    assert_eq!(funded[0].escrow_id, Some(pools[0].id));
    // The job's own funding is untouched.
    assert_eq!(state.escrows.len(), 2);
    assert_eq!(state.jobs[&job_id].payment_status, PaymentStatus::Funded);
}

#[tokio::test]
async fn test_pm_capture_for_another_job_is_rejected() {
    let h = Harness::new();
    let poster = Uuid::new_v4();
    let job_id = funded_job(&h, poster).await;
    let pm = seed_approved_pm(&h, job_id, poster, 8_000).await;

    let outcome = h
        .deliver(pm_capture_event("evt_pm_x", "pi_pm_x", &pm, Uuid::new_v4()))
        .await;
    match outcome {
        GateOutcome::Processed {
            effect: EventEffect::Funding(FundingOutcome::Rejected(rejection)),
            ..
        } => assert_eq!(rejection.code(), "INVALID_METADATA"),
        other => panic!("unexpected outcome: {:?}", other),
    }

    let state = h.store.snapshot().await;
    assert!(state.escrows.iter().all(|e| e.pm_request_id.is_none()));
    assert_eq!(state.pm_requests[&pm.id].status, PmRequestStatus::Approved);
    assert!(
        state
            .ledger
            .iter()
            .all(|e| e.entry_type != EntryType::PmEscrowFunded)
    );
}

async fn seed_verified_pm(h: &Harness, approved: i64, verified: i64) -> PmRequest {
    let pm = PmRequest {
        id: Uuid::new_v4(),
        job_id: Uuid::new_v4(),
        poster_id: Uuid::new_v4(),
        contractor_id: Uuid::new_v4(),
        status: PmRequestStatus::Verified,
        approved_total_cents: approved,
        verified_receipt_total_cents: Some(verified),
        currency: Currency::Usd,
        funded_at: Some(Utc::now()),
        released_at: None,
        closed_at: None,
    };
    let escrow = NewEscrow {
        job_id: pm.job_id,
        pm_request_id: Some(pm.id),
        kind: EscrowKind::PartsMaterials,
        amount_cents: approved,
        currency: Currency::Usd,
        payment_intent_ref: format!("pi_pm_{}", pm.id.simple()),
    }
    .into_escrow(EscrowId::new(), Utc::now());
    let seeded = pm.clone();
    h.store
        .with_state(move |s| {
            s.pm_requests.insert(seeded.id, seeded);
            s.escrows.push(escrow);
        })
        .await;
    pm
}

async fn release_pm(h: &Harness, pm: &PmRequest) -> ReleaseSummary {
    match h
        .bus
        .dispatch(Command::ReleasePmRequest {
            pm_request_id: pm.id,
            actor: Actor::user(pm.poster_id),
        })
        .await
        .unwrap()
    {
        CommandResult::Release(ReleaseOutcome::Released(summary)) => summary,
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_pm_overrun_is_not_paid_out() {
    let h = Harness::new();
    let pm = seed_verified_pm(&h, 10_000, 12_000).await;

    let summary = release_pm(&h, &pm).await;
    assert_eq!(summary.release_amount_cents, 10_000);
    assert_eq!(summary.remainder_cents, 0);
    assert_eq!(summary.disposition, RemainderDisposition::None);
    assert_eq!(h.processor.refund_calls(), 0);

    let state = h.store.snapshot().await;
    assert_eq!(state.pm_requests[&pm.id].status, PmRequestStatus::Closed);
    let leg = state.transfers.iter().find(|t| t.pm_request_id == Some(pm.id)).unwrap();
    assert_eq!(leg.amount_cents, 10_000);
}

#[tokio::test]
async fn test_pm_large_remainder_is_refunded() {
    let h = Harness::new();
    let pm = seed_verified_pm(&h, 10_000, 6_000).await;

    let summary = release_pm(&h, &pm).await;
    assert_eq!(summary.release_amount_cents, 6_000);
    assert_eq!(summary.remainder_cents, 4_000);
    assert_eq!(summary.disposition, RemainderDisposition::ProcessorRefund);
    assert_eq!(h.processor.refund_calls(), 1);
    assert_eq!(h.processor.last_refund().unwrap().amount_cents, Some(4_000));

    let state = h.store.snapshot().await;
    let refund_entry = state
        .ledger
        .iter()
        .find(|e| e.entry_type == EntryType::PmRefund)
        .unwrap();
    assert_eq!(refund_entry.amount_cents, 4_000);
    assert!(refund_entry.external_ref.is_some());
    assert!(state.wallet_credits.is_empty());

    // Second release: flagged, zeroed, nothing new written.
    let entries = state.ledger.len();
    let again = release_pm(&h, &pm).await;
    assert!(again.already_released);
    assert_eq!(again.release_amount_cents, 0);
    assert_eq!(again.remainder_cents, 0);
    assert_eq!(h.store.snapshot().await.ledger.len(), entries);
    assert_eq!(h.processor.refund_calls(), 1);
}

#[tokio::test]
async fn test_pm_small_remainder_becomes_wallet_credit() {
    let h = Harness::new();
    let pm = seed_verified_pm(&h, 10_000, 9_700).await;

    let summary = release_pm(&h, &pm).await;
    assert_eq!(summary.remainder_cents, 300);
    assert_eq!(summary.disposition, RemainderDisposition::WalletCredit);
    assert_eq!(h.processor.refund_calls(), 0);

    let state = h.store.snapshot().await;
    assert_eq!(state.wallet_credits.len(), 1);
    assert_eq!(state.wallet_credits[0].amount_cents, 300);
    assert!(state.ledger.iter().any(|e| e.entry_type == EntryType::PmCredit
        && e.direction == Direction::Credit
        && e.amount_cents == 300));
}

#[tokio::test]
async fn test_pm_refund_failure_leaves_escrow_funded() {
    let h = Harness::new();
    let pm = seed_verified_pm(&h, 10_000, 6_000).await;
    h.processor.set_fail_refunds(true);

    let result = h
        .bus
        .dispatch(Command::ReleasePmRequest {
            pm_request_id: pm.id,
            actor: Actor::user(pm.poster_id),
        })
        .await;
    assert!(result.is_err());

    let state = h.store.snapshot().await;
    assert_eq!(state.escrows[0].status, EscrowStatus::Funded);
    assert!(state.ledger.is_empty());
    assert!(state.transfers.is_empty());
    assert_eq!(state.pm_requests[&pm.id].status, PmRequestStatus::Verified);
}

// ============================================================================
// Payout legs, reconciliation and audit
// ============================================================================

#[tokio::test]
async fn test_payout_lifecycle_reconcile_and_audit() {
    let h = Harness::new();
    let poster = Uuid::new_v4();
    let job_id = funded_job(&h, poster).await;
    h.complete_job(job_id, Uuid::new_v4()).await;
    h.release_job(job_id, Actor::user(poster)).await;

    let leg_id = h
        .store
        .snapshot()
        .await
        .transfers
        .iter()
        .find(|t| t.role == TransferRole::Contractor)
        .unwrap()
        .id;
    h.deliver(transfer_event(
        "evt_created",
        "transfer.created",
        "tr_9",
        &leg_id.to_string(),
    ))
    .await;

    let now = Utc::now();
    let report = match h
        .bus
        .dispatch(Command::RunAudit {
            from: now - Duration::hours(1),
            to: now + Duration::minutes(1),
        })
        .await
        .unwrap()
    {
        CommandResult::Audit(report) => report,
        other => panic!("unexpected result: {:?}", other),
    };
    assert_eq!(report.jobs_scanned, 1);
    assert!(report.violations.is_empty(), "{:?}", report.violations);

    // Processor now reports the transfer reversed.
    h.processor.set_transfer(TransferView {
        id: "tr_9".into(),
        amount_cents: 21_250,
        amount_reversed_cents: 21_250,
        reversed: true,
    });
    let outcome = match h
        .bus
        .dispatch(Command::ReconcileTransfer {
            external_id: "tr_9".into(),
        })
        .await
        .unwrap()
    {
        CommandResult::Reconcile(outcome) => outcome,
        other => panic!("unexpected result: {:?}", other),
    };
    assert!(matches!(
        outcome,
        ReconcileOutcome::Applied {
            before: TransferStatus::Sent,
            after: TransferStatus::Reversed,
            ..
        }
    ));

    let state = h.store.snapshot().await;
    let adjustment = state
        .ledger
        .iter()
        .find(|e| e.entry_type == EntryType::Adjustment)
        .unwrap();
    assert_eq!(adjustment.direction, Direction::Debit);
    assert_eq!(adjustment.transfer_record_id, Some(leg_id));

    // A stale `created` event cannot move the leg back.
    let stale = h
        .deliver(transfer_event(
            "evt_stale",
            "transfer.created",
            "tr_9",
            &leg_id.to_string(),
        ))
        .await;
    assert!(matches!(
        stale,
        GateOutcome::Processed {
            effect: EventEffect::Transfer(TransitionOutcome::Conflict { .. }),
            ..
        }
    ));
}
