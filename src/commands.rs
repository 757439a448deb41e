//! Command dispatch
//!
//! Every state-changing operation the boundary can request is a variant
//! of [`Command`]. [`CommandBus`] owns the services, built once at
//! startup, and routes with an exhaustive match.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::actor::Actor;
use crate::config::EscrowConfig;
use crate::error::EscrowError;
use crate::funding::{CheckoutDraft, CheckoutResult, CheckoutService};
use crate::processor::PaymentProcessor;
use crate::reconcile::{AuditReport, ReconcileOutcome, ReconciliationAuditor, TransferReconciler};
use crate::refund::{RefundOutcome, RefundService};
use crate::release::{ReleaseEngine, ReleaseOutcome};
use crate::store::EscrowStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CheckoutDraft(CheckoutDraft),
    ReleaseJob { job_id: Uuid, actor: Actor },
    ReleasePmRequest { pm_request_id: Uuid, actor: Actor },
    RefundJob { job_id: Uuid },
    ReconcileTransfer { external_id: String },
    RunAudit { from: DateTime<Utc>, to: DateTime<Utc> },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::CheckoutDraft(_) => "checkout_draft",
            Command::ReleaseJob { .. } => "release_job",
            Command::ReleasePmRequest { .. } => "release_pm_request",
            Command::RefundJob { .. } => "refund_job",
            Command::ReconcileTransfer { .. } => "reconcile_transfer",
            Command::RunAudit { .. } => "run_audit",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CommandResult {
    Checkout(CheckoutResult),
    Release(ReleaseOutcome),
    Refund(RefundOutcome),
    Reconcile(ReconcileOutcome),
    Audit(AuditReport),
}

pub struct CommandBus {
    checkout: CheckoutService,
    release: ReleaseEngine,
    refund: RefundService,
    reconciler: TransferReconciler,
    auditor: Arc<ReconciliationAuditor>,
}

impl CommandBus {
    pub fn new(
        store: Arc<dyn EscrowStore>,
        processor: Arc<dyn PaymentProcessor>,
        config: EscrowConfig,
    ) -> Self {
        Self {
            checkout: CheckoutService::new(store.clone(), processor.clone()),
            release: ReleaseEngine::new(store.clone(), processor.clone(), config),
            refund: RefundService::new(store.clone(), processor.clone()),
            reconciler: TransferReconciler::new(store.clone(), processor),
            auditor: Arc::new(ReconciliationAuditor::new(store)),
        }
    }

    /// Shared with the periodic audit worker
    pub fn auditor(&self) -> Arc<ReconciliationAuditor> {
        self.auditor.clone()
    }

    pub async fn dispatch(&self, command: Command) -> Result<CommandResult, EscrowError> {
        debug!(command = command.name(), "Dispatching command");
        match command {
            Command::CheckoutDraft(draft) => {
                Ok(CommandResult::Checkout(self.checkout.checkout_draft(draft).await?))
            }
            Command::ReleaseJob { job_id, actor } => {
                Ok(CommandResult::Release(self.release.release_job(job_id, actor).await?))
            }
            Command::ReleasePmRequest {
                pm_request_id,
                actor,
            } => Ok(CommandResult::Release(
                self.release.release_pm_request(pm_request_id, actor).await?,
            )),
            Command::RefundJob { job_id } => {
                Ok(CommandResult::Refund(self.refund.refund_job(job_id).await?))
            }
            Command::ReconcileTransfer { external_id } => Ok(CommandResult::Reconcile(
                self.reconciler.reconcile_by_external_id(&external_id).await?,
            )),
            Command::RunAudit { from, to } => {
                Ok(CommandResult::Audit(self.auditor.run(from, to).await?))
            }
        }
    }
}
