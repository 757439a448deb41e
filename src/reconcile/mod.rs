//! Reconciliation: converge payout legs with the processor and audit the
//! books against each other.

pub mod auditor;
pub mod summary;
pub mod trace;
pub mod transfer;
pub mod worker;

pub use auditor::{
    AuditReport, JobEvidence, ReconciliationAuditor, Severity, SeverityCounts, TrendReport,
    Violation, ViolationCode, audit_job,
};
pub use summary::{ReconciliationSummary, reconciliation_summary};
pub use trace::{PayoutTrace, payout_trace};
pub use transfer::{ReconcileOutcome, TransferReconciler, TransitionOutcome, apply_lifecycle_event};
pub use worker::{AuditWorker, WorkerConfig};
