//! Reconciliation Auditor
//!
//! Read-only comparator over released jobs. For each job it assembles
//! the escrow, payout legs and ledger entries and reports violations.
//! It never writes.
//!
//! | Rule                             | Severity |
//! |----------------------------------|----------|
//! | `RELEASED_WITHOUT_ESCROW`        | CRITICAL |
//! | `ESCROW_NOT_RELEASED`            | CRITICAL |
//! | `REFUNDED_AFTER_RELEASE`         | CRITICAL |
//! | `SENT_LEG_WITHOUT_PAYOUT_LEDGER` | HIGH     |
//! | `ESCROW_AMOUNT_MISMATCH`         | HIGH     |
//! | `LEGS_EXCEED_ESCROW`             | HIGH     |
//! | `MISSING_RELEASE_LEDGER`         | HIGH     |
//! | `RELEASED_WITHOUT_LEGS`          | WARN     |
//! | `FAILED_LEG`                     | WARN     |
//! | `REVERSED_LEG`                   | WARN     |

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::EscrowError;
use crate::escrow::{Escrow, EscrowStatus, JobFinancials, PaymentStatus};
use crate::ids::TransferRecordId;
use crate::ledger::{Direction, EntryType, LedgerEntry};
use crate::store::EscrowStore;
use crate::transfer::{TransferRecord, TransferStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    High,
    Warn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationCode {
    ReleasedWithoutEscrow,
    EscrowNotReleased,
    RefundedAfterRelease,
    SentLegWithoutPayoutLedger,
    EscrowAmountMismatch,
    LegsExceedEscrow,
    MissingReleaseLedger,
    ReleasedWithoutLegs,
    FailedLeg,
    ReversedLeg,
}

impl ViolationCode {
    pub fn severity(&self) -> Severity {
        use ViolationCode::*;
        match self {
            ReleasedWithoutEscrow | EscrowNotReleased | RefundedAfterRelease => Severity::Critical,
            SentLegWithoutPayoutLedger | EscrowAmountMismatch | LegsExceedEscrow
            | MissingReleaseLedger => Severity::High,
            ReleasedWithoutLegs | FailedLeg | ReversedLeg => Severity::Warn,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub job_id: Uuid,
    pub code: ViolationCode,
    pub severity: Severity,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_record_id: Option<TransferRecordId>,
}

impl Violation {
    fn new(job_id: Uuid, code: ViolationCode, detail: impl Into<String>) -> Self {
        Self {
            job_id,
            code,
            severity: code.severity(),
            detail: detail.into(),
            transfer_record_id: None,
        }
    }

    fn on_leg(mut self, id: TransferRecordId) -> Self {
        self.transfer_record_id = Some(id);
        self
    }
}

/// Everything the auditor looks at for one job
#[derive(Debug, Clone)]
pub struct JobEvidence {
    pub job: JobFinancials,
    pub escrows: Vec<Escrow>,
    pub transfers: Vec<TransferRecord>,
    pub ledger: Vec<LedgerEntry>,
}

/// Apply every rule to one released job.
///
/// The job escrow is checked against the job-level legs, and each
/// parts/materials escrow against the legs carrying its request id.
/// Leg status rules apply to every leg of the job.
pub fn audit_job(evidence: &JobEvidence) -> Vec<Violation> {
    let job = &evidence.job;
    let mut violations = Vec::new();

    let escrow = evidence.escrows.iter().find(|e| e.pm_request_id.is_none());
    let legs: Vec<&TransferRecord> = evidence
        .transfers
        .iter()
        .filter(|t| t.pm_request_id.is_none())
        .collect();

    match escrow {
        None => violations.push(Violation::new(
            job.id,
            ViolationCode::ReleasedWithoutEscrow,
            "job payout released but no escrow exists",
        )),
        Some(escrow) => {
            if escrow.status == EscrowStatus::Funded {
                violations.push(Violation::new(
                    job.id,
                    ViolationCode::EscrowNotReleased,
                    format!("escrow {} still {}", escrow.id, escrow.status),
                ));
            }
            if escrow.amount_cents != job.amount_cents {
                violations.push(Violation::new(
                    job.id,
                    ViolationCode::EscrowAmountMismatch,
                    format!(
                        "escrow {} cents vs job {} cents",
                        escrow.amount_cents, job.amount_cents
                    ),
                ));
            }

            let leg_total: i64 = legs.iter().map(|l| l.amount_cents).sum();
            if leg_total > escrow.amount_cents {
                violations.push(Violation::new(
                    job.id,
                    ViolationCode::LegsExceedEscrow,
                    format!(
                        "legs total {} cents exceeds escrow {} cents",
                        leg_total, escrow.amount_cents
                    ),
                ));
            }

            let has_release_entry = evidence
                .ledger
                .iter()
                .any(|e| e.entry_type == EntryType::EscrowRelease && e.escrow_id == Some(escrow.id));
            if !has_release_entry {
                violations.push(Violation::new(
                    job.id,
                    ViolationCode::MissingReleaseLedger,
                    format!("no ESCROW_RELEASE entry for escrow {}", escrow.id),
                ));
            }
        }
    }

    if escrow.is_some_and(|e| e.status == EscrowStatus::Refunded)
        || job.payment_status == PaymentStatus::Refunded
    {
        violations.push(Violation::new(
            job.id,
            ViolationCode::RefundedAfterRelease,
            "job refunded after payout release",
        ));
    }

    if legs.is_empty() {
        violations.push(Violation::new(
            job.id,
            ViolationCode::ReleasedWithoutLegs,
            "released job has no payout legs",
        ));
    }

    audit_pm_pools(evidence, &mut violations);

    for leg in &evidence.transfers {
        match leg.status {
            TransferStatus::Sent => {
                if !has_payout_evidence(&evidence.ledger, leg.id) {
                    violations.push(
                        Violation::new(
                            job.id,
                            ViolationCode::SentLegWithoutPayoutLedger,
                            format!("{} leg SENT without PAYOUT credit", leg.role),
                        )
                        .on_leg(leg.id),
                    );
                }
            }
            TransferStatus::Failed => violations.push(
                Violation::new(
                    job.id,
                    ViolationCode::FailedLeg,
                    leg.failure_reason
                        .clone()
                        .unwrap_or_else(|| format!("{} leg failed", leg.role)),
                )
                .on_leg(leg.id),
            ),
            TransferStatus::Reversed => violations.push(
                Violation::new(
                    job.id,
                    ViolationCode::ReversedLeg,
                    format!("{} leg reversed", leg.role),
                )
                .on_leg(leg.id),
            ),
            TransferStatus::Pending => {}
        }
    }

    violations
}

/// Parts/materials escrows against their own legs and release entries
fn audit_pm_pools(evidence: &JobEvidence, violations: &mut Vec<Violation>) {
    let job_id = evidence.job.id;
    let mut pm_ids: Vec<Uuid> = evidence
        .escrows
        .iter()
        .filter_map(|e| e.pm_request_id)
        .chain(evidence.transfers.iter().filter_map(|t| t.pm_request_id))
        .collect();
    pm_ids.sort();
    pm_ids.dedup();

    for pm_id in pm_ids {
        let escrow = evidence
            .escrows
            .iter()
            .find(|e| e.pm_request_id == Some(pm_id));
        let legs: Vec<&TransferRecord> = evidence
            .transfers
            .iter()
            .filter(|t| t.pm_request_id == Some(pm_id))
            .collect();

        let Some(escrow) = escrow else {
            violations.push(Violation::new(
                job_id,
                ViolationCode::ReleasedWithoutEscrow,
                format!("parts/materials {} has payout legs but no escrow", pm_id),
            ));
            continue;
        };

        // A funded pool with no legs is simply awaiting its receipt.
        if escrow.status == EscrowStatus::Funded && !legs.is_empty() {
            violations.push(Violation::new(
                job_id,
                ViolationCode::EscrowNotReleased,
                format!("parts/materials escrow {} still FUNDED with payout legs", escrow.id),
            ));
        }

        let leg_total: i64 = legs.iter().map(|l| l.amount_cents).sum();
        if leg_total > escrow.amount_cents {
            violations.push(Violation::new(
                job_id,
                ViolationCode::LegsExceedEscrow,
                format!(
                    "parts/materials legs total {} cents exceeds escrow {} cents",
                    leg_total, escrow.amount_cents
                ),
            ));
        }

        let has_release_entry = evidence
            .ledger
            .iter()
            .any(|e| e.entry_type == EntryType::PmRelease && e.escrow_id == Some(escrow.id));
        if escrow.status == EscrowStatus::Released && !has_release_entry {
            violations.push(Violation::new(
                job_id,
                ViolationCode::MissingReleaseLedger,
                format!("no PM_RELEASE entry for escrow {}", escrow.id),
            ));
        }
    }
}

/// A PAYOUT credit tied to this leg
pub fn has_payout_evidence(ledger: &[LedgerEntry], leg_id: TransferRecordId) -> bool {
    ledger.iter().any(|e| {
        e.entry_type == EntryType::Payout
            && e.direction == Direction::Credit
            && e.transfer_record_id == Some(leg_id)
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeverityCounts {
    pub critical: usize,
    pub high: usize,
    pub warn: usize,
}

impl SeverityCounts {
    pub fn add(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Warn => self.warn += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.critical + self.high + self.warn
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DaySummary {
    pub released_jobs: usize,
    #[serde(flatten)]
    pub violations: SeverityCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub jobs_scanned: usize,
    pub violations: Vec<Violation>,
    pub totals: SeverityCounts,
    /// Keyed by release day (UTC)
    pub by_day: BTreeMap<NaiveDate, DaySummary>,
    /// Jobs released before `from`
    pub outside_window: SeverityCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrendPoint {
    pub day: NaiveDate,
    pub released_jobs: usize,
    pub critical: usize,
    pub high: usize,
    pub warn: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendReport {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub days: Vec<TrendPoint>,
}

impl From<&AuditReport> for TrendReport {
    fn from(report: &AuditReport) -> Self {
        TrendReport {
            from: report.from,
            to: report.to,
            days: report
                .by_day
                .iter()
                .map(|(day, summary)| TrendPoint {
                    day: *day,
                    released_jobs: summary.released_jobs,
                    critical: summary.violations.critical,
                    high: summary.violations.high,
                    warn: summary.violations.warn,
                })
                .collect(),
        }
    }
}

pub struct ReconciliationAuditor {
    store: Arc<dyn EscrowStore>,
}

impl ReconciliationAuditor {
    pub fn new(store: Arc<dyn EscrowStore>) -> Self {
        Self { store }
    }

    async fn evidence_for(&self, job: JobFinancials) -> Result<JobEvidence, EscrowError> {
        Ok(JobEvidence {
            escrows: self.store.escrows_for_job(job.id).await?,
            transfers: self.store.transfers_for_job(job.id).await?,
            ledger: self.store.ledger_for_job(job.id).await?,
            job,
        })
    }

    /// Audit jobs released in `[from, to)`
    pub async fn run(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<AuditReport, EscrowError> {
        let jobs = self.store.released_jobs(Some(from), Some(to)).await?;
        let jobs_scanned = jobs.len();

        let mut violations = Vec::new();
        let mut totals = SeverityCounts::default();
        let mut by_day: BTreeMap<NaiveDate, DaySummary> = BTreeMap::new();

        for job in jobs {
            let day = job.released_at.unwrap_or(from).date_naive();
            let evidence = self.evidence_for(job).await?;
            let found = audit_job(&evidence);

            let summary = by_day.entry(day).or_default();
            summary.released_jobs += 1;
            for v in &found {
                summary.violations.add(v.severity);
                totals.add(v.severity);
            }
            violations.extend(found);
        }

        let mut outside_window = SeverityCounts::default();
        for job in self.store.released_jobs(None, Some(from)).await? {
            let evidence = self.evidence_for(job).await?;
            for v in audit_job(&evidence) {
                outside_window.add(v.severity);
            }
        }

        debug!(jobs_scanned, violations = violations.len(), "Audit window scanned");
        info!(
            %from,
            %to,
            jobs_scanned,
            critical = totals.critical,
            high = totals.high,
            warn = totals.warn,
            "Reconciliation audit complete"
        );

        Ok(AuditReport {
            from,
            to,
            jobs_scanned,
            violations,
            totals,
            by_day,
            outside_window,
        })
    }

    pub async fn trend(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<TrendReport, EscrowError> {
        let report = self.run(from, to).await?;
        Ok(TrendReport::from(&report))
    }
}
