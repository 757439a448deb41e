//! Audit Worker
//!
//! Background task that runs the reconciliation auditor on a fixed
//! interval over a trailing window.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::auditor::{AuditReport, ReconciliationAuditor, Severity};
use crate::config::ReconciliationConfig;
use crate::error::EscrowError;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to run the audit
    pub interval: Duration,
    /// How far back each run looks
    pub lookback: ChronoDuration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            lookback: ChronoDuration::hours(24),
        }
    }
}

impl From<&ReconciliationConfig> for WorkerConfig {
    fn from(cfg: &ReconciliationConfig) -> Self {
        Self {
            interval: Duration::from_secs(cfg.audit_interval_secs.max(1)),
            lookback: ChronoDuration::hours(cfg.audit_lookback_hours.max(1)),
        }
    }
}

pub struct AuditWorker {
    auditor: Arc<ReconciliationAuditor>,
    config: WorkerConfig,
}

impl AuditWorker {
    pub fn new(auditor: Arc<ReconciliationAuditor>, config: WorkerConfig) -> Self {
        Self { auditor, config }
    }

    /// Run forever
    pub async fn run(&self) -> ! {
        info!(
            interval_secs = self.config.interval.as_secs(),
            lookback_hours = self.config.lookback.num_hours(),
            "Starting audit worker"
        );

        loop {
            if let Err(e) = self.run_once().await {
                error!(error = %e, "Audit run failed");
            }

            tokio::time::sleep(self.config.interval).await;
        }
    }

    /// One audit over the trailing window
    pub async fn run_once(&self) -> Result<AuditReport, EscrowError> {
        let to = Utc::now();
        let from = to - self.config.lookback;
        let report = self.auditor.run(from, to).await?;

        for v in &report.violations {
            match v.severity {
                Severity::Critical => error!(
                    job_id = %v.job_id,
                    code = ?v.code,
                    detail = %v.detail,
                    "CRITICAL: ledger/escrow divergence"
                ),
                Severity::High => warn!(job_id = %v.job_id, code = ?v.code, detail = %v.detail, "Audit violation"),
                Severity::Warn => {}
            }
        }

        if report.outside_window.critical > 0 {
            warn!(
                critical = report.outside_window.critical,
                "Critical violations remain on jobs released before the window"
            );
        }

        Ok(report)
    }
}
