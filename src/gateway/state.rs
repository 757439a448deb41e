use std::sync::Arc;

use crate::commands::CommandBus;
use crate::config::ReconciliationConfig;
use crate::db::Database;
use crate::money::Currency;
use crate::processor::PaymentProcessor;
use crate::reconcile::ReconciliationAuditor;
use crate::store::EscrowStore;
use crate::webhook::WebhookGate;

/// Gateway application state (shared)
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<CommandBus>,
    pub gate: Arc<WebhookGate>,
    /// Read side for traces and summaries
    pub store: Arc<dyn EscrowStore>,
    pub processor: Arc<dyn PaymentProcessor>,
    pub auditor: Arc<ReconciliationAuditor>,
    pub reconciliation: ReconciliationConfig,
    pub default_currency: Currency,
    /// PostgreSQL pool, pinged by /health when configured
    pub pg_db: Option<Arc<Database>>,
}

impl AppState {
    pub fn new(
        bus: Arc<CommandBus>,
        gate: Arc<WebhookGate>,
        store: Arc<dyn EscrowStore>,
        processor: Arc<dyn PaymentProcessor>,
        reconciliation: ReconciliationConfig,
        pg_db: Option<Arc<Database>>,
    ) -> Self {
        Self {
            auditor: bus.auditor(),
            bus,
            gate,
            store,
            processor,
            reconciliation,
            default_currency: Currency::Usd,
            pg_db,
        }
    }

    /// Default audit window ends now and reaches back this far
    pub fn audit_lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(self.reconciliation.audit_lookback_hours)
    }
}
