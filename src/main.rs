//! Escrow ledger service
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌──────────┐    ┌──────────┐
//! │ Webhooks │───▶│ Idempotency  │───▶│ Funding  │───▶│  Ledger  │
//! │  / API   │    │    Gate      │    │ Release  │    │ Escrows  │
//! └──────────┘    └──────────────┘    │ Refund   │    │  Legs    │
//!                                     └──────────┘    └──────────┘
//!                                           ▲
//!                      Audit worker ────────┘ (read-only)
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use escrow_ledger::commands::CommandBus;
use escrow_ledger::config::AppConfig;
use escrow_ledger::db::Database;
use escrow_ledger::gateway::{self, state::AppState};
use escrow_ledger::processor::{PaymentProcessor, StripeClient};
use escrow_ledger::reconcile::{AuditWorker, WorkerConfig};
use escrow_ledger::store::{EscrowStore, MemoryEscrowStore, PgEscrowStore};
use escrow_ledger::webhook::WebhookGate;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Get port override from command line (--port argument)
fn get_port_override() -> Option<u16> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            return args[i + 1].parse().ok();
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let mut app_config = AppConfig::load(&env)?;
    let _log_guard = escrow_ledger::logging::init_logging(&app_config);

    tracing::info!(env = %env, git_hash = env!("GIT_HASH"), "Starting escrow ledger");

    app_config
        .escrow
        .validate()
        .context("Invalid escrow configuration")?;
    if let Some(port) = get_port_override() {
        app_config.gateway.port = port;
    }

    // Store: PostgreSQL when configured, otherwise in-memory
    let (store, pg_db): (Arc<dyn EscrowStore>, Option<Arc<Database>>) =
        match &app_config.postgres_url {
            Some(url) => {
                let db = Database::connect(url)
                    .await
                    .context("Failed to connect to PostgreSQL")?;
                db.init_schema().await?;
                let store = PgEscrowStore::new(db.pool().clone());
                (Arc::new(store), Some(Arc::new(db)))
            }
            None => {
                tracing::warn!("postgres_url not set; using in-memory store (state is lost on exit)");
                (Arc::new(MemoryEscrowStore::new()), None)
            }
        };

    let processor_cfg = &app_config.processor;
    let processor: Arc<dyn PaymentProcessor> = Arc::new(StripeClient::new(
        processor_cfg.api_base.clone(),
        processor_cfg.secret_key()?,
        Duration::from_secs(processor_cfg.timeout_secs),
    )?);

    let bus = Arc::new(CommandBus::new(
        store.clone(),
        processor.clone(),
        app_config.escrow.clone(),
    ));
    let gate = Arc::new(WebhookGate::new(
        store.clone(),
        processor_cfg.webhook_secret()?,
        processor_cfg.signature_tolerance_secs,
    ));

    let worker = AuditWorker::new(
        bus.auditor(),
        WorkerConfig::from(&app_config.reconciliation),
    );
    tokio::spawn(async move {
        worker.run().await;
    });
    tracing::info!(
        interval_secs = app_config.reconciliation.audit_interval_secs,
        "Reconciliation audit worker started"
    );

    let state = Arc::new(AppState::new(
        bus,
        gate,
        store,
        processor,
        app_config.reconciliation.clone(),
        pg_db,
    ));

    gateway::run_server(&app_config.gateway, state).await
}
