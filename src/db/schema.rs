//! PostgreSQL schema
//!
//! Created idempotently at startup. Enumerated columns are TEXT holding
//! the SCREAMING_SNAKE names the domain enums print; ids minted by the
//! service (escrows, legs, ledger entries) are ULID text.

use anyhow::{Context, Result};
use sqlx::PgPool;

pub async fn init_schema(pool: &PgPool) -> Result<()> {
    tracing::info!("Initializing PostgreSQL schema...");

    for (name, ddl) in [
        ("jobs", CREATE_JOBS_TABLE),
        ("pm_requests", CREATE_PM_REQUESTS_TABLE),
        ("dispute_cases", CREATE_DISPUTE_CASES_TABLE),
        ("escrows", CREATE_ESCROWS_TABLE),
        ("transfer_records", CREATE_TRANSFER_RECORDS_TABLE),
        ("ledger_entries", CREATE_LEDGER_ENTRIES_TABLE),
        ("wallet_credits", CREATE_WALLET_CREDITS_TABLE),
        ("stripe_webhook_events", CREATE_WEBHOOK_EVENTS_TABLE),
    ] {
        sqlx::raw_sql(ddl)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to create {} table", name))?;
    }

    tracing::info!("PostgreSQL schema initialized successfully");
    Ok(())
}

const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id                        UUID PRIMARY KEY,
    draft_id                  UUID NOT NULL UNIQUE,
    poster_id                 UUID NOT NULL,
    contractor_id             UUID,
    router_id                 UUID,
    status                    TEXT NOT NULL,
    payment_status            TEXT NOT NULL,
    payout_status             TEXT NOT NULL,
    amount_cents              BIGINT NOT NULL CHECK (amount_cents > 0),
    currency                  TEXT NOT NULL,
    stripe_payment_intent_id  TEXT,
    stripe_charge_id          TEXT,
    stripe_refund_id          TEXT,
    released_at               TIMESTAMPTZ,
    refunded_at               TIMESTAMPTZ,
    created_at                TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at                TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_jobs_released_at ON jobs (released_at)
    WHERE payout_status = 'RELEASED';
"#;

const CREATE_PM_REQUESTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pm_requests (
    id                           UUID PRIMARY KEY,
    job_id                       UUID NOT NULL REFERENCES jobs (id),
    poster_id                    UUID NOT NULL,
    contractor_id                UUID NOT NULL,
    status                       TEXT NOT NULL,
    approved_total_cents         BIGINT NOT NULL CHECK (approved_total_cents > 0),
    verified_receipt_total_cents BIGINT,
    currency                     TEXT NOT NULL,
    funded_at                    TIMESTAMPTZ,
    released_at                  TIMESTAMPTZ,
    closed_at                    TIMESTAMPTZ,
    created_at                   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at                   TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

const CREATE_DISPUTE_CASES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS dispute_cases (
    id          UUID PRIMARY KEY,
    job_id      UUID NOT NULL REFERENCES jobs (id),
    status      TEXT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_dispute_cases_job ON dispute_cases (job_id);
"#;

const CREATE_ESCROWS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS escrows (
    id                    TEXT PRIMARY KEY,
    job_id                UUID NOT NULL REFERENCES jobs (id),
    pm_request_id         UUID REFERENCES pm_requests (id),
    kind                  TEXT NOT NULL,
    amount_cents          BIGINT NOT NULL CHECK (amount_cents > 0),
    currency              TEXT NOT NULL,
    status                TEXT NOT NULL,
    payment_intent_ref    TEXT NOT NULL UNIQUE,
    created_at            TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    released_at           TIMESTAMPTZ,
    webhook_processed_at  TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS idx_escrows_job ON escrows (job_id, pm_request_id);
"#;

const CREATE_TRANSFER_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transfer_records (
    id                     TEXT PRIMARY KEY,
    job_id                 UUID NOT NULL REFERENCES jobs (id),
    pm_request_id          UUID REFERENCES pm_requests (id),
    role                   TEXT NOT NULL,
    user_id                UUID NOT NULL,
    amount_cents           BIGINT NOT NULL CHECK (amount_cents >= 0),
    currency               TEXT NOT NULL,
    method                 TEXT NOT NULL,
    status                 TEXT NOT NULL,
    external_transfer_ref  TEXT,
    failure_reason         TEXT,
    created_at             TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at             TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    released_at            TIMESTAMPTZ
);
CREATE UNIQUE INDEX IF NOT EXISTS uq_transfer_records_leg ON transfer_records
    (job_id, COALESCE(pm_request_id, '00000000-0000-0000-0000-000000000000'::uuid), role);
CREATE UNIQUE INDEX IF NOT EXISTS uq_transfer_records_external ON transfer_records
    (external_transfer_ref) WHERE external_transfer_ref IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_transfer_records_user ON transfer_records (user_id, created_at);
"#;

const CREATE_LEDGER_ENTRIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_entries (
    id                  TEXT PRIMARY KEY,
    created_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    user_id             UUID NOT NULL,
    job_id              UUID,
    escrow_id           TEXT REFERENCES escrows (id),
    transfer_record_id  TEXT REFERENCES transfer_records (id),
    entry_type          TEXT NOT NULL,
    direction           TEXT NOT NULL,
    bucket              TEXT NOT NULL,
    amount_cents        BIGINT NOT NULL CHECK (amount_cents >= 0),
    currency            TEXT NOT NULL,
    external_ref        TEXT,
    memo                TEXT
);
CREATE INDEX IF NOT EXISTS idx_ledger_entries_job ON ledger_entries (job_id);
CREATE INDEX IF NOT EXISTS idx_ledger_entries_user ON ledger_entries (user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_ledger_entries_currency ON ledger_entries (currency, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS uq_ledger_entries_leg_type ON ledger_entries
    (transfer_record_id, entry_type) WHERE transfer_record_id IS NOT NULL;
"#;

const CREATE_WALLET_CREDITS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS wallet_credits (
    id             TEXT PRIMARY KEY,
    user_id        UUID NOT NULL,
    job_id         UUID NOT NULL REFERENCES jobs (id),
    pm_request_id  UUID REFERENCES pm_requests (id),
    amount_cents   BIGINT NOT NULL CHECK (amount_cents > 0),
    currency       TEXT NOT NULL,
    reason         TEXT NOT NULL,
    created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

const CREATE_WEBHOOK_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS stripe_webhook_events (
    event_id      TEXT PRIMARY KEY,
    event_type    TEXT NOT NULL,
    object_id     TEXT,
    received_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    processed_at  TIMESTAMPTZ
);
"#;
