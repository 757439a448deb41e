use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use uuid::Uuid;

use crate::money::Currency;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub enable_tracing: bool,
    pub gateway: GatewayConfig,
    /// PostgreSQL connection URL. When absent the in-memory store is used.
    #[serde(default)]
    pub postgres_url: Option<String>,
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub escrow: EscrowConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

/// Payment processor client settings. Secrets are looked up in the
/// environment variables named here.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProcessorConfig {
    pub api_base: String,
    pub secret_key_env: String,
    pub webhook_secret_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_signature_tolerance_secs")]
    pub signature_tolerance_secs: i64,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_signature_tolerance_secs() -> i64 {
    300
}

impl ProcessorConfig {
    pub fn secret_key(&self) -> anyhow::Result<String> {
        std::env::var(&self.secret_key_env)
            .with_context(|| format!("missing processor secret key env {}", self.secret_key_env))
    }

    pub fn webhook_secret(&self) -> anyhow::Result<String> {
        std::env::var(&self.webhook_secret_env).with_context(|| {
            format!(
                "missing processor webhook secret env {}",
                self.webhook_secret_env
            )
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EscrowConfig {
    /// Remainders strictly below this become wallet credit instead of a
    /// processor refund.
    pub wallet_credit_threshold_cents: i64,
    /// Per-currency overrides of `wallet_credit_threshold_cents`.
    #[serde(default)]
    pub currency_thresholds: HashMap<Currency, i64>,
    pub platform_fee_bps: u32,
    pub router_fee_bps: u32,
    /// Ledger/payout user that receives the platform leg.
    pub platform_user_id: Uuid,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            wallet_credit_threshold_cents: 500,
            currency_thresholds: HashMap::new(),
            platform_fee_bps: 1000,
            router_fee_bps: 500,
            platform_user_id: Uuid::nil(),
        }
    }
}

impl EscrowConfig {
    /// Fee shares must leave the contractor a non-negative amount
    pub fn validate(&self) -> anyhow::Result<()> {
        let total = self.platform_fee_bps + self.router_fee_bps;
        if total > 10_000 {
            anyhow::bail!(
                "platform_fee_bps + router_fee_bps = {} exceeds 10000",
                total
            );
        }
        if self.wallet_credit_threshold_cents < 0
            || self.currency_thresholds.values().any(|t| *t < 0)
        {
            anyhow::bail!("wallet credit thresholds must be non-negative");
        }
        Ok(())
    }

    pub fn wallet_credit_threshold(&self, currency: Currency) -> i64 {
        self.currency_thresholds
            .get(&currency)
            .copied()
            .unwrap_or(self.wallet_credit_threshold_cents)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReconciliationConfig {
    pub variance_warning_cents: i64,
    pub audit_interval_secs: u64,
    pub audit_lookback_hours: i64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            variance_warning_cents: 100,
            audit_interval_secs: 3600,
            audit_lookback_hours: 24,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}
