//! Stripe REST client
//!
//! Form-encoded requests against the Stripe v1 API using `reqwest`.
//! Every mutating call carries an `Idempotency-Key` so a retried request
//! after a timeout cannot double-charge or double-refund.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    BalanceSnapshot, ChargeRequest, PaymentIntentView, PaymentProcessor, ProcessorError,
    RefundRequest, RefundView, TransferView,
};
use crate::money::Currency;

pub struct StripeClient {
    http: reqwest::Client,
    api_base: String,
    secret_key: String,
}

impl StripeClient {
    pub fn new(
        api_base: impl Into<String>,
        secret_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProcessorError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProcessorError::Http(e.to_string()))?;

        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.api_base, path)
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ProcessorError> {
        let response = request
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_transport_error)?;

        if !status.is_success() {
            let message = serde_json::from_str::<StripeErrorEnvelope>(&body)
                .map(|e| e.error.message.unwrap_or_default())
                .unwrap_or_else(|_| body.clone());
            warn!(status = status.as_u16(), message = %message, "Stripe request rejected");
            return Err(ProcessorError::Api {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_str(&body).map_err(|e| ProcessorError::Decode(e.to_string()))
    }
}

fn map_transport_error(e: reqwest::Error) -> ProcessorError {
    if e.is_timeout() {
        ProcessorError::Timeout
    } else {
        ProcessorError::Http(e.to_string())
    }
}

/// Flatten metadata into Stripe's `metadata[key]=value` form fields
fn metadata_fields<'a>(
    metadata: impl IntoIterator<Item = (&'a String, &'a String)>,
) -> Vec<(String, String)> {
    metadata
        .into_iter()
        .map(|(k, v)| (format!("metadata[{}]", k), v.clone()))
        .collect()
}

#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorBody,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripePaymentIntent {
    id: String,
    status: String,
    amount: i64,
    client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeTransfer {
    id: String,
    amount: i64,
    #[serde(default)]
    amount_reversed: i64,
    #[serde(default)]
    reversed: bool,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    status: Option<String>,
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct StripeBalance {
    available: Vec<StripeBalanceAmount>,
    pending: Vec<StripeBalanceAmount>,
}

#[derive(Debug, Deserialize)]
struct StripeBalanceAmount {
    amount: i64,
    currency: String,
}

fn sum_for_currency(amounts: &[StripeBalanceAmount], currency: Currency) -> i64 {
    amounts
        .iter()
        .filter(|a| a.currency.eq_ignore_ascii_case(currency.as_str()))
        .map(|a| a.amount)
        .sum()
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    fn name(&self) -> &'static str {
        "stripe"
    }

    async fn create_charge(
        &self,
        req: &ChargeRequest,
    ) -> Result<PaymentIntentView, ProcessorError> {
        debug!(
            amount = req.amount_cents,
            currency = %req.currency,
            idempotency_key = %req.idempotency_key,
            "Creating payment intent"
        );

        let mut form = vec![
            ("amount".to_string(), req.amount_cents.to_string()),
            ("currency".to_string(), req.currency.as_str().to_string()),
            (
                "automatic_payment_methods[enabled]".to_string(),
                "true".to_string(),
            ),
        ];
        form.extend(metadata_fields(&req.metadata));

        let pi: StripePaymentIntent = self
            .send(
                self.http
                    .post(self.url("payment_intents"))
                    .header("Idempotency-Key", &req.idempotency_key)
                    .form(&form),
            )
            .await?;

        Ok(PaymentIntentView {
            id: pi.id,
            status: pi.status,
            amount_cents: pi.amount,
            client_secret: pi.client_secret,
        })
    }

    async fn retrieve_transfer(&self, transfer_id: &str) -> Result<TransferView, ProcessorError> {
        let transfer: StripeTransfer = self
            .send(self.http.get(self.url(&format!("transfers/{}", transfer_id))))
            .await?;

        Ok(TransferView {
            id: transfer.id,
            amount_cents: transfer.amount,
            amount_reversed_cents: transfer.amount_reversed,
            reversed: transfer.reversed,
        })
    }

    async fn create_refund(&self, req: &RefundRequest) -> Result<RefundView, ProcessorError> {
        let reference_field = if req.reference.starts_with("pi_") {
            "payment_intent"
        } else {
            "charge"
        };

        let mut form = vec![(reference_field.to_string(), req.reference.clone())];
        if let Some(amount) = req.amount_cents {
            form.push(("amount".to_string(), amount.to_string()));
        }
        form.extend(metadata_fields(&req.metadata));

        let refund: StripeRefund = self
            .send(
                self.http
                    .post(self.url("refunds"))
                    .header("Idempotency-Key", &req.idempotency_key)
                    .form(&form),
            )
            .await?;

        Ok(RefundView {
            id: refund.id,
            status: refund.status.unwrap_or_else(|| "pending".to_string()),
            amount_cents: refund.amount,
        })
    }

    async fn retrieve_balance(
        &self,
        currency: Currency,
    ) -> Result<BalanceSnapshot, ProcessorError> {
        let balance: StripeBalance = self.send(self.http.get(self.url("balance"))).await?;

        Ok(BalanceSnapshot {
            currency,
            available_cents: sum_for_currency(&balance.available, currency),
            pending_cents: sum_for_currency(&balance.pending, currency),
        })
    }
}
