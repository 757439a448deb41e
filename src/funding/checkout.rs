//! Claim-then-charge checkout
//!
//! The job row is claimed and committed before the processor is asked
//! for a payment intent. A processor failure therefore leaves a claimed
//! job with no intent, and the retry reuses it instead of claiming a
//! second one. The processor idempotency key makes the charge call itself
//! safe to repeat.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::EscrowError;
use crate::escrow::NewJob;
use crate::money::Currency;
use crate::processor::{ChargeRequest, PaymentProcessor};
use crate::store::EscrowStore;

/// Poster's checkout of a job draft
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutDraft {
    pub draft_id: Uuid,
    pub poster_id: Uuid,
    pub amount_cents: i64,
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutResult {
    pub job_id: Uuid,
    pub payment_intent_id: String,
    pub client_secret: Option<String>,
    /// The claimed job already carried an intent; nothing new was created
    pub reused: bool,
}

pub fn charge_idempotency_key(job_id: Uuid) -> String {
    format!("job-{}-charge", job_id)
}

pub struct CheckoutService {
    store: Arc<dyn EscrowStore>,
    processor: Arc<dyn PaymentProcessor>,
}

impl CheckoutService {
    pub fn new(store: Arc<dyn EscrowStore>, processor: Arc<dyn PaymentProcessor>) -> Self {
        Self { store, processor }
    }

    pub async fn checkout_draft(&self, draft: CheckoutDraft) -> Result<CheckoutResult, EscrowError> {
        if draft.amount_cents <= 0 {
            return Err(EscrowError::InvalidPayload(
                "amount_cents must be positive".to_string(),
            ));
        }

        // tx1: claim
        let mut tx = self.store.begin().await?;
        let job = tx
            .claim_job_for_draft(NewJob {
                draft_id: draft.draft_id,
                poster_id: draft.poster_id,
                amount_cents: draft.amount_cents,
                currency: draft.currency,
            })
            .await?;
        tx.commit().await?;

        if job.poster_id != draft.poster_id {
            return Err(EscrowError::NotFound(format!("draft {}", draft.draft_id)));
        }

        if let Some(pi) = job.stripe_payment_intent_id.clone().filter(|p| !p.is_empty()) {
            info!(job_id = %job.id, payment_intent = %pi, "Checkout reused existing intent");
            return Ok(CheckoutResult {
                job_id: job.id,
                payment_intent_id: pi,
                client_secret: None,
                reused: true,
            });
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("type".to_string(), "job_escrow".to_string());
        metadata.insert("jobId".to_string(), job.id.to_string());
        metadata.insert("posterId".to_string(), job.poster_id.to_string());

        // The claimed row's amount wins over the retry's request body.
        let intent = self
            .processor
            .create_charge(&ChargeRequest {
                amount_cents: job.amount_cents,
                currency: job.currency,
                metadata,
                idempotency_key: charge_idempotency_key(job.id),
            })
            .await?;

        // tx2: store the reference
        let mut tx = self.store.begin().await?;
        tx.set_job_payment_intent(job.id, &intent.id).await?;
        tx.commit().await?;

        info!(
            job_id = %job.id,
            payment_intent = %intent.id,
            amount_cents = job.amount_cents,
            processor = self.processor.name(),
            "Checkout created payment intent"
        );

        Ok(CheckoutResult {
            job_id: job.id,
            payment_intent_id: intent.id,
            client_secret: intent.client_secret,
            reused: false,
        })
    }
}
