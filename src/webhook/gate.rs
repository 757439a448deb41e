//! Webhook Idempotency Gate
//!
//! Every inbound event is recorded by id and claimed with a conditional
//! update on `processed_at` before any domain effect runs. The claim,
//! the effects and the processed mark commit together:
//!
//! - claim lost (already processed): ack without side effects
//! - effect fails with an infrastructure error: roll back everything,
//!   including the claim, so redelivery retries
//! - effect returns a typed rejection: commit; the event is done

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::dispatch::{EventEffect, dispatch};
use super::event::EventEnvelope;
use super::signature::verify_signature;
use crate::error::EscrowError;
use crate::store::EscrowStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GateOutcome {
    Processed {
        event_id: String,
        #[serde(flatten)]
        effect: EventEffect,
    },
    Duplicate {
        event_id: String,
    },
}

pub struct WebhookGate {
    store: Arc<dyn EscrowStore>,
    secret: String,
    tolerance_secs: i64,
}

impl WebhookGate {
    pub fn new(store: Arc<dyn EscrowStore>, secret: String, tolerance_secs: i64) -> Self {
        Self {
            store,
            secret,
            tolerance_secs,
        }
    }

    /// Authenticate and process one raw delivery
    pub async fn handle(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
    ) -> Result<GateOutcome, EscrowError> {
        let header = signature_header.ok_or(EscrowError::InvalidSignature)?;
        verify_signature(
            payload,
            header,
            &self.secret,
            self.tolerance_secs,
            Utc::now().timestamp(),
        )
        .map_err(|e| {
            warn!(error = %e, "Webhook signature rejected");
            EscrowError::InvalidSignature
        })?;

        self.process(payload).await
    }

    /// Process an already-authenticated delivery
    pub async fn process(&self, payload: &[u8]) -> Result<GateOutcome, EscrowError> {
        let envelope = EventEnvelope::parse(payload)?;
        let event_id = envelope.id.clone();

        let mut tx = self.store.begin().await?;
        let inserted = tx
            .insert_webhook_event(&event_id, &envelope.event_type, envelope.object_id())
            .await?;

        if !tx.claim_webhook_event(&event_id).await? {
            debug!(event_id = %event_id, inserted, "Duplicate webhook delivery");
            return Ok(GateOutcome::Duplicate { event_id });
        }

        let effect = dispatch(tx.as_mut(), &envelope).await?;
        tx.commit().await?;

        info!(
            event_id = %event_id,
            event_type = %envelope.event_type,
            "Webhook event processed"
        );
        Ok(GateOutcome::Processed { event_id, effect })
    }
}
