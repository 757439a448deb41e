//! Route a claimed event to the component that owns it

use serde::Serialize;
use tracing::{info, warn};

use super::event::{
    AccountObject, ChargeObject, EventEnvelope, EventKind, PaymentIntentObject, TransferObject,
};
use crate::error::EscrowError;
use crate::funding::{FundingOutcome, PaymentFailureOutcome, finalize_payment, record_payment_failure};
use crate::reconcile::{TransitionOutcome, apply_lifecycle_event};
use crate::refund::{ChargeRefundOutcome, apply_charge_refunded};
use crate::store::StoreTx;

/// What one event did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "effect", content = "outcome", rename_all = "snake_case")]
pub enum EventEffect {
    Funding(FundingOutcome),
    PaymentFailure(PaymentFailureOutcome),
    Refund(ChargeRefundOutcome),
    Transfer(TransitionOutcome),
    AccountUpdated {
        account_id: String,
        charges_enabled: bool,
        payouts_enabled: bool,
    },
    /// Acknowledged without domain effects
    Ignored {
        event_type: String,
        reason: Option<String>,
    },
}

fn decode<T>(envelope: &EventEnvelope) -> Result<T, EventEffect>
where
    T: for<'de> serde::Deserialize<'de>,
{
    envelope.object::<T>().map_err(|e| {
        // A malformed object will not parse on redelivery either.
        warn!(event_id = %envelope.id, event_type = %envelope.event_type, error = %e, "Undecodable event object");
        EventEffect::Ignored {
            event_type: envelope.event_type.clone(),
            reason: Some(e.to_string()),
        }
    })
}

/// Apply `envelope` inside the gate's transaction
pub async fn dispatch(
    tx: &mut dyn StoreTx,
    envelope: &EventEnvelope,
) -> Result<EventEffect, EscrowError> {
    let effect = match envelope.kind() {
        EventKind::PaymentSucceeded => match decode::<PaymentIntentObject>(envelope) {
            Ok(pi) => EventEffect::Funding(finalize_payment(tx, &pi).await?),
            Err(ignored) => ignored,
        },
        EventKind::PaymentFailed | EventKind::PaymentCanceled => {
            match decode::<PaymentIntentObject>(envelope) {
                Ok(pi) => EventEffect::PaymentFailure(record_payment_failure(tx, &pi).await?),
                Err(ignored) => ignored,
            }
        }
        EventKind::ChargeRefunded => match decode::<ChargeObject>(envelope) {
            Ok(charge) => EventEffect::Refund(apply_charge_refunded(tx, &charge).await?),
            Err(ignored) => ignored,
        },
        EventKind::Transfer(lifecycle) => match decode::<TransferObject>(envelope) {
            Ok(transfer) => {
                EventEffect::Transfer(apply_lifecycle_event(tx, lifecycle, &transfer).await?)
            }
            Err(ignored) => ignored,
        },
        EventKind::AccountUpdated => match decode::<AccountObject>(envelope) {
            Ok(account) => {
                info!(
                    account_id = %account.id,
                    charges_enabled = account.charges_enabled,
                    payouts_enabled = account.payouts_enabled,
                    "Connected account updated"
                );
                EventEffect::AccountUpdated {
                    account_id: account.id,
                    charges_enabled: account.charges_enabled,
                    payouts_enabled: account.payouts_enabled,
                }
            }
            Err(ignored) => ignored,
        },
        EventKind::Unrecognized => EventEffect::Ignored {
            event_type: envelope.event_type.clone(),
            reason: None,
        },
    };
    Ok(effect)
}
