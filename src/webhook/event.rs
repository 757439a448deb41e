//! Inbound processor event envelope
//!
//! Only the fields this subsystem consumes are decoded. Payment metadata
//! is the sole source of attribution; request bodies from clients are
//! never consulted.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::EscrowError;
use crate::transfer::TransferLifecycle;

/// `{ id, type, data: { object } }`
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: Value,
}

impl EventEnvelope {
    pub fn parse(payload: &[u8]) -> Result<Self, EscrowError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }

    /// `data.object.id`, recorded on the idempotency row
    pub fn object_id(&self) -> Option<&str> {
        self.data.object.get("id").and_then(Value::as_str)
    }

    /// Decode `data.object` into the shape the event kind implies
    pub fn object<T: for<'de> Deserialize<'de>>(&self) -> Result<T, EscrowError> {
        Ok(T::deserialize(&self.data.object)?)
    }
}

/// Closed set of recognized event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PaymentSucceeded,
    PaymentFailed,
    PaymentCanceled,
    ChargeRefunded,
    Transfer(TransferLifecycle),
    AccountUpdated,
    Unrecognized,
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "payment_intent.succeeded" => EventKind::PaymentSucceeded,
            "payment_intent.payment_failed" => EventKind::PaymentFailed,
            "payment_intent.canceled" => EventKind::PaymentCanceled,
            "charge.refunded" => EventKind::ChargeRefunded,
            "transfer.created" => EventKind::Transfer(TransferLifecycle::Created),
            "transfer.failed" => EventKind::Transfer(TransferLifecycle::Failed),
            "transfer.reversed" => EventKind::Transfer(TransferLifecycle::Reversed),
            "account.updated" => EventKind::AccountUpdated,
            _ => EventKind::Unrecognized,
        }
    }
}

/// Metadata attached to payment intents at checkout.
///
/// Keys are camelCase on the wire; snake_case aliases are accepted for
/// intents created by older tooling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PaymentMetadata {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(rename = "jobId", alias = "job_id")]
    pub job_id: Option<String>,
    #[serde(rename = "pmRequestId", alias = "pm_request_id")]
    pub pm_request_id: Option<String>,
    #[serde(rename = "posterId", alias = "poster_id")]
    pub poster_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub amount_received: i64,
    pub currency: String,
    #[serde(default)]
    pub latest_charge: Option<String>,
    #[serde(default)]
    pub metadata: PaymentMetadata,
}

impl PaymentIntentObject {
    /// Captured amount; falls back to `amount` for events that omit
    /// `amount_received`
    pub fn captured_cents(&self) -> i64 {
        if self.amount_received > 0 {
            self.amount_received
        } else {
            self.amount
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundList {
    #[serde(default)]
    pub data: Vec<RefundObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundObject {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChargeObject {
    pub id: String,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub amount_refunded: i64,
    #[serde(default)]
    pub refunds: Option<RefundList>,
    #[serde(default)]
    pub metadata: PaymentMetadata,
}

impl ChargeObject {
    /// Most recent refund id, or the charge id when the list is absent
    pub fn refund_reference(&self) -> String {
        self.refunds
            .as_ref()
            .and_then(|r| r.data.first())
            .map(|r| r.id.clone())
            .unwrap_or_else(|| self.id.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferObject {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub amount_reversed: i64,
    #[serde(default)]
    pub reversed: bool,
    #[serde(default)]
    pub failure_message: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl TransferObject {
    pub fn transfer_record_hint(&self) -> Option<&str> {
        self.metadata
            .get("transferRecordId")
            .or_else(|| self.metadata.get("transfer_record_id"))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountObject {
    pub id: String,
    #[serde(default)]
    pub charges_enabled: bool,
    #[serde(default)]
    pub payouts_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payment_succeeded_envelope() {
        let payload = br#"{
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "created": 1700000000,
            "data": {"object": {
                "id": "pi_1",
                "status": "succeeded",
                "amount": 25000,
                "amount_received": 25000,
                "currency": "usd",
                "latest_charge": "ch_1",
                "metadata": {"type": "job_escrow", "jobId": "j", "posterId": "p"}
            }}
        }"#;

        let envelope = EventEnvelope::parse(payload).unwrap();
        assert_eq!(envelope.kind(), EventKind::PaymentSucceeded);
        assert_eq!(envelope.object_id(), Some("pi_1"));

        let pi: PaymentIntentObject = envelope.object().unwrap();
        assert_eq!(pi.captured_cents(), 25_000);
        assert_eq!(pi.metadata.kind.as_deref(), Some("job_escrow"));
        assert_eq!(pi.metadata.job_id.as_deref(), Some("j"));
        assert_eq!(pi.metadata.pm_request_id, None);
    }

    #[test]
    fn test_snake_case_metadata_alias() {
        let meta: PaymentMetadata =
            serde_json::from_str(r#"{"type":"pm_escrow","pm_request_id":"x"}"#).unwrap();
        assert_eq!(meta.pm_request_id.as_deref(), Some("x"));
    }

    #[test]
    fn test_event_kind_mapping() {
        assert_eq!(
            EventKind::from_type("transfer.reversed"),
            EventKind::Transfer(TransferLifecycle::Reversed)
        );
        assert_eq!(EventKind::from_type("payment_intent.canceled"), EventKind::PaymentCanceled);
        assert_eq!(EventKind::from_type("invoice.paid"), EventKind::Unrecognized);
    }

    #[test]
    fn test_charge_refund_reference() {
        let charge: ChargeObject = serde_json::from_str(
            r#"{"id":"ch_1","refunds":{"data":[{"id":"re_9"}]}}"#,
        )
        .unwrap();
        assert_eq!(charge.refund_reference(), "re_9");

        let bare: ChargeObject = serde_json::from_str(r#"{"id":"ch_2"}"#).unwrap();
        assert_eq!(bare.refund_reference(), "ch_2");
    }

    #[test]
    fn test_malformed_envelope_is_invalid_payload() {
        let err = EventEnvelope::parse(b"{\"id\":1}").unwrap_err();
        assert_eq!(err.code(), "INVALID_PAYLOAD");
    }
}
