//! Inbound processor events
//!
//! ```text
//! raw body ─▶ signature ─▶ envelope ─▶ gate (record + claim) ─▶ dispatch
//! ```

pub mod dispatch;
pub mod event;
pub mod gate;
pub mod signature;

pub use dispatch::{EventEffect, dispatch};
pub use event::{EventEnvelope, EventKind};
pub use gate::{GateOutcome, WebhookGate};
pub use signature::{SignatureError, sign_payload, verify_signature};
