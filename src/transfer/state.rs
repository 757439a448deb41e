//! Payout Leg State Definitions
//!
//! ```text
//! PENDING ──▶ SENT ──▶ REVERSED
//!    │                    ▲
//!    └──────▶ FAILED ─────┘
//! ```
//!
//! Same-state transitions are legal no-ops so redelivered events are
//! harmless. Everything else is rejected, never coerced.

use serde::Serialize;

use crate::escrow::text_enum;

/// Payout leg status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    /// Scheduled by the Release Engine, not yet confirmed by the processor
    Pending,
    /// Processor confirmed the transfer
    Sent,
    /// Processor failed the transfer
    Failed,
    /// Terminal: money pulled back after SENT or written off after FAILED
    Reversed,
}

text_enum!(TransferStatus {
    Pending => "PENDING",
    Sent => "SENT",
    Failed => "FAILED",
    Reversed => "REVERSED",
});

impl TransferStatus {
    pub const ALL: [TransferStatus; 4] = [
        TransferStatus::Pending,
        TransferStatus::Sent,
        TransferStatus::Failed,
        TransferStatus::Reversed,
    ];

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Reversed)
    }

    /// Whether `self -> to` is a legal hop
    pub fn can_transition_to(&self, to: TransferStatus) -> bool {
        is_allowed(*self, to)
    }
}

/// Legal transition graph for a payout leg
pub fn is_allowed(from: TransferStatus, to: TransferStatus) -> bool {
    use TransferStatus::*;

    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (Pending, Sent) | (Pending, Failed) | (Sent, Reversed) | (Failed, Reversed)
    )
}

/// Processor lifecycle events that move a payout leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransferLifecycle {
    Created,
    Failed,
    Reversed,
}

impl TransferLifecycle {
    /// Target leg status for this event
    pub fn target_status(&self) -> TransferStatus {
        match self {
            TransferLifecycle::Created => TransferStatus::Sent,
            TransferLifecycle::Failed => TransferStatus::Failed,
            TransferLifecycle::Reversed => TransferStatus::Reversed,
        }
    }
}

/// Recipient role of a payout leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferRole {
    Contractor,
    Router,
    Platform,
}

text_enum!(TransferRole {
    Contractor => "CONTRACTOR",
    Router => "ROUTER",
    Platform => "PLATFORM",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutMethod {
    Stripe,
    Paypal,
}

text_enum!(PayoutMethod {
    Stripe => "STRIPE",
    Paypal => "PAYPAL",
});

#[cfg(test)]
mod tests {
    use super::*;
    use TransferStatus::*;

    #[test]
    fn test_legal_hops() {
        assert!(is_allowed(Pending, Sent));
        assert!(is_allowed(Pending, Failed));
        assert!(is_allowed(Sent, Reversed));
        assert!(is_allowed(Failed, Reversed));
    }

    #[test]
    fn test_illegal_hops() {
        assert!(!is_allowed(Failed, Sent));
        assert!(!is_allowed(Reversed, Sent));
        assert!(!is_allowed(Sent, Pending));
        assert!(!is_allowed(Reversed, Failed));
        assert!(!is_allowed(Reversed, Pending));
        assert!(!is_allowed(Pending, Reversed));
        assert!(!is_allowed(Sent, Failed));
        assert!(!is_allowed(Failed, Pending));
    }

    #[test]
    fn test_same_state_always_allowed() {
        for s in TransferStatus::ALL {
            assert!(is_allowed(s, s), "{} -> {} must be a no-op", s, s);
        }
    }

    #[test]
    fn test_full_matrix_has_four_real_hops() {
        let hops = TransferStatus::ALL
            .iter()
            .flat_map(|a| TransferStatus::ALL.iter().map(move |b| (*a, *b)))
            .filter(|(a, b)| a != b && is_allowed(*a, *b))
            .count();
        assert_eq!(hops, 4);
    }

    #[test]
    fn test_lifecycle_mapping() {
        assert_eq!(TransferLifecycle::Created.target_status(), Sent);
        assert_eq!(TransferLifecycle::Failed.target_status(), Failed);
        assert_eq!(TransferLifecycle::Reversed.target_status(), Reversed);
    }

    #[test]
    fn test_terminal() {
        assert!(Reversed.is_terminal());
        assert!(!Sent.is_terminal());
        assert!(!Failed.is_terminal());
    }

    #[test]
    fn test_display() {
        assert_eq!(Pending.to_string(), "PENDING");
        assert_eq!("REVERSED".parse::<TransferStatus>(), Ok(Reversed));
        assert_eq!(TransferRole::Router.as_str(), "ROUTER");
    }

    #[test]
    fn test_text_columns_parse_without_local_imports() {
        assert_eq!("PLATFORM".parse::<TransferRole>(), Ok(TransferRole::Platform));
        assert_eq!("PAYPAL".parse::<PayoutMethod>(), Ok(PayoutMethod::Paypal));
        assert_eq!(PayoutMethod::Stripe.to_string(), "STRIPE");
        assert!("sent".parse::<TransferStatus>().is_err());
    }
}
