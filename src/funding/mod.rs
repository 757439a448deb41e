//! Escrow funding: checkout and capture finalization

pub mod checkout;
pub mod finalizer;

pub use checkout::{CheckoutDraft, CheckoutResult, CheckoutService};
pub use finalizer::{
    FundingOutcome, FundingRejection, FundingTarget, PaymentFailureOutcome, finalize_payment,
    record_payment_failure, resolve_target,
};
