//! Release amount arithmetic
//!
//! Pure functions; the engine decides what to persist.

use serde::Serialize;

const BPS_DENOMINATOR: i128 = 10_000;

/// Contractor release and poster remainder for a parts/materials request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PmSplit {
    pub release_amount_cents: i64,
    pub remainder_cents: i64,
}

/// `release = min(verified, approved)`, `remainder = approved - release`.
///
/// Receipts above the approved quote are never paid out; the overrun is
/// the contractor's.
pub fn pm_split(approved_total_cents: i64, verified_receipt_total_cents: i64) -> PmSplit {
    let release = verified_receipt_total_cents.clamp(0, approved_total_cents.max(0));
    PmSplit {
        release_amount_cents: release,
        remainder_cents: approved_total_cents.max(0) - release,
    }
}

/// Where a non-zero remainder goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemainderDisposition {
    /// Nothing left over
    None,
    /// Ledger credit to the poster's AVAILABLE bucket plus a credit record
    WalletCredit,
    /// Processor refund against the original charge
    ProcessorRefund,
}

/// Below the threshold, or with no refundable reference, the remainder
/// becomes wallet credit.
pub fn remainder_disposition(
    remainder_cents: i64,
    threshold_cents: i64,
    has_refund_reference: bool,
) -> RemainderDisposition {
    if remainder_cents <= 0 {
        RemainderDisposition::None
    } else if remainder_cents < threshold_cents || !has_refund_reference {
        RemainderDisposition::WalletCredit
    } else {
        RemainderDisposition::ProcessorRefund
    }
}

/// Per-role shares of a job escrow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobSplit {
    pub contractor_cents: i64,
    pub router_cents: i64,
    pub platform_cents: i64,
}

impl JobSplit {
    pub fn total(&self) -> i64 {
        self.contractor_cents + self.router_cents + self.platform_cents
    }
}

fn bps_of(amount_cents: i64, bps: u32) -> i64 {
    // Floors; the contractor absorbs rounding dust.
    ((amount_cents as i128 * bps as i128) / BPS_DENOMINATOR) as i64
}

/// Split a job escrow by basis points. With no router the router share
/// folds into the platform share. Shares always sum to `amount_cents`.
pub fn job_split(amount_cents: i64, platform_bps: u32, router_bps: u32, has_router: bool) -> JobSplit {
    let amount = amount_cents.max(0);
    let router = bps_of(amount, router_bps);
    let platform = bps_of(amount, platform_bps);

    let (router_cents, platform_cents) = if has_router {
        (router, platform)
    } else {
        (0, platform + router)
    };
    let fees = (router_cents + platform_cents).min(amount);

    JobSplit {
        contractor_cents: amount - fees,
        router_cents,
        platform_cents: fees - router_cents,
    }
}
