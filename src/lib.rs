//! Escrow ledger - the money core of a local-services marketplace
//!
//! Funds move from a poster's payment into held escrow, then out to
//! contractors, routers and the platform, or back to the poster. Every
//! movement is recorded in an append-only ledger and reconciled against
//! the payment processor.
//!
//! # Modules
//!
//! - [`ledger`] - Append-only ledger entries and bucket totals
//! - [`escrow`] - Escrow records and the job / PM request rows they hold funds for
//! - [`transfer`] - Payout legs, their status machine and reconcile plans
//! - [`store`] - Transactional persistence (PostgreSQL and in-memory)
//! - [`processor`] - Payment processor seam
//! - [`webhook`] - Signature check, idempotency gate and event routing
//! - [`funding`] - Checkout and the funding finalizer
//! - [`release`] - Split arithmetic and the release engine
//! - [`refund`] - Refund guard and refund recording
//! - [`reconcile`] - Transfer reconciliation, audits, traces and summaries
//! - [`commands`] - Command bus over the services
//! - [`gateway`] - HTTP surface

// Core types - must be first!
pub mod ids;
pub mod money;

pub mod actor;
pub mod config;
pub mod error;
pub mod logging;

// Books
pub mod escrow;
pub mod ledger;
pub mod transfer;

// Persistence and the outside world
pub mod db;
pub mod processor;
pub mod store;

// Money movement
pub mod funding;
pub mod refund;
pub mod release;
pub mod webhook;

pub mod reconcile;

pub mod commands;
pub mod gateway;

#[cfg(test)]
mod integration_tests;

// Convenient re-exports at crate root
pub use commands::{Command, CommandBus, CommandResult};
pub use error::EscrowError;
pub use money::Currency;
pub use store::{EscrowStore, MemoryEscrowStore, StoreTx};
