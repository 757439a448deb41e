//! Escrow release: amount arithmetic and the engine that applies it

pub mod engine;
pub mod split;

pub use engine::{ReleaseEngine, ReleaseOutcome, ReleaseRejection, ReleaseSummary};
pub use split::{JobSplit, PmSplit, RemainderDisposition, job_split, pm_split, remainder_disposition};
