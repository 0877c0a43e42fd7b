//! Lock Manager
//!
//! One durable exclusivity token (`idle | preview | recording`) that decides
//! which capture activity holds the shared camera hardware.
//!
//! State machine: `idle ⇄ preview`, `idle ⇄ recording`, `preview → recording`.
//!
//! The token is not an in-memory primitive: the coordinator itself may
//! restart mid-operation, so the token is a rename-atomic record on disk with
//! staleness and holder-liveness detection.

mod errors;
mod liveness;
mod manager;
mod token;

pub use errors::{LockError, LockResult};
pub use liveness::{HolderLiveness, ProcessLiveness};
pub use manager::{
    AcquireOutcome, Denial, LockManager, LockManagerConfig, LockStatus, ReleaseOutcome,
};
pub use token::{ExclusivityToken, Mode};
