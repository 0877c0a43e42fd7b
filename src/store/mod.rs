//! Durable State Store
//!
//! Exclusivity token and recording session records are written atomically
//! (write-new-then-rename) so a crash mid-write never yields a partially
//! written, ambiguous record.
//!
//! - `DurableRecord<T>`: checksummed JSON record, atomically replaced
//! - `FileGuard`: cross-process critical section around read-modify-write

mod durable;
mod errors;
mod guard;

pub use durable::{compute_checksum, DurableRecord};
pub use errors::{StoreError, StoreResult};
pub use guard::FileGuard;
