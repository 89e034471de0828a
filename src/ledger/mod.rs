//! Persisted ledgers owned by the orchestrator.
//!
//! Both ledgers sit on [`JsonFileStore`], which serializes every
//! read-modify-write behind one lock per store and commits with an atomic
//! rename. They assume a single owning process per file.

mod idempotency;
mod quota;
mod store;

pub use idempotency::{Claim, ClaimGuard, IdempotencyLedger, IdempotencyRecord, RecordStatus};
pub use quota::QuotaLedger;
pub use store::JsonFileStore;
