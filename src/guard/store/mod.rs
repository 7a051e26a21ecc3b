//! Attempt store contract.
//!
//! Stores come in two capability levels. Every store offers plain
//! [`AttemptStore::get`] / [`AttemptStore::set`], which the engine combines
//! into a read-then-write round trip. Two concurrent attempts for the same
//! identity can both read the same record and both be admitted, so stores
//! that only offer this level are best-effort under concurrent identical keys.
//!
//! A store that can read, decide and write under one per-key lock also
//! implements [`AtomicIncrement`] and exposes it via
//! [`AttemptStore::as_atomic`]; the engine then uses the single atomic step.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;

use super::policy::Transition;
use super::record::AttemptRecord;

/// Errors raised by attempt store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or refused the request
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be encoded or decoded
    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// The engine's decision for one attempt, given the identity's stored record.
pub type TransitionFn<'a> = dyn for<'r> Fn(Option<&'r AttemptRecord>) -> Transition + Send + Sync + 'a;

/// Persistence for per-identity attempt records.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Fetch the record for `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<AttemptRecord>, StoreError>;

    /// Overwrite the record for `key` and rearm its expiry.
    ///
    /// A `ttl_secs` of 0 means the record never expires.
    async fn set(&self, key: &str, record: &AttemptRecord, ttl_secs: u64) -> Result<(), StoreError>;

    /// Remove the record for `key` and cancel its expiry. Removing an absent
    /// key succeeds.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;

    /// The atomic capability of this store, if it has one.
    fn as_atomic(&self) -> Option<&dyn AtomicIncrement> {
        None
    }
}

/// Single-step read, decide and write for one key.
#[async_trait]
pub trait AtomicIncrement: Send + Sync {
    /// Read the record for `key`, apply `transition` to it and persist the
    /// admitted record, all without another attempt on the same key
    /// interleaving. Denied transitions leave the stored record untouched.
    async fn increment(
        &self,
        key: &str,
        transition: &TransitionFn<'_>,
    ) -> Result<Transition, StoreError>;
}
