//! # Repository Layer
//!
//! Repositories that encapsulate SeaORM operations for tracked posts, account
//! credentials and per-owner refresh locks. Every method takes `now` from the
//! caller so the scheduler's clock is the only time source.

use chrono::{DateTime, FixedOffset, Utc};

pub mod credential;
pub mod post;
pub mod sync_lock;

pub use credential::CredentialRepository;
pub use post::PostRepository;
pub use sync_lock::{SyncLockRepository, SyncOutcome};

/// Normalize a timestamp to a UTC offset before it is stored or compared.
pub(crate) fn to_db_time(dt: DateTime<Utc>) -> DateTime<FixedOffset> {
    dt.fixed_offset()
}
