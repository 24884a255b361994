//! The storage interface the job manager consumes (spec.md §6). The core
//! never talks to a concrete backend directly -- it only ever sees this
//! trait, so a networked sorted-set/hash store could be swapped in later
//! without touching `manager` or `server`.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::job::Job;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("internal storage error: {0}")]
    Internal(String),
}

/// A reservation created when a worker fetches a job: proof that some
/// worker has taken the job and must ack or fail it before `expiry`.
#[derive(Clone, Debug)]
pub struct Reservation {
    pub jid: String,
    pub wid: Option<String>,
    pub expiry: DateTime<Utc>,
    pub job: Job,
}

/// Abstract key/value + sorted-set backend exposing named queues, sorted
/// sets (scheduled/retries/dead), counters, and a reservation map.
///
/// Every method is `async` because a real networked backend needs to be,
/// even though the in-process `memory` implementation never actually
/// suspends.
#[async_trait]
pub trait Store: Send + Sync {
    /// Appends a job to the back of `queue`.
    async fn push(&self, queue: &str, job: Job) -> Result<(), StoreError>;

    /// Pops the highest-priority, earliest-pushed job off `queue`, if any.
    async fn pop(&self, queue: &str) -> Result<Option<Job>, StoreError>;

    /// Number of jobs currently sitting in `queue`.
    async fn queue_size(&self, queue: &str) -> Result<u64, StoreError>;

    /// Every queue name the store currently knows about (has been pushed to
    /// at least once).
    async fn queue_names(&self) -> Result<Vec<String>, StoreError>;

    /// Inserts a job into the scheduled set, keyed by the time it becomes
    /// due.
    async fn schedule_add(
        &self,
        at: DateTime<Utc>,
        job: Job,
    ) -> Result<(), StoreError>;

    /// Atomically removes and returns every scheduled job due at or before
    /// `now`.
    async fn schedule_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;

    async fn schedule_size(&self) -> Result<u64, StoreError>;

    /// Inserts a job into the retries set, keyed by its `next_at`.
    async fn retry_add(
        &self,
        at: DateTime<Utc>,
        job: Job,
    ) -> Result<(), StoreError>;

    /// Atomically removes and returns every retry-set job due at or before
    /// `now`.
    async fn retry_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    async fn retry_size(&self) -> Result<u64, StoreError>;

    /// Inserts a job into the dead set.
    async fn dead_add(&self, job: Job) -> Result<(), StoreError>;

    /// Enforces the dead set's size and age caps.
    async fn dead_trim(
        &self,
        max_size: u64,
        max_age: chrono::Duration,
    ) -> Result<(), StoreError>;

    async fn dead_size(&self) -> Result<u64, StoreError>;

    /// Creates or overwrites the reservation for `jid`.
    async fn reservation_set(
        &self,
        reservation: Reservation,
    ) -> Result<(), StoreError>;

    async fn reservation_get(
        &self,
        jid: &str,
    ) -> Result<Option<Reservation>, StoreError>;

    /// Removes and returns the reservation for `jid`, if any existed.
    async fn reservation_delete(
        &self,
        jid: &str,
    ) -> Result<Option<Reservation>, StoreError>;

    /// Removes and returns every reservation whose expiry is at or before
    /// `now`.
    async fn reservation_scan_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, StoreError>;

    /// Atomically increments and returns the new `TotalProcessed` value.
    async fn incr_processed(&self) -> Result<u64, StoreError>;

    /// Atomically increments and returns the new `TotalFailures` value.
    async fn incr_failures(&self) -> Result<u64, StoreError>;

    async fn total_processed(&self) -> Result<u64, StoreError>;

    async fn total_failures(&self) -> Result<u64, StoreError>;

    /// Clears all queues, sets, reservations, and resets counters to zero.
    async fn flush(&self) -> Result<(), StoreError>;

    /// Releases any resources held by the backend. A no-op for the
    /// in-process adapter.
    async fn close(&self) -> Result<(), StoreError>;
}
