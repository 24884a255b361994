//! The job state machine (spec.md §4.2): push, fetch (reserve), ack, fail,
//! plus the shared plumbing the background sweepers in [`sweep`] build on.
//! Pure logic over the [`Store`] trait -- this module never talks to a
//! socket.

pub mod sweep;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::FaktoryError;
use crate::storage::{Reservation, Store, StoreError};
use crate::types::job::{Failure, Job, PushError};

/// How long `fetch` blocks waiting for a job before returning `None`.
pub const FETCH_BLOCK: StdDuration = StdDuration::from_secs(2);

/// Default dead-set caps (spec.md §6 Defaults).
pub const DEFAULT_DEAD_MAX_SIZE: u64 = 10_000;
pub const DEFAULT_DEAD_MAX_AGE_DAYS: i64 = 180;

pub struct JobManager {
    store: Arc<dyn Store>,
    /// Fed by `push` and the scheduled/retry sweepers; `fetch` waits on it
    /// instead of polling the store, per the spec's explicitly-endorsed
    /// local condition-variable alternative to a storage-level blocking
    /// pop.
    notify: Notify,
    dead_max_size: u64,
    dead_max_age: chrono::Duration,
}

impl JobManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_dead_caps(
            store,
            DEFAULT_DEAD_MAX_SIZE,
            chrono::Duration::days(DEFAULT_DEAD_MAX_AGE_DAYS),
        )
    }

    pub fn with_dead_caps(
        store: Arc<dyn Store>,
        dead_max_size: u64,
        dead_max_age: chrono::Duration,
    ) -> Self {
        Self {
            store,
            notify: Notify::new(),
            dead_max_size,
            dead_max_age,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Validates, applies defaults, and places a job in its queue or the
    /// scheduled set.
    pub async fn push(&self, mut job: Job) -> Result<(), FaktoryError> {
        job.validate().map_err(|e| {
            FaktoryError::Malformed(match e {
                PushError::MissingJid => "missing jid".to_string(),
                PushError::MissingJobtype => "missing jobtype".to_string(),
            })
        })?;

        let now = Utc::now();
        job.normalize(now);

        if job.is_scheduled(now) {
            let at = job.at.unwrap();
            self.store.schedule_add(at, job).await?;
        } else {
            let queue = job.queue.clone();
            self.store.push(&queue, job).await?;
            self.notify.notify_waiters();
        }

        Ok(())
    }

    /// Attempts each queue once, in the given order, without blocking.
    async fn try_fetch_once(
        &self,
        queues: &[String],
    ) -> Result<Option<Job>, FaktoryError> {
        for queue in queues {
            if let Some(job) = self.store.pop(queue).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Reserves and returns the highest-priority ready job from the first
    /// non-empty queue in `queues`, blocking up to [`FETCH_BLOCK`] if all
    /// are empty.
    pub async fn fetch(
        &self,
        queues: &[String],
        wid: Option<&str>,
    ) -> Result<Option<Job>, FaktoryError> {
        let deadline = tokio::time::Instant::now() + FETCH_BLOCK;

        loop {
            if let Some(job) = self.try_fetch_once(queues).await? {
                let now = Utc::now();
                let expiry = now + chrono::Duration::seconds(job.reserve_for as i64);

                self.store
                    .reservation_set(Reservation {
                        jid: job.jid.clone(),
                        wid: wid.map(str::to_string),
                        expiry,
                        job: job.clone(),
                    })
                    .await?;

                return Ok(Some(job));
            }

            let notified = self.notify.notified();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            tokio::select! {
                _ = notified => {},
                _ = tokio::time::sleep(remaining) => return Ok(None),
            }
        }
    }

    /// Removes the reservation for `jid` and counts it as processed. Not an
    /// error to ack an unknown jid -- idempotent, logged only.
    pub async fn ack(&self, jid: &str) -> Result<(), FaktoryError> {
        match self.store.reservation_delete(jid).await? {
            Some(_) => {
                self.store.incr_processed().await?;
            },
            None => debug!(jid, "ACK of unknown or already-acked job"),
        }
        Ok(())
    }

    /// Reports a failed reservation; moves it to the retries set with a
    /// backoff, or dead-letters/discards it once retries are exhausted.
    pub async fn fail(
        &self,
        jid: &str,
        errtype: Option<String>,
        message: Option<String>,
        backtrace: Option<Vec<String>>,
    ) -> Result<(), FaktoryError> {
        let reservation = self
            .store
            .reservation_delete(jid)
            .await?
            .ok_or_else(|| FaktoryError::NotFound(format!("unknown jid {jid}")))?;

        self.store.incr_failures().await?;

        let now = Utc::now();
        let mut job = reservation.job;
        let retry_count = job.failure.as_ref().map(|f| f.retry_count).unwrap_or(0) + 1;

        job.failure = Some(Failure {
            retry_count,
            failed_at: Some(now),
            next_at: None,
            message,
            errtype,
            backtrace,
        });

        let max_retries = job.max_retries();

        if max_retries < 0 {
            // Retries disabled: drop the job entirely.
            return Ok(());
        }

        if max_retries == 0 || retry_count as i64 >= max_retries {
            self.store.dead_add(job).await?;
            self.store
                .dead_trim(self.dead_max_size, self.dead_max_age)
                .await?;
            return Ok(());
        }

        let next_at = now + backoff(retry_count);
        if let Some(f) = job.failure.as_mut() {
            f.next_at = Some(next_at);
        }
        self.store.retry_add(next_at, job).await?;

        Ok(())
    }

    /// Re-enqueues everything in the scheduled set due at or before `now`.
    pub async fn sweep_scheduled(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let due = self.store.schedule_due(now).await?;
        let count = due.len();
        for job in due {
            let queue = job.queue.clone();
            self.store.push(&queue, job).await?;
        }
        if count > 0 {
            self.notify.notify_waiters();
        }
        Ok(count)
    }

    /// Re-enqueues everything in the retries set due at or before `now`.
    pub async fn sweep_retries(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let due = self.store.retry_due(now).await?;
        let count = due.len();
        for job in due {
            let queue = job.queue.clone();
            self.store.push(&queue, job).await?;
        }
        if count > 0 {
            self.notify.notify_waiters();
        }
        Ok(count)
    }

    /// Re-enqueues or dead-letters every reservation expired at or before
    /// `now`, using the same policy as an explicit `FAIL`.
    pub async fn sweep_expired_reservations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let expired = self.store.reservation_scan_expired(now).await?;
        let count = expired.len();

        for reservation in expired {
            let mut job = reservation.job;
            let retry_count =
                job.failure.as_ref().map(|f| f.retry_count).unwrap_or(0) + 1;

            job.failure = Some(Failure {
                retry_count,
                failed_at: Some(now),
                next_at: None,
                message: Some("reservation expired".to_string()),
                errtype: Some("ReservationExpired".to_string()),
                backtrace: None,
            });

            let max_retries = job.max_retries();

            if max_retries < 0 {
                continue;
            }

            if max_retries == 0 || retry_count as i64 >= max_retries {
                self.store.dead_add(job).await?;
                self.store
                    .dead_trim(self.dead_max_size, self.dead_max_age)
                    .await?;
                continue;
            }

            let next_at = now + backoff(retry_count);
            if let Some(f) = job.failure.as_mut() {
                f.next_at = Some(next_at);
            }
            self.store.retry_add(next_at, job).await?;
        }

        Ok(count)
    }

    pub async fn dead_trim(&self) -> Result<(), StoreError> {
        self.store
            .dead_trim(self.dead_max_size, self.dead_max_age)
            .await
    }
}

/// `(retry_count^4) + 15 + (rand 0..30) * (retry_count + 1)` seconds, per
/// spec.md §4.2.
fn backoff(retry_count: u32) -> chrono::Duration {
    let base = (retry_count as i64).pow(4);
    let jitter = rand::thread_rng().gen_range(0..30i64) * (retry_count as i64 + 1);
    chrono::Duration::seconds(base + 15 + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;

    fn manager() -> JobManager {
        JobManager::new(Arc::new(MemoryStore::new()))
    }

    fn job_doc(jid: &str, extra: serde_json::Value) -> Job {
        let mut base = serde_json::json!({ "jid": jid, "jobtype": "T" });
        base.as_object_mut()
            .unwrap()
            .extend(extra.as_object().unwrap().clone());
        serde_json::from_value(base).unwrap()
    }

    #[tokio::test]
    async fn push_fetch_ack_round_trip() {
        let mgr = manager();
        mgr.push(job_doc("a", serde_json::json!({}))).await.unwrap();

        let fetched = mgr
            .fetch(&["default".to_string()], Some("w1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.jid, "a");

        mgr.ack("a").await.unwrap();
        assert_eq!(mgr.store().total_processed().await.unwrap(), 1);
        assert_eq!(mgr.store().queue_size("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn priority_order_respected_across_fetch() {
        let mgr = manager();
        mgr.push(job_doc("lo", serde_json::json!({"priority": 3})))
            .await
            .unwrap();
        mgr.push(job_doc("hi", serde_json::json!({"priority": 9})))
            .await
            .unwrap();

        let first = mgr
            .fetch(&["default".to_string()], None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.jid, "hi");

        let second = mgr
            .fetch(&["default".to_string()], None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.jid, "lo");
    }

    #[tokio::test]
    async fn fetch_returns_none_when_empty() {
        let mgr = manager();
        let start = tokio::time::Instant::now();
        let result = mgr.fetch(&["default".to_string()], None).await.unwrap();
        assert!(result.is_none());
        assert!(start.elapsed() >= StdDuration::from_secs(2));
    }

    #[tokio::test]
    async fn fail_with_retries_remaining_goes_to_retry_set() {
        let mgr = manager();
        mgr.push(job_doc("a", serde_json::json!({"retry": 2})))
            .await
            .unwrap();
        mgr.fetch(&["default".to_string()], None).await.unwrap();

        mgr.fail("a", Some("Boom".to_string()), Some("oops".to_string()), None)
            .await
            .unwrap();

        assert_eq!(mgr.store().retry_size().await.unwrap(), 1);
        assert_eq!(mgr.store().dead_size().await.unwrap(), 0);
        assert_eq!(mgr.store().total_failures().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fail_exhausting_retries_goes_dead() {
        let mgr = manager();
        mgr.push(job_doc("a", serde_json::json!({"retry": 1})))
            .await
            .unwrap();
        mgr.fetch(&["default".to_string()], None).await.unwrap();

        mgr.fail("a", None, None, None).await.unwrap();

        assert_eq!(mgr.store().dead_size().await.unwrap(), 1);
        assert_eq!(mgr.store().retry_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fail_with_retry_disabled_discards_job() {
        let mgr = manager();
        mgr.push(job_doc("a", serde_json::json!({"retry": -1})))
            .await
            .unwrap();
        mgr.fetch(&["default".to_string()], None).await.unwrap();

        mgr.fail("a", None, None, None).await.unwrap();

        assert_eq!(mgr.store().dead_size().await.unwrap(), 0);
        assert_eq!(mgr.store().retry_size().await.unwrap(), 0);
        assert_eq!(mgr.store().total_failures().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ack_of_unknown_jid_is_not_an_error() {
        let mgr = manager();
        assert!(mgr.ack("ghost").await.is_ok());
    }

    #[tokio::test]
    async fn fail_of_unknown_jid_is_not_found() {
        let mgr = manager();
        let err = mgr.fail("ghost", None, None, None).await.unwrap_err();
        assert_eq!(err.tag(), "NOTFOUND");
    }

    #[tokio::test]
    async fn expired_reservation_with_retries_remaining_goes_to_retry_set() {
        let mgr = manager();
        mgr.push(job_doc("a", serde_json::json!({"retry": 3})))
            .await
            .unwrap();
        mgr.fetch(&["default".to_string()], Some("w1")).await.unwrap();

        // The reservation was just made, so it isn't expired yet.
        let reaped = mgr.sweep_expired_reservations(Utc::now()).await.unwrap();
        assert_eq!(reaped, 0);

        // Pretend it's long past the reservation's expiry.
        let far_future = Utc::now() + chrono::Duration::days(1);
        let reaped = mgr.sweep_expired_reservations(far_future).await.unwrap();
        assert_eq!(reaped, 1);
        assert_eq!(mgr.store().retry_size().await.unwrap(), 1);
        assert_eq!(mgr.store().queue_size("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_reservation_exhausting_retries_goes_dead() {
        let mgr = manager();
        mgr.push(job_doc("a", serde_json::json!({"retry": 0})))
            .await
            .unwrap();
        mgr.fetch(&["default".to_string()], Some("w1")).await.unwrap();

        let far_future = Utc::now() + chrono::Duration::days(1);
        let reaped = mgr.sweep_expired_reservations(far_future).await.unwrap();
        assert_eq!(reaped, 1);
        assert_eq!(mgr.store().dead_size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scheduled_push_is_invisible_until_due() {
        let mgr = manager();
        let at = Utc::now() + chrono::Duration::seconds(2);
        mgr.push(job_doc("a", serde_json::json!({"at": at.to_rfc3339()})))
            .await
            .unwrap();

        assert_eq!(mgr.store().queue_size("default").await.unwrap(), 0);
        assert_eq!(mgr.store().schedule_size().await.unwrap(), 1);

        let swept = mgr.sweep_scheduled(Utc::now() + chrono::Duration::seconds(3)).await.unwrap();
        assert_eq!(swept, 1);
        assert_eq!(mgr.store().queue_size("default").await.unwrap(), 1);
    }
}
