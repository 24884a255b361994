//! In-process reference implementation of [`Store`]. Spec.md treats the
//! concrete networked sorted-set/hash backend as opaque and out of scope;
//! this is the one concrete backend this crate ships, built from
//! `tokio::sync::Mutex`-guarded structures. Per-key linearizability (the
//! only ordering guarantee the manager relies on) falls out for free from
//! locking the whole structure per operation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use super::{Reservation, Store, StoreError};
use crate::types::job::Job;

type PriorityQueue = BTreeMap<u8, VecDeque<Job>>;

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failures: AtomicU64,
    seq: AtomicU64,
}

pub struct MemoryStore {
    queues: Mutex<HashMap<String, PriorityQueue>>,
    scheduled: Mutex<BTreeMap<(DateTime<Utc>, u64), Job>>,
    retries: Mutex<BTreeMap<(DateTime<Utc>, u64), Job>>,
    dead: Mutex<VecDeque<(DateTime<Utc>, Job)>>,
    reservations: Mutex<HashMap<String, Reservation>>,
    counters: Counters,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            scheduled: Mutex::new(BTreeMap::new()),
            retries: Mutex::new(BTreeMap::new()),
            dead: Mutex::new(VecDeque::new()),
            reservations: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    fn next_seq(&self) -> u64 {
        self.counters.seq.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn push(&self, queue: &str, job: Job) -> Result<(), StoreError> {
        let mut queues = self.queues.lock().await;
        let pq = queues.entry(queue.to_string()).or_default();
        pq.entry(job.priority).or_default().push_back(job);
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Job>, StoreError> {
        let mut queues = self.queues.lock().await;
        let Some(pq) = queues.get_mut(queue) else {
            return Ok(None);
        };

        // Highest priority first; BTreeMap iterates ascending, so walk from
        // the back.
        let Some((&pri, bucket)) = pq.iter_mut().next_back() else {
            return Ok(None);
        };

        let job = bucket.pop_front();
        if bucket.is_empty() {
            pq.remove(&pri);
        }
        Ok(job)
    }

    async fn queue_size(&self, queue: &str) -> Result<u64, StoreError> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(queue)
            .map(|pq| pq.values().map(|b| b.len() as u64).sum())
            .unwrap_or(0))
    }

    async fn queue_names(&self) -> Result<Vec<String>, StoreError> {
        let queues = self.queues.lock().await;
        Ok(queues.keys().cloned().collect())
    }

    async fn schedule_add(
        &self,
        at: DateTime<Utc>,
        job: Job,
    ) -> Result<(), StoreError> {
        let seq = self.next_seq();
        self.scheduled.lock().await.insert((at, seq), job);
        Ok(())
    }

    async fn schedule_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut scheduled = self.scheduled.lock().await;
        let rest = scheduled.split_off(&(now + Duration::nanoseconds(1), 0));
        let due = std::mem::replace(&mut *scheduled, rest);
        Ok(due.into_values().collect())
    }

    async fn schedule_size(&self) -> Result<u64, StoreError> {
        Ok(self.scheduled.lock().await.len() as u64)
    }

    async fn retry_add(
        &self,
        at: DateTime<Utc>,
        job: Job,
    ) -> Result<(), StoreError> {
        let seq = self.next_seq();
        self.retries.lock().await.insert((at, seq), job);
        Ok(())
    }

    async fn retry_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let mut retries = self.retries.lock().await;
        let rest = retries.split_off(&(now + Duration::nanoseconds(1), 0));
        let due = std::mem::replace(&mut *retries, rest);
        Ok(due.into_values().collect())
    }

    async fn retry_size(&self) -> Result<u64, StoreError> {
        Ok(self.retries.lock().await.len() as u64)
    }

    async fn dead_add(&self, job: Job) -> Result<(), StoreError> {
        self.dead.lock().await.push_back((Utc::now(), job));
        Ok(())
    }

    async fn dead_trim(
        &self,
        max_size: u64,
        max_age: Duration,
    ) -> Result<(), StoreError> {
        let mut dead = self.dead.lock().await;
        let cutoff = Utc::now() - max_age;

        while dead.front().is_some_and(|(ts, _)| *ts < cutoff) {
            dead.pop_front();
        }

        while dead.len() as u64 > max_size {
            dead.pop_front();
        }

        Ok(())
    }

    async fn dead_size(&self) -> Result<u64, StoreError> {
        Ok(self.dead.lock().await.len() as u64)
    }

    async fn reservation_set(
        &self,
        reservation: Reservation,
    ) -> Result<(), StoreError> {
        self.reservations
            .lock()
            .await
            .insert(reservation.jid.clone(), reservation);
        Ok(())
    }

    async fn reservation_get(
        &self,
        jid: &str,
    ) -> Result<Option<Reservation>, StoreError> {
        Ok(self.reservations.lock().await.get(jid).cloned())
    }

    async fn reservation_delete(
        &self,
        jid: &str,
    ) -> Result<Option<Reservation>, StoreError> {
        Ok(self.reservations.lock().await.remove(jid))
    }

    async fn reservation_scan_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, StoreError> {
        let mut reservations = self.reservations.lock().await;
        let expired_jids: Vec<String> = reservations
            .iter()
            .filter(|(_, r)| r.expiry <= now)
            .map(|(jid, _)| jid.clone())
            .collect();

        Ok(expired_jids
            .into_iter()
            .filter_map(|jid| reservations.remove(&jid))
            .collect())
    }

    async fn incr_processed(&self) -> Result<u64, StoreError> {
        Ok(self.counters.processed.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn incr_failures(&self) -> Result<u64, StoreError> {
        Ok(self.counters.failures.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn total_processed(&self) -> Result<u64, StoreError> {
        Ok(self.counters.processed.load(Ordering::SeqCst))
    }

    async fn total_failures(&self) -> Result<u64, StoreError> {
        Ok(self.counters.failures.load(Ordering::SeqCst))
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.queues.lock().await.clear();
        self.scheduled.lock().await.clear();
        self.retries.lock().await.clear();
        self.dead.lock().await.clear();
        self.reservations.lock().await.clear();
        self.counters.processed.store(0, Ordering::SeqCst);
        self.counters.failures.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(jid: &str, pri: u8) -> Job {
        serde_json::from_value(serde_json::json!({
            "jid": jid,
            "jobtype": "T",
            "priority": pri,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn priority_order_within_queue() {
        let store = MemoryStore::new();
        store.push("default", job("lo", 3)).await.unwrap();
        store.push("default", job("hi", 9)).await.unwrap();

        assert_eq!(store.pop("default").await.unwrap().unwrap().jid, "hi");
        assert_eq!(store.pop("default").await.unwrap().unwrap().jid, "lo");
        assert!(store.pop("default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fifo_within_same_priority() {
        let store = MemoryStore::new();
        store.push("default", job("a", 5)).await.unwrap();
        store.push("default", job("b", 5)).await.unwrap();

        assert_eq!(store.pop("default").await.unwrap().unwrap().jid, "a");
        assert_eq!(store.pop("default").await.unwrap().unwrap().jid, "b");
    }

    #[tokio::test]
    async fn schedule_due_is_atomic_pop() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.schedule_add(now - Duration::seconds(1), job("past", 5)).await.unwrap();
        store.schedule_add(now + Duration::seconds(60), job("future", 5)).await.unwrap();

        let due = store.schedule_due(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].jid, "past");
        assert_eq!(store.schedule_size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn flush_resets_everything() {
        let store = MemoryStore::new();
        store.push("default", job("a", 5)).await.unwrap();
        store.incr_processed().await.unwrap();
        store.flush().await.unwrap();

        assert_eq!(store.queue_size("default").await.unwrap(), 0);
        assert_eq!(store.total_processed().await.unwrap(), 0);
    }
}
