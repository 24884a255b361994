//! The five background sweepers spec.md §4.2 names, each wired into the
//! [`crate::taskrunner::TaskRunner`] at its own period.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::JobManager;
use crate::registry::WorkerRegistry;
use crate::taskrunner::Taskable;

/// Every 5s: moves due scheduled entries into their queues.
pub struct ScheduledEnqueuer(pub Arc<JobManager>);

#[async_trait]
impl Taskable for ScheduledEnqueuer {
    async fn run(&self) -> anyhow::Result<()> {
        let moved = self.0.sweep_scheduled(Utc::now()).await?;
        if moved > 0 {
            debug!(moved, "scheduled jobs moved to queue");
        }
        Ok(())
    }
}

/// Every 5s: moves due retry-set entries into their queues.
pub struct RetryEnqueuer(pub Arc<JobManager>);

#[async_trait]
impl Taskable for RetryEnqueuer {
    async fn run(&self) -> anyhow::Result<()> {
        let moved = self.0.sweep_retries(Utc::now()).await?;
        if moved > 0 {
            debug!(moved, "retry-set jobs moved to queue");
        }
        Ok(())
    }
}

/// Every 15s: re-enqueues or dead-letters jobs whose reservation expired.
pub struct ReservationReaper(pub Arc<JobManager>);

#[async_trait]
impl Taskable for ReservationReaper {
    async fn run(&self) -> anyhow::Result<()> {
        let reaped = self.0.sweep_expired_reservations(Utc::now()).await?;
        if reaped > 0 {
            debug!(reaped, "expired reservations reclaimed");
        }
        Ok(())
    }
}

/// Every 15s: drops workers with no heartbeat in 60s; force-closes
/// connections of workers stale enough to hit the force-close threshold.
pub struct HeartbeatReaper(pub Arc<WorkerRegistry>);

#[async_trait]
impl Taskable for HeartbeatReaper {
    async fn run(&self) -> anyhow::Result<()> {
        self.0.reap(Utc::now());
        Ok(())
    }
}

/// Hourly: enforces the dead set's size and age caps.
pub struct DeadSetTrimmer(pub Arc<JobManager>);

#[async_trait]
impl Taskable for DeadSetTrimmer {
    async fn run(&self) -> anyhow::Result<()> {
        self.0.dead_trim().await?;
        Ok(())
    }
}
