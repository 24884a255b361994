//! Periodic background task scheduler (spec.md §4.4). A single ticker
//! drives all registered tasks; each runs serially so a slow task only
//! delays its own next tick, never another task's. Panics are caught so one
//! broken sweeper can never bring the server down.

use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// One periodic unit of work a sweeper performs. Implementations should be
/// individually short; long work should be chunked across ticks rather
/// than done in one `run` call.
#[async_trait]
pub trait Taskable: Send + Sync {
    async fn run(&self) -> anyhow::Result<()>;
}

struct TaskEntry {
    name: &'static str,
    period: chrono::Duration,
    last_run: Mutex<Option<DateTime<Utc>>>,
    task: Box<dyn Taskable>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStat {
    pub name: &'static str,
    pub period_secs: i64,
    pub last_run: Option<DateTime<Utc>>,
}

pub struct TaskRunner {
    tasks: Vec<TaskEntry>,
}

impl TaskRunner {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn register(
        &mut self,
        name: &'static str,
        period: chrono::Duration,
        task: Box<dyn Taskable>,
    ) {
        self.tasks.push(TaskEntry {
            name,
            period,
            last_run: Mutex::new(None),
            task,
        });
    }

    pub fn stats(&self) -> Vec<TaskStat> {
        self.tasks
            .iter()
            .map(|t| TaskStat {
                name: t.name,
                period_secs: t.period.num_seconds(),
                last_run: *t.last_run.lock().unwrap(),
            })
            .collect()
    }

    /// Runs the scheduler loop until `cancel` fires. Wakes once per second;
    /// for each task whose period has elapsed, runs it to completion before
    /// considering the next.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(StdDuration::from_secs(1));

        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = cancel.cancelled() => return,
            }

            let now = Utc::now();

            for entry in &self.tasks {
                let due = {
                    let last_run = entry.last_run.lock().unwrap();
                    match *last_run {
                        Some(t) => now - t >= entry.period,
                        None => true,
                    }
                };

                if !due {
                    continue;
                }

                match AssertUnwindSafe(entry.task.run()).catch_unwind().await {
                    Ok(Ok(())) => {},
                    Ok(Err(err)) => {
                        warn!(task = entry.name, %err, "sweeper task failed, will retry next tick");
                    },
                    Err(_) => {
                        error!(task = entry.name, "sweeper task panicked");
                    },
                }

                *entry.last_run.lock().unwrap() = Some(now);
            }
        }
    }
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new()
    }
}
