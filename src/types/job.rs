use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default queue name jobs land on when none is specified.
pub const DEFAULT_QUEUE: &str = "default";
/// Default number of attempts (including the first) before a job is dead.
pub const DEFAULT_RETRY: i64 = 25;
/// Default reservation window, in seconds.
pub const DEFAULT_RESERVE_FOR: u32 = 1800;
/// Minimum reservation window the server will honour.
pub const MIN_RESERVE_FOR: u32 = 60;
/// Default priority assigned to a job with no (or an out-of-range) priority.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Failure bookkeeping attached to a job after at least one `FAIL`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Failure {
    pub retry_count: u32,
    pub failed_at: Option<DateTime<Utc>>,
    pub next_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub errtype: Option<String>,
    pub backtrace: Option<Vec<String>>,
}

/// A job as carried on the wire and in storage. `custom` is an opaque
/// passthrough bag the server never inspects.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub jid: String,
    pub jobtype: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_retry")]
    pub retry: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
    #[serde(default = "default_reserve_for")]
    pub reserve_for: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

fn default_retry() -> i64 {
    DEFAULT_RETRY
}

fn default_reserve_for() -> u32 {
    DEFAULT_RESERVE_FOR
}

impl Job {
    /// Applies server-side defaults for a just-received PUSH payload.
    /// Priority out of `1..=9` is reset to the default rather than rejected,
    /// as the wire spec prescribes; missing required fields are instead
    /// caught by `validate`.
    pub fn normalize(&mut self, now: DateTime<Utc>) {
        if !(1..=9).contains(&self.priority) {
            self.priority = DEFAULT_PRIORITY;
        }

        if self.reserve_for < MIN_RESERVE_FOR {
            self.reserve_for = MIN_RESERVE_FOR;
        }

        self.created_at.get_or_insert(now);
        self.enqueued_at = Some(now);
    }

    /// Whether this job was pushed with a future `at` and so belongs in the
    /// scheduled set rather than its queue.
    pub fn is_scheduled(&self, now: DateTime<Utc>) -> bool {
        self.at.is_some_and(|at| at > now)
    }

    /// Maximum number of attempts before a job is dead-lettered. `retry < 0`
    /// disables retries (the job is discarded rather than buried on
    /// exhaustion); `retry == 0` means "dead immediately on first failure".
    pub fn max_retries(&self) -> i64 {
        self.retry
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushError {
    MissingJid,
    MissingJobtype,
}

impl Job {
    pub fn validate(&self) -> Result<(), PushError> {
        if self.jid.trim().is_empty() {
            return Err(PushError::MissingJid);
        }
        if self.jobtype.trim().is_empty() {
            return Err(PushError::MissingJobtype);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Job {
        serde_json::from_value(serde_json::json!({
            "jid": "abc123",
            "jobtype": "SomeJob",
            "args": [1, 2, 3],
        }))
        .unwrap()
    }

    #[test]
    fn defaults_applied_on_deserialize() {
        let job = sample();
        assert_eq!(job.queue, "default");
        assert_eq!(job.priority, 5);
        assert_eq!(job.retry, 25);
        assert_eq!(job.reserve_for, 1800);
    }

    #[test]
    fn normalize_resets_bad_priority() {
        let mut job = sample();
        job.priority = 0;
        job.normalize(Utc::now());
        assert_eq!(job.priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn validate_rejects_missing_fields() {
        let mut job = sample();
        job.jid.clear();
        assert_eq!(job.validate(), Err(PushError::MissingJid));
    }
}
