use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FaktoryError;
use crate::types::job::Job;
use crate::types::worker::DesiredState;

/// A command sent by the client, already parsed off the wire. `raw` carries
/// the verb's original argument payload where a command needs to re-parse
/// application-level JSON after routing (kept minimal: most commands carry
/// their own typed fields).
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// `PUSH <json>` -- places a job document onto its queue or the
    /// scheduled set.
    Push(Job),
    /// `FETCH <queue> [queue ...]` -- reserves and returns the
    /// highest-priority ready job from the first non-empty queue, in the
    /// client-given order.
    Fetch { queues: Vec<String> },
    /// `ACK <{jid}>` -- confirms successful processing of a reserved job.
    Ack { jid: String },
    /// `FAIL <{jid,errtype,message,backtrace}>` -- reports a reserved job
    /// failed; the job is retried or dead-lettered per its remaining
    /// attempts.
    Fail {
        jid: String,
        errtype: Option<String>,
        message: Option<String>,
        backtrace: Option<Vec<String>>,
    },
    /// `BEAT <{wid[,current_state]}>` -- worker liveness heartbeat.
    Beat {
        wid: String,
        current_state: Option<String>,
    },
    /// `INFO` -- server state snapshot.
    Info,
    /// `FLUSH` -- clears all job state. Auth-gated like every other verb
    /// once a password is configured.
    Flush,
    /// `MUTATE <json>` -- admin operations against the sorted sets.
    Mutate(MutateOp),
    /// `END` -- terminates the connection.
    End,
}

/// The (deliberately small) admin-operation vocabulary this crate
/// recognises for `MUTATE`. Anything else is rejected as `MALFORMED`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum MutateOp {
    /// Empties one of the sorted sets entirely.
    Clear { target: MutateTarget },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutateTarget {
    Scheduled,
    Retries,
    Dead,
}

/// Every reply the dispatcher can write back to a client.
#[derive(Debug, PartialEq)]
pub enum Response {
    /// `+OK\r\n`
    Ok,
    /// `-<TAG> <message>\r\n`
    Error(FaktoryError),
    /// `$<n>\r\n<bytes>\r\n`, or `$-1\r\n` for `None`.
    Blob(Option<Vec<u8>>),
    /// `+<json>\r\n` -- used for the BEAT quiet/terminate signal, which is
    /// a simple-string reply carrying a small JSON body rather than `OK`.
    SimpleJson(Value),
}

impl Response {
    pub fn beat_signal(state: DesiredState) -> Self {
        Self::SimpleJson(serde_json::json!({ "state": state }))
    }

    pub fn blob_json(value: &impl Serialize) -> Self {
        match serde_json::to_vec(value) {
            Ok(bytes) => Self::Blob(Some(bytes)),
            Err(_) => Self::Error(FaktoryError::Internal(
                "failed to serialize response".to_string(),
            )),
        }
    }
}
