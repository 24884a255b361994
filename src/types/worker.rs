use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

/// A worker-requested state transition the server wants to hand back on the
/// worker's next `BEAT`. Unlike `quiet`/`terminate`, `running` is never
/// reported back to the worker -- it's simply the absence of a signal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Quiet,
    Terminate,
}

/// Opaque identifier for one post-handshake TCP connection, unique for the
/// lifetime of the server process.
pub type ConnId = u64;

/// A one-way handle the worker registry holds on a connection so the
/// heartbeat reaper can force-close it without reaching back into the
/// dispatcher. The connection itself holds only its own `wid` -- it never
/// needs to navigate back into the registry.
#[derive(Debug)]
pub struct ConnHandle {
    pub conn_id: ConnId,
    pub close: mpsc::Sender<()>,
}

/// Liveness and identity record for one worker process, keyed by `wid` in
/// the [`crate::registry::WorkerRegistry`]. A single worker process may
/// hold more than one open connection.
#[derive(Debug)]
pub struct ClientData {
    pub wid: String,
    pub hostname: String,
    pub pid: u32,
    pub labels: HashSet<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub desired_state: Option<DesiredState>,
    pub connections: HashMap<ConnId, ConnHandle>,
}

impl ClientData {
    pub fn new(
        wid: String,
        hostname: String,
        pid: u32,
        labels: HashSet<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            wid,
            hostname,
            pid,
            labels,
            last_heartbeat: now,
            desired_state: None,
            connections: HashMap::new(),
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = now;
    }

    pub fn is_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now - self.last_heartbeat > timeout
    }
}
