//! In-memory worker liveness tracking (spec.md §4.3). Only the dispatcher
//! mutates this map (on `HELLO`, `BEAT`, and connection close); the
//! heartbeat reaper reads and deletes entries. All access goes through the
//! registry's own mutex, kept separate from the server-wide mutex so a
//! `BEAT` never has to wait on server boot/stop machinery.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::worker::{ClientData, ConnHandle, ConnId, DesiredState};

/// How long without a heartbeat before a worker is dropped from the
/// registry.
pub const HEARTBEAT_TIMEOUT_SECS: i64 = 60;
/// How long without a heartbeat before a worker's remaining connections are
/// force-closed, even if it was already dropped from the registry.
pub const HEARTBEAT_FORCE_CLOSE_SECS: i64 = 120;

pub struct WorkerRegistry {
    workers: Mutex<HashMap<String, ClientData>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a worker connection from a successful `HELLO` carrying a
    /// `wid`. If the `wid` is already known (a second connection from the
    /// same worker process), the existing record is reused rather than
    /// replaced, so its `desired_state` and other open connections survive.
    pub fn hello(
        &self,
        wid: String,
        hostname: String,
        pid: u32,
        labels: HashSet<String>,
        conn_id: ConnId,
        close: mpsc::Sender<()>,
        now: DateTime<Utc>,
    ) {
        let mut workers = self.workers.lock().unwrap();
        let client = workers.entry(wid.clone()).or_insert_with(|| {
            ClientData::new(wid, hostname.clone(), pid, labels.clone(), now)
        });

        client.hostname = hostname;
        client.pid = pid;
        client.labels = labels;
        client.touch(now);
        client
            .connections
            .insert(conn_id, ConnHandle { conn_id, close });
    }

    /// Removes a closed connection from its worker's connection set. Leaves
    /// the worker record itself in place -- only the heartbeat reaper
    /// drops dead workers.
    pub fn disconnect(&self, wid: &str, conn_id: ConnId) {
        let mut workers = self.workers.lock().unwrap();
        if let Some(client) = workers.get_mut(wid) {
            client.connections.remove(&conn_id);
        }
    }

    /// Records a heartbeat and returns any pending desired-state
    /// transition the caller should relay back to the worker.
    pub fn beat(&self, wid: &str, now: DateTime<Utc>) -> Option<DesiredState> {
        let mut workers = self.workers.lock().unwrap();
        let client = workers.get_mut(wid)?;
        client.touch(now);
        client.desired_state
    }

    /// Sets the desired state the server will hand back to `wid` on its
    /// next `BEAT`. Used by admin tooling to quiesce or terminate workers.
    pub fn signal(&self, wid: &str, state: DesiredState) -> bool {
        let mut workers = self.workers.lock().unwrap();
        match workers.get_mut(wid) {
            Some(client) => {
                client.desired_state = Some(state);
                true
            },
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Drops workers whose last heartbeat is older than
    /// [`HEARTBEAT_TIMEOUT_SECS`]; force-closes the connections of any
    /// worker stale enough to hit [`HEARTBEAT_FORCE_CLOSE_SECS`] first.
    pub fn reap(&self, now: DateTime<Utc>) {
        let timeout = chrono::Duration::seconds(HEARTBEAT_TIMEOUT_SECS);
        let force_close = chrono::Duration::seconds(HEARTBEAT_FORCE_CLOSE_SECS);

        let mut workers = self.workers.lock().unwrap();
        let stale: Vec<String> = workers
            .iter()
            .filter(|(_, c)| c.is_stale(now, timeout))
            .map(|(wid, _)| wid.clone())
            .collect();

        for wid in stale {
            if let Some(client) = workers.get(&wid) {
                if client.is_stale(now, force_close) {
                    for handle in client.connections.values() {
                        // best-effort: a full channel or a dropped receiver
                        // just means the connection is already on its way
                        // out.
                        let _ = handle.close.try_send(());
                    }
                }
            }

            debug!(wid, "reaping stale worker");
            workers.remove(&wid);
        }
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chan() -> mpsc::Sender<()> {
        mpsc::channel(1).0
    }

    #[test]
    fn beat_reports_pending_signal() {
        let reg = WorkerRegistry::new();
        let now = Utc::now();
        reg.hello("w1".into(), "host".into(), 1, HashSet::new(), 1, chan(), now);

        assert_eq!(reg.beat("w1", now), None);

        reg.signal("w1", DesiredState::Quiet);
        assert_eq!(reg.beat("w1", now), Some(DesiredState::Quiet));
    }

    #[test]
    fn reap_drops_stale_workers() {
        let reg = WorkerRegistry::new();
        let past = Utc::now() - chrono::Duration::seconds(1000);
        reg.hello("w1".into(), "host".into(), 1, HashSet::new(), 1, chan(), past);

        assert_eq!(reg.count(), 1);
        reg.reap(Utc::now());
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn unknown_wid_signal_returns_false() {
        let reg = WorkerRegistry::new();
        assert!(!reg.signal("ghost", DesiredState::Terminate));
    }
}
