use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use toolsync_core::{Clock, RecordId, Timestamp, ToolName, UserId};

use crate::connectivity::ConnectivityMonitor;

/// One row of the remote store.
///
/// ```json
/// { "user_id": "...", "tool_name": "...", "data": ..., "last_sync": "<ISO-8601>" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub user_id: UserId,
    pub tool_name: ToolName,
    #[serde(rename = "data")]
    pub payload: Value,
    pub last_sync: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The server stored the payload at this server-side time.
    Accepted(Timestamp),
    Unavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PullOutcome {
    Found(RemoteRecord),
    Absent,
    Unavailable,
}

/// A remote key-value service holding one record per `(user, tool)`.
///
/// Implementations must give up within `timeout` and report
/// `Unavailable`; a network failure is an expected outcome, not an error.
pub trait RemoteStore {
    fn push(&self, user: &UserId, tool: &ToolName, payload: &Value, timeout: Duration)
    -> PushOutcome;

    fn pull(&self, user: &UserId, tool: &ToolName, timeout: Duration) -> PullOutcome;
}

/// Remote used when no backend is configured: every call is unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRemote;

impl RemoteStore for NoRemote {
    fn push(&self, _: &UserId, _: &ToolName, _: &Value, _: Duration) -> PushOutcome {
        PushOutcome::Unavailable
    }

    fn pull(&self, _: &UserId, _: &ToolName, _: Duration) -> PullOutcome {
        PullOutcome::Unavailable
    }
}

/// Gatekeeper in front of a [`RemoteStore`].
///
/// Skips the call entirely while offline, applies the configured timeout,
/// and records the time of the last successful exchange.
pub struct RemoteTier {
    store: Rc<dyn RemoteStore>,
    connectivity: Rc<ConnectivityMonitor>,
    clock: Rc<dyn Clock>,
    timeout: Duration,
    last_sync_time: Cell<Option<Timestamp>>,
}

impl RemoteTier {
    pub fn new(
        store: Rc<dyn RemoteStore>,
        connectivity: Rc<ConnectivityMonitor>,
        clock: Rc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            connectivity,
            clock,
            timeout,
            last_sync_time: Cell::new(None),
        }
    }

    /// When the most recent successful push or pull happened.
    pub fn last_sync_time(&self) -> Option<Timestamp> {
        self.last_sync_time.get()
    }

    /// Note a completed exchange. A server time ahead of the local clock
    /// is taken as is; the recorded value never moves backwards.
    fn exchanged(&self, server_time: Option<Timestamp>) {
        let at = server_time.map_or(self.clock.now(), |t| t.max(self.clock.now()));
        if self.last_sync_time.get().is_none_or(|prev| at > prev) {
            self.last_sync_time.set(Some(at));
        }
    }

    pub fn push(&self, id: &RecordId, payload: &Value) -> PushOutcome {
        if !self.connectivity.is_online() {
            return PushOutcome::Unavailable;
        }
        let outcome = self.store.push(&id.user, &id.tool, payload, self.timeout);
        match outcome {
            PushOutcome::Accepted(at) => {
                debug!(record = %id, last_sync = %at, "pushed to remote");
                self.exchanged(Some(at));
            }
            PushOutcome::Unavailable => debug!(record = %id, "remote unavailable for push"),
        }
        outcome
    }

    pub fn pull(&self, id: &RecordId) -> PullOutcome {
        if !self.connectivity.is_online() {
            return PullOutcome::Unavailable;
        }
        let outcome = self.store.pull(&id.user, &id.tool, self.timeout);
        match &outcome {
            PullOutcome::Found(record) => {
                debug!(record = %id, last_sync = %record.last_sync, "pulled from remote");
                self.exchanged(None);
            }
            PullOutcome::Absent => {
                debug!(record = %id, "no remote copy");
                self.exchanged(None);
            }
            PullOutcome::Unavailable => debug!(record = %id, "remote unavailable for pull"),
        }
        outcome
    }
}
