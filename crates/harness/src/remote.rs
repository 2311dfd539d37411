use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;
use toolsync_core::{Clock, LocalClock, Timestamp, ToolName, UserId};
use toolsync_sync::{PullOutcome, PushOutcome, RemoteRecord, RemoteStore};

type PullHook = Rc<dyn Fn()>;

/// In-process stand-in for the remote key-value service.
///
/// Stamps `last_sync` from its own monotonic server clock, answers
/// `Unavailable` when unreachable or slower than the caller's timeout, and
/// counts every call it receives.
pub struct SimulatedRemote {
    records: RefCell<BTreeMap<(UserId, ToolName), RemoteRecord>>,
    clock: LocalClock,
    reachable: Cell<bool>,
    latency: Cell<Duration>,
    pushes: Cell<usize>,
    pulls: Cell<usize>,
    on_pull: RefCell<Option<PullHook>>,
}

impl SimulatedRemote {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            records: RefCell::new(BTreeMap::new()),
            clock: LocalClock::new(clock),
            reachable: Cell::new(true),
            latency: Cell::new(Duration::ZERO),
            pushes: Cell::new(0),
            pulls: Cell::new(0),
            on_pull: RefCell::new(None),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.set(reachable);
    }

    /// Simulated response time. Calls whose timeout is shorter fail.
    pub fn set_latency(&self, latency: Duration) {
        self.latency.set(latency);
    }

    /// Run `hook` inside every pull, before the answer is produced. Lets a
    /// test re-enter the caller while a reconcile is mid-flight.
    pub fn on_pull(&self, hook: impl Fn() + 'static) {
        *self.on_pull.borrow_mut() = Some(Rc::new(hook));
    }

    pub fn clear_on_pull(&self) {
        *self.on_pull.borrow_mut() = None;
    }

    /// Store a record as if another device had pushed it at `last_sync`.
    pub fn seed(&self, user: &UserId, tool: &ToolName, payload: Value, last_sync: Timestamp) {
        self.clock.observe(last_sync);
        self.records.borrow_mut().insert(
            (user.clone(), tool.clone()),
            RemoteRecord {
                user_id: user.clone(),
                tool_name: tool.clone(),
                payload,
                last_sync,
            },
        );
    }

    pub fn record(&self, user: &UserId, tool: &ToolName) -> Option<RemoteRecord> {
        self.records
            .borrow()
            .get(&(user.clone(), tool.clone()))
            .cloned()
    }

    pub fn pushes(&self) -> usize {
        self.pushes.get()
    }

    pub fn pulls(&self) -> usize {
        self.pulls.get()
    }

    pub fn calls(&self) -> usize {
        self.pushes.get() + self.pulls.get()
    }

    pub fn reset_counters(&self) {
        self.pushes.set(0);
        self.pulls.set(0);
    }

    fn answers_within(&self, timeout: Duration) -> bool {
        self.reachable.get() && self.latency.get() <= timeout
    }
}

impl RemoteStore for SimulatedRemote {
    fn push(
        &self,
        user: &UserId,
        tool: &ToolName,
        payload: &Value,
        timeout: Duration,
    ) -> PushOutcome {
        self.pushes.set(self.pushes.get() + 1);
        if !self.answers_within(timeout) {
            return PushOutcome::Unavailable;
        }
        let last_sync = self.clock.tick();
        self.records.borrow_mut().insert(
            (user.clone(), tool.clone()),
            RemoteRecord {
                user_id: user.clone(),
                tool_name: tool.clone(),
                payload: payload.clone(),
                last_sync,
            },
        );
        PushOutcome::Accepted(last_sync)
    }

    fn pull(&self, user: &UserId, tool: &ToolName, timeout: Duration) -> PullOutcome {
        self.pulls.set(self.pulls.get() + 1);
        let hook = self.on_pull.borrow().clone();
        if let Some(hook) = hook {
            hook();
        }
        if !self.answers_within(timeout) {
            return PullOutcome::Unavailable;
        }
        match self.record(user, tool) {
            Some(record) => PullOutcome::Found(record),
            None => PullOutcome::Absent,
        }
    }
}
