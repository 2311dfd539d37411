use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::rc::Rc;

use serde_json::Value;
use tracing::{debug, info, warn};

use toolsync_core::{Checksum, Clock, LocalClock, RecordId, Timestamp};
use toolsync_storage::{FlatEntry, FlatKey, FlatStore, StorageError, StoredRecord, StructuredStore};

use crate::config::{SyncConfig, TieBreak};
use crate::connectivity::ConnectivityMonitor;
use crate::error::SyncError;
use crate::remote::{PullOutcome, PushOutcome, RemoteRecord, RemoteStore, RemoteTier};
use crate::scheduler::Scheduler;

/// Where a payload was read from or written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Structured,
    Flat,
    Remote,
}

/// The local copy of a record, from whichever local tier served it.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRecord {
    pub payload: Value,
    pub timestamp: Timestamp,
    pub synced: bool,
    pub tier: Tier,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// The authoritative payload and the tier it came from.
    Resolved { payload: Value, source: Tier },
    /// No tier holds anything for this record.
    Absent,
    /// Another pass for this record was already running; nothing was done.
    /// Carries the current local payload.
    Coalesced { payload: Option<Value> },
}

impl ReconcileOutcome {
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Resolved { payload, .. } => Some(payload),
            Self::Coalesced { payload } => payload.as_ref(),
            Self::Absent => None,
        }
    }

    pub fn into_payload(self) -> Option<Value> {
        match self {
            Self::Resolved { payload, .. } => Some(payload),
            Self::Coalesced { payload } => payload,
            Self::Absent => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
}

/// Last-write-wins between a local write time and the remote `last_sync`.
/// Equal timestamps go to `tie`.
pub fn resolve(local: Timestamp, remote: Timestamp, tie: TieBreak) -> Winner {
    if local > remote {
        Winner::Local
    } else if local < remote {
        Winner::Remote
    } else {
        match tie {
            TieBreak::Remote => Winner::Remote,
            TieBreak::Local => Winner::Local,
        }
    }
}

/// Result of writing a payload through the tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReport {
    /// Local tier that holds the write: `Structured`, or `Flat` when the
    /// structured write failed.
    pub tier: Tier,
    /// Server time of the push, if the remote accepted it.
    pub pushed: Option<Timestamp>,
}

/// What one [`SyncCoordinator::tick`] did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub flushed: Vec<RecordId>,
    pub reconciled: Vec<(RecordId, ReconcileOutcome)>,
    pub errors: Vec<(RecordId, SyncError)>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.flushed.is_empty() && self.reconciled.is_empty() && self.errors.is_empty()
    }

    pub fn outcome_for(&self, id: &RecordId) -> Option<&ReconcileOutcome> {
        self.reconciled
            .iter()
            .rev()
            .find(|(rid, _)| rid == id)
            .map(|(_, outcome)| outcome)
    }

    fn merge(&mut self, other: TickReport) {
        self.flushed.extend(other.flushed);
        self.reconciled.extend(other.reconciled);
        self.errors.extend(other.errors);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum TaskKind {
    Flush,
    PeriodicSync,
}

type TaskKey = (RecordId, TaskKind);

/// Marks a record as having a pass in flight; cleared on drop.
struct InFlight<'a> {
    set: &'a RefCell<HashSet<RecordId>>,
    id: RecordId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.borrow_mut().remove(&self.id);
    }
}

/// Keeps the local tiers and the remote converged for every record a
/// session touches.
///
/// Everything runs on the caller's thread. Overlap shows up as re-entrant
/// calls (a timer or connectivity edge handled while a pass is running),
/// which the per-record in-flight set turns into no-ops. No `RefCell`
/// borrow is held across a store call.
pub struct SyncCoordinator {
    structured: Rc<dyn StructuredStore>,
    flat: Rc<dyn FlatStore>,
    remote: RemoteTier,
    connectivity: Rc<ConnectivityMonitor>,
    clock: LocalClock,
    config: SyncConfig,
    scheduler: RefCell<Scheduler<TaskKey>>,
    /// Latest unsaved payload per record, waiting out the debounce.
    pending: RefCell<BTreeMap<RecordId, Value>>,
    in_flight: RefCell<HashSet<RecordId>>,
    /// Records reconciled when connectivity comes back.
    active: RefCell<BTreeSet<RecordId>>,
    restored_seen: Cell<u64>,
}

impl SyncCoordinator {
    pub fn new(
        structured: Rc<dyn StructuredStore>,
        flat: Rc<dyn FlatStore>,
        remote: Rc<dyn RemoteStore>,
        connectivity: Rc<ConnectivityMonitor>,
        clock: Rc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        let remote = RemoteTier::new(
            remote,
            connectivity.clone(),
            clock.clone(),
            config.remote_timeout(),
        );
        let restored_seen = Cell::new(connectivity.restored_generation());
        Self {
            structured,
            flat,
            remote,
            connectivity,
            clock: LocalClock::new(clock),
            config,
            scheduler: RefCell::new(Scheduler::new()),
            pending: RefCell::new(BTreeMap::new()),
            in_flight: RefCell::new(HashSet::new()),
            active: RefCell::new(BTreeSet::new()),
            restored_seen,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn last_sync_time(&self) -> Option<Timestamp> {
        self.remote.last_sync_time()
    }

    pub fn is_syncing(&self, id: &RecordId) -> bool {
        self.in_flight.borrow().contains(id)
    }

    pub fn has_pending_write(&self, id: &RecordId) -> bool {
        self.pending.borrow().contains_key(id)
    }

    /// Earliest time a scheduled task wants to run.
    pub fn next_wakeup(&self) -> Option<Timestamp> {
        self.scheduler.borrow().next_due()
    }

    /// Register a record for reconciliation on connectivity restore.
    pub fn track(&self, id: &RecordId) {
        self.active.borrow_mut().insert(id.clone());
    }

    fn begin(&self, id: &RecordId) -> Option<InFlight<'_>> {
        if !self.in_flight.borrow_mut().insert(id.clone()) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            id: id.clone(),
        })
    }

    fn arm_periodic(&self, id: &RecordId) {
        let now = self.clock.now();
        self.scheduler.borrow_mut().schedule_every(
            (id.clone(), TaskKind::PeriodicSync),
            now,
            self.config.periodic_interval(),
        );
    }

    fn disarm_periodic(&self, id: &RecordId) {
        self.scheduler
            .borrow_mut()
            .cancel(&(id.clone(), TaskKind::PeriodicSync));
    }

    // ========================================================================
    // Local tiers
    // ========================================================================

    /// Read the local copy. When both tiers hold an entry the newer one wins
    /// and a tie goes to the structured tier; the flat tier alone serves when
    /// the structured read fails or finds nothing.
    pub fn read_local(&self, id: &RecordId) -> Result<Option<LocalRecord>, SyncError> {
        let structured = match self.structured.get(&id.tool, &id.user) {
            Ok(record) => record.map(|r| LocalRecord {
                payload: r.payload,
                timestamp: r.timestamp,
                synced: r.synced,
                tier: Tier::Structured,
            }),
            Err(structured) => {
                warn!(
                    record = %id,
                    error = %structured,
                    "structured read failed; using fallback tier"
                );
                return self
                    .read_flat(id)
                    .map_err(|flat| SyncError::TiersExhausted { structured, flat });
            }
        };

        let flat = match self.read_flat(id) {
            Ok(flat) => flat,
            Err(e) => {
                warn!(record = %id, error = %e, "fallback read failed");
                None
            }
        };
        Ok(match (structured, flat) {
            (Some(s), Some(f)) if f.timestamp > s.timestamp => Some(f),
            (Some(s), _) => Some(s),
            (None, f) => f,
        })
    }

    fn read_flat(&self, id: &RecordId) -> Result<Option<LocalRecord>, StorageError> {
        let entry = self.flat.get(&FlatKey::for_tool(&id.tool))?;
        Ok(entry
            .filter(|e| e.owner == id.user)
            .map(|e| LocalRecord {
                payload: e.payload,
                timestamp: e.timestamp,
                synced: false,
                tier: Tier::Flat,
            }))
    }

    /// Write to the structured tier and mirror into the flat tier. Fails only
    /// when both tiers fail.
    fn write_local(&self, id: &RecordId, payload: &Value) -> Result<LocalRecord, SyncError> {
        let timestamp = self.clock.tick();
        let structured = self.structured.put(&id.tool, &id.user, payload, timestamp);
        let flat = self.flat.put(
            &FlatKey::for_tool(&id.tool),
            &FlatEntry {
                owner: id.user.clone(),
                payload: payload.clone(),
                timestamp,
            },
        );

        let tier = match (structured, flat) {
            (Ok(_), flat) => {
                if let Err(e) = flat {
                    warn!(record = %id, error = %e, "fallback mirror write failed");
                }
                Tier::Structured
            }
            (Err(e), Ok(())) => {
                warn!(record = %id, error = %e, "structured write failed; kept in fallback tier");
                Tier::Flat
            }
            (Err(structured), Err(flat)) => {
                return Err(SyncError::TiersExhausted { structured, flat });
            }
        };

        Ok(LocalRecord {
            payload: payload.clone(),
            timestamp,
            synced: false,
            tier,
        })
    }

    /// Overwrite both local tiers with the remote copy, marked synced.
    fn adopt_remote(&self, id: &RecordId, remote: &RemoteRecord) -> Result<(), SyncError> {
        let record = StoredRecord::new(id.clone(), remote.payload.clone(), remote.last_sync, true)?;
        let structured = self.structured.adopt(&record);
        let flat = self.flat.put(
            &FlatKey::for_tool(&id.tool),
            &FlatEntry {
                owner: id.user.clone(),
                payload: remote.payload.clone(),
                timestamp: remote.last_sync,
            },
        );

        match (structured, flat) {
            (Ok(()), flat) => {
                if let Err(e) = flat {
                    warn!(record = %id, error = %e, "fallback mirror write failed");
                }
            }
            (Err(e), Ok(())) => {
                warn!(
                    record = %id,
                    error = %e,
                    "structured write failed; remote copy kept in fallback tier"
                );
            }
            (Err(structured), Err(flat)) => {
                return Err(SyncError::TiersExhausted { structured, flat });
            }
        }

        self.disarm_periodic(id);
        Ok(())
    }

    /// True when the persisted local copy has not reached the remote.
    pub fn has_unsynced(&self, id: &RecordId) -> bool {
        match self.read_local(id) {
            Ok(Some(local)) => !local.synced,
            Ok(None) => false,
            Err(_) => true,
        }
    }

    // ========================================================================
    // Remote
    // ========================================================================

    /// Push `local` and record the result. Returns the server time on success.
    fn push_record(&self, id: &RecordId, local: &LocalRecord) -> Option<Timestamp> {
        match self.remote.push(id, &local.payload) {
            PushOutcome::Accepted(at) => {
                self.clock.observe(at);
                self.settle_synced(id, local);
                Some(at)
            }
            PushOutcome::Unavailable => {
                self.arm_periodic(id);
                None
            }
        }
    }

    fn settle_synced(&self, id: &RecordId, pushed: &LocalRecord) {
        let checksum = match Checksum::of(&pushed.payload) {
            Ok(checksum) => checksum,
            Err(e) => {
                warn!(record = %id, error = %e, "could not checksum pushed payload");
                return;
            }
        };

        match pushed.tier {
            Tier::Structured => match self.structured.mark_synced(&id.tool, &id.user, &checksum) {
                Ok(true) => self.disarm_periodic(id),
                Ok(false) => {
                    debug!(record = %id, "local copy changed during push; still dirty");
                    self.arm_periodic(id);
                }
                Err(e) => {
                    warn!(record = %id, error = %e, "could not mark record synced");
                    self.arm_periodic(id);
                }
            },
            Tier::Flat | Tier::Remote => {
                // The structured tier missed this write. The remote has it
                // now, so try to bring the structured tier back in line.
                let record = StoredRecord {
                    id: id.clone(),
                    payload: pushed.payload.clone(),
                    timestamp: pushed.timestamp,
                    checksum,
                    synced: true,
                };
                if let Err(e) = self.structured.adopt(&record) {
                    warn!(record = %id, error = %e, "structured tier still failing after push");
                }
                self.disarm_periodic(id);
            }
        }
    }

    /// Push the local copy as the winner. Re-reads first so that a write that
    /// landed while the pull was outstanding is the one pushed.
    fn push_winner(&self, id: &RecordId, local: LocalRecord) -> ReconcileOutcome {
        let current = match self.read_local(id) {
            Ok(Some(current)) => current,
            _ => local,
        };
        self.push_record(id, &current);
        ReconcileOutcome::Resolved {
            payload: current.payload,
            source: current.tier,
        }
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Decide which copy of `id` is authoritative and converge the tiers on
    /// it.
    ///
    /// Offline (or with the remote unreachable) the local copy is returned
    /// untouched. Online, last-write-wins between the local write time and
    /// the remote `last_sync` picks the winner, which is then pushed or
    /// adopted locally.
    pub fn reconcile(&self, id: &RecordId) -> Result<ReconcileOutcome, SyncError> {
        self.track(id);
        let Some(_guard) = self.begin(id) else {
            debug!(record = %id, "reconcile already in flight; coalescing");
            let local = self.read_local(id)?;
            return Ok(ReconcileOutcome::Coalesced {
                payload: local.map(|l| l.payload),
            });
        };

        let local = self.read_local(id)?;
        if !self.connectivity.is_online() {
            return Ok(local_outcome(local));
        }

        let remote = match self.remote.pull(id) {
            PullOutcome::Found(remote) => {
                self.clock.observe(remote.last_sync);
                Some(remote)
            }
            PullOutcome::Absent => None,
            PullOutcome::Unavailable => {
                if local.as_ref().is_some_and(|l| !l.synced) {
                    self.arm_periodic(id);
                }
                return Ok(local_outcome(local));
            }
        };

        match (local, remote) {
            (None, None) => Ok(ReconcileOutcome::Absent),
            (None, Some(remote)) => {
                self.adopt_remote(id, &remote)?;
                Ok(ReconcileOutcome::Resolved {
                    payload: remote.payload,
                    source: Tier::Remote,
                })
            }
            (Some(local), None) => Ok(self.push_winner(id, local)),
            (Some(local), Some(remote)) => {
                if local.synced && local.payload == remote.payload {
                    return Ok(ReconcileOutcome::Resolved {
                        payload: local.payload,
                        source: local.tier,
                    });
                }
                match resolve(local.timestamp, remote.last_sync, self.config.tie_break) {
                    Winner::Local => {
                        debug!(
                            record = %id,
                            local = %local.timestamp,
                            remote = %remote.last_sync,
                            "local copy is newer; pushing"
                        );
                        Ok(self.push_winner(id, local))
                    }
                    Winner::Remote => {
                        debug!(
                            record = %id,
                            local = %local.timestamp,
                            remote = %remote.last_sync,
                            "remote copy wins; overwriting local tiers"
                        );
                        self.adopt_remote(id, &remote)?;
                        Ok(ReconcileOutcome::Resolved {
                            payload: remote.payload,
                            source: Tier::Remote,
                        })
                    }
                }
            }
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Queue `payload` behind the debounce. Each call restarts the quiet
    /// period; only the last payload of a burst is written.
    pub fn schedule_write(&self, id: &RecordId, payload: Value) {
        self.track(id);
        self.pending.borrow_mut().insert(id.clone(), payload);
        let now = self.clock.now();
        self.scheduler.borrow_mut().schedule_once(
            (id.clone(), TaskKind::Flush),
            now,
            self.config.debounce(),
        );
    }

    /// Write `payload` through immediately, superseding any pending write.
    pub fn write_through(&self, id: &RecordId, payload: &Value) -> Result<WriteReport, SyncError> {
        self.scheduler
            .borrow_mut()
            .cancel(&(id.clone(), TaskKind::Flush));
        self.pending.borrow_mut().remove(id);
        self.persist(id, payload)
    }

    /// Write the pending payload for `id` now, if there is one.
    pub fn flush(&self, id: &RecordId) -> Result<Option<WriteReport>, SyncError> {
        self.scheduler
            .borrow_mut()
            .cancel(&(id.clone(), TaskKind::Flush));
        let Some(payload) = self.pending.borrow_mut().remove(id) else {
            return Ok(None);
        };

        match self.persist(id, &payload) {
            Ok(report) => Ok(Some(report)),
            Err(e) => {
                // Keep the payload and retry after another quiet period,
                // unless a newer save already replaced it.
                if !self.has_pending_write(id) {
                    self.schedule_write(id, payload);
                }
                Err(e)
            }
        }
    }

    /// Flush every pending write. Used on teardown.
    pub fn flush_all(&self) -> Vec<(RecordId, SyncError)> {
        let ids: Vec<RecordId> = self.pending.borrow().keys().cloned().collect();
        let mut errors = Vec::new();
        for id in ids {
            if let Err(e) = self.flush(&id) {
                errors.push((id, e));
            }
        }
        errors
    }

    fn persist(&self, id: &RecordId, payload: &Value) -> Result<WriteReport, SyncError> {
        self.track(id);
        let local = self.write_local(id, payload)?;

        let Some(_guard) = self.begin(id) else {
            debug!(record = %id, "reconcile in flight; push deferred");
            self.arm_periodic(id);
            return Ok(WriteReport {
                tier: local.tier,
                pushed: None,
            });
        };

        let pushed = self.push_record(id, &local);
        Ok(WriteReport {
            tier: local.tier,
            pushed,
        })
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Reconcile every tracked record if connectivity came back since the
    /// last check.
    pub fn poll_connectivity(&self) -> TickReport {
        let mut report = TickReport::default();
        let Some(generation) = self.connectivity.take_restored(self.restored_seen.get()) else {
            return report;
        };
        self.restored_seen.set(generation);

        let ids: Vec<RecordId> = self.active.borrow().iter().cloned().collect();
        info!(records = ids.len(), "connectivity restored; reconciling");
        for id in ids {
            match self.reconcile(&id) {
                Ok(outcome) => report.reconciled.push((id, outcome)),
                Err(e) => {
                    warn!(record = %id, error = %e, "reconcile after restore failed");
                    report.errors.push((id, e));
                }
            }
        }
        report
    }

    /// Run whatever is due: the connectivity-restored pass, debounced
    /// flushes, and periodic reconciles for records with unsynced changes.
    pub fn tick(&self) -> TickReport {
        let mut report = self.poll_connectivity();

        let now = self.clock.now();
        let due = self.scheduler.borrow_mut().take_due(now);
        for (id, kind) in due {
            match kind {
                TaskKind::Flush => match self.flush(&id) {
                    Ok(Some(_)) => report.flushed.push(id),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(record = %id, error = %e, "debounced write failed");
                        report.errors.push((id, e));
                    }
                },
                TaskKind::PeriodicSync => {
                    if !self.connectivity.is_online() {
                        continue;
                    }
                    if !self.has_unsynced(&id) {
                        self.disarm_periodic(&id);
                        continue;
                    }
                    match self.reconcile(&id) {
                        Ok(outcome) => report.reconciled.push((id, outcome)),
                        Err(e) => {
                            warn!(record = %id, error = %e, "periodic reconcile failed");
                            report.errors.push((id, e));
                        }
                    }
                }
            }
        }
        report
    }

    /// [`tick`](Self::tick), then keep ticking while the clock has already
    /// passed the next wakeup (a flush can arm a periodic task that is due).
    pub fn run_until_idle(&self) -> TickReport {
        let mut report = self.tick();
        while self.next_wakeup().is_some_and(|at| at <= self.clock.now()) {
            report.merge(self.tick());
        }
        report
    }
}

fn local_outcome(local: Option<LocalRecord>) -> ReconcileOutcome {
    match local {
        Some(local) => ReconcileOutcome::Resolved {
            payload: local.payload,
            source: local.tier,
        },
        None => ReconcileOutcome::Absent,
    }
}
