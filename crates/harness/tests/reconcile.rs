use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serde_json::{Value, json};
use toolsync_core::Timestamp;
use toolsync_harness::{START, TestDevice};
use toolsync_storage::StructuredStore;
use toolsync_sync::{ReconcileOutcome, SyncConfig, TieBreak, Tier};

fn at(offset_ms: u64) -> Timestamp {
    Timestamp::from_millis(START.as_millis() + offset_ms)
}

/// Local holds "A" written at `local`, remote holds "B" synced at `remote`.
fn conflict(
    local: Timestamp,
    remote: Timestamp,
    tie_break: TieBreak,
) -> Result<(TestDevice, ReconcileOutcome), Box<dyn std::error::Error>> {
    let device = TestDevice::with_config(SyncConfig {
        tie_break,
        ..SyncConfig::default()
    })?;
    let id = device.record_id("goal-planner")?;
    device.structured.inner().put(&id.tool, &id.user, &json!("A"), local)?;
    device.remote.seed(&id.user, &id.tool, json!("B"), remote);
    let outcome = device.context.coordinator().reconcile(&id)?;
    Ok((device, outcome))
}

// ============================================================================
// Last-write-wins
// ============================================================================

#[test]
fn newer_local_copy_wins_and_is_pushed() -> Result<(), Box<dyn std::error::Error>> {
    let (device, outcome) = conflict(at(2_000), at(1_000), TieBreak::Remote)?;
    assert_eq!(
        outcome,
        ReconcileOutcome::Resolved {
            payload: json!("A"),
            source: Tier::Structured,
        }
    );

    let id = device.record_id("goal-planner")?;
    let remote = device.remote.record(&id.user, &id.tool).ok_or("no remote copy")?;
    assert_eq!(remote.payload, json!("A"));
    let local = device.structured.get(&id.tool, &id.user)?.ok_or("no local copy")?;
    assert!(local.synced);
    Ok(())
}

#[test]
fn newer_remote_copy_overwrites_local() -> Result<(), Box<dyn std::error::Error>> {
    let (device, outcome) = conflict(at(1_000), at(2_000), TieBreak::Remote)?;
    assert_eq!(
        outcome,
        ReconcileOutcome::Resolved {
            payload: json!("B"),
            source: Tier::Remote,
        }
    );

    let id = device.record_id("goal-planner")?;
    let local = device.structured.get(&id.tool, &id.user)?.ok_or("no local copy")?;
    assert_eq!(local.payload, json!("B"));
    assert_eq!(local.timestamp, at(2_000));
    assert!(local.synced);
    assert_eq!(device.remote.pushes(), 0);
    Ok(())
}

#[test]
fn equal_timestamps_go_to_remote_by_default() -> Result<(), Box<dyn std::error::Error>> {
    let (_, outcome) = conflict(at(1_000), at(1_000), TieBreak::Remote)?;
    assert_eq!(outcome.into_payload(), Some(json!("B")));
    Ok(())
}

#[test]
fn equal_timestamps_follow_configured_tie_break() -> Result<(), Box<dyn std::error::Error>> {
    let (_, outcome) = conflict(at(1_000), at(1_000), TieBreak::Local)?;
    assert_eq!(outcome.into_payload(), Some(json!("A")));
    Ok(())
}

#[test]
fn conflict_resolution_is_deterministic() -> Result<(), Box<dyn std::error::Error>> {
    let cases: [(u64, u64, &str); 5] = [
        (0, 1, "B"),
        (1, 0, "A"),
        (5_000, 5_000, "B"),
        (10_000, 9_999, "A"),
        (9_999, 10_000, "B"),
    ];
    for (local, remote, winner) in cases {
        for _ in 0..3 {
            let (_, outcome) = conflict(at(local), at(remote), TieBreak::Remote)?;
            assert_eq!(outcome.into_payload(), Some(json!(winner)), "{local} vs {remote}");
        }
    }
    Ok(())
}

#[test]
fn remote_only_copy_seeds_both_local_tiers() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new()?;
    let id = device.record_id("text-analyzer")?;
    device.remote.seed(&id.user, &id.tool, json!({"text": "from elsewhere"}), at(500));

    let mut m = device.manager("text-analyzer", json!(null))?;
    assert_eq!(m.load()?, json!({"text": "from elsewhere"}));

    let local = device.structured.get(&id.tool, &id.user)?.ok_or("no local copy")?;
    assert!(local.synced);
    device.structured.set_simulate_read_error(true);
    let fallback = device.context.coordinator().read_local(&id)?.ok_or("no fallback copy")?;
    assert_eq!(fallback.tier, Tier::Flat);
    assert_eq!(fallback.payload, json!({"text": "from elsewhere"}));
    Ok(())
}

#[test]
fn nothing_anywhere_is_absent() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new()?;
    let id = device.record_id("gradient")?;
    assert_eq!(device.context.coordinator().reconcile(&id)?, ReconcileOutcome::Absent);
    assert_eq!(device.remote.pulls(), 1);
    assert_eq!(device.remote.pushes(), 0);
    Ok(())
}

#[test]
fn converged_copies_are_not_pushed_again() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new()?;
    let mut m = device.manager("gradient", json!({}))?;
    m.save(json!({"angle": 30}));
    device.settle();
    assert_eq!(device.remote.pushes(), 1);

    for _ in 0..3 {
        device.advance(Duration::from_secs(5));
        m.load()?;
    }
    assert_eq!(device.remote.pushes(), 1);
    Ok(())
}

// ============================================================================
// Offline and unreachable remote
// ============================================================================

#[test]
fn offline_reconcile_never_touches_remote() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new()?;
    device.set_online(false);
    let id = device.record_id("goal-planner")?;
    device.structured.inner().put(&id.tool, &id.user, &json!("A"), at(0))?;
    device.remote.seed(&id.user, &id.tool, json!("B"), at(9_000));

    let outcome = device.context.coordinator().reconcile(&id)?;
    assert_eq!(outcome.into_payload(), Some(json!("A")));
    assert_eq!(device.remote.calls(), 0);

    let local = device.structured.get(&id.tool, &id.user)?.ok_or("no local copy")?;
    assert_eq!(local.payload, json!("A"));
    assert!(!local.synced);
    Ok(())
}

#[test]
fn offline_session_makes_no_remote_calls() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new()?;
    device.set_online(false);
    let mut m = device.manager("password-generator", json!({"length": 12}))?;
    m.load()?;
    m.save(json!({"length": 20}));
    device.settle();
    m.manual_save()?;
    device.advance(Duration::from_secs(120));
    m.load()?;

    assert_eq!(device.remote.calls(), 0);
    assert!(!m.is_online());
    assert_eq!(m.last_sync_time(), None);
    Ok(())
}

#[test]
fn slow_remote_degrades_to_local() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::with_config(SyncConfig {
        remote_timeout_ms: 100,
        ..SyncConfig::default()
    })?;
    device.remote.set_latency(Duration::from_millis(250));
    let id = device.record_id("goal-planner")?;
    device.structured.inner().put(&id.tool, &id.user, &json!("A"), at(0))?;
    device.remote.seed(&id.user, &id.tool, json!("B"), at(9_000));

    let outcome = device.context.coordinator().reconcile(&id)?;
    assert_eq!(outcome.into_payload(), Some(json!("A")));
    assert_eq!(device.remote.pulls(), 1);
    assert_eq!(device.context.coordinator().last_sync_time(), None);
    Ok(())
}

#[test]
fn last_sync_time_is_when_the_exchange_happened() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new()?;
    let id = device.record_id("goal-planner")?;
    device.remote.seed(&id.user, &id.tool, json!("B"), START);
    device.clock.advance(Duration::from_secs(3_600));

    let outcome = device.context.coordinator().reconcile(&id)?;
    assert_eq!(outcome.into_payload(), Some(json!("B")));
    assert_eq!(device.context.coordinator().last_sync_time(), Some(at(3_600_000)));

    // A push later on moves it forward again.
    device.clock.advance(Duration::from_secs(60));
    let mut m = device.manager("goal-planner", json!(null))?;
    m.save(json!("C"));
    m.manual_save()?;
    let last = m.last_sync_time().ok_or("never synced")?;
    assert!(last >= at(3_660_000), "expected {last:?} >= one hour and a minute in");
    Ok(())
}

// ============================================================================
// Single flight
// ============================================================================

#[test]
fn overlapping_reconcile_is_coalesced() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new()?;
    let id = device.record_id("color-palette")?;
    device.structured.inner().put(&id.tool, &id.user, &json!(["A"]), at(0))?;

    let inner: Rc<RefCell<Option<(bool, ReconcileOutcome)>>> = Rc::new(RefCell::new(None));
    {
        let ctx = device.context.clone();
        let id = id.clone();
        let inner = inner.clone();
        device.remote.on_pull(move || {
            let syncing = ctx.coordinator().is_syncing(&id);
            if let Ok(outcome) = ctx.coordinator().reconcile(&id) {
                *inner.borrow_mut() = Some((syncing, outcome));
            }
        });
    }

    let outer = device.context.coordinator().reconcile(&id)?;
    device.remote.clear_on_pull();

    assert_eq!(outer.into_payload(), Some(json!(["A"])));
    let (syncing, overlapped) = inner.borrow_mut().take().ok_or("hook did not run")?;
    assert!(syncing);
    assert_eq!(
        overlapped,
        ReconcileOutcome::Coalesced {
            payload: Some(json!(["A"])),
        }
    );
    assert_eq!(device.remote.pulls(), 1);
    assert_eq!(device.remote.pushes(), 1);
    assert!(!device.context.coordinator().is_syncing(&id));
    Ok(())
}

#[test]
fn write_during_reconcile_is_the_one_pushed() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new()?;
    let id = device.record_id("color-palette")?;
    device.structured.inner().put(&id.tool, &id.user, &json!(["A"]), at(0))?;

    {
        let ctx = device.context.clone();
        let id = id.clone();
        device.remote.on_pull(move || {
            let _ = ctx.coordinator().write_through(&id, &json!(["C"]));
        });
    }
    let outcome = device.context.coordinator().reconcile(&id)?;
    device.remote.clear_on_pull();

    assert_eq!(outcome.into_payload(), Some(json!(["C"])));
    let remote = device.remote.record(&id.user, &id.tool).ok_or("no remote copy")?;
    assert_eq!(remote.payload, json!(["C"]));
    assert_eq!(device.remote.pushes(), 1);

    let local = device.structured.get(&id.tool, &id.user)?.ok_or("no local copy")?;
    assert_eq!(local.payload, json!(["C"]));
    assert!(local.synced);
    Ok(())
}

#[test]
fn load_reports_loading_and_syncing_state() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new()?;
    let mut m = device.manager("date-planner", json!({"events": []}))?;
    let before = m.status();
    assert!(before.is_loading);
    assert!(before.is_online);
    assert!(!before.is_syncing);

    m.load()?;
    let after = m.status();
    assert!(!after.is_loading);
    assert!(!after.is_syncing);

    let value: Value = m.data().clone();
    assert_eq!(value, json!({"events": []}));
    Ok(())
}
