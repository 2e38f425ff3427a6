//! Multi-instance coordination over one shared backend: registration rows,
//! schema-version acknowledgement, the gates that wait on it, and the expulsion
//! path for instances that stopped acknowledging.

#![allow(missing_docs)]

use std::time::Duration;

use trama::mgmt::{JobHandle, JobState};
use trama::schema::{SchemaAction, SchemaStatus};
use trama::types::{ElementKind, InstanceId, PropType};
use trama::{Backend, Result, Store, StoreConfig, TramaError};

const WAIT: Duration = Duration::from_secs(5);

fn fast_poll() -> StoreConfig {
    StoreConfig::default().registration_poll_interval(Duration::from_millis(10))
}

/// Commits a property key, then a composite index over it in a second schema
/// commit. The index lands on an existing key, so the commit queues a
/// registration gate and returns its handle.
fn stage_gated_index(store: &Store) -> Result<JobHandle> {
    let mut mgmt = store.manage()?;
    let uid = mgmt.make_property_key("uid", PropType::String).make()?;
    mgmt.commit()?;

    let mut mgmt = store.manage()?;
    mgmt.build_index("byUid", ElementKind::Vertex)
        .key(uid)
        .composite()?;
    let mut jobs = mgmt.commit()?;
    assert_eq!(jobs.len(), 1, "an existing-key index queues one gate");
    Ok(jobs.remove(0))
}

fn field_status(store: &Store, index: &str) -> Option<SchemaStatus> {
    let snapshot = store.catalog().snapshot();
    let def = snapshot.index_by_name(index)?;
    let field = def.field_keys().next()?;
    snapshot.index_status(def.id, field)
}

#[test]
fn open_instances_report_acknowledged_versions() -> Result<()> {
    let backend = Backend::in_memory();
    let a = Store::open(backend.clone(), StoreConfig::default().instance_id("a"))?;

    let mut mgmt = a.manage()?;
    mgmt.make_property_key("uid", PropType::String).make()?;
    mgmt.commit()?;

    // Registration snapshots the version that is persisted at open time.
    let b = Store::open(backend, StoreConfig::default().instance_id("b"))?;
    let rows = a.registry().open_instances()?;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.acked.0 == 1));

    let mut mgmt = a.manage()?;
    mgmt.make_property_key("name", PropType::String).make()?;
    mgmt.commit()?;

    let rows = a.registry().open_instances()?;
    let acked = |id: &str| rows.iter().find(|r| r.id.0 == id).map(|r| r.acked.0);
    assert_eq!(acked("a"), Some(2), "the committer acknowledges its own write");
    assert_eq!(acked("b"), Some(1), "peers lag until they refresh");

    b.refresh_schema()?;
    let rows = a.registry().open_instances()?;
    assert!(rows.iter().all(|r| r.acked.0 == 2));
    Ok(())
}

/// The registration gate holds until every open instance has applied the
/// version that introduced the index, then flips the field to REGISTERED.
#[test]
fn schema_change_gates_on_every_open_instance() -> Result<()> {
    let backend = Backend::in_memory();
    let a = Store::open(backend.clone(), fast_poll().instance_id("a"))?;
    let b = Store::open(backend, StoreConfig::default().instance_id("b"))?;

    let job = stage_gated_index(&a)?;
    let stalled = job.wait(Duration::from_millis(200));
    assert!(
        matches!(stalled, JobState::Pending | JobState::Running),
        "gate completed while an instance lagged: {stalled:?}"
    );
    assert_eq!(field_status(&a, "byUid"), Some(SchemaStatus::Installed));

    b.refresh_schema()?;
    assert_eq!(job.wait(WAIT), JobState::Succeeded);
    assert_eq!(field_status(&a, "byUid"), Some(SchemaStatus::Registered));
    Ok(())
}

/// A gate whose deadline passes while an instance still lags fails with the
/// laggard unacknowledged, and a later REGISTER_INDEX retry completes it.
#[test]
fn lagging_instance_times_out_the_gate() -> Result<()> {
    let backend = Backend::in_memory();
    let a = Store::open(
        backend.clone(),
        fast_poll()
            .instance_id("a")
            .registration_timeout(Duration::from_millis(300)),
    )?;
    let b = Store::open(backend, StoreConfig::default().instance_id("b"))?;

    let job = stage_gated_index(&a)?;
    match job.wait(WAIT) {
        JobState::Failed(msg) => {
            assert!(msg.contains("acknowledged"), "unexpected failure: {msg}")
        }
        other => panic!("expected the gate to time out, got {other:?}"),
    }
    assert_eq!(field_status(&a, "byUid"), Some(SchemaStatus::Installed));

    let mut mgmt = a.manage()?;
    mgmt.update_index("byUid", SchemaAction::RegisterIndex)?;
    let jobs = mgmt.commit()?;
    assert_eq!(jobs.len(), 1);
    b.refresh_schema()?;
    assert_eq!(jobs[0].wait(WAIT), JobState::Succeeded);
    assert_eq!(field_status(&a, "byUid"), Some(SchemaStatus::Registered));
    Ok(())
}

/// An instance that vanished without closing keeps its registration row and
/// would stall every gate forever; expelling it lets the gate converge.
#[test]
fn expelling_a_crashed_instance_unblocks_the_gate() -> Result<()> {
    let backend = Backend::in_memory();
    let a = Store::open(backend.clone(), fast_poll().instance_id("a"))?;
    let b = Store::open(backend, StoreConfig::default().instance_id("b"))?;
    drop(b);

    let job = stage_gated_index(&a)?;
    let stalled = job.wait(Duration::from_millis(200));
    assert!(
        matches!(stalled, JobState::Pending | JobState::Running),
        "gate completed while a dead row lingered: {stalled:?}"
    );

    a.force_close_instance(&InstanceId::from("b"))?;
    assert_eq!(job.wait(WAIT), JobState::Succeeded);

    let rows = a.registry().open_instances()?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, InstanceId::from("a"));
    Ok(())
}

#[test]
fn an_instance_cannot_expel_itself() -> Result<()> {
    let store = Store::open(Backend::in_memory(), StoreConfig::default().instance_id("solo"))?;
    match store.force_close_instance(store.instance_id()) {
        Err(TramaError::Invalid(msg)) => assert!(msg.contains("current instance")),
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(()) => panic!("an instance expelled itself"),
    }
    Ok(())
}

#[test]
fn duplicate_instance_ids_are_rejected_until_closed() -> Result<()> {
    let backend = Backend::in_memory();
    let first = Store::open(backend.clone(), StoreConfig::default().instance_id("node"))?;
    match Store::open(backend.clone(), StoreConfig::default().instance_id("node")) {
        Err(TramaError::Invalid(msg)) => assert!(msg.contains("already open")),
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("a second instance opened under a taken id"),
    }

    first.close()?;
    let reopened = Store::open(backend, StoreConfig::default().instance_id("node"))?;
    reopened.close()?;
    Ok(())
}

/// `await_registered` reports which instances are still behind, and flips to
/// success once the last one refreshes and the gate promotes the field.
#[test]
fn registration_report_names_laggards() -> Result<()> {
    let backend = Backend::in_memory();
    let a = Store::open(backend.clone(), fast_poll().instance_id("a"))?;
    let b = Store::open(backend, StoreConfig::default().instance_id("b"))?;

    let job = stage_gated_index(&a)?;
    let report = a.await_registered("byUid", Duration::from_millis(300))?;
    assert!(!report.succeeded);
    assert!(report.elapsed >= Duration::from_millis(300));
    assert!(report.elapsed < Duration::from_secs(2), "wait overshot its deadline");
    assert!(report.missing.contains(&InstanceId::from("b")));

    b.refresh_schema()?;
    assert_eq!(job.wait(WAIT), JobState::Succeeded);
    let report = a.await_registered("byUid", WAIT)?;
    assert!(report.succeeded, "gate never promoted the field");
    assert!(report.missing.is_empty());
    assert!(!report.statuses.is_empty());
    assert!(report
        .statuses
        .iter()
        .all(|(_, s)| matches!(s, SchemaStatus::Registered | SchemaStatus::Enabled)));
    Ok(())
}
