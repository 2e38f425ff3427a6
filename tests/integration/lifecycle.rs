//! Index lifecycle walks over the public API: registration gates, reindex
//! backfills, disable windows, and terminal removal, plus what the planner
//! and the write path do at each stage.

#![allow(missing_docs)]

use std::time::Duration;

use trama::mgmt::JobState;
use trama::query::RelationQuery;
use trama::schema::{RelationBase, SchemaAction, SchemaStatus};
use trama::types::{Direction, ElementKind, PropType, SortOrder};
use trama::{Backend, Op, Result, Store, StoreConfig, TramaError, Value};

const WAIT: Duration = Duration::from_secs(5);

fn open() -> Result<Store> {
    Store::open(Backend::in_memory(), StoreConfig::default())
}

fn field_status(store: &Store, index: &str) -> Option<SchemaStatus> {
    let snap = store.catalog().snapshot();
    let def = snap.index_by_name(index)?;
    let key = def.field_keys().next()?;
    snap.index_status(def.id, key)
}

fn add_person(store: &Store, uid: &str) -> Result<()> {
    let mut tx = store.begin()?;
    let v = tx.add_vertex(None)?;
    tx.add_property(v, "uid", Value::from(uid))?;
    tx.commit()
}

fn find_by_uid(store: &Store, uid: &str) -> Result<usize> {
    let tx = store.begin()?;
    Ok(tx.query().has_eq("uid", Value::from(uid)).vertices()?.len())
}

fn uses_index(store: &Store, uid: &str) -> Result<bool> {
    let tx = store.begin()?;
    let explain = tx
        .query()
        .has_eq("uid", Value::from(uid))
        .explain(ElementKind::Vertex)?;
    Ok(!explain.steps.is_empty())
}

#[test]
fn index_over_existing_data_backfills_through_reindex() -> Result<()> {
    let store = open()?;
    let mut mgmt = store.manage()?;
    let uid = mgmt.make_property_key("uid", PropType::String).make()?;
    mgmt.commit()?;
    add_person(&store, "a")?;
    add_person(&store, "b")?;

    let mut mgmt = store.manage()?;
    mgmt.build_index("byUid", ElementKind::Vertex)
        .key(uid)
        .composite()?;
    let jobs = mgmt.commit()?;
    assert_eq!(jobs[0].action(), SchemaAction::RegisterIndex);
    assert_eq!(jobs[0].wait(WAIT), JobState::Succeeded);
    assert_eq!(field_status(&store, "byUid"), Some(SchemaStatus::Registered));

    // Registered: the data is reachable, just not through the index yet.
    assert!(!uses_index(&store, "a")?);
    assert_eq!(find_by_uid(&store, "a")?, 1);

    let mut mgmt = store.manage()?;
    mgmt.update_index("byUid", SchemaAction::Reindex)?;
    let jobs = mgmt.commit()?;
    assert_eq!(jobs[0].wait(WAIT), JobState::Succeeded);
    assert_eq!(jobs[0].metrics().records_added, 2);
    assert_eq!(field_status(&store, "byUid"), Some(SchemaStatus::Enabled));

    assert!(uses_index(&store, "a")?);
    assert_eq!(find_by_uid(&store, "a")?, 1);
    assert_eq!(find_by_uid(&store, "b")?, 1);
    Ok(())
}

#[test]
fn enable_without_reindex_misses_history() -> Result<()> {
    let store = open()?;
    let mut mgmt = store.manage()?;
    let uid = mgmt.make_property_key("uid", PropType::String).make()?;
    mgmt.commit()?;
    add_person(&store, "old")?;

    let mut mgmt = store.manage()?;
    mgmt.build_index("byUid", ElementKind::Vertex)
        .key(uid)
        .composite()?;
    let jobs = mgmt.commit()?;
    assert_eq!(jobs[0].wait(WAIT), JobState::Succeeded);

    // Written after declaration, so the write path maintains its entry.
    add_person(&store, "new")?;

    let mut mgmt = store.manage()?;
    mgmt.update_index("byUid", SchemaAction::EnableIndex)?;
    mgmt.commit()?;

    assert!(uses_index(&store, "new")?);
    assert_eq!(find_by_uid(&store, "new")?, 1);
    // The pre-declaration vertex has no entry until a reindex writes one.
    assert_eq!(find_by_uid(&store, "old")?, 0);

    let mut mgmt = store.manage()?;
    mgmt.update_index("byUid", SchemaAction::DisableIndex)?;
    mgmt.commit()?;
    let mut mgmt = store.manage()?;
    mgmt.update_index("byUid", SchemaAction::Reindex)?;
    let jobs = mgmt.commit()?;
    assert_eq!(jobs[0].wait(WAIT), JobState::Succeeded);

    assert_eq!(find_by_uid(&store, "old")?, 1);
    assert_eq!(find_by_uid(&store, "new")?, 1);
    Ok(())
}

#[test]
fn reindex_of_an_enabled_index_is_rejected() -> Result<()> {
    let store = open()?;
    let mut mgmt = store.manage()?;
    let uid = mgmt.make_property_key("uid", PropType::String).make()?;
    mgmt.build_index("byUid", ElementKind::Vertex)
        .key(uid)
        .composite()?;
    mgmt.commit()?;
    assert_eq!(field_status(&store, "byUid"), Some(SchemaStatus::Enabled));

    let mut mgmt = store.manage()?;
    let err = mgmt
        .update_index("byUid", SchemaAction::Reindex)
        .expect_err("enabled indexes are rebuilt via disable");
    assert!(matches!(
        err,
        TramaError::InvalidLifecycleTransition {
            action: SchemaAction::Reindex,
            status: SchemaStatus::Enabled,
        }
    ));
    Ok(())
}

#[test]
fn disable_window_is_recovered_by_reindex() -> Result<()> {
    let store = open()?;
    let mut mgmt = store.manage()?;
    let uid = mgmt.make_property_key("uid", PropType::String).make()?;
    mgmt.build_index("byUid", ElementKind::Vertex)
        .key(uid)
        .composite()?;
    mgmt.commit()?;
    add_person(&store, "a")?;

    let mut mgmt = store.manage()?;
    mgmt.update_index("byUid", SchemaAction::DisableIndex)?;
    mgmt.commit()?;
    assert_eq!(field_status(&store, "byUid"), Some(SchemaStatus::Disabled));

    // Written into the disable window: no entry, and no index to ask.
    add_person(&store, "b")?;
    assert!(!uses_index(&store, "b")?);
    assert_eq!(find_by_uid(&store, "b")?, 1);

    let mut mgmt = store.manage()?;
    mgmt.update_index("byUid", SchemaAction::Reindex)?;
    let jobs = mgmt.commit()?;
    assert_eq!(jobs[0].wait(WAIT), JobState::Succeeded);
    assert_eq!(jobs[0].metrics().records_added, 2);
    assert_eq!(field_status(&store, "byUid"), Some(SchemaStatus::Enabled));

    assert!(uses_index(&store, "b")?);
    assert_eq!(find_by_uid(&store, "a")?, 1);
    assert_eq!(find_by_uid(&store, "b")?, 1);
    Ok(())
}

#[test]
fn removal_purges_entries_and_is_terminal() -> Result<()> {
    let store = open()?;
    let mut mgmt = store.manage()?;
    let uid = mgmt.make_property_key("uid", PropType::String).make()?;
    mgmt.build_index("byUid", ElementKind::Vertex)
        .key(uid)
        .composite()?;
    mgmt.commit()?;
    add_person(&store, "a")?;
    add_person(&store, "b")?;

    let mut mgmt = store.manage()?;
    mgmt.update_index("byUid", SchemaAction::RemoveIndex)?;
    let jobs = mgmt.commit()?;
    assert_eq!(jobs[0].wait(WAIT), JobState::Succeeded);
    assert_eq!(jobs[0].metrics().records_deleted, 2);
    assert_eq!(field_status(&store, "byUid"), Some(SchemaStatus::Removed));

    // The definition survives for history; plans ignore it, scans still work.
    assert!(!uses_index(&store, "a")?);
    assert_eq!(find_by_uid(&store, "a")?, 1);

    let mut mgmt = store.manage()?;
    let err = mgmt
        .update_index("byUid", SchemaAction::EnableIndex)
        .expect_err("removed is terminal");
    assert!(matches!(
        err,
        TramaError::InvalidLifecycleTransition {
            status: SchemaStatus::Removed,
            ..
        }
    ));
    mgmt.update_index("byUid", SchemaAction::RemoveIndex)?;
    let jobs = mgmt.commit()?;
    assert!(jobs.is_empty(), "re-removal stages nothing");
    Ok(())
}

#[test]
fn mixed_index_removal_drops_the_service_side() -> Result<()> {
    let store = open()?;
    let mut mgmt = store.manage()?;
    let bio = mgmt.make_property_key("bio", PropType::String).make()?;
    mgmt.build_index("search", ElementKind::Vertex)
        .key(bio)
        .mixed("memory")?;
    mgmt.commit()?;

    let mut tx = store.begin()?;
    let v = tx.add_vertex(None)?;
    tx.add_property(v, "bio", Value::from("tends a quiet garden"))?;
    tx.commit()?;

    let tx = store.begin()?;
    let hits = tx
        .query()
        .has("bio", Op::TextContains, Value::from("garden"))
        .vertices()?;
    assert_eq!(hits.len(), 1);
    drop(tx);

    let mut mgmt = store.manage()?;
    mgmt.update_index("search", SchemaAction::RemoveIndex)?;
    let jobs = mgmt.commit()?;
    assert_eq!(jobs[0].wait(WAIT), JobState::Succeeded);
    assert_eq!(field_status(&store, "search"), Some(SchemaStatus::Removed));

    // Back to scanning; the answer is unchanged.
    let tx = store.begin()?;
    let explain = tx
        .query()
        .has("bio", Op::TextContains, Value::from("garden"))
        .explain(ElementKind::Vertex)?;
    assert!(explain.steps.is_empty());
    let hits = tx
        .query()
        .has("bio", Op::TextContains, Value::from("garden"))
        .vertices()?;
    assert_eq!(hits.len(), 1);
    Ok(())
}

#[test]
fn edge_index_backfill_covers_existing_edges() -> Result<()> {
    let store = open()?;
    let mut mgmt = store.manage()?;
    let stars = mgmt.make_property_key("stars", PropType::Int).make()?;
    let rated = mgmt.make_edge_label("rated").make()?;
    mgmt.commit()?;

    let mut tx = store.begin()?;
    let viewer = tx.add_vertex(None)?;
    for s in [4, 1, 5] {
        let movie = tx.add_vertex(None)?;
        let e = tx.add_edge("rated", viewer, movie)?;
        tx.set_edge_property(e, "stars", Value::Int(s))?;
    }
    tx.commit()?;

    let mut mgmt = store.manage()?;
    mgmt.build_edge_index("byStars", rated, Direction::Out, SortOrder::Desc, &[stars])?;
    let jobs = mgmt.commit()?;
    assert_eq!(jobs[0].wait(WAIT), JobState::Succeeded);
    assert_eq!(field_status(&store, "byStars"), Some(SchemaStatus::Registered));

    let mut mgmt = store.manage()?;
    mgmt.update_index("byStars", SchemaAction::Reindex)?;
    let jobs = mgmt.commit()?;
    assert_eq!(jobs[0].wait(WAIT), JobState::Succeeded);
    assert_eq!(jobs[0].metrics().records_added, 3);
    assert_eq!(field_status(&store, "byStars"), Some(SchemaStatus::Enabled));

    let tx = store.begin()?;
    let mut query = RelationQuery::all(RelationBase::EdgeLabel(rated), Direction::Out);
    query.orders.push((stars, SortOrder::Desc));
    let hits = tx.edges_of(viewer, &query)?;
    let ranked: Vec<Option<&Value>> = hits.iter().map(|e| e.value(stars)).collect();
    assert_eq!(
        ranked,
        [
            Some(&Value::Int(5)),
            Some(&Value::Int(4)),
            Some(&Value::Int(1))
        ]
    );
    Ok(())
}

#[test]
fn await_registered_tracks_the_gate() -> Result<()> {
    let store = open()?;
    let mut mgmt = store.manage()?;
    let uid = mgmt.make_property_key("uid", PropType::String).make()?;
    mgmt.commit()?;

    let mut mgmt = store.manage()?;
    mgmt.build_index("byUid", ElementKind::Vertex)
        .key(uid)
        .composite()?;
    let jobs = mgmt.commit()?;
    let report = store.await_registered("byUid", WAIT)?;
    assert!(report.succeeded);
    assert!(report.missing.is_empty());
    assert!(report
        .statuses
        .iter()
        .all(|(_, s)| matches!(s, SchemaStatus::Registered | SchemaStatus::Enabled)));
    assert_eq!(jobs[0].wait(WAIT), JobState::Succeeded);

    let err = store.await_registered("ghost", WAIT).expect_err("unknown");
    assert!(matches!(err, TramaError::NotFound));
    Ok(())
}

#[test]
fn dropped_management_transaction_publishes_nothing() -> Result<()> {
    let store = open()?;
    let mut mgmt = store.manage()?;
    let uid = mgmt.make_property_key("uid", PropType::String).make()?;
    mgmt.commit()?;
    add_person(&store, "a")?;

    let mut mgmt = store.manage()?;
    mgmt.build_index("byUid", ElementKind::Vertex)
        .key(uid)
        .composite()?;
    drop(mgmt);

    // Nothing was published, so the index name is free again.
    let mut mgmt = store.manage()?;
    mgmt.build_index("byUid", ElementKind::Vertex)
        .key(uid)
        .composite()?;
    let jobs = mgmt.commit()?;
    assert_eq!(jobs[0].wait(WAIT), JobState::Succeeded);
    Ok(())
}
