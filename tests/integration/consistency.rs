//! Commit-time enforcement over the public API: uniqueness under sequential
//! and racing writers, fork-on-update edges, multiplicity and cardinality
//! constraints, and the sort keys relation indexes demand of new relations.

#![allow(missing_docs)]

use std::sync::{Arc, Barrier};
use std::thread;

use trama::query::RelationQuery;
use trama::schema::{Cardinality, ConsistencyModifier, Multiplicity, RelationBase};
use trama::types::{Direction, ElementKind, PropType, SortOrder};
use trama::{Backend, Op, Result, Store, StoreConfig, Transaction, TramaError, Value};

fn store_with_unique_uid(backend: Backend, locking: bool) -> Result<Store> {
    let store = Store::open(backend, StoreConfig::default())?;
    let mut mgmt = store.manage()?;
    let uid = mgmt.make_property_key("uid", PropType::String).make()?;
    mgmt.build_index("byUid", ElementKind::Vertex)
        .key(uid)
        .unique()
        .composite()?;
    if locking {
        mgmt.set_consistency("byUid", ConsistencyModifier::Lock)?;
    }
    mgmt.commit()?;
    Ok(store)
}

fn stage_person(store: &Store, uid: &str) -> Result<Transaction> {
    let mut tx = store.begin()?;
    let v = tx.add_vertex(None)?;
    tx.add_property(v, "uid", Value::from(uid))?;
    Ok(tx)
}

fn holders_of(store: &Store, uid: &str) -> Result<usize> {
    let tx = store.begin()?;
    Ok(tx
        .query()
        .has("uid", Op::Eq, Value::from(uid))
        .vertices()?
        .len())
}

/// Commits both transactions from separate threads released together.
fn race(t1: Transaction, t2: Transaction) -> (Result<()>, Result<()>) {
    let barrier = Arc::new(Barrier::new(2));
    let spawn = |tx: Transaction, gate: Arc<Barrier>| {
        thread::spawn(move || {
            gate.wait();
            tx.commit()
        })
    };
    let h1 = spawn(t1, Arc::clone(&barrier));
    let h2 = spawn(t2, barrier);
    (
        h1.join().expect("committer panicked"),
        h2.join().expect("committer panicked"),
    )
}

#[test]
fn sequential_duplicate_on_a_unique_index_is_rejected() -> Result<()> {
    let store = store_with_unique_uid(Backend::in_memory(), false)?;

    stage_person(&store, "ada")?.commit()?;
    match stage_person(&store, "ada")?.commit() {
        Err(TramaError::SchemaViolation(msg)) => {
            assert!(msg.contains("already holds this value"), "got: {msg}")
        }
        other => panic!("duplicate was admitted: {other:?}"),
    }

    // A different tuple is unaffected.
    stage_person(&store, "grace")?.commit()?;
    assert_eq!(holders_of(&store, "ada")?, 1);
    assert_eq!(holders_of(&store, "grace")?, 1);
    Ok(())
}

#[test]
fn racing_duplicate_inserts_admit_exactly_one_writer() -> Result<()> {
    let store = store_with_unique_uid(Backend::in_memory(), true)?;

    let t1 = stage_person(&store, "dup")?;
    let t2 = stage_person(&store, "dup")?;
    let (r1, r2) = race(t1, t2);

    assert_eq!(
        [&r1, &r2].iter().filter(|r| r.is_ok()).count(),
        1,
        "exactly one writer may claim the tuple: {r1:?} / {r2:?}"
    );
    let loser = if r1.is_err() { r1 } else { r2 };
    assert!(matches!(
        loser,
        Err(TramaError::SchemaViolation(_)) | Err(TramaError::LockConflict(_))
    ));
    assert_eq!(holders_of(&store, "dup")?, 1);
    Ok(())
}

/// On a backend without guard support the same race is decided purely by
/// the lock service.
#[test]
fn lock_consistency_holds_without_optimistic_guards() -> Result<()> {
    let store = store_with_unique_uid(Backend::in_memory_pessimistic(), true)?;

    let t1 = stage_person(&store, "dup")?;
    let t2 = stage_person(&store, "dup")?;
    let (r1, r2) = race(t1, t2);

    assert_eq!([&r1, &r2].iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(holders_of(&store, "dup")?, 1);
    Ok(())
}

#[test]
fn updating_a_forked_edge_leaves_a_superseded_original() -> Result<()> {
    let store = Store::open(Backend::in_memory(), StoreConfig::default())?;
    let mut mgmt = store.manage()?;
    let note = mgmt.make_property_key("note", PropType::String).make()?;
    let annotates = mgmt
        .make_edge_label("annotates")
        .consistency(ConsistencyModifier::Fork)
        .make()?;
    mgmt.commit()?;

    let mut tx = store.begin()?;
    let a = tx.add_vertex(None)?;
    let b = tx.add_vertex(None)?;
    let original = tx.add_edge("annotates", a, b)?;
    tx.set_edge_property(original, "note", Value::from("draft"))?;
    tx.commit()?;

    let mut tx = store.begin()?;
    tx.set_edge_property(original, "note", Value::from("final"))?;
    tx.commit()?;

    let tx = store.begin()?;
    let live = tx.edges_of(
        a,
        &RelationQuery::all(RelationBase::EdgeLabel(annotates), Direction::Out),
    )?;
    assert_eq!(live.len(), 1, "the fork replaces the updated edge");
    assert_ne!(live[0].id, original, "a fork takes a fresh id");
    assert_eq!(live[0].value(note), Some(&Value::from("final")));
    let fork = live[0].id;

    let tombstone = tx.edge(original)?;
    assert!(
        tombstone.is_some_and(|e| e.superseded),
        "the original stays behind as a superseded marker"
    );

    // Updating the live fork forks again; every rewrite adds exactly one
    // generation and never merges back.
    let mut tx = store.begin()?;
    tx.set_edge_property(fork, "note", Value::from("final v2"))?;
    tx.commit()?;

    let tx = store.begin()?;
    let live = tx.edges_of(
        a,
        &RelationQuery::all(RelationBase::EdgeLabel(annotates), Direction::Out),
    )?;
    assert_eq!(live.len(), 1);
    assert_ne!(live[0].id, fork);
    assert_eq!(live[0].value(note), Some(&Value::from("final v2")));
    assert!(tx.edge(fork)?.is_some_and(|e| e.superseded));
    Ok(())
}

/// Default-consistency updates rewrite in place: repeated writes converge to
/// the latest value on one edge id with no duplicate elements.
#[test]
fn default_updates_converge_in_place() -> Result<()> {
    let store = Store::open(Backend::in_memory(), StoreConfig::default())?;
    let mut mgmt = store.manage()?;
    let note = mgmt.make_property_key("note", PropType::String).make()?;
    let annotates = mgmt.make_edge_label("annotates").make()?;
    mgmt.commit()?;

    let mut tx = store.begin()?;
    let a = tx.add_vertex(None)?;
    let b = tx.add_vertex(None)?;
    let edge = tx.add_edge("annotates", a, b)?;
    tx.set_edge_property(edge, "note", Value::from("draft"))?;
    tx.commit()?;

    for rev in ["second", "third"] {
        let mut tx = store.begin()?;
        tx.set_edge_property(edge, "note", Value::from(rev))?;
        tx.commit()?;
    }

    let tx = store.begin()?;
    let live = tx.edges_of(
        a,
        &RelationQuery::all(RelationBase::EdgeLabel(annotates), Direction::Out),
    )?;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, edge, "no fork under default consistency");
    assert_eq!(live[0].value(note), Some(&Value::from("third")));
    assert!(!live[0].superseded);
    Ok(())
}

/// Two transactions updating the same fork-labeled edge never clobber each
/// other; both updates survive as separate live edges.
#[test]
fn concurrent_forks_preserve_both_updates() -> Result<()> {
    let store = Store::open(Backend::in_memory(), StoreConfig::default())?;
    let mut mgmt = store.manage()?;
    let note = mgmt.make_property_key("note", PropType::String).make()?;
    let annotates = mgmt
        .make_edge_label("annotates")
        .consistency(ConsistencyModifier::Fork)
        .make()?;
    mgmt.commit()?;

    let mut tx = store.begin()?;
    let a = tx.add_vertex(None)?;
    let b = tx.add_vertex(None)?;
    let original = tx.add_edge("annotates", a, b)?;
    tx.set_edge_property(original, "note", Value::from("v0"))?;
    tx.commit()?;

    let mut t1 = store.begin()?;
    t1.set_edge_property(original, "note", Value::from("left"))?;
    let mut t2 = store.begin()?;
    t2.set_edge_property(original, "note", Value::from("right"))?;
    let (r1, r2) = race(t1, t2);
    r1?;
    r2?;

    let tx = store.begin()?;
    let live = tx.edges_of(
        a,
        &RelationQuery::all(RelationBase::EdgeLabel(annotates), Direction::Out),
    )?;
    assert_eq!(live.len(), 2, "both updates must survive");
    let notes: Vec<Option<&Value>> = live.iter().map(|e| e.value(note)).collect();
    assert!(notes.contains(&Some(&Value::from("left"))));
    assert!(notes.contains(&Some(&Value::from("right"))));
    Ok(())
}

#[test]
fn multiplicity_is_enforced_within_a_transaction() -> Result<()> {
    let store = Store::open(Backend::in_memory(), StoreConfig::default())?;
    let mut mgmt = store.manage()?;
    mgmt.make_edge_label("married")
        .multiplicity(Multiplicity::One2One)
        .make()?;
    mgmt.make_edge_label("mother")
        .multiplicity(Multiplicity::Many2One)
        .make()?;
    mgmt.commit()?;

    let mut tx = store.begin()?;
    let a = tx.add_vertex(None)?;
    let b = tx.add_vertex(None)?;
    let c = tx.add_vertex(None)?;
    tx.add_edge("married", a, b)?;
    for (out_v, in_v) in [(a, c), (c, b)] {
        match tx.add_edge("married", out_v, in_v) {
            Err(TramaError::SchemaViolation(msg)) => {
                assert!(msg.contains("admits no further edge"), "got: {msg}")
            }
            other => panic!("one-to-one endpoint reused: {other:?}"),
        }
    }
    tx.commit()?;

    let mut tx = store.begin()?;
    let child = tx.add_vertex(None)?;
    let mom = tx.add_vertex(None)?;
    let sibling = tx.add_vertex(None)?;
    tx.add_edge("mother", child, mom)?;
    assert!(
        tx.add_edge("mother", child, sibling).is_err(),
        "a child takes a single mother edge"
    );
    tx.add_edge("mother", sibling, mom)?;
    tx.commit()?;
    Ok(())
}

#[test]
fn multiplicity_is_enforced_across_transactions() -> Result<()> {
    let store = Store::open(Backend::in_memory(), StoreConfig::default())?;
    let mut mgmt = store.manage()?;
    mgmt.make_edge_label("follows")
        .multiplicity(Multiplicity::Simple)
        .make()?;
    mgmt.commit()?;

    let mut tx = store.begin()?;
    let a = tx.add_vertex(None)?;
    let b = tx.add_vertex(None)?;
    let c = tx.add_vertex(None)?;
    tx.add_edge("follows", a, b)?;
    tx.commit()?;

    // The duplicate only becomes visible against committed adjacency.
    let mut tx = store.begin()?;
    tx.add_edge("follows", a, b)?;
    match tx.commit() {
        Err(TramaError::SchemaViolation(msg)) => {
            assert!(msg.contains("admits no further edge"), "got: {msg}")
        }
        other => panic!("duplicate simple edge was admitted: {other:?}"),
    }

    let mut tx = store.begin()?;
    tx.add_edge("follows", a, c)?;
    tx.commit()?;
    Ok(())
}

#[test]
fn cardinality_shapes_committed_property_instances() -> Result<()> {
    let store = Store::open(Backend::in_memory(), StoreConfig::default())?;
    let mut mgmt = store.manage()?;
    let name = mgmt.make_property_key("name", PropType::String).make()?;
    let tag = mgmt
        .make_property_key("tag", PropType::String)
        .cardinality(Cardinality::Set)
        .make()?;
    let hit = mgmt
        .make_property_key("hit", PropType::Int)
        .cardinality(Cardinality::List)
        .make()?;
    mgmt.commit()?;

    let mut tx = store.begin()?;
    let v = tx.add_vertex(None)?;
    tx.add_property(v, "name", Value::from("ada"))?;
    let first = tx.add_property(v, "tag", Value::from("db"))?;
    let again = tx.add_property(v, "tag", Value::from("db"))?;
    assert_eq!(first, again, "a set key folds identical values");
    tx.add_property(v, "hit", Value::Int(1))?;
    tx.add_property(v, "hit", Value::Int(1))?;
    tx.commit()?;

    // SINGLE replaces across commits, SET folds, LIST appends.
    let mut tx = store.begin()?;
    tx.add_property(v, "name", Value::from("grace"))?;
    let folded = tx.add_property(v, "tag", Value::from("db"))?;
    assert_eq!(folded, first, "the committed instance is reused");
    tx.add_property(v, "tag", Value::from("graph"))?;
    tx.add_property(v, "hit", Value::Int(1))?;
    tx.commit()?;

    let tx = store.begin()?;
    let record = tx.vertex(v)?.expect("vertex");
    assert_eq!(
        record.values(name).collect::<Vec<_>>(),
        vec![&Value::from("grace")]
    );
    assert_eq!(record.values(tag).count(), 2);
    assert_eq!(record.values(hit).count(), 3);
    Ok(())
}

#[test]
fn meta_properties_ride_on_property_instances() -> Result<()> {
    let store = Store::open(Backend::in_memory(), StoreConfig::default())?;
    let mut mgmt = store.manage()?;
    mgmt.make_property_key("name", PropType::String).make()?;
    let at = mgmt.make_property_key("at", PropType::Int).make()?;
    mgmt.commit()?;

    let mut tx = store.begin()?;
    let v = tx.add_vertex(None)?;
    let instance = tx.add_property(v, "name", Value::from("ada"))?;
    tx.set_property_meta(v, instance, "at", Value::Int(1815))?;
    tx.commit()?;

    let tx = store.begin()?;
    let record = tx.vertex(v)?.expect("vertex");
    let stored = record.property(instance).expect("instance");
    assert_eq!(stored.meta_value(at), Some(&Value::Int(1815)));
    Ok(())
}

#[test]
fn relation_sort_keys_are_mandatory_once_indexed() -> Result<()> {
    let store = Store::open(Backend::in_memory(), StoreConfig::default())?;
    let mut mgmt = store.manage()?;
    let stars = mgmt.make_property_key("stars", PropType::Int).make()?;
    let rated = mgmt.make_edge_label("rated").make()?;
    mgmt.build_edge_index("byStars", rated, Direction::Out, SortOrder::Desc, &[stars])?;
    mgmt.commit()?;

    let mut tx = store.begin()?;
    let viewer = tx.add_vertex(None)?;
    let film = tx.add_vertex(None)?;
    tx.add_edge("rated", viewer, film)?;
    match tx.commit() {
        Err(TramaError::SchemaViolation(msg)) => {
            assert!(msg.contains("requires sort key"), "got: {msg}")
        }
        other => panic!("unsortable relation was admitted: {other:?}"),
    }

    // The rejected commit left nothing behind; rebuild with the key present.
    let mut tx = store.begin()?;
    let viewer = tx.add_vertex(None)?;
    let film = tx.add_vertex(None)?;
    let e = tx.add_edge("rated", viewer, film)?;
    tx.set_edge_property(e, "stars", Value::Int(4))?;
    tx.commit()?;

    let tx = store.begin()?;
    let hits = tx.edges_of(
        viewer,
        &RelationQuery::all(RelationBase::EdgeLabel(rated), Direction::Out),
    )?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].value(stars), Some(&Value::Int(4)));
    Ok(())
}
