//! End-to-end planning scenarios over the public API: which indexes a
//! query consults, what stays behind as in-memory work, and how the
//! chosen plan behaves once executed against real data.

#![allow(missing_docs)]

use std::time::Duration;

use trama::mgmt::JobState;
use trama::query::{Condition, RelationQuery};
use trama::schema::{RelationBase, SchemaAction};
use trama::types::{Direction, ElementKind, PropType, SortOrder};
use trama::{Backend, Op, Result, Store, StoreConfig, TramaError, Value};

const WAIT: Duration = Duration::from_secs(5);

fn open() -> Result<Store> {
    Store::open(Backend::in_memory(), StoreConfig::default())
}

#[test]
fn unique_equality_short_circuits_other_candidates() -> Result<()> {
    let store = open()?;
    let mut mgmt = store.manage()?;
    let uid = mgmt.make_property_key("uid", PropType::String).make()?;
    let age = mgmt.make_property_key("age", PropType::Int).make()?;
    mgmt.build_index("byUid", ElementKind::Vertex)
        .key(uid)
        .unique()
        .composite()?;
    mgmt.build_index("byAge", ElementKind::Vertex)
        .key(age)
        .composite()?;
    mgmt.commit()?;

    let mut tx = store.begin()?;
    for (u, a) in [("u1", 30), ("u2", 20), ("u3", 40)] {
        let v = tx.add_vertex(None)?;
        tx.add_property(v, "uid", Value::from(u))?;
        tx.add_property(v, "age", Value::Int(a))?;
    }
    tx.commit()?;

    let tx = store.begin()?;
    let explain = tx
        .query()
        .has_eq("uid", Value::from("u2"))
        .has("age", Op::Gt, Value::Int(10))
        .explain(ElementKind::Vertex)?;
    assert_eq!(explain.steps.len(), 1, "unique lookup needs no second index");
    assert_eq!(explain.steps[0].index, "byUid");
    assert_eq!(explain.residual_conditions, 1);
    assert!(!explain.fitted);

    let hits = tx
        .query()
        .has_eq("uid", Value::from("u2"))
        .has("age", Op::Gt, Value::Int(10))
        .vertices()?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].values(uid).next(), Some(&Value::from("u2")));
    Ok(())
}

#[test]
fn membership_expands_into_point_lookups() -> Result<()> {
    let store = open()?;
    let mut mgmt = store.manage()?;
    let uid = mgmt.make_property_key("uid", PropType::String).make()?;
    mgmt.build_index("byUid", ElementKind::Vertex)
        .key(uid)
        .composite()?;
    mgmt.commit()?;

    let mut tx = store.begin()?;
    for u in ["u1", "u2", "u3"] {
        let v = tx.add_vertex(None)?;
        tx.add_property(v, "uid", Value::from(u))?;
    }
    tx.commit()?;

    let tx = store.begin()?;
    let explain = tx
        .query()
        .within("uid", vec![Value::from("u1"), Value::from("u3")])
        .explain(ElementKind::Vertex)?;
    assert_eq!(explain.steps[0].lookups, 2);
    assert!(explain.fitted);

    let hits = tx
        .query()
        .within("uid", vec![Value::from("u1"), Value::from("u3")])
        .vertices()?;
    assert_eq!(hits.len(), 2);
    Ok(())
}

#[test]
fn joint_composite_retrievals_intersect() -> Result<()> {
    let store = open()?;
    let mut mgmt = store.manage()?;
    let name = mgmt.make_property_key("name", PropType::String).make()?;
    let city = mgmt.make_property_key("city", PropType::String).make()?;
    mgmt.build_index("byName", ElementKind::Vertex)
        .key(name)
        .composite()?;
    mgmt.build_index("byCity", ElementKind::Vertex)
        .key(city)
        .composite()?;
    mgmt.commit()?;

    let mut tx = store.begin()?;
    for (n, c) in [("alice", "paris"), ("bob", "paris"), ("alice", "tokyo")] {
        let v = tx.add_vertex(None)?;
        tx.add_property(v, "name", Value::from(n))?;
        tx.add_property(v, "city", Value::from(c))?;
    }
    tx.commit()?;

    let tx = store.begin()?;
    let explain = tx
        .query()
        .has_eq("name", Value::from("alice"))
        .has_eq("city", Value::from("paris"))
        .explain(ElementKind::Vertex)?;
    assert_eq!(explain.steps.len(), 2);
    assert!(explain.fitted);

    let hits = tx
        .query()
        .has_eq("name", Value::from("alice"))
        .has_eq("city", Value::from("paris"))
        .vertices()?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].values(name).next(), Some(&Value::from("alice")));
    assert_eq!(hits[0].values(city).next(), Some(&Value::from("paris")));
    Ok(())
}

#[test]
fn one_service_folds_every_delegable_condition() -> Result<()> {
    let store = open()?;
    let mut mgmt = store.manage()?;
    let bio = mgmt.make_property_key("bio", PropType::String).make()?;
    let age = mgmt.make_property_key("age", PropType::Int).make()?;
    mgmt.build_index("search", ElementKind::Vertex)
        .key(bio)
        .key(age)
        .mixed("memory")?;
    mgmt.commit()?;

    let mut tx = store.begin()?;
    for (b, a) in [
        ("writes rust all day", 34),
        ("rust curious", 16),
        ("keeps bees", 51),
    ] {
        let v = tx.add_vertex(None)?;
        tx.add_property(v, "bio", Value::from(b))?;
        tx.add_property(v, "age", Value::Int(a))?;
    }
    tx.commit()?;

    let tx = store.begin()?;
    let explain = tx
        .query()
        .has("bio", Op::TextContains, Value::from("rust"))
        .has("age", Op::Gte, Value::Int(18))
        .explain(ElementKind::Vertex)?;
    assert_eq!(explain.steps.len(), 1, "both conditions ride one query");
    assert_eq!(explain.steps[0].kind, "mixed");
    assert_eq!(explain.steps[0].backing.as_deref(), Some("memory"));
    assert_eq!(explain.steps[0].conditions, 2);
    assert!(explain.fitted);

    let hits = tx
        .query()
        .has("bio", Op::TextContains, Value::from("rust"))
        .has("age", Op::Gte, Value::Int(18))
        .vertices()?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].values(age).next(), Some(&Value::Int(34)));
    Ok(())
}

#[test]
fn negated_membership_is_filtered_in_memory() -> Result<()> {
    let store = open()?;
    let mut mgmt = store.manage()?;
    let age = mgmt.make_property_key("age", PropType::Int).make()?;
    mgmt.build_index("byAge", ElementKind::Vertex)
        .key(age)
        .composite()?;
    mgmt.commit()?;

    let mut tx = store.begin()?;
    for a in [20, 30, 40] {
        let v = tx.add_vertex(None)?;
        tx.add_property(v, "age", Value::Int(a))?;
    }
    tx.commit()?;

    let tx = store.begin()?;
    let explain = tx
        .query()
        .without("age", vec![Value::Int(20)])
        .explain(ElementKind::Vertex)?;
    assert!(explain.steps.is_empty(), "negation never hits an index");
    assert_eq!(explain.residual_conditions, 1);

    let hits = tx.query().without("age", vec![Value::Int(20)]).vertices()?;
    assert_eq!(hits.len(), 2);
    assert!(hits
        .iter()
        .all(|v| v.values(age).next() != Some(&Value::Int(20))));
    Ok(())
}

#[test]
fn unsatisfiable_membership_skips_retrieval() -> Result<()> {
    let store = open()?;
    let mut mgmt = store.manage()?;
    let uid = mgmt.make_property_key("uid", PropType::String).make()?;
    mgmt.build_index("byUid", ElementKind::Vertex)
        .key(uid)
        .composite()?;
    mgmt.commit()?;

    let mut tx = store.begin()?;
    let v = tx.add_vertex(None)?;
    tx.add_property(v, "uid", Value::from("u1"))?;
    tx.commit()?;

    let tx = store.begin()?;
    let explain = tx
        .query()
        .within("uid", vec![])
        .explain(ElementKind::Vertex)?;
    assert!(explain.no_results);
    assert!(explain.steps.is_empty());
    assert!(tx.query().within("uid", vec![]).vertices()?.is_empty());
    Ok(())
}

#[test]
fn requested_order_is_native_only_from_the_service() -> Result<()> {
    let store = open()?;
    let mut mgmt = store.manage()?;
    let name = mgmt.make_property_key("name", PropType::String).make()?;
    let bio = mgmt.make_property_key("bio", PropType::String).make()?;
    let age = mgmt.make_property_key("age", PropType::Int).make()?;
    mgmt.build_index("byName", ElementKind::Vertex)
        .key(name)
        .composite()?;
    mgmt.build_index("search", ElementKind::Vertex)
        .key(bio)
        .key(age)
        .mixed("memory")?;
    mgmt.commit()?;

    let mut tx = store.begin()?;
    for (b, a) in [
        ("paints fences", 41),
        ("paints houses", 29),
        ("paints boats", 35),
    ] {
        let v = tx.add_vertex(None)?;
        tx.add_property(v, "name", Value::from("kim"))?;
        tx.add_property(v, "bio", Value::from(b))?;
        tx.add_property(v, "age", Value::Int(a))?;
    }
    tx.commit()?;

    let tx = store.begin()?;
    let native = tx
        .query()
        .has("bio", Op::TextContains, Value::from("paints"))
        .order_by("age", SortOrder::Desc)
        .explain(ElementKind::Vertex)?;
    assert!(native.ordered, "the service sorts on our behalf");

    let sorted = tx
        .query()
        .has_eq("name", Value::from("kim"))
        .order_by("age", SortOrder::Desc)
        .explain(ElementKind::Vertex)?;
    assert!(!sorted.ordered, "composite retrievals carry no order");

    // Either way the caller sees the requested order.
    for build in [
        tx.query()
            .has("bio", Op::TextContains, Value::from("paints"))
            .order_by("age", SortOrder::Desc),
        tx.query()
            .has_eq("name", Value::from("kim"))
            .order_by("age", SortOrder::Desc),
    ] {
        let hits = build.vertices()?;
        let ages: Vec<Option<&Value>> = hits.iter().map(|v| v.values(age).next()).collect();
        assert_eq!(
            ages,
            [
                Some(&Value::Int(41)),
                Some(&Value::Int(35)),
                Some(&Value::Int(29))
            ]
        );
    }
    Ok(())
}

#[test]
fn index_visibility_follows_field_status() -> Result<()> {
    let store = open()?;
    let mut mgmt = store.manage()?;
    let age = mgmt.make_property_key("age", PropType::Int).make()?;
    mgmt.commit()?;

    // Declared over a key with history: born Installed, invisible to plans.
    let mut mgmt = store.manage()?;
    mgmt.build_index("byAge", ElementKind::Vertex)
        .key(age)
        .composite()?;
    let jobs = mgmt.commit()?;

    let tx = store.begin()?;
    let explain = tx
        .query()
        .has_eq("age", Value::Int(30))
        .explain(ElementKind::Vertex)?;
    assert!(explain.steps.is_empty(), "installed indexes answer nothing");

    // Registered: maintained by writers, still not consulted by plans.
    assert_eq!(jobs[0].wait(WAIT), JobState::Succeeded);
    let tx = store.begin()?;
    let explain = tx
        .query()
        .has_eq("age", Value::Int(30))
        .explain(ElementKind::Vertex)?;
    assert!(explain.steps.is_empty(), "registered indexes answer nothing");

    let mut mgmt = store.manage()?;
    mgmt.update_index("byAge", SchemaAction::EnableIndex)?;
    mgmt.commit()?;
    let tx = store.begin()?;
    let explain = tx
        .query()
        .has_eq("age", Value::Int(30))
        .explain(ElementKind::Vertex)?;
    assert_eq!(explain.steps.len(), 1);
    assert_eq!(explain.steps[0].index, "byAge");
    Ok(())
}

#[test]
fn label_constrained_index_serves_only_labeled_queries() -> Result<()> {
    let store = open()?;
    let mut mgmt = store.manage()?;
    let age = mgmt.make_property_key("age", PropType::Int).make()?;
    let person = mgmt.make_vertex_label("person")?;
    mgmt.build_index("personByAge", ElementKind::Vertex)
        .key(age)
        .only_vertex_label(person)
        .composite()?;
    mgmt.commit()?;

    let mut tx = store.begin()?;
    let labeled = tx.add_vertex(Some("person"))?;
    tx.add_property(labeled, "age", Value::Int(30))?;
    let plain = tx.add_vertex(None)?;
    tx.add_property(plain, "age", Value::Int(30))?;
    tx.commit()?;

    let tx = store.begin()?;
    let unlabeled = tx
        .query()
        .has_eq("age", Value::Int(30))
        .explain(ElementKind::Vertex)?;
    assert!(unlabeled.steps.is_empty(), "the index answers person only");
    assert_eq!(tx.query().has_eq("age", Value::Int(30)).vertices()?.len(), 2);

    let scoped = tx
        .query()
        .label("person")
        .has_eq("age", Value::Int(30))
        .explain(ElementKind::Vertex)?;
    assert_eq!(scoped.steps.len(), 1);
    assert_eq!(scoped.steps[0].index, "personByAge");
    assert!(scoped.fitted);

    let hits = tx
        .query()
        .label("person")
        .has_eq("age", Value::Int(30))
        .vertices()?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, labeled);
    Ok(())
}

#[test]
fn forced_index_usage_rejects_residual_only_plans() -> Result<()> {
    let store = Store::open(
        Backend::in_memory(),
        StoreConfig::default().force_index_usage(true),
    )?;
    let mut mgmt = store.manage()?;
    let uid = mgmt.make_property_key("uid", PropType::String).make()?;
    mgmt.make_property_key("age", PropType::Int).make()?;
    mgmt.build_index("byUid", ElementKind::Vertex)
        .key(uid)
        .composite()?;
    mgmt.commit()?;

    let tx = store.begin()?;
    let err = tx
        .query()
        .has("age", Op::Gt, Value::Int(10))
        .vertices()
        .expect_err("no index covers age");
    assert!(matches!(err, TramaError::PlannerFallbackRejected));

    // An indexed conjunction still passes.
    assert!(tx
        .query()
        .has_eq("uid", Value::from("u1"))
        .vertices()?
        .is_empty());
    Ok(())
}

#[test]
fn plan_fingerprints_are_stable() -> Result<()> {
    let store = open()?;
    let mut mgmt = store.manage()?;
    mgmt.make_property_key("uid", PropType::String).make()?;
    mgmt.commit()?;

    let tx = store.begin()?;
    let first = tx
        .query()
        .has_eq("uid", Value::from("u1"))
        .explain(ElementKind::Vertex)?;
    let second = tx
        .query()
        .has_eq("uid", Value::from("u1"))
        .explain(ElementKind::Vertex)?;
    let other = tx
        .query()
        .has_eq("uid", Value::from("u2"))
        .explain(ElementKind::Vertex)?;
    assert_eq!(first.fingerprint, second.fingerprint);
    assert_ne!(first.fingerprint, other.fingerprint);
    Ok(())
}

#[test]
fn sort_index_plans_incident_edge_queries() -> Result<()> {
    let store = open()?;
    let mut mgmt = store.manage()?;
    let stars = mgmt.make_property_key("stars", PropType::Int).make()?;
    let rated = mgmt.make_edge_label("rated").make()?;
    mgmt.build_edge_index("byStars", rated, Direction::Out, SortOrder::Desc, &[stars])?;
    mgmt.commit()?;

    let mut tx = store.begin()?;
    let viewer = tx.add_vertex(None)?;
    for s in [2, 5, 3] {
        let movie = tx.add_vertex(None)?;
        let e = tx.add_edge("rated", viewer, movie)?;
        tx.set_edge_property(e, "stars", Value::Int(s))?;
    }
    tx.commit()?;

    let tx = store.begin()?;
    let mut query = RelationQuery::all(RelationBase::EdgeLabel(rated), Direction::Out);
    query.orders.push((stars, SortOrder::Desc));
    let hits = tx.edges_of(viewer, &query)?;
    let ranked: Vec<Option<&Value>> = hits.iter().map(|e| e.value(stars)).collect();
    assert_eq!(
        ranked,
        [
            Some(&Value::Int(5)),
            Some(&Value::Int(3)),
            Some(&Value::Int(2))
        ]
    );
    Ok(())
}

#[test]
fn sort_index_equality_narrows_incident_edges() -> Result<()> {
    let store = open()?;
    let mut mgmt = store.manage()?;
    let stars = mgmt.make_property_key("stars", PropType::Int).make()?;
    let rated = mgmt.make_edge_label("rated").make()?;
    mgmt.build_edge_index("byStars", rated, Direction::Out, SortOrder::Asc, &[stars])?;
    mgmt.commit()?;

    let mut tx = store.begin()?;
    let viewer = tx.add_vertex(None)?;
    for s in [2, 5, 3, 3] {
        let movie = tx.add_vertex(None)?;
        let e = tx.add_edge("rated", viewer, movie)?;
        tx.set_edge_property(e, "stars", Value::Int(s))?;
    }
    tx.commit()?;

    let tx = store.begin()?;
    let mut narrowed = RelationQuery::all(RelationBase::EdgeLabel(rated), Direction::Out);
    narrowed
        .conditions
        .push(Condition::new(stars, Op::Eq, Value::Int(3)));
    let hits = tx.edges_of(viewer, &narrowed)?;
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|e| e.value(stars) == Some(&Value::Int(3))));
    Ok(())
}
