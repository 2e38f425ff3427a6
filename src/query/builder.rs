//! Fluent graph-query builder.
//!
//! Filters reference property keys and labels by name; the first name that
//! fails to resolve parks an error that surfaces at the terminal call, so
//! chains stay ergonomic. Terminals plan against the transaction's schema
//! snapshot and run the plan through the executor.

use crate::query::condition::{Condition, Op, PredicateSet};
use crate::query::executor;
use crate::query::plan::{PlanExplain, QueryPlan};
use crate::query::planner::QueryPlanner;
use crate::schema::LabelConstraint;
use crate::txn::{EdgeRecord, PropertyRecord, Transaction, VertexRecord};
use crate::types::{
    ElementKind, PropKeyId, PropType, Result, SortOrder, TramaError, Value, VertexId,
};

/// Builder for index-backed element retrievals within one transaction.
pub struct GraphQuery<'a> {
    txn: &'a Transaction,
    predicates: PredicateSet,
    error: Option<TramaError>,
}

impl<'a> GraphQuery<'a> {
    pub(crate) fn new(txn: &'a Transaction) -> Self {
        GraphQuery {
            txn,
            predicates: PredicateSet::default(),
            error: None,
        }
    }

    /// Adds one condition on `key`.
    pub fn has(mut self, key: &str, op: Op, value: Value) -> Self {
        if let Some((id, data_type)) = self.resolve_key(key) {
            self.push_condition(Condition::new(id, op, value), data_type);
        }
        self
    }

    /// Equality shorthand.
    pub fn has_eq(self, key: &str, value: Value) -> Self {
        self.has(key, Op::Eq, value)
    }

    /// Requires that `key` carries no value. Always evaluated in memory.
    pub fn has_not(mut self, key: &str) -> Self {
        if let Some((id, data_type)) = self.resolve_key(key) {
            self.push_condition(Condition::absent(id), data_type);
        }
        self
    }

    /// Restricts `key` to an explicit value list.
    pub fn within(mut self, key: &str, values: Vec<Value>) -> Self {
        if let Some((id, data_type)) = self.resolve_key(key) {
            self.push_condition(Condition::membership(id, Op::In, values), data_type);
        }
        self
    }

    /// Excludes an explicit value list for `key`.
    pub fn without(mut self, key: &str, values: Vec<Value>) -> Self {
        if let Some((id, data_type)) = self.resolve_key(key) {
            self.push_condition(Condition::membership(id, Op::NotIn, values), data_type);
        }
        self
    }

    /// Half-open range `start <= key < end`.
    pub fn interval(mut self, key: &str, start: Value, end: Value) -> Self {
        if let Some((id, data_type)) = self.resolve_key(key) {
            self.push_condition(Condition::new(id, Op::Gte, start), data_type);
            self.push_condition(Condition::new(id, Op::Lt, end), data_type);
        }
        self
    }

    /// Restricts results to elements with the named vertex or edge label.
    pub fn label(mut self, name: &str) -> Self {
        let constraint = {
            let schema = self.txn.schema();
            if let Some(def) = schema.vertex_label_by_name(name) {
                Some(LabelConstraint::Vertex(def.id))
            } else if let Some(def) = schema.edge_label_by_name(name) {
                Some(LabelConstraint::Edge(def.id))
            } else {
                None
            }
        };
        match constraint {
            Some(constraint) => self.predicates.label = Some(constraint),
            None => self.park(TramaError::SchemaViolation(format!("unknown label {name}"))),
        }
        self
    }

    /// Appends an order clause; earlier clauses take precedence.
    pub fn order_by(mut self, key: &str, order: SortOrder) -> Self {
        if let Some((id, _)) = self.resolve_key(key) {
            self.predicates.orders.push((id, order));
        }
        self
    }

    /// Caps the number of returned elements.
    pub fn limit(mut self, limit: usize) -> Self {
        self.predicates.limit = Some(limit);
        self
    }

    /// Runs the query over vertices.
    pub fn vertices(mut self) -> Result<Vec<VertexRecord>> {
        let plan = self.plan(ElementKind::Vertex)?;
        executor::vertices(self.txn, &self.predicates, &plan)
    }

    /// Runs the query over edges.
    pub fn edges(mut self) -> Result<Vec<EdgeRecord>> {
        let plan = self.plan(ElementKind::Edge)?;
        executor::edges(self.txn, &self.predicates, &plan)
    }

    /// Runs the query over property instances, returning each with its
    /// owning vertex.
    pub fn properties(mut self) -> Result<Vec<(VertexId, PropertyRecord)>> {
        let plan = self.plan(ElementKind::Property)?;
        executor::properties(self.txn, &self.predicates, &plan)
    }

    /// Renders the plan for `kind` without running it.
    pub fn explain(mut self, kind: ElementKind) -> Result<PlanExplain> {
        let plan = self.plan(kind)?;
        Ok(plan.explain(self.txn.schema()))
    }

    fn plan(&mut self, kind: ElementKind) -> Result<QueryPlan> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        QueryPlanner::new(
            self.txn.schema(),
            self.txn.backend().capabilities(),
            self.txn.config().force_index_usage,
        )
        .plan(kind, &self.predicates)
    }

    fn resolve_key(&mut self, name: &str) -> Option<(PropKeyId, PropType)> {
        match self.txn.schema().prop_key_by_name(name) {
            Some(def) => Some((def.id, def.data_type)),
            None => {
                self.park(TramaError::SchemaViolation(format!(
                    "unknown property key {name}"
                )));
                None
            }
        }
    }

    fn push_condition(&mut self, condition: Condition, data_type: PropType) {
        match condition.validate(data_type) {
            Ok(()) => self.predicates.conditions.push(condition),
            Err(err) => self.park(err),
        }
    }

    fn park(&mut self, err: TramaError) {
        // Only the first failure is reported.
        if self.error.is_none() {
            self.error = Some(err);
        }
    }
}
