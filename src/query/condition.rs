//! Atomic predicates and the conjunction handed to the planner.

use std::fmt;

use serde::Serialize;
use smallvec::SmallVec;

use crate::schema::LabelConstraint;
use crate::types::{PropKeyId, PropType, Result, SortOrder, TramaError, Value};

/// Predicate operator.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize)]
pub enum Op {
    /// Equality.
    Eq,
    /// Inequality. Matches elements missing the key entirely.
    Neq,
    /// Strictly less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Strictly greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Membership in an explicit value list.
    In,
    /// Absence from an explicit value list. Never delegated to an index.
    NotIn,
    /// No value for the key at all. Never delegated to an index.
    Absent,
    /// Tokenized text contains every query token.
    TextContains,
    /// String starts with the given prefix.
    TextPrefix,
    /// Shape lies within the operand shape.
    GeoWithin,
    /// Shape overlaps the operand shape.
    GeoIntersect,
    /// Shape fully contains the operand shape.
    GeoContains,
    /// Shape shares no point with the operand shape.
    GeoDisjoint,
}

impl Op {
    /// Operators that take exactly one operand value.
    fn single_operand(&self) -> bool {
        !matches!(self, Op::In | Op::NotIn | Op::Absent)
    }

    /// Whether the planner may hand this operator to an index at all.
    pub fn delegable(&self) -> bool {
        !matches!(self, Op::NotIn | Op::Absent)
    }

    /// Whether correctness of delegation depends on exact value identity,
    /// not just ordering. Relevant for truncating backends.
    pub fn exactness_sensitive(&self) -> bool {
        matches!(self, Op::Eq | Op::Neq | Op::In)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Op::Eq => "=",
            Op::Neq => "<>",
            Op::Lt => "<",
            Op::Lte => "<=",
            Op::Gt => ">",
            Op::Gte => ">=",
            Op::In => "in",
            Op::NotIn => "not_in",
            Op::Absent => "absent",
            Op::TextContains => "text_contains",
            Op::TextPrefix => "text_prefix",
            Op::GeoWithin => "geo_within",
            Op::GeoIntersect => "geo_intersect",
            Op::GeoContains => "geo_contains",
            Op::GeoDisjoint => "geo_disjoint",
        };
        f.write_str(name)
    }
}

/// One predicate on one property key.
#[derive(Clone, Debug, Serialize)]
pub struct Condition {
    /// Constrained key.
    pub key: PropKeyId,
    /// Operator.
    pub op: Op,
    /// Operand values: one for scalar operators, any number for `In` and
    /// `NotIn`.
    pub values: SmallVec<[Value; 2]>,
}

impl Condition {
    /// Single-operand condition.
    pub fn new(key: PropKeyId, op: Op, value: Value) -> Self {
        Condition {
            key,
            op,
            values: SmallVec::from_iter([value]),
        }
    }

    /// Set-membership condition.
    pub fn membership(key: PropKeyId, op: Op, values: Vec<Value>) -> Self {
        Condition {
            key,
            op,
            values: SmallVec::from_vec(values),
        }
    }

    /// Key-absence condition.
    pub fn absent(key: PropKeyId) -> Self {
        Condition {
            key,
            op: Op::Absent,
            values: SmallVec::new(),
        }
    }

    /// Validates operand arity and types against the key's declared type.
    pub fn validate(&self, ty: PropType) -> Result<()> {
        if self.op.single_operand() && self.values.len() != 1 {
            return Err(TramaError::Invalid("operator takes exactly one operand"));
        }
        match self.op {
            Op::TextContains | Op::TextPrefix => {
                if ty != PropType::String {
                    return Err(TramaError::Invalid(
                        "text operator requires a string-typed key",
                    ));
                }
            }
            Op::GeoWithin | Op::GeoIntersect | Op::GeoContains | Op::GeoDisjoint => {
                if ty != PropType::Geo {
                    return Err(TramaError::Invalid("geo operator requires a geo-typed key"));
                }
            }
            Op::Lt | Op::Lte | Op::Gt | Op::Gte => {
                if ty == PropType::Geo || ty == PropType::Bool {
                    return Err(TramaError::Invalid(
                        "range operator requires an orderable key",
                    ));
                }
            }
            Op::Absent => {
                if !self.values.is_empty() {
                    return Err(TramaError::Invalid("absence test takes no operand"));
                }
            }
            Op::Eq | Op::Neq | Op::In | Op::NotIn => {}
        }
        for value in &self.values {
            if value.prop_type() != ty {
                return Err(TramaError::Invalid("operand type does not match key type"));
            }
        }
        Ok(())
    }

    /// Evaluates the predicate against the element's values for the key.
    ///
    /// An element with at least one value matches when any value satisfies
    /// the operator. An element missing the key matches only `Neq`, `NotIn`,
    /// and `Absent`.
    pub fn evaluate(&self, values: &[Value]) -> bool {
        evaluate_any(self.op, &self.values, values)
    }
}

/// Evaluates one operator over an element's value list with any-match
/// semantics. An empty value list matches only negated operators.
pub(crate) fn evaluate_any(op: Op, operands: &[Value], values: &[Value]) -> bool {
    if values.is_empty() {
        return matches!(op, Op::Neq | Op::NotIn | Op::Absent);
    }
    values.iter().any(|v| value_matches(op, operands, v))
}

/// Tests a single candidate value against an operator and its operands.
pub(crate) fn value_matches(op: Op, operands: &[Value], value: &Value) -> bool {
    match op {
        Op::Eq => value == &operands[0],
        Op::Neq => value != &operands[0],
        Op::Lt | Op::Lte | Op::Gt | Op::Gte => {
            let operand = &operands[0];
            if value.prop_type() != operand.prop_type() || !value.is_orderable() {
                return false;
            }
            match op {
                Op::Lt => value < operand,
                Op::Lte => value <= operand,
                Op::Gt => value > operand,
                Op::Gte => value >= operand,
                _ => unreachable!(),
            }
        }
        Op::In => operands.contains(value),
        Op::NotIn => !operands.contains(value),
        Op::Absent => false,
        Op::TextContains => match (value, &operands[0]) {
            (Value::String(text), Value::String(query)) => text_contains(text, query),
            _ => false,
        },
        Op::TextPrefix => match (value, &operands[0]) {
            (Value::String(text), Value::String(prefix)) => text.starts_with(prefix),
            _ => false,
        },
        Op::GeoWithin => match (value, &operands[0]) {
            (Value::Geo(shape), Value::Geo(operand)) => shape.within(operand),
            _ => false,
        },
        Op::GeoIntersect => match (value, &operands[0]) {
            (Value::Geo(shape), Value::Geo(operand)) => shape.intersects(operand),
            _ => false,
        },
        Op::GeoContains => match (value, &operands[0]) {
            (Value::Geo(shape), Value::Geo(operand)) => shape.contains(operand),
            _ => false,
        },
        Op::GeoDisjoint => match (value, &operands[0]) {
            (Value::Geo(shape), Value::Geo(operand)) => shape.disjoint(operand),
            _ => false,
        },
    }
}

/// Word-level containment: every token of `query` appears among the
/// lowercased alphanumeric tokens of `text`.
pub(crate) fn text_contains(text: &str, query: &str) -> bool {
    let mut query_tokens = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .peekable();
    if query_tokens.peek().is_none() {
        return false;
    }
    let text_tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect();
    query_tokens.all(|q| text_tokens.iter().any(|t| *t == q))
}

/// Conjunction of conditions with an optional order and limit, the unit the
/// planner consumes.
#[derive(Clone, Debug, Default)]
pub struct PredicateSet {
    /// ANDed conditions.
    pub conditions: Vec<Condition>,
    /// Requested result order, outermost first.
    pub orders: Vec<(PropKeyId, SortOrder)>,
    /// Optional result cap.
    pub limit: Option<usize>,
    /// Optional label restriction on the returned elements.
    pub label: Option<LabelConstraint>,
}

impl PredicateSet {
    /// Whether neither conditions nor a label restrict the result.
    pub fn is_unconstrained(&self) -> bool {
        self.conditions.is_empty() && self.label.is_none()
    }
}
