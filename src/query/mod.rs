//! Query model, planning, and execution.
//!
//! A query is a conjunction of property conditions plus ordering and a
//! limit. The planner covers as many conditions as the enabled indexes
//! allow and leaves the rest as in-memory residual filters; the executor
//! runs the chosen accesses against the backend and reconciles results with
//! the transaction's staged writes.

pub mod builder;
pub mod condition;
pub(crate) mod executor;
pub mod plan;
pub mod planner;
pub mod relation;

pub use builder::GraphQuery;
pub use condition::{Condition, Op, PredicateSet};
pub use plan::{IndexAccess, PlanExplain, QueryPlan, StepExplain, Subquery};
pub use planner::QueryPlanner;
pub use relation::{RelationPlan, RelationPlanner, RelationQuery};
