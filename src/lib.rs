//! Transactional property-graph store with pluggable secondary indexes.
//!
//! A [`store::Store`] opens one instance over a shared [`store::Backend`]:
//! a key-value store plus any number of external index services. Data
//! lives in vertices, edges, and vertex properties; schema types and index
//! definitions live in a versioned catalog shared by every open instance.
//!
//! Reads and writes run inside a [`txn::Transaction`], which stages changes
//! in memory and enforces schema constraints, consistency modifiers, and
//! index maintenance at commit. Schema changes run through a
//! [`mgmt::ManagementTx`]; index lifecycle actions that touch existing data
//! spawn background jobs gated on every instance acknowledging the new
//! schema version. Queries are planned against enabled indexes by
//! [`query::QueryPlanner`] and built fluently with [`query::GraphQuery`].

pub mod backend;
pub mod logging;
pub mod mgmt;
pub mod query;
pub mod schema;
pub mod store;
pub mod txn;
pub mod types;

pub use query::{GraphQuery, Op};
pub use store::{Backend, Store, StoreConfig};
pub use txn::Transaction;
pub use types::{Result, TramaError, Value};
