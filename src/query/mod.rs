//! Query planning and execution engine.
//!
//! Logical query variables are turned into a tree of pull-based physical
//! operators by [`BuildCtx`]; a [`Cursor`] drives the tree and hands out
//! result rows.

/// Plan builder: logical variables to operator trees.
pub mod builder;

/// Engine limits and polling policy.
pub mod config;

/// Per-statement shared state and cancellation.
pub mod context;

/// Statement-level row iterator.
pub mod cursor;

/// Plan printing and plan fingerprints.
pub mod explain;

/// Boolean predicates over result rows.
pub mod expr;

/// Logical query variables.
pub mod logical;

/// Physical operators.
pub mod op;

/// Sort descriptors.
pub mod order;

/// Opt-in per-operator timing counters.
pub mod profile;

pub use builder::BuildCtx;
pub use config::QueryConfig;
pub use context::{QueryCtx, QueryCtxBuilder, Session};
pub use cursor::Cursor;
pub use explain::{ExplainNode, ExplainProp};
pub use expr::{CmpOp, Expr, Operand};
pub use logical::{IndexCond, JoinVar, QueryVar, SetOpVar, SimpleVar, SourceSpec, SubQuerySpec};
pub use order::{Direction, SortExpr, SortKey, SortOrder};
pub use profile::{profile_snapshot, OpTiming, QueryProfileSnapshot};
