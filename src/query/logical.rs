//! Logical query variables consumed by the plan builder.
//!
//! A [`QueryVar`] describes what a statement asks for; [`BuildCtx`] picks the
//! physical operators. Every type here is serde-serializable so queries can
//! be stored as JSON next to a dataset.
//!
//! [`BuildCtx`]: crate::query::BuildCtx

use serde::{Deserialize, Serialize};

use crate::query::expr::Expr;
use crate::query::op::{JoinCond, JoinKind, PathSeg, SetOpKind, SubQueryMode};
use crate::storage::KeyRange;
use crate::types::{ClassId, PinId, PropId};

/// Identity source of a simple variable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SourceSpec {
    /// Members of a class.
    Class {
        /// Class scanned.
        class: ClassId,
    },
    /// Reference values of a context parameter.
    Param {
        /// Parameter index.
        index: usize,
    },
    /// The context environment array.
    Env,
    /// Full-text matches.
    FullText {
        /// Property searched; every property when absent.
        #[serde(default)]
        prop: Option<PropId>,
        /// Word looked up.
        word: String,
    },
    /// Fixed identity list.
    Ids {
        /// Listed identities.
        ids: Vec<PinId>,
    },
}

/// Range condition on a property, served by an index when one exists.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexCond {
    /// Property tested.
    pub prop: PropId,
    /// Accepted values.
    pub range: KeyRange,
}

/// Correlated sub-query attached to a simple variable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubQuerySpec {
    /// Inner query; must produce one slot.
    pub query: Box<QueryVar>,
    /// Outer slot whose identity is checked.
    #[serde(default)]
    pub slot: usize,
    /// Relation checked.
    pub mode: SubQueryMode,
    /// Keep rows that fail the check instead.
    #[serde(default)]
    pub negate: bool,
}

/// Single-slot variable: sources, local conditions and an optional path.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimpleVar {
    /// Scan sources; intersected when more than one.
    pub sources: Vec<SourceSpec>,
    /// Range conditions.
    pub index_conds: Vec<IndexCond>,
    /// Local predicate over slot 0.
    pub predicate: Option<Expr>,
    /// Correlated checks.
    pub subqueries: Vec<SubQuerySpec>,
    /// Path suffix expanded from every matching node.
    pub path: Vec<PathSeg>,
    /// Properties materialized for the result.
    pub props: Vec<PropId>,
    /// Tombstoned PINs are visible.
    pub include_deleted: bool,
}

impl SimpleVar {
    /// Adds a scan source.
    pub fn source(mut self, source: SourceSpec) -> Self {
        self.sources.push(source);
        self
    }

    /// Adds a range condition.
    pub fn index_cond(mut self, prop: PropId, range: KeyRange) -> Self {
        self.index_conds.push(IndexCond { prop, range });
        self
    }

    /// ANDs `expr` into the local predicate.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    /// Adds a correlated check.
    pub fn subquery(mut self, query: QueryVar, mode: SubQueryMode, negate: bool) -> Self {
        self.subqueries.push(SubQuerySpec {
            query: Box::new(query),
            slot: 0,
            mode,
            negate,
        });
        self
    }

    /// Appends a path segment.
    pub fn path(mut self, seg: PathSeg) -> Self {
        self.path.push(seg);
        self
    }

    /// Requests result properties.
    pub fn props(mut self, props: impl IntoIterator<Item = PropId>) -> Self {
        self.props.extend(props);
        self
    }

    /// Lets tombstones through.
    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }
}

/// Binary join of two variables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinVar {
    /// Join flavor.
    pub kind: JoinKind,
    /// Left input.
    pub left: Box<QueryVar>,
    /// Right input.
    pub right: Box<QueryVar>,
    /// Equality chain; empty for a theta join.
    #[serde(default)]
    pub conds: Vec<JoinCond>,
    /// Residual predicate over the combined row.
    #[serde(default)]
    pub predicate: Option<Expr>,
}

/// N-ary set operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetOpVar {
    /// Operation.
    pub kind: SetOpKind,
    /// Single-slot inputs.
    pub inputs: Vec<QueryVar>,
}

/// Logical query tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "var", rename_all = "snake_case")]
pub enum QueryVar {
    /// Scan plus local conditions.
    Simple(SimpleVar),
    /// Two-way join.
    Join(JoinVar),
    /// Set operation.
    SetOp(SetOpVar),
}

impl QueryVar {
    /// Join of `left` and `right` on `conds`.
    pub fn join(kind: JoinKind, left: QueryVar, right: QueryVar, conds: Vec<JoinCond>) -> Self {
        QueryVar::Join(JoinVar {
            kind,
            left: Box::new(left),
            right: Box::new(right),
            conds,
            predicate: None,
        })
    }

    /// Set operation over `inputs`.
    pub fn set_op(kind: SetOpKind, inputs: Vec<QueryVar>) -> Self {
        QueryVar::SetOp(SetOpVar { kind, inputs })
    }

    /// Adds a residual predicate to a join; other variables are unchanged.
    pub fn with_join_predicate(mut self, expr: Expr) -> Self {
        if let QueryVar::Join(join) = &mut self {
            join.predicate = Some(match join.predicate.take() {
                Some(existing) => existing.and(expr),
                None => expr,
            });
        }
        self
    }

    /// Returns true for [`QueryVar::Simple`].
    pub fn is_simple(&self) -> bool {
        matches!(self, QueryVar::Simple(_))
    }

    /// Result slots produced by the variable.
    pub fn width(&self) -> usize {
        match self {
            QueryVar::Simple(_) | QueryVar::SetOp(_) => 1,
            QueryVar::Join(join) => join.kind.width(join.left.width(), join.right.width()),
        }
    }

    /// Properties requested per result slot.
    pub fn slot_props(&self) -> Vec<Vec<PropId>> {
        match self {
            QueryVar::Simple(simple) => vec![simple.props.clone()],
            QueryVar::SetOp(_) => vec![Vec::new()],
            QueryVar::Join(join) => {
                let mut slots = join.left.slot_props();
                if join.kind != JoinKind::Semi {
                    slots.extend(join.right.slot_props());
                }
                slots
            }
        }
    }
}

impl From<SimpleVar> for QueryVar {
    fn from(simple: SimpleVar) -> Self {
        QueryVar::Simple(simple)
    }
}
