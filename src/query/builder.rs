//! Rule-based translation of [`QueryVar`] trees into operator trees.
//!
//! Operators are assembled bottom-up on an explicit stack: every variable
//! pushes exactly one operator and combinators pop their inputs. The number
//! of operators created per statement is bounded by
//! [`QueryConfig::max_operators`](crate::query::QueryConfig::max_operators).

use tracing::debug;

use crate::query::context::QueryCtx;
use crate::query::expr::{CmpOp, Expr, Operand};
use crate::query::logical::{JoinVar, QueryVar, SetOpVar, SimpleVar, SourceSpec};
use crate::query::op::{
    BuildSide, FilterOp, HashJoinOp, JoinCond, JoinKind, KeyRef, LoadOp, MergeJoinOp, MergeOp,
    NestedLoopOp, Operator, PathOp, Qualifier, ScanOp, ScanSource, SetOpKind, SortOp,
    SubQueryCheck, SubQueryMode,
};
use crate::query::order::SortOrder;
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::types::{PinError, Result};

/// Physical join algorithm picked for a [`JoinVar`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum JoinStrategy {
    Merge,
    Hash(BuildSide),
    NestedLoop,
}

/// Per-statement plan builder.
pub struct BuildCtx {
    ctx: QueryCtx,
    stack: Vec<Box<dyn Operator>>,
    created: usize,
}

impl BuildCtx {
    /// Builder over `ctx`.
    pub fn new(ctx: QueryCtx) -> Self {
        Self {
            ctx,
            stack: Vec::new(),
            created: 0,
        }
    }

    /// Query context shared by every built operator.
    pub fn ctx(&self) -> &QueryCtx {
        &self.ctx
    }

    /// Builds the operator tree for `var`.
    pub fn build(&mut self, var: &QueryVar) -> Result<Box<dyn Operator>> {
        let timer = profile_timer();
        self.stack.clear();
        self.created = 0;
        let built = self.build_var(var).and_then(|()| self.pop());
        record_profile_timer(QueryProfileKind::Build, timer);
        let root = built?;
        if !self.stack.is_empty() {
            return Err(PinError::Internal("operator stack not balanced after build"));
        }
        debug!(
            operators = self.created,
            root = root.name(),
            width = root.width(),
            "query.build.done"
        );
        Ok(root)
    }

    fn add(&mut self, op: impl Operator + 'static) -> Result<Box<dyn Operator>> {
        let limit = self.ctx.config().max_operators;
        if self.created >= limit {
            return Err(PinError::TooManyOperators { limit });
        }
        self.created += 1;
        Ok(Box::new(op))
    }

    fn push(&mut self, op: Box<dyn Operator>) {
        self.stack.push(op);
    }

    fn pop(&mut self) -> Result<Box<dyn Operator>> {
        self.stack
            .pop()
            .ok_or(PinError::Internal("operator stack underflow"))
    }

    fn build_var(&mut self, var: &QueryVar) -> Result<()> {
        match var {
            QueryVar::Simple(simple) => self.build_simple(simple),
            QueryVar::Join(join) => self.build_join(join),
            QueryVar::SetOp(set) => self.build_set_op(set),
        }
    }

    fn scan(&mut self, source: ScanSource) -> Result<Box<dyn Operator>> {
        let op = ScanOp::new(self.ctx.clone(), source);
        self.add(op)
    }

    fn build_simple(&mut self, var: &SimpleVar) -> Result<()> {
        let store = self.ctx.store();
        let mut candidates = Vec::new();
        let mut quals = Vec::new();
        let mut unchecked = false;
        for cond in &var.index_conds {
            if store.has_index(cond.prop) && !var.include_deleted {
                candidates.push(ScanSource::Index {
                    prop: cond.prop,
                    range: cond.range.clone(),
                });
            } else {
                debug!(prop = %cond.prop, "query.build.index_residual");
                quals.push(Qualifier::Range {
                    slot: 0,
                    prop: cond.prop,
                    range: cond.range.clone(),
                });
            }
        }
        for source in &var.sources {
            let source = match source {
                SourceSpec::Class { class } => ScanSource::Class {
                    class: *class,
                    include_deleted: var.include_deleted,
                },
                SourceSpec::Param { index } => ScanSource::Param(*index),
                SourceSpec::Env => ScanSource::Env,
                SourceSpec::FullText { prop, word } => ScanSource::FullText {
                    prop: *prop,
                    word: word.clone(),
                },
                SourceSpec::Ids { ids } => ScanSource::Ids(ids.clone()),
            };
            unchecked |= source.unchecked();
            candidates.push(source);
        }
        if candidates.is_empty() {
            candidates.push(ScanSource::Full {
                include_deleted: var.include_deleted,
            });
        }

        let mut op = if candidates.len() == 1 {
            let source = candidates.remove(0);
            self.scan(source)?
        } else {
            let mut inputs = Vec::with_capacity(candidates.len());
            for source in candidates {
                let scan = self.scan(source)?;
                inputs.push(self.normalize(scan)?);
            }
            debug!(inputs = inputs.len(), "query.build.intersect_sources");
            let merge = MergeOp::new(self.ctx.clone(), SetOpKind::Intersect, inputs)?;
            self.add(merge)?
        };

        for sub in &var.subqueries {
            self.build_var(&sub.query)?;
            let mut plan = self.pop()?;
            if sub.mode == SubQueryMode::Membership {
                plan = self.normalize(plan)?;
            }
            quals.push(Qualifier::SubQuery(SubQueryCheck::new(
                plan,
                sub.slot,
                sub.mode,
                sub.negate,
            )?));
        }

        let has_filter = var.predicate.is_some() || !quals.is_empty();
        if var.path.is_empty() {
            // Predicates read bodies, so access checks run before them.
            let resident = op.stream_props().has_resident(&var.props);
            if unchecked || has_filter || !resident {
                let load = LoadOp::new(self.ctx.clone(), op, var.props.clone())
                    .include_deleted(var.include_deleted);
                op = self.add(load)?;
            }
            if has_filter {
                let filter = FilterOp::new(self.ctx.clone(), op, var.predicate.clone(), quals);
                op = self.add(filter)?;
            }
        } else {
            if unchecked || has_filter {
                let load = LoadOp::new(self.ctx.clone(), op, Vec::new())
                    .include_deleted(var.include_deleted);
                op = self.add(load)?;
            }
            if has_filter {
                let filter = FilterOp::new(self.ctx.clone(), op, var.predicate.clone(), quals);
                op = self.add(filter)?;
            }
            let path = PathOp::new(self.ctx.clone(), op, var.path.clone())?;
            op = self.add(path)?;
            if !var.props.is_empty() {
                let load = LoadOp::new(self.ctx.clone(), op, var.props.clone());
                op = self.add(load)?;
            }
        }
        self.push(op);
        Ok(())
    }

    /// Identity sorted and duplicate free, inserting a Sort when needed.
    fn normalize(&mut self, op: Box<dyn Operator>) -> Result<Box<dyn Operator>> {
        let props = op.stream_props();
        if props.is_id_sorted() && props.unique {
            return Ok(op);
        }
        if op.width() != 1 {
            return Err(PinError::Invalid("set operation input must produce one slot"));
        }
        debug!(input = op.name(), "query.build.sort_by_id");
        let sort = SortOp::new(self.ctx.clone(), op, SortOrder::by_id(), true);
        self.add(sort)
    }

    /// Sort `op` on `order` unless it already is.
    fn ensure_sorted(&mut self, op: Box<dyn Operator>, order: SortOrder) -> Result<Box<dyn Operator>> {
        if op.stream_props().satisfies(&order) {
            return Ok(op);
        }
        debug!(input = op.name(), %order, "query.build.sort_for_join");
        let sort = SortOp::new(self.ctx.clone(), op, order, false);
        self.add(sort)
    }

    fn build_set_op(&mut self, var: &SetOpVar) -> Result<()> {
        for input in &var.inputs {
            self.build_var(input)?;
        }
        let mut inputs = Vec::with_capacity(var.inputs.len());
        for _ in &var.inputs {
            inputs.push(self.pop()?);
        }
        inputs.reverse();
        let inputs = inputs
            .into_iter()
            .map(|op| self.normalize(op))
            .collect::<Result<Vec<_>>>()?;
        debug!(kind = ?var.kind, inputs = inputs.len(), "query.build.set_op");
        let merge = MergeOp::new(self.ctx.clone(), var.kind, inputs)?;
        let op = self.add(merge)?;
        self.push(op);
        Ok(())
    }

    fn choose_join(var: &JoinVar, left: &dyn Operator, right: &dyn Operator) -> JoinStrategy {
        let outer = var.kind.keeps_left() || var.kind.keeps_right();
        if var.conds.is_empty() {
            return JoinStrategy::NestedLoop;
        }
        if var.kind == JoinKind::Semi && var.predicate.is_some() {
            return JoinStrategy::NestedLoop;
        }
        if outer && var.predicate.is_some() {
            return JoinStrategy::NestedLoop;
        }
        let left_ok =
            var.left.is_simple() || left.stream_props().satisfies(&JoinCond::left_order(&var.conds));
        let right_ok = var.right.is_simple()
            || right.stream_props().satisfies(&JoinCond::right_order(&var.conds));
        if left_ok && right_ok {
            return JoinStrategy::Merge;
        }
        if matches!(var.kind, JoinKind::Inner | JoinKind::Semi) && var.conds.len() == 1 {
            let cond = var.conds[0];
            let right_build = var.right.is_simple()
                && right.width() == 1
                && (cond.right_slot, cond.right) == (0, KeyRef::Id);
            let left_build = var.kind == JoinKind::Inner
                && var.left.is_simple()
                && left.width() == 1
                && (cond.left_slot, cond.left) == (0, KeyRef::Id);
            if right_build {
                return JoinStrategy::Hash(BuildSide::Right);
            }
            if left_build {
                return JoinStrategy::Hash(BuildSide::Left);
            }
        }
        JoinStrategy::NestedLoop
    }

    fn build_join(&mut self, var: &JoinVar) -> Result<()> {
        self.build_var(&var.left)?;
        self.build_var(&var.right)?;
        let right = self.pop()?;
        let left = self.pop()?;
        let strategy = Self::choose_join(var, left.as_ref(), right.as_ref());
        debug!(kind = ?var.kind, ?strategy, conds = var.conds.len(), "query.build.join");
        let op = match strategy {
            JoinStrategy::Merge => {
                // Left side is sorted first.
                let left = self.ensure_sorted(left, JoinCond::left_order(&var.conds))?;
                let right = self.ensure_sorted(right, JoinCond::right_order(&var.conds))?;
                let join = MergeJoinOp::new(self.ctx.clone(), var.kind, var.conds.clone(), left, right)?;
                self.add(join)?
            }
            JoinStrategy::Hash(side) => {
                let join = HashJoinOp::new(self.ctx.clone(), var.kind, side, var.conds[0], left, right)?;
                self.add(join)?
            }
            JoinStrategy::NestedLoop => {
                if var.kind.keeps_right() {
                    return Err(PinError::Invalid(
                        "right and full outer joins need a sortable equality key",
                    ));
                }
                let predicate = fold_conds(&var.conds, left.width(), var.predicate.clone());
                let join = NestedLoopOp::new(self.ctx.clone(), var.kind, left, right, predicate)?;
                self.add(join)?
            }
        };
        let op = match (&var.predicate, strategy) {
            (Some(predicate), JoinStrategy::Merge | JoinStrategy::Hash(_)) => {
                let filter = FilterOp::new(self.ctx.clone(), op, Some(predicate.clone()), Vec::new());
                self.add(filter)?
            }
            _ => op,
        };
        self.push(op);
        Ok(())
    }
}

/// The equality chain as a predicate over the combined row.
fn fold_conds(conds: &[JoinCond], left_width: usize, residual: Option<Expr>) -> Option<Expr> {
    let operand = |slot: usize, key: KeyRef| match key {
        KeyRef::Id => Operand::Id { slot },
        KeyRef::Prop(prop) => Operand::Prop { slot, prop },
    };
    let mut folded: Option<Expr> = None;
    for cond in conds {
        let eq = Expr::Cmp {
            op: CmpOp::Eq,
            lhs: operand(cond.left_slot, cond.left),
            rhs: operand(left_width + cond.right_slot, cond.right),
            nocase: cond.nocase,
        };
        folded = Some(match folded {
            Some(expr) => expr.and(eq),
            None => eq,
        });
    }
    match (folded, residual) {
        (Some(folded), Some(residual)) => Some(folded.and(residual)),
        (folded, residual) => folded.or(residual),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::query::config::QueryConfig;
    use crate::query::logical::SimpleVar;
    use crate::query::op::testutil::{drain, drain_ids, init_tracing};
    use crate::query::op::PathSeg;
    use crate::storage::{KeyRange, MemStore, PinRecord};
    use crate::types::{ClassId, PinId, PropId, Value};

    fn store() -> MemStore {
        let store = MemStore::new().with_index(2);
        for id in 1..=6u64 {
            let mut record = PinRecord::new(id)
                .with_class(if id % 2 == 0 { 1 } else { 2 })
                .with_prop(1, (id * 10) as i64)
                .with_prop(2, (id % 3) as i64);
            if id < 6 {
                record = record.with_prop(3, PinId(id + 1));
            }
            store.insert(record);
        }
        store
    }

    fn ctx(config: QueryConfig) -> QueryCtx {
        init_tracing();
        QueryCtx::builder(Arc::new(store())).config(config).build()
    }

    fn class(id: u32) -> SimpleVar {
        SimpleVar::default().source(SourceSpec::Class { class: ClassId(id) })
    }

    fn plan(var: &QueryVar) -> (Box<dyn Operator>, String) {
        let mut builder = BuildCtx::new(ctx(QueryConfig::default()));
        let op = builder.build(var).unwrap();
        let text = op.explain().render();
        (op, text)
    }

    #[test]
    fn indexed_condition_intersects_with_class_scan() {
        let var: QueryVar = class(1)
            .index_cond(PropId(2), KeyRange::eq(Value::Int(0)))
            .into();
        let (mut op, text) = plan(&var);
        assert!(text.starts_with("Intersect"), "{text}");
        assert!(text.contains("Sort"), "{text}");
        assert!(text.contains("IndexScan"), "{text}");
        assert_eq!(drain_ids(op.as_mut()), vec![6]);
    }

    #[test]
    fn unindexed_condition_becomes_range_qualifier() {
        let var: QueryVar = class(2)
            .index_cond(PropId(1), KeyRange::eq(Value::Int(30)))
            .props([PropId(1)])
            .into();
        let (mut op, text) = plan(&var);
        assert!(text.starts_with("Filter"), "{text}");
        assert!(text.contains("Load"), "{text}");
        assert_eq!(drain_ids(op.as_mut()), vec![3]);
    }

    #[test]
    fn path_suffix_orders_filter_before_path() {
        let var: QueryVar = SimpleVar::default()
            .source(SourceSpec::Ids { ids: vec![PinId(1)] })
            .filter(Expr::prop_eq(0, PropId(1), 10i64))
            .path(PathSeg::new(vec![PropId(3)], 1, 2))
            .props([PropId(1)])
            .into();
        let (mut op, text) = plan(&var);
        let lines: Vec<&str> = text.lines().map(str::trim).collect();
        assert!(lines[0].starts_with("Load"), "{text}");
        assert!(lines[1].starts_with("Path"), "{text}");
        assert!(lines[2].starts_with("Filter"), "{text}");
        assert_eq!(drain_ids(op.as_mut()), vec![2, 3]);
    }

    #[test]
    fn join_strategy_follows_input_shapes() {
        let by_ref = vec![JoinCond::new(KeyRef::Prop(PropId(3)), KeyRef::Id)];
        let merge = QueryVar::join(JoinKind::Inner, class(1).into(), class(2).into(), by_ref.clone());
        let (mut op, text) = plan(&merge);
        assert!(text.starts_with("MergeJoin"), "{text}");
        // PIN 6 has no reference and never matches.
        assert_eq!(
            drain(op.as_mut()),
            vec![vec![Some(2), Some(3)], vec![Some(4), Some(5)]]
        );

        let union = QueryVar::set_op(SetOpKind::Union, vec![class(1).into(), class(2).into()]);
        let hash = QueryVar::join(JoinKind::Semi, union.clone(), class(2).into(), by_ref.clone());
        let (mut op, text) = plan(&hash);
        assert!(text.starts_with("HashJoin"), "{text}");
        assert_eq!(drain_ids(op.as_mut()), vec![2, 4]);

        let theta = QueryVar::join(JoinKind::Inner, union.clone(), union, Vec::new()).with_join_predicate(
            Expr::Cmp {
                op: CmpOp::Gt,
                lhs: Operand::Prop { slot: 0, prop: PropId(1) },
                rhs: Operand::Lit(Value::Int(50)),
                nocase: false,
            },
        );
        let (mut op, text) = plan(&theta);
        assert!(text.starts_with("NestedLoop"), "{text}");
        assert_eq!(drain(op.as_mut()).len(), 6);
    }

    #[test]
    fn outer_join_without_sortable_inputs_is_rejected() {
        let union = QueryVar::set_op(SetOpKind::Union, vec![class(1).into()]);
        let var = QueryVar::join(JoinKind::FullOuter, union.clone(), union, Vec::new());
        let mut builder = BuildCtx::new(ctx(QueryConfig::default()));
        assert!(matches!(builder.build(&var), Err(PinError::Invalid(_))));
    }

    #[test]
    fn operator_budget_is_enforced() {
        let var = QueryVar::set_op(
            SetOpKind::Union,
            vec![class(1).into(), class(2).into(), class(1).into()],
        );
        let mut builder = BuildCtx::new(ctx(QueryConfig::default().with_max_operators(3)));
        assert!(matches!(
            builder.build(&var),
            Err(PinError::TooManyOperators { limit: 3 })
        ));
        let mut roomy = BuildCtx::new(ctx(QueryConfig::default().with_max_operators(4)));
        let mut op = roomy.build(&var).unwrap();
        assert_eq!(drain_ids(op.as_mut()), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn membership_subquery_filters_outer_rows() {
        let inner: QueryVar = SimpleVar::default()
            .index_cond(PropId(2), KeyRange::eq(Value::Int(1)))
            .into();
        let var: QueryVar = class(2).subquery(inner.clone(), SubQueryMode::Membership, false).into();
        let (mut op, _) = plan(&var);
        assert_eq!(drain_ids(op.as_mut()), vec![1]);
        let negated: QueryVar = class(2).subquery(inner, SubQueryMode::Membership, true).into();
        let (mut op, _) = plan(&negated);
        assert_eq!(drain_ids(op.as_mut()), vec![3, 5]);
    }
}
