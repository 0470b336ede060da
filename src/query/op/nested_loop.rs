use crate::query::context::QueryCtx;
use crate::query::explain::ExplainNode;
use crate::query::expr::Expr;
use crate::query::op::merge_join::JoinKind;
use crate::query::op::{fetch_slot_props, new_row, pull, split_slots, OpBase, Operator, SlotSpec, Step, StreamProps};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::storage::PinHandle;
use crate::types::{PinError, PinId, PropId, Result};

/// Rescans the right input for every left row and keeps the pairs the
/// predicate accepts.
pub struct NestedLoopOp {
    base: OpBase,
    kind: JoinKind,
    left: Box<dyn Operator>,
    right: Box<dyn Operator>,
    predicate: Option<Expr>,
    needed: Vec<(usize, PropId)>,
    pair: Vec<PinHandle>,
    left_width: usize,
    left_ready: bool,
    matched: bool,
}

impl NestedLoopOp {
    /// Joins `left` with `right`. The predicate sees the combined row: left
    /// slots first, then right slots.
    pub fn new(
        ctx: QueryCtx,
        kind: JoinKind,
        left: Box<dyn Operator>,
        right: Box<dyn Operator>,
        predicate: Option<Expr>,
    ) -> Result<Self> {
        if !matches!(kind, JoinKind::Inner | JoinKind::Semi | JoinKind::LeftOuter) {
            return Err(PinError::Invalid("nested loop supports inner, semi and left joins"));
        }
        let left_width = left.width();
        let total = left_width + right.width();
        if predicate
            .as_ref()
            .and_then(Expr::max_slot)
            .is_some_and(|slot| slot >= total)
        {
            return Err(PinError::Invalid("predicate slot outside result row"));
        }
        let needed = predicate.as_ref().map(Expr::needed_props).unwrap_or_default();
        Ok(Self {
            base: OpBase::new(ctx),
            kind,
            left,
            right,
            predicate,
            needed,
            pair: new_row(total),
            left_width,
            left_ready: false,
            matched: false,
        })
    }

    /// Positions on the next left row with its predicate properties resident.
    fn advance_left(&mut self) -> Result<Step> {
        let lw = self.left_width;
        loop {
            self.base.tick()?;
            if pull(self.left.as_mut(), &mut self.pair[..lw], None)? == Step::Eof {
                return Ok(Step::Eof);
            }
            match fetch_slot_props(self.left.as_mut(), &mut self.pair, 0, &self.needed) {
                Ok(()) => {}
                Err(err) if err.is_row_level() => continue,
                Err(err) => return Err(err),
            }
            self.right.rewind()?;
            self.left_ready = true;
            self.matched = false;
            return Ok(Step::Row);
        }
    }

    fn next_inner(&mut self, out: &mut [PinHandle]) -> Result<Step> {
        let lw = self.left_width;
        loop {
            self.base.tick()?;
            if !self.left_ready && self.advance_left()? == Step::Eof {
                return Ok(Step::Eof);
            }
            if pull(self.right.as_mut(), &mut self.pair[lw..], None)? == Step::Eof {
                self.left_ready = false;
                if self.kind == JoinKind::LeftOuter && !self.matched {
                    for slot in &mut self.pair[lw..] {
                        slot.clear();
                    }
                    out.clone_from_slice(&self.pair);
                    return Ok(Step::Row);
                }
                continue;
            }
            match fetch_slot_props(self.right.as_mut(), &mut self.pair, lw, &self.needed) {
                Ok(()) => {}
                Err(err) if err.is_row_level() => continue,
                Err(err) => return Err(err),
            }
            let accepted = match &self.predicate {
                Some(predicate) => predicate.eval(&self.pair, self.base.ctx())?,
                None => true,
            };
            if !accepted {
                continue;
            }
            self.matched = true;
            if self.kind == JoinKind::Semi {
                self.left_ready = false;
                out.clone_from_slice(&self.pair[..lw]);
            } else {
                out.clone_from_slice(&self.pair);
            }
            return Ok(Step::Row);
        }
    }
}

impl Operator for NestedLoopOp {
    fn name(&self) -> &'static str {
        "NestedLoop"
    }

    fn width(&self) -> usize {
        let right = self.pair.len() - self.left_width;
        self.kind.width(self.left_width, right)
    }

    fn ctx(&self) -> &QueryCtx {
        self.base.ctx()
    }

    fn connect(&mut self, slots: &[SlotSpec]) -> Result<()> {
        self.base.bind(slots, self.width())?;
        let (left, right) = split_slots(slots, self.left_width, self.pair.len());
        self.left.connect(&left)?;
        self.right.connect(&right)
    }

    fn next(&mut self, out: &mut [PinHandle], _hint: Option<PinId>) -> Result<Step> {
        if self.base.is_exhausted() {
            return Ok(Step::Eof);
        }
        let timer = profile_timer();
        let step = self.next_inner(out);
        record_profile_timer(QueryProfileKind::NestedLoop, timer);
        self.base.finish(step)
    }

    fn rewind(&mut self) -> Result<()> {
        self.left.rewind()?;
        self.left_ready = false;
        self.matched = false;
        self.base.reset();
        Ok(())
    }

    fn stream_props(&self) -> StreamProps {
        let left = self.left.stream_props();
        StreamProps {
            unique: self.kind == JoinKind::Semi && left.unique,
            ..left
        }
    }

    fn explain(&self) -> ExplainNode {
        let kind = match self.kind {
            JoinKind::Semi => "semi",
            JoinKind::LeftOuter => "left",
            _ => "inner",
        };
        let mut node = ExplainNode::new(self.name()).prop("kind", kind);
        if let Some(predicate) = &self.predicate {
            node = node.literal("predicate", predicate);
        }
        node.input(self.left.explain()).input(self.right.explain())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::config::QueryConfig;
    use crate::query::context::Session;
    use crate::query::expr::{CmpOp, Operand};
    use crate::query::op::testutil::*;
    use std::sync::Arc;

    fn less_than() -> Expr {
        Expr::Cmp {
            op: CmpOp::Lt,
            lhs: Operand::Prop { slot: 0, prop: PropId(1) },
            rhs: Operand::Prop { slot: 1, prop: PropId(1) },
            nocase: false,
        }
    }

    fn join(kind: JoinKind, left: &[u64], right: &[u64], predicate: Option<Expr>) -> NestedLoopOp {
        let ctx = ctx_for(numbered_store(5));
        NestedLoopOp::new(ctx.clone(), kind, ids(&ctx, left), ids(&ctx, right), predicate).unwrap()
    }

    #[test]
    fn inner_evaluates_predicate_over_combined_row() {
        let mut op = join(JoinKind::Inner, &[1, 2], &[1, 2, 3], Some(less_than()));
        assert_eq!(
            drain(&mut op),
            vec![
                vec![Some(1), Some(2)],
                vec![Some(1), Some(3)],
                vec![Some(2), Some(3)],
            ]
        );
    }

    #[test]
    fn without_predicate_is_a_cross_product() {
        let mut op = join(JoinKind::Inner, &[1, 2], &[3, 4, 5], None);
        assert_eq!(drain(&mut op).len(), 6);
        op.rewind().unwrap();
        assert_eq!(op.count(10).unwrap(), 6);
    }

    #[test]
    fn semi_emits_each_left_row_once() {
        let mut op = join(JoinKind::Semi, &[1, 2, 3], &[2, 3], Some(less_than()));
        assert_eq!(op.width(), 1);
        assert_eq!(drain_ids(&mut op), vec![1, 2]);
    }

    #[test]
    fn left_outer_pads_unmatched_rows() {
        let mut op = join(JoinKind::LeftOuter, &[1, 3], &[2], Some(less_than()));
        assert_eq!(
            drain(&mut op),
            vec![vec![Some(1), Some(2)], vec![Some(3), None]]
        );
    }

    #[test]
    fn rejects_out_of_range_predicate_and_outer_kinds() {
        let ctx = ctx_for(numbered_store(2));
        let wide = Expr::IsNull(Operand::Prop { slot: 2, prop: PropId(1) });
        assert!(NestedLoopOp::new(ctx.clone(), JoinKind::Inner, ids(&ctx, &[1]), ids(&ctx, &[2]), Some(wide)).is_err());
        assert!(NestedLoopOp::new(ctx.clone(), JoinKind::FullOuter, ids(&ctx, &[1]), ids(&ctx, &[2]), None).is_err());
    }

    #[test]
    fn abort_stops_the_loop() {
        let session = Session::new(7);
        let ctx = QueryCtx::builder(Arc::new(numbered_store(3)))
            .session(session.clone())
            .config(QueryConfig::default().with_abort_poll_interval(1))
            .build();
        let mut op =
            NestedLoopOp::new(ctx.clone(), JoinKind::Inner, ids(&ctx, &[1, 2]), ids(&ctx, &[1, 2]), None).unwrap();
        op.connect(&[SlotSpec::default(), SlotSpec::default()]).unwrap();
        let mut row = new_row(2);
        assert_eq!(op.next(&mut row, None).unwrap(), Step::Row);
        session.abort();
        assert!(matches!(op.next(&mut row, None), Err(PinError::Aborted)));
        assert_eq!(op.next(&mut row, None).unwrap(), Step::Eof);
    }
}
