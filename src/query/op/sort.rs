use std::cmp::Ordering;

use crate::query::context::QueryCtx;
use crate::query::explain::ExplainNode;
use crate::query::op::{fetch_slot_props, new_row, OpBase, Operator, SlotSpec, Step, StreamProps};
use crate::query::order::SortOrder;
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::storage::PinHandle;
use crate::types::{PinError, PinId, PropId, Result};

/// Drains its child, then replays the rows in `order`.
pub struct SortOp {
    base: OpBase,
    child: Box<dyn Operator>,
    order: SortOrder,
    dedup: bool,
    rows: Vec<Vec<PinHandle>>,
    pos: usize,
    filled: bool,
}

impl SortOp {
    /// Sorts `child` by `order`; with `dedup` rows with identical slot
    /// identities collapse into one.
    pub fn new(ctx: QueryCtx, child: Box<dyn Operator>, order: SortOrder, dedup: bool) -> Self {
        Self {
            base: OpBase::new(ctx),
            child,
            order,
            dedup,
            rows: Vec::new(),
            pos: 0,
            filled: false,
        }
    }

    fn fill(&mut self) -> Result<()> {
        let limit = self.base.ctx().config().sort_limit;
        let needed = self.order.props();
        let width = self.child.width();
        let mut row = new_row(width);
        loop {
            self.base.tick()?;
            if self.child.next(&mut row, None)? == Step::Eof {
                break;
            }
            match fetch_slot_props(self.child.as_mut(), &mut row, 0, &needed) {
                Ok(()) => {}
                Err(err) if err.is_row_level() => continue,
                Err(err) => return Err(err),
            }
            if self.rows.len() >= limit {
                return Err(PinError::ResourceLimit("sort buffer"));
            }
            self.rows.push(std::mem::replace(&mut row, new_row(width)));
        }
        let order = &self.order;
        // Stable, so equal keys keep arrival order.
        self.rows.sort_by(|a, b| order.compare_rows(a, b));
        if self.dedup {
            self.rows.dedup_by(|a, b| {
                order.compare_rows(a, b) == Ordering::Equal && same_identities(a, b)
            });
        }
        self.filled = true;
        Ok(())
    }

    fn next_inner(&mut self, out: &mut [PinHandle], hint: Option<PinId>) -> Result<Step> {
        if !self.filled {
            self.fill()?;
        }
        if let Some(hint) = hint.filter(|_| self.order.is_id_asc()) {
            let rest = &self.rows[self.pos..];
            self.pos += rest.partition_point(|row| row[0].id().is_some_and(|id| id < hint));
        }
        let Some(row) = self.rows.get(self.pos) else {
            return Ok(Step::Eof);
        };
        self.pos += 1;
        out.clone_from_slice(row);
        Ok(Step::Row)
    }
}

fn same_identities(a: &[PinHandle], b: &[PinHandle]) -> bool {
    a.iter().zip(b).all(|(x, y)| x.id() == y.id())
}

impl Operator for SortOp {
    fn name(&self) -> &'static str {
        "Sort"
    }

    fn width(&self) -> usize {
        self.child.width()
    }

    fn ctx(&self) -> &QueryCtx {
        self.base.ctx()
    }

    fn connect(&mut self, slots: &[SlotSpec]) -> Result<()> {
        self.base.bind(slots, self.width())?;
        self.child.connect(slots)
    }

    fn next(&mut self, out: &mut [PinHandle], hint: Option<PinId>) -> Result<Step> {
        if self.base.is_exhausted() {
            return Ok(Step::Eof);
        }
        let timer = profile_timer();
        let step = self.next_inner(out, hint);
        record_profile_timer(QueryProfileKind::Sort, timer);
        self.base.finish(step)
    }

    fn rewind(&mut self) -> Result<()> {
        // The buffer is replayed; the child is not drained again.
        self.pos = 0;
        self.base.reset();
        Ok(())
    }

    fn count(&mut self, limit: u64) -> Result<u64> {
        if !self.filled {
            self.fill()?;
        }
        let remaining = self.rows.len().saturating_sub(self.pos) as u64;
        self.pos = self.rows.len();
        self.base.mark_exhausted();
        if remaining > limit {
            return Err(PinError::Timeout);
        }
        Ok(remaining)
    }

    fn get_data(&mut self, handle: &mut PinHandle, props: &[PropId]) -> Result<()> {
        self.child.get_data(handle, props)
    }

    fn unique(&mut self, on: bool) {
        if self.base.is_fresh() && !self.filled {
            self.dedup = self.dedup || on;
        }
    }

    fn stream_props(&self) -> StreamProps {
        let mut resident = self.child.stream_props().resident;
        for (slot, prop) in self.order.props() {
            if slot == 0 && !resident.contains(&prop) {
                resident.push(prop);
            }
        }
        StreamProps {
            unique: self.dedup && self.width() == 1 && self.order.is_id_asc(),
            order: Some(self.order.clone()),
            resident,
        }
    }

    fn explain(&self) -> ExplainNode {
        ExplainNode::new(self.name())
            .prop("order", &self.order)
            .prop("dedup", self.dedup)
            .input(self.child.explain())
    }
}
