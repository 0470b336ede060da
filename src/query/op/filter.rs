use serde::{Deserialize, Serialize};

use crate::query::context::QueryCtx;
use crate::query::explain::ExplainNode;
use crate::query::expr::Expr;
use crate::query::op::{cleanup_row, fetch_slot_props, new_row, OpBase, Operator, SlotSpec, Step, StreamProps};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::storage::{KeyRange, PinHandle};
use crate::types::{PinError, PinId, PropId, Result, Value};

/// How a correlated sub-query relates to the outer row.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubQueryMode {
    /// The outer identity appears in the sub-query result.
    Membership,
    /// Some sub-query row references the outer identity through `prop`.
    RefersTo(PropId),
}

/// Correlated check against a rewindable sub-plan.
pub struct SubQueryCheck {
    plan: Box<dyn Operator>,
    slot: usize,
    mode: SubQueryMode,
    negate: bool,
    scratch: Vec<PinHandle>,
}

impl SubQueryCheck {
    /// Checks the identity in `slot` of every outer row against `plan`.
    ///
    /// Membership checks need `plan` sorted by identity.
    pub fn new(plan: Box<dyn Operator>, slot: usize, mode: SubQueryMode, negate: bool) -> Result<Self> {
        if plan.width() != 1 {
            return Err(PinError::Invalid("sub-query must produce one slot"));
        }
        if mode == SubQueryMode::Membership && !plan.stream_props().is_id_sorted() {
            return Err(PinError::Invalid("membership sub-query must be identity sorted"));
        }
        Ok(Self {
            plan,
            slot,
            mode,
            negate,
            scratch: new_row(1),
        })
    }

    fn holds(&mut self, row: &[PinHandle]) -> Result<bool> {
        let Some(id) = row.get(self.slot).and_then(PinHandle::id) else {
            return Ok(self.negate);
        };
        self.plan.rewind()?;
        let found = match self.mode {
            SubQueryMode::Membership => loop {
                match self.plan.next(&mut self.scratch, Some(id))? {
                    Step::Eof => break false,
                    Step::Row => match self.scratch[0].id() {
                        Some(found) if found == id => break true,
                        Some(found) if found > id => break false,
                        _ => {}
                    },
                }
            },
            SubQueryMode::RefersTo(prop) => loop {
                match self.plan.next(&mut self.scratch, None)? {
                    Step::Eof => break false,
                    Step::Row => {
                        let mut handle = std::mem::take(&mut self.scratch[0]);
                        let fetched = self.plan.get_data(&mut handle, &[prop]);
                        self.scratch[0] = handle;
                        match fetched {
                            Ok(()) => {}
                            Err(err) if err.is_row_level() => continue,
                            Err(err) => return Err(err),
                        }
                        if refers_to(self.scratch[0].prop(prop), id) {
                            break true;
                        }
                    }
                }
            },
        };
        cleanup_row(&mut self.scratch);
        Ok(found != self.negate)
    }

    fn explain(&self) -> ExplainNode {
        let mode = match self.mode {
            SubQueryMode::Membership => "membership".to_string(),
            SubQueryMode::RefersTo(prop) => format!("refers_to p{prop}"),
        };
        ExplainNode::new("SubQuery")
            .prop("slot", self.slot)
            .prop("mode", mode)
            .prop("negate", self.negate)
            .input(self.plan.explain())
    }
}

fn refers_to(value: Option<&Value>, id: PinId) -> bool {
    match value {
        Some(Value::Ref(target)) => *target == id,
        Some(Value::Coll(items)) => items.iter().any(|item| item.as_ref_id() == Some(id)),
        _ => false,
    }
}

/// Extra row conditions carried by a Filter besides its predicate.
pub enum Qualifier {
    /// Index condition that could not be served by an index scan.
    Range {
        /// Result slot tested.
        slot: usize,
        /// Property tested.
        prop: PropId,
        /// Accepted values.
        range: KeyRange,
    },
    /// Correlated sub-query check.
    SubQuery(SubQueryCheck),
}

impl Qualifier {
    fn needed(&self, out: &mut Vec<(usize, PropId)>) {
        if let Qualifier::Range { slot, prop, .. } = self {
            if !out.contains(&(*slot, *prop)) {
                out.push((*slot, *prop));
            }
        }
    }

    fn holds(&mut self, row: &[PinHandle]) -> Result<bool> {
        match self {
            Qualifier::Range { slot, prop, range } => {
                let Some(handle) = row.get(*slot) else {
                    return Err(PinError::Invalid("qualifier slot outside result row"));
                };
                match handle.prop(*prop) {
                    Some(Value::Coll(items)) => {
                        for item in items {
                            if range.contains(item)? {
                                return Ok(true);
                            }
                        }
                        Ok(false)
                    }
                    Some(value) => range.contains(value),
                    None => Ok(false),
                }
            }
            Qualifier::SubQuery(check) => check.holds(row),
        }
    }

    fn explain_into(&self, node: ExplainNode) -> ExplainNode {
        match self {
            Qualifier::Range { slot, prop, range } => {
                node.literal(format!("range ${slot}.p{prop}"), range.describe())
            }
            Qualifier::SubQuery(check) => node.input(check.explain()),
        }
    }
}

/// Passes rows satisfying a predicate and every qualifier.
pub struct FilterOp {
    base: OpBase,
    child: Box<dyn Operator>,
    expr: Option<Expr>,
    quals: Vec<Qualifier>,
    needed: Vec<(usize, PropId)>,
}

impl FilterOp {
    /// Filter over `child`.
    pub fn new(ctx: QueryCtx, child: Box<dyn Operator>, expr: Option<Expr>, quals: Vec<Qualifier>) -> Self {
        let mut needed = expr.as_ref().map(Expr::needed_props).unwrap_or_default();
        for qual in &quals {
            qual.needed(&mut needed);
        }
        Self {
            base: OpBase::new(ctx),
            child,
            expr,
            quals,
            needed,
        }
    }

    fn accept(&mut self, out: &mut [PinHandle]) -> Result<bool> {
        fetch_slot_props(self.child.as_mut(), out, 0, &self.needed)?;
        for qual in &mut self.quals {
            if !qual.holds(out)? {
                return Ok(false);
            }
        }
        match &self.expr {
            Some(expr) => expr.eval(out, self.base.ctx()),
            None => Ok(true),
        }
    }

    fn next_inner(&mut self, out: &mut [PinHandle], hint: Option<PinId>) -> Result<Step> {
        loop {
            self.base.tick()?;
            if self.child.next(out, hint)? == Step::Eof {
                return Ok(Step::Eof);
            }
            match self.accept(out) {
                Ok(true) => return Ok(Step::Row),
                Ok(false) => {}
                Err(err) if err.is_row_level() => {}
                Err(err) => return Err(err),
            }
        }
    }
}

impl Operator for FilterOp {
    fn name(&self) -> &'static str {
        "Filter"
    }

    fn width(&self) -> usize {
        self.child.width()
    }

    fn ctx(&self) -> &QueryCtx {
        self.base.ctx()
    }

    fn connect(&mut self, slots: &[SlotSpec]) -> Result<()> {
        if let Some(max) = self.expr.as_ref().and_then(Expr::max_slot) {
            if max >= self.width() {
                return Err(PinError::Invalid("predicate slot outside result row"));
            }
        }
        self.base.bind(slots, self.width())?;
        self.child.connect(slots)?;
        for qual in &mut self.quals {
            if let Qualifier::SubQuery(check) = qual {
                check.plan.connect(&[SlotSpec::default()])?;
            }
        }
        Ok(())
    }

    fn next(&mut self, out: &mut [PinHandle], hint: Option<PinId>) -> Result<Step> {
        if self.base.is_exhausted() {
            return Ok(Step::Eof);
        }
        let timer = profile_timer();
        let step = self.next_inner(out, hint);
        record_profile_timer(QueryProfileKind::Filter, timer);
        self.base.finish(step)
    }

    fn rewind(&mut self) -> Result<()> {
        self.child.rewind()?;
        self.base.reset();
        Ok(())
    }

    fn get_data(&mut self, handle: &mut PinHandle, props: &[PropId]) -> Result<()> {
        self.child.get_data(handle, props)
    }

    fn unique(&mut self, on: bool) {
        self.child.unique(on);
    }

    fn reverse(&mut self) {
        self.child.reverse();
    }

    fn stream_props(&self) -> StreamProps {
        let mut props = self.child.stream_props();
        for (slot, prop) in &self.needed {
            if *slot == 0 && !props.resident.contains(prop) {
                props.resident.push(*prop);
            }
        }
        props
    }

    fn explain(&self) -> ExplainNode {
        let mut node = ExplainNode::new(self.name());
        if let Some(expr) = &self.expr {
            node = node.literal("predicate", expr);
        }
        for qual in &self.quals {
            node = qual.explain_into(node);
        }
        // Sub-query plans are appended after the filtered input.
        let mut inputs = vec![self.child.explain()];
        inputs.append(&mut node.inputs);
        node.inputs = inputs;
        node
    }
}
