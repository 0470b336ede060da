//! Streaming operator contract and the shared per-operator state.
//!
//! Operators are pulled one row at a time: the caller owns a slice of
//! [`PinHandle`] slots of length [`Operator::width`] and every successful
//! [`Operator::next`] fills it. Rows rejected by the lock manager or the ACL
//! are absorbed by the operator that detects them; every other error
//! propagates and leaves the operator exhausted until [`Operator::rewind`].

mod filter;
mod hash_join;
mod load;
mod merge;
mod merge_join;
mod nested_loop;
mod path;
mod scan;
mod sort;

pub use filter::{FilterOp, Qualifier, SubQueryCheck, SubQueryMode};
pub use hash_join::{BuildSide, HashJoinOp};
pub use load::LoadOp;
pub use merge::{MergeOp, SetOpKind};
pub use merge_join::{JoinCond, JoinKind, KeyRef, MergeJoinOp, SpillRecord};
pub use nested_loop::NestedLoopOp;
pub use path::{PathOp, PathSeg};
pub use scan::{ScanOp, ScanSource};
pub use sort::SortOp;

use crate::query::context::{AbortPoll, QueryCtx};
use crate::query::explain::ExplainNode;
use crate::query::order::SortOrder;
use crate::storage::{Cardinality, Intent, PinHandle};
use crate::types::{PinError, PinId, PropId, Result};

/// Outcome of one [`Operator::next`] call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[must_use]
pub enum Step {
    /// The output slots hold a row.
    Row,
    /// End of stream; sticky until rewind.
    Eof,
}

/// Properties a consumer wants resident in one result slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlotSpec {
    /// Requested properties.
    pub props: Vec<PropId>,
    /// Access intent for the slot's body.
    pub intent: Intent,
}

impl SlotSpec {
    /// Slot requesting `props` for reading.
    pub fn with_props(props: impl Into<Vec<PropId>>) -> Self {
        Self {
            props: props.into(),
            intent: Intent::Read,
        }
    }
}

/// Ordering and residency guarantees advertised by an operator's output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamProps {
    /// Order of the output rows, if any.
    pub order: Option<SortOrder>,
    /// No two rows share the slot-0 identity.
    pub unique: bool,
    /// Properties guaranteed resident in slot 0.
    pub resident: Vec<PropId>,
}

impl StreamProps {
    /// No guarantees.
    pub fn unordered() -> Self {
        Self::default()
    }

    /// Identity ascending, duplicate free.
    pub fn id_sorted() -> Self {
        Self {
            order: Some(SortOrder::by_id()),
            unique: true,
            resident: Vec::new(),
        }
    }

    /// Returns true when the stream is sorted in `required` order.
    pub fn satisfies(&self, required: &SortOrder) -> bool {
        self.order
            .as_ref()
            .is_some_and(|order| order.satisfies(required))
    }

    /// Identity ascending on slot 0.
    pub fn is_id_sorted(&self) -> bool {
        self.order.as_ref().is_some_and(SortOrder::is_id_asc)
    }

    /// Returns true when every property in `props` is resident in slot 0.
    pub fn has_resident(&self, props: &[PropId]) -> bool {
        props.iter().all(|prop| self.resident.contains(prop))
    }
}

/// Lifecycle state held by [`OpBase`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpState {
    /// Never pulled.
    Uninit,
    /// Positioned before the first row.
    BeforeFirst,
    /// Positioned on a row.
    OnRow,
    /// End of stream or failure; sticky until rewind.
    Exhausted,
}

/// State shared by every operator: context, lifecycle, abort polling and
/// the slot binding received through [`Operator::connect`].
pub struct OpBase {
    ctx: QueryCtx,
    state: OpState,
    poll: AbortPoll,
    slots: Vec<SlotSpec>,
}

impl OpBase {
    /// Fresh state over `ctx`.
    pub fn new(ctx: QueryCtx) -> Self {
        Self {
            ctx,
            state: OpState::Uninit,
            poll: AbortPoll::default(),
            slots: Vec::new(),
        }
    }

    /// Shared query context.
    pub fn ctx(&self) -> &QueryCtx {
        &self.ctx
    }

    /// Current lifecycle state.
    pub fn state(&self) -> OpState {
        self.state
    }

    /// Returns true before the first pull since construction or rewind.
    pub fn is_fresh(&self) -> bool {
        matches!(self.state, OpState::Uninit | OpState::BeforeFirst)
    }

    /// Returns true once the stream ended or failed.
    pub fn is_exhausted(&self) -> bool {
        self.state == OpState::Exhausted
    }

    /// Records the outcome of a pull. Row-level errors leave the state
    /// untouched so the caller may pull again; anything else is sticky.
    pub fn finish(&mut self, outcome: Result<Step>) -> Result<Step> {
        match &outcome {
            Ok(Step::Row) => self.state = OpState::OnRow,
            Ok(Step::Eof) => self.state = OpState::Exhausted,
            Err(err) if err.is_row_level() => {}
            Err(_) => self.state = OpState::Exhausted,
        }
        outcome
    }

    /// Ends the stream without going through [`OpBase::finish`].
    pub fn mark_exhausted(&mut self) {
        self.state = OpState::Exhausted;
    }

    /// Back to [`OpState::BeforeFirst`].
    pub fn reset(&mut self) {
        self.state = OpState::BeforeFirst;
    }

    /// Polls the abort flag every configured number of iterations.
    pub fn tick(&mut self) -> Result<()> {
        self.poll.tick(&self.ctx)
    }

    /// Validates and stores a slot binding of `width` slots.
    pub fn bind(&mut self, slots: &[SlotSpec], width: usize) -> Result<()> {
        if slots.len() != width {
            return Err(PinError::Invalid("slot binding does not match operator width"));
        }
        self.slots = slots.to_vec();
        Ok(())
    }

    /// Slot binding received through connect.
    pub fn slots(&self) -> &[SlotSpec] {
        &self.slots
    }
}

/// A physical operator in a pull-based tree.
pub trait Operator {
    /// Short operator name used by explain output.
    fn name(&self) -> &'static str;

    /// Number of result slots produced per row.
    fn width(&self) -> usize {
        1
    }

    /// Shared query context.
    fn ctx(&self) -> &QueryCtx;

    /// Binds the requested per-slot properties once per query and checks
    /// the row arity; propagates to children.
    fn connect(&mut self, slots: &[SlotSpec]) -> Result<()>;

    /// Produces the next row into `out`.
    ///
    /// `hint` is the smallest identity the caller still cares about;
    /// identity-ordered operators may jump ahead to it.
    fn next(&mut self, out: &mut [PinHandle], hint: Option<PinId>) -> Result<Step>;

    /// Restarts the stream from the beginning.
    fn rewind(&mut self) -> Result<()>;

    /// Rows remaining; more than `limit` rows yields [`PinError::Timeout`].
    fn count(&mut self, limit: u64) -> Result<u64> {
        let mut row = new_row(self.width());
        let mut poll = AbortPoll::default();
        let mut rows = 0u64;
        loop {
            poll.tick(self.ctx())?;
            match self.next(&mut row, None)? {
                Step::Row => {
                    rows += 1;
                    if rows > limit {
                        return Err(PinError::Timeout);
                    }
                    cleanup_row(&mut row);
                }
                Step::Eof => return Ok(rows),
            }
        }
    }

    /// Loads `props` into `handle` if they are not resident yet.
    fn get_data(&mut self, handle: &mut PinHandle, props: &[PropId]) -> Result<()> {
        load_props(self.ctx(), handle, props)
    }

    /// Advisory: the consumer only needs distinct rows.
    fn unique(&mut self, _on: bool) {}

    /// Advisory: the consumer prefers descending order.
    fn reverse(&mut self) {}

    /// Discards up to `n` rows, returning how many were skipped.
    fn skip(&mut self, n: u64) -> Result<u64> {
        let mut row = new_row(self.width());
        let mut poll = AbortPoll::default();
        let mut skipped = 0;
        while skipped < n {
            poll.tick(self.ctx())?;
            match self.next(&mut row, None)? {
                Step::Row => {
                    skipped += 1;
                    cleanup_row(&mut row);
                }
                Step::Eof => break,
            }
        }
        Ok(skipped)
    }

    /// Guarantees of the output stream.
    fn stream_props(&self) -> StreamProps;

    /// Explain tree rooted at this operator.
    fn explain(&self) -> ExplainNode;
}

/// Result row of `width` empty slots.
pub fn new_row(width: usize) -> Vec<PinHandle> {
    vec![PinHandle::empty(); width]
}

/// Drops loaded state from every slot between rows.
pub fn cleanup_row(row: &mut [PinHandle]) {
    for slot in row {
        slot.cleanup();
    }
}

/// Loads the body (once) and every missing property of `props`.
pub(crate) fn load_props(ctx: &QueryCtx, handle: &mut PinHandle, props: &[PropId]) -> Result<()> {
    if handle.is_empty() {
        return Ok(());
    }
    let missing = handle.missing(props);
    if missing.is_empty() {
        return Ok(());
    }
    let store = ctx.store();
    if !handle.body_loaded() {
        store.load_body(handle, Intent::Read)?;
    }
    for prop in missing {
        let value = store.get_property(handle, prop, Cardinality::All)?;
        handle.set_prop(prop, value);
    }
    Ok(())
}

/// Pulls from `child`, skipping rows whose row-level failure surfaced.
pub(crate) fn pull(
    child: &mut dyn Operator,
    row: &mut [PinHandle],
    hint: Option<PinId>,
) -> Result<Step> {
    loop {
        match child.next(row, hint) {
            Err(err) if err.is_row_level() => {
                cleanup_row(row);
                continue;
            }
            other => return other,
        }
    }
}

/// Fetches the listed `(slot, prop)` pairs through `child` for a row it
/// produced at `offset` in `row`.
pub(crate) fn fetch_slot_props(
    child: &mut dyn Operator,
    row: &mut [PinHandle],
    offset: usize,
    needed: &[(usize, PropId)],
) -> Result<()> {
    let width = child.width();
    for (slot, prop) in needed {
        if *slot < offset || *slot >= offset + width {
            continue;
        }
        let handle = &mut row[*slot];
        if handle.prop(*prop).is_none() {
            child.get_data(handle, std::slice::from_ref(prop))?;
        }
    }
    Ok(())
}

/// Splits a slot binding at `at`, padding missing entries with defaults.
pub(crate) fn split_slots(slots: &[SlotSpec], at: usize, total: usize) -> (Vec<SlotSpec>, Vec<SlotSpec>) {
    let mut all: Vec<SlotSpec> = slots.to_vec();
    all.resize(total, SlotSpec::default());
    let right = all.split_off(at);
    (all, right)
}
