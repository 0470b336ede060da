//! Two-way equi-join over inputs sorted on the join key.
//!
//! Right rows sharing a key are captured into a spill buffer of
//! [`SpillRecord`]s once, then replayed for every left row carrying the same
//! key. The buffer is bounded by [`QueryConfig::spill_limit`] and released as
//! soon as the left side moves past the key.
//!
//! [`QueryConfig::spill_limit`]: crate::query::QueryConfig::spill_limit

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::query::context::QueryCtx;
use crate::query::explain::ExplainNode;
use crate::query::op::{new_row, pull, split_slots, OpBase, Operator, SlotSpec, Step, StreamProps};
use crate::query::order::{SortKey, SortOrder};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::storage::PinHandle;
use crate::types::{PinError, PinId, PropId, Result, Value};

/// Join flavor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    /// Matching pairs.
    Inner,
    /// Left rows with at least one match; left slots only.
    Semi,
    /// Matching pairs plus unmatched left rows.
    LeftOuter,
    /// Matching pairs plus unmatched right rows.
    RightOuter,
    /// Matching pairs plus unmatched rows of both sides.
    FullOuter,
}

impl JoinKind {
    /// Unmatched left rows are emitted with an empty right side.
    pub fn keeps_left(self) -> bool {
        matches!(self, JoinKind::LeftOuter | JoinKind::FullOuter)
    }

    /// Unmatched right rows are emitted with an empty left side.
    pub fn keeps_right(self) -> bool {
        matches!(self, JoinKind::RightOuter | JoinKind::FullOuter)
    }

    /// Result width for inputs of `left` and `right` slots.
    pub fn width(self, left: usize, right: usize) -> usize {
        match self {
            JoinKind::Semi => left,
            _ => left + right,
        }
    }

    fn label(self) -> &'static str {
        match self {
            JoinKind::Inner => "inner",
            JoinKind::Semi => "semi",
            JoinKind::LeftOuter => "left",
            JoinKind::RightOuter => "right",
            JoinKind::FullOuter => "full",
        }
    }
}

/// Key component read from one side of a join.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRef {
    /// The slot identity.
    Id,
    /// A property of the slot.
    Prop(PropId),
}

/// One equality of a join-key chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinCond {
    /// Left slot read.
    #[serde(default)]
    pub left_slot: usize,
    /// Left key component.
    pub left: KeyRef,
    /// Right slot read (numbered within the right input).
    #[serde(default)]
    pub right_slot: usize,
    /// Right key component.
    pub right: KeyRef,
    /// Case-insensitive string comparison.
    #[serde(default)]
    pub nocase: bool,
}

impl JoinCond {
    /// `left = right` on slot 0 of both sides.
    pub fn new(left: KeyRef, right: KeyRef) -> Self {
        Self {
            left_slot: 0,
            left,
            right_slot: 0,
            right,
            nocase: false,
        }
    }

    fn sort_key(slot: usize, key: KeyRef, nocase: bool) -> SortKey {
        match key {
            KeyRef::Id => SortKey::id(slot),
            KeyRef::Prop(prop) => SortKey {
                nocase,
                ..SortKey::prop(slot, prop)
            },
        }
    }

    /// Order the left input must be in.
    pub fn left_order(conds: &[JoinCond]) -> SortOrder {
        SortOrder::new(
            conds
                .iter()
                .map(|c| Self::sort_key(c.left_slot, c.left, c.nocase)),
        )
    }

    /// Order the right input must be in.
    pub fn right_order(conds: &[JoinCond]) -> SortOrder {
        SortOrder::new(
            conds
                .iter()
                .map(|c| Self::sort_key(c.right_slot, c.right, c.nocase)),
        )
    }

    fn describe(&self) -> String {
        let side = |slot: usize, key: KeyRef| match key {
            KeyRef::Id => format!("${slot}.id"),
            KeyRef::Prop(prop) => format!("${slot}.p{prop}"),
        };
        let mut text = format!(
            "{} = {}",
            side(self.left_slot, self.left),
            side(self.right_slot, self.right)
        );
        if self.nocase {
            text.push_str(" nocase");
        }
        text
    }
}

type Key = SmallVec<[Value; 2]>;

fn compare_keys(conds: &[JoinCond], a: &Key, b: &Key) -> Ordering {
    for ((cond, x), y) in conds.iter().zip(a).zip(b) {
        let ord = x.total_cmp(y, cond.nocase);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn has_null(key: &Key) -> bool {
    key.iter().any(Value::is_null)
}

/// Compact copy of a right row kept while its key group is replayed.
#[derive(Clone, Debug, PartialEq)]
pub struct SpillRecord {
    ids: SmallVec<[Option<PinId>; 2]>,
    key: Key,
}

impl SpillRecord {
    fn capture(row: &[PinHandle], key: &Key) -> Self {
        Self {
            ids: row.iter().map(PinHandle::id).collect(),
            key: key.clone(),
        }
    }

    /// Re-creates bare handles, with key properties resident again.
    fn restore(&self, out: &mut [PinHandle], conds: &[JoinCond]) {
        for (slot, id) in out.iter_mut().zip(&self.ids) {
            *slot = id.map(PinHandle::new).unwrap_or_default();
        }
        for (cond, value) in conds.iter().zip(&self.key) {
            if let KeyRef::Prop(prop) = cond.right {
                if let Some(handle) = out.get_mut(cond.right_slot) {
                    if !handle.is_empty() {
                        handle.set_prop(prop, value.clone());
                    }
                }
            }
        }
    }
}

struct Side {
    op: Box<dyn Operator>,
    row: Vec<PinHandle>,
    key: Key,
    done: bool,
    is_left: bool,
}

impl Side {
    fn new(op: Box<dyn Operator>, is_left: bool) -> Self {
        let row = new_row(op.width());
        Self {
            op,
            row,
            key: Key::new(),
            done: false,
            is_left,
        }
    }

    fn advance(&mut self, conds: &[JoinCond]) -> Result<()> {
        loop {
            match pull(self.op.as_mut(), &mut self.row, None)? {
                Step::Eof => {
                    self.done = true;
                    self.key.clear();
                    return Ok(());
                }
                Step::Row => match self.extract_key(conds) {
                    Ok(()) => return Ok(()),
                    Err(err) if err.is_row_level() => continue,
                    Err(err) => return Err(err),
                },
            }
        }
    }

    fn extract_key(&mut self, conds: &[JoinCond]) -> Result<()> {
        self.key.clear();
        for cond in conds {
            let (slot, key) = if self.is_left {
                (cond.left_slot, cond.left)
            } else {
                (cond.right_slot, cond.right)
            };
            let handle = self
                .row
                .get_mut(slot)
                .ok_or(PinError::Invalid("join key slot outside input row"))?;
            let value = match key {
                KeyRef::Id => handle.id().map(Value::Ref).unwrap_or(Value::Null),
                KeyRef::Prop(prop) => {
                    if handle.prop(prop).is_none() {
                        self.op.get_data(handle, &[prop])?;
                    }
                    handle.prop(prop).cloned().unwrap_or(Value::Null)
                }
            };
            self.key.push(value);
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.op.rewind()?;
        self.done = false;
        self.key.clear();
        for handle in &mut self.row {
            handle.clear();
        }
        Ok(())
    }
}

/// Merge join over inputs sorted on the join-key chain.
pub struct MergeJoinOp {
    base: OpBase,
    kind: JoinKind,
    conds: Vec<JoinCond>,
    left: Side,
    right: Side,
    spill: Vec<SpillRecord>,
    group: Option<Key>,
    replay: usize,
    started: bool,
}

impl MergeJoinOp {
    /// Joins `left` and `right`, which must already be sorted by
    /// [`JoinCond::left_order`] and [`JoinCond::right_order`].
    pub fn new(
        ctx: QueryCtx,
        kind: JoinKind,
        conds: Vec<JoinCond>,
        left: Box<dyn Operator>,
        right: Box<dyn Operator>,
    ) -> Result<Self> {
        if conds.is_empty() {
            return Err(PinError::Invalid("merge join needs a key condition"));
        }
        if conds
            .iter()
            .any(|c| c.left_slot >= left.width() || c.right_slot >= right.width())
        {
            return Err(PinError::Invalid("join key slot outside input row"));
        }
        if !left.stream_props().satisfies(&JoinCond::left_order(&conds))
            || !right.stream_props().satisfies(&JoinCond::right_order(&conds))
        {
            return Err(PinError::Invalid("merge join inputs must be sorted on the key"));
        }
        Ok(Self {
            base: OpBase::new(ctx),
            kind,
            conds,
            left: Side::new(left, true),
            right: Side::new(right, false),
            spill: Vec::new(),
            group: None,
            replay: 0,
            started: false,
        })
    }

    fn left_width(&self) -> usize {
        self.left.row.len()
    }

    fn emit_pair(&self, out: &mut [PinHandle], idx: usize) -> Result<()> {
        let lw = self.left_width();
        let record = self
            .spill
            .get(idx)
            .ok_or(PinError::Internal("spill replay out of range"))?;
        out[..lw].clone_from_slice(&self.left.row);
        record.restore(&mut out[lw..], &self.conds);
        Ok(())
    }

    fn emit_left_only(&self, out: &mut [PinHandle]) {
        let lw = self.left_width();
        out[..lw].clone_from_slice(&self.left.row);
        for slot in &mut out[lw..] {
            slot.clear();
        }
    }

    fn emit_right_only(&self, out: &mut [PinHandle]) {
        let lw = self.left_width();
        for slot in &mut out[..lw] {
            slot.clear();
        }
        out[lw..].clone_from_slice(&self.right.row);
    }

    fn capture_group(&mut self) -> Result<()> {
        let limit = self.base.ctx().config().spill_limit;
        let key = self.right.key.clone();
        self.spill.clear();
        while !self.right.done && compare_keys(&self.conds, &self.right.key, &key) == Ordering::Equal {
            if self.spill.len() >= limit {
                return Err(PinError::SpillOverflow { limit });
            }
            self.spill.push(SpillRecord::capture(&self.right.row, &self.right.key));
            self.base.tick()?;
            self.right.advance(&self.conds)?;
        }
        self.group = Some(key);
        self.replay = 0;
        Ok(())
    }

    fn next_inner(&mut self, out: &mut [PinHandle]) -> Result<Step> {
        if !self.started {
            self.left.advance(&self.conds)?;
            self.right.advance(&self.conds)?;
            self.started = true;
        }
        loop {
            self.base.tick()?;
            if let Some(group) = &self.group {
                let same = !self.left.done
                    && compare_keys(&self.conds, &self.left.key, group) == Ordering::Equal;
                if same {
                    if self.replay < self.spill.len() {
                        self.emit_pair(out, self.replay)?;
                        self.replay += 1;
                        return Ok(Step::Row);
                    }
                    self.left.advance(&self.conds)?;
                    self.replay = 0;
                } else {
                    self.group = None;
                    self.spill.clear();
                    self.replay = 0;
                }
                continue;
            }
            match (self.left.done, self.right.done) {
                (true, true) => return Ok(Step::Eof),
                (true, false) if self.kind.keeps_right() => {
                    self.emit_right_only(out);
                    self.right.advance(&self.conds)?;
                    return Ok(Step::Row);
                }
                (false, true) if self.kind.keeps_left() => {
                    self.emit_left_only(out);
                    self.left.advance(&self.conds)?;
                    return Ok(Step::Row);
                }
                (true, false) | (false, true) => return Ok(Step::Eof),
                (false, false) => {}
            }
            if has_null(&self.left.key) {
                if self.kind.keeps_left() {
                    self.emit_left_only(out);
                    self.left.advance(&self.conds)?;
                    return Ok(Step::Row);
                }
                self.left.advance(&self.conds)?;
                continue;
            }
            if has_null(&self.right.key) {
                if self.kind.keeps_right() {
                    self.emit_right_only(out);
                    self.right.advance(&self.conds)?;
                    return Ok(Step::Row);
                }
                self.right.advance(&self.conds)?;
                continue;
            }
            match compare_keys(&self.conds, &self.left.key, &self.right.key) {
                Ordering::Less => {
                    if self.kind.keeps_left() {
                        self.emit_left_only(out);
                        self.left.advance(&self.conds)?;
                        return Ok(Step::Row);
                    }
                    self.left.advance(&self.conds)?;
                }
                Ordering::Greater => {
                    if self.kind.keeps_right() {
                        self.emit_right_only(out);
                        self.right.advance(&self.conds)?;
                        return Ok(Step::Row);
                    }
                    self.right.advance(&self.conds)?;
                }
                Ordering::Equal if self.kind == JoinKind::Semi => {
                    out.clone_from_slice(&self.left.row);
                    let key = self.left.key.clone();
                    // Later left rows with the same key are suppressed.
                    loop {
                        self.left.advance(&self.conds)?;
                        if self.left.done
                            || compare_keys(&self.conds, &self.left.key, &key) != Ordering::Equal
                        {
                            break;
                        }
                    }
                    return Ok(Step::Row);
                }
                Ordering::Equal => self.capture_group()?,
            }
        }
    }
}

impl Operator for MergeJoinOp {
    fn name(&self) -> &'static str {
        "MergeJoin"
    }

    fn width(&self) -> usize {
        self.kind.width(self.left.row.len(), self.right.row.len())
    }

    fn ctx(&self) -> &QueryCtx {
        self.base.ctx()
    }

    fn connect(&mut self, slots: &[SlotSpec]) -> Result<()> {
        self.base.bind(slots, self.width())?;
        let lw = self.left.row.len();
        let (left, right) = split_slots(slots, lw, lw + self.right.row.len());
        self.left.op.connect(&left)?;
        self.right.op.connect(&right)
    }

    fn next(&mut self, out: &mut [PinHandle], _hint: Option<PinId>) -> Result<Step> {
        if self.base.is_exhausted() {
            return Ok(Step::Eof);
        }
        let timer = profile_timer();
        let step = self.next_inner(out);
        record_profile_timer(QueryProfileKind::MergeJoin, timer);
        self.base.finish(step)
    }

    fn rewind(&mut self) -> Result<()> {
        self.left.reset()?;
        self.right.reset()?;
        self.spill = Vec::new();
        self.group = None;
        self.replay = 0;
        self.started = false;
        self.base.reset();
        Ok(())
    }

    fn stream_props(&self) -> StreamProps {
        let left = self.left.op.stream_props();
        match self.kind {
            JoinKind::Inner | JoinKind::LeftOuter => StreamProps {
                order: left.order,
                unique: false,
                resident: left.resident,
            },
            JoinKind::Semi => left,
            JoinKind::RightOuter | JoinKind::FullOuter => StreamProps::unordered(),
        }
    }

    fn explain(&self) -> ExplainNode {
        let keys: Vec<String> = self.conds.iter().map(JoinCond::describe).collect();
        ExplainNode::new(self.name())
            .prop("kind", self.kind.label())
            .prop("keys", keys.join(" and "))
            .input(self.left.op.explain())
            .input(self.right.op.explain())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::config::QueryConfig;
    use crate::query::op::testutil::*;
    use crate::query::op::SortOp;
    use crate::storage::{MemStore, PinRecord};

    const KEY: PropId = PropId(1);

    /// Left PINs 1..=4 with keys [1, 2, 2, 3]; right PINs 11..=14 with keys
    /// [2, 2, 3, 4].
    fn store() -> MemStore {
        MemStore::new()
            .with_pin(PinRecord::new(1).with_prop(1, 1i64))
            .with_pin(PinRecord::new(2).with_prop(1, 2i64))
            .with_pin(PinRecord::new(3).with_prop(1, 2i64))
            .with_pin(PinRecord::new(4).with_prop(1, 3i64))
            .with_pin(PinRecord::new(11).with_prop(1, 2i64))
            .with_pin(PinRecord::new(12).with_prop(1, 2i64))
            .with_pin(PinRecord::new(13).with_prop(1, 3i64))
            .with_pin(PinRecord::new(14).with_prop(1, 4i64))
            .with_pin(PinRecord::new(20))
    }

    fn sorted(ctx: &QueryCtx, list: &[u64], order: SortOrder) -> Box<dyn Operator> {
        Box::new(SortOp::new(ctx.clone(), ids(ctx, list), order, false))
    }

    fn join(kind: JoinKind, left: &[u64], right: &[u64], config: QueryConfig) -> MergeJoinOp {
        let ctx = ctx_with(store(), config);
        let conds = vec![JoinCond::new(KeyRef::Prop(KEY), KeyRef::Prop(KEY))];
        let l = sorted(&ctx, left, JoinCond::left_order(&conds));
        let r = sorted(&ctx, right, JoinCond::right_order(&conds));
        MergeJoinOp::new(ctx, kind, conds, l, r).unwrap()
    }

    fn pairs(op: &mut MergeJoinOp) -> Vec<(Option<u64>, Option<u64>)> {
        drain(op).into_iter().map(|row| (row[0], row[1])).collect()
    }

    #[test]
    fn inner_join_replays_duplicate_groups() {
        let mut op = join(JoinKind::Inner, &[1, 2, 3, 4], &[11, 12, 13, 14], QueryConfig::default());
        assert_eq!(
            pairs(&mut op),
            vec![
                (Some(2), Some(11)),
                (Some(2), Some(12)),
                (Some(3), Some(11)),
                (Some(3), Some(12)),
                (Some(4), Some(13)),
            ]
        );
    }

    #[test]
    fn semi_join_emits_one_left_row_per_key() {
        let mut op = join(JoinKind::Semi, &[1, 2, 3, 4], &[11, 12, 13, 14], QueryConfig::default());
        assert_eq!(op.width(), 1);
        assert_eq!(drain_ids(&mut op), vec![2, 4]);
    }

    #[test]
    fn outer_joins_fill_missing_side_with_empty_handles() {
        let mut left = join(JoinKind::LeftOuter, &[1, 4], &[13, 14], QueryConfig::default());
        assert_eq!(pairs(&mut left), vec![(Some(1), None), (Some(4), Some(13))]);

        let mut right = join(JoinKind::RightOuter, &[1, 4], &[13, 14], QueryConfig::default());
        assert_eq!(pairs(&mut right), vec![(Some(4), Some(13)), (None, Some(14))]);

        let mut full = join(JoinKind::FullOuter, &[1, 4], &[11, 13, 14], QueryConfig::default());
        assert_eq!(
            pairs(&mut full),
            vec![
                (Some(1), None),
                (None, Some(11)),
                (Some(4), Some(13)),
                (None, Some(14)),
            ]
        );
    }

    #[test]
    fn outer_joins_replay_duplicate_groups() {
        // Left keys [1, 2, 2, 3], right keys [2, 2, 4].
        let mut inner = join(JoinKind::Inner, &[1, 2, 3, 4], &[11, 12, 14], QueryConfig::default());
        assert_eq!(
            pairs(&mut inner),
            vec![(Some(2), Some(11)), (Some(2), Some(12)), (Some(3), Some(11)), (Some(3), Some(12))]
        );

        let mut right = join(JoinKind::RightOuter, &[1, 2, 3, 4], &[11, 12, 14], QueryConfig::default());
        assert_eq!(
            pairs(&mut right),
            vec![
                (Some(2), Some(11)),
                (Some(2), Some(12)),
                (Some(3), Some(11)),
                (Some(3), Some(12)),
                (None, Some(14)),
            ]
        );

        let mut full = join(JoinKind::FullOuter, &[1, 2, 3, 4], &[11, 12, 14], QueryConfig::default());
        let expected = vec![
            (Some(1), None),
            (Some(2), Some(11)),
            (Some(2), Some(12)),
            (Some(3), Some(11)),
            (Some(3), Some(12)),
            (Some(4), None),
            (None, Some(14)),
        ];
        assert_eq!(pairs(&mut full), expected);
        full.rewind().unwrap();
        assert_eq!(pairs(&mut full), expected);
    }

    #[test]
    fn null_keys_never_match() {
        let mut inner = join(JoinKind::Inner, &[20, 1], &[20, 11], QueryConfig::default());
        assert!(pairs(&mut inner).is_empty());
        let mut full = join(JoinKind::FullOuter, &[20], &[20], QueryConfig::default());
        assert_eq!(pairs(&mut full), vec![(Some(20), None), (None, Some(20))]);
    }

    #[test]
    fn spill_limit_overflow_is_a_resource_error() {
        let mut op = join(
            JoinKind::Inner,
            &[2],
            &[11, 12],
            QueryConfig::default().with_spill_limit(1),
        );
        op.connect(&[SlotSpec::default(), SlotSpec::default()]).unwrap();
        let mut row = new_row(2);
        assert!(matches!(
            op.next(&mut row, None),
            Err(PinError::SpillOverflow { limit: 1 })
        ));
        assert_eq!(op.next(&mut row, None).unwrap(), Step::Eof);
    }

    #[test]
    fn replayed_right_rows_keep_key_resident_and_rewind_repeats() {
        let mut op = join(JoinKind::Inner, &[2, 3], &[11, 12], QueryConfig::default());
        op.connect(&[SlotSpec::default(), SlotSpec::default()]).unwrap();
        let mut row = new_row(2);
        assert_eq!(op.next(&mut row, None).unwrap(), Step::Row);
        assert_eq!(row[1].prop(KEY), Some(&Value::Int(2)));
        let first = pairs(&mut op);
        op.rewind().unwrap();
        let again = pairs(&mut op);
        assert_eq!(again.len(), 4);
        assert_eq!(&again[1..], first.as_slice());
    }

    #[test]
    fn multi_column_chain() {
        let store = MemStore::new()
            .with_pin(PinRecord::new(1).with_prop(1, 1i64).with_prop(2, "x"))
            .with_pin(PinRecord::new(2).with_prop(1, 1i64).with_prop(2, "y"))
            .with_pin(PinRecord::new(11).with_prop(1, 1i64).with_prop(2, "Y"))
            .with_pin(PinRecord::new(12).with_prop(1, 2i64).with_prop(2, "x"));
        let ctx = ctx_for(store);
        let conds = vec![
            JoinCond::new(KeyRef::Prop(PropId(1)), KeyRef::Prop(PropId(1))),
            JoinCond {
                nocase: true,
                ..JoinCond::new(KeyRef::Prop(PropId(2)), KeyRef::Prop(PropId(2)))
            },
        ];
        let l = sorted(&ctx, &[1, 2], JoinCond::left_order(&conds));
        let r = sorted(&ctx, &[11, 12], JoinCond::right_order(&conds));
        let mut op = MergeJoinOp::new(ctx, JoinKind::Inner, conds, l, r).unwrap();
        assert_eq!(pairs(&mut op), vec![(Some(2), Some(11))]);
    }

    #[test]
    fn identity_key_joins_reference_property() {
        let store = MemStore::new()
            .with_pin(PinRecord::new(1))
            .with_pin(PinRecord::new(2))
            .with_pin(PinRecord::new(10).with_prop(5, PinId(2)))
            .with_pin(PinRecord::new(11).with_prop(5, PinId(1)));
        let ctx = ctx_for(store);
        let conds = vec![JoinCond::new(KeyRef::Id, KeyRef::Prop(PropId(5)))];
        let l = ids(&ctx, &[1, 2]);
        let r = sorted(&ctx, &[10, 11], JoinCond::right_order(&conds));
        let mut op = MergeJoinOp::new(ctx, JoinKind::Inner, conds, l, r).unwrap();
        assert_eq!(pairs(&mut op), vec![(Some(1), Some(11)), (Some(2), Some(10))]);
    }

    #[test]
    fn rejects_unsorted_inputs() {
        let ctx = ctx_for(store());
        let conds = vec![JoinCond::new(KeyRef::Prop(KEY), KeyRef::Prop(KEY))];
        let result = MergeJoinOp::new(ctx.clone(), JoinKind::Inner, conds, ids(&ctx, &[1]), ids(&ctx, &[11]));
        assert!(matches!(result, Err(PinError::Invalid(_))));
    }
}
