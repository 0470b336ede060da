use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::query::context::QueryCtx;
use crate::query::explain::ExplainNode;
use crate::query::op::merge_join::{JoinCond, JoinKind, KeyRef};
use crate::query::op::{cleanup_row, new_row, pull, split_slots, OpBase, Operator, SlotSpec, Step, StreamProps};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::storage::{DedupStore, PinHandle};
use crate::types::{PinError, PinId, Result, Value};

/// Input drained into the identity set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildSide {
    /// Left input is built, right input probes; rows are `[build, probe..]`.
    Left,
    /// Right input is built, left input probes; rows are `[probe.., build]`.
    Right,
}

/// Identity hash join: one single-slot input is drained into a bounded
/// identity set, the other streams and probes it by identity or by a
/// reference-valued property.
pub struct HashJoinOp {
    base: OpBase,
    kind: JoinKind,
    side: BuildSide,
    cond: JoinCond,
    build: Box<dyn Operator>,
    probe: Box<dyn Operator>,
    probe_slot: usize,
    probe_key: KeyRef,
    set: DedupStore,
    built: bool,
    probe_row: Vec<PinHandle>,
    matches: SmallVec<[PinId; 4]>,
    pending: usize,
}

impl HashJoinOp {
    /// Joins `left` and `right` on `cond`. The build side must be a single
    /// slot keyed by its identity. Semi joins build the right side.
    pub fn new(
        ctx: QueryCtx,
        kind: JoinKind,
        side: BuildSide,
        cond: JoinCond,
        left: Box<dyn Operator>,
        right: Box<dyn Operator>,
    ) -> Result<Self> {
        match (kind, side) {
            (JoinKind::Inner, _) | (JoinKind::Semi, BuildSide::Right) => {}
            (JoinKind::Semi, BuildSide::Left) => {
                return Err(PinError::Invalid("semi hash join must build the right input"))
            }
            _ => return Err(PinError::Invalid("hash join supports inner and semi joins")),
        }
        let (build, probe, build_key, probe_slot, probe_key) = match side {
            BuildSide::Right => (right, left, (cond.right_slot, cond.right), cond.left_slot, cond.left),
            BuildSide::Left => (left, right, (cond.left_slot, cond.left), cond.right_slot, cond.right),
        };
        if build.width() != 1 || build_key != (0, KeyRef::Id) {
            return Err(PinError::Invalid("hash join build side must be keyed by identity"));
        }
        if probe_slot >= probe.width() {
            return Err(PinError::Invalid("join key slot outside input row"));
        }
        let probe_row = new_row(probe.width());
        let limit = ctx.config().dedup_limit;
        Ok(Self {
            base: OpBase::new(ctx),
            kind,
            side,
            cond,
            build,
            probe,
            probe_slot,
            probe_key,
            set: DedupStore::new(limit),
            built: false,
            probe_row,
            matches: SmallVec::new(),
            pending: 0,
        })
    }

    fn build_set(&mut self) -> Result<()> {
        let mut row = new_row(1);
        loop {
            self.base.tick()?;
            if pull(self.build.as_mut(), &mut row, None)? == Step::Eof {
                break;
            }
            if let Some(id) = row[0].id() {
                self.set.insert(id)?;
            }
            cleanup_row(&mut row);
        }
        self.built = true;
        Ok(())
    }

    /// Collects the probe row's key identities present in the build set.
    fn collect_matches(&mut self) -> Result<()> {
        self.matches.clear();
        self.pending = 0;
        let handle = &mut self.probe_row[self.probe_slot];
        match self.probe_key {
            KeyRef::Id => {
                if let Some(id) = handle.id() {
                    self.matches.push(id);
                }
            }
            KeyRef::Prop(prop) => {
                if handle.prop(prop).is_none() {
                    self.probe.get_data(handle, &[prop])?;
                }
                match handle.prop(prop) {
                    Some(Value::Ref(id)) => self.matches.push(*id),
                    Some(Value::Coll(items)) => {
                        for id in items.iter().filter_map(Value::as_ref_id) {
                            if !self.matches.contains(&id) {
                                self.matches.push(id);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        let set = &self.set;
        self.matches.retain(|id| set.contains(*id));
        Ok(())
    }

    fn emit_pair(&self, out: &mut [PinHandle], id: PinId) {
        match self.side {
            BuildSide::Right => {
                let (probe, build) = out.split_at_mut(self.probe_row.len());
                probe.clone_from_slice(&self.probe_row);
                build[0] = PinHandle::new(id);
            }
            BuildSide::Left => {
                out[0] = PinHandle::new(id);
                out[1..].clone_from_slice(&self.probe_row);
            }
        }
    }

    fn next_inner(&mut self, out: &mut [PinHandle], hint: Option<PinId>) -> Result<Step> {
        if !self.built {
            self.build_set()?;
        }
        // Slot 0 belongs to the probe only when the right side is built.
        let hint = hint.filter(|_| self.side == BuildSide::Right);
        loop {
            if let Some(id) = self.matches.get(self.pending).copied() {
                self.pending += 1;
                self.emit_pair(out, id);
                return Ok(Step::Row);
            }
            self.base.tick()?;
            self.matches.clear();
            if pull(self.probe.as_mut(), &mut self.probe_row, hint)? == Step::Eof {
                return Ok(Step::Eof);
            }
            match self.collect_matches() {
                Ok(()) => {}
                Err(err) if err.is_row_level() => continue,
                Err(err) => return Err(err),
            }
            if self.kind == JoinKind::Semi && !self.matches.is_empty() {
                self.matches.clear();
                out.clone_from_slice(&self.probe_row);
                return Ok(Step::Row);
            }
        }
    }
}

impl Operator for HashJoinOp {
    fn name(&self) -> &'static str {
        "HashJoin"
    }

    fn width(&self) -> usize {
        match self.kind {
            JoinKind::Semi => self.probe_row.len(),
            _ => self.probe_row.len() + 1,
        }
    }

    fn ctx(&self) -> &QueryCtx {
        self.base.ctx()
    }

    fn connect(&mut self, slots: &[SlotSpec]) -> Result<()> {
        self.base.bind(slots, self.width())?;
        let pw = self.probe_row.len();
        match self.side {
            BuildSide::Right => {
                let (probe, build) = split_slots(slots, pw, pw + 1);
                self.probe.connect(&probe)?;
                self.build.connect(&build)
            }
            BuildSide::Left => {
                let (build, probe) = split_slots(slots, 1, pw + 1);
                self.build.connect(&build)?;
                self.probe.connect(&probe)
            }
        }
    }

    fn next(&mut self, out: &mut [PinHandle], hint: Option<PinId>) -> Result<Step> {
        if self.base.is_exhausted() {
            return Ok(Step::Eof);
        }
        let timer = profile_timer();
        let step = self.next_inner(out, hint);
        record_profile_timer(QueryProfileKind::HashJoin, timer);
        self.base.finish(step)
    }

    fn rewind(&mut self) -> Result<()> {
        // A complete set is reused; a partial one is rebuilt from the start.
        if !self.built {
            self.set.clear();
            self.build.rewind()?;
        }
        self.probe.rewind()?;
        self.matches.clear();
        self.pending = 0;
        self.base.reset();
        Ok(())
    }

    fn stream_props(&self) -> StreamProps {
        match self.side {
            BuildSide::Right => {
                let mut props = self.probe.stream_props();
                // A multi-valued reference may pair one probe row with several
                // build rows.
                if self.kind == JoinKind::Inner && self.probe_key != KeyRef::Id {
                    props.unique = false;
                }
                props
            }
            BuildSide::Left => StreamProps::unordered(),
        }
    }

    fn explain(&self) -> ExplainNode {
        let kind = match self.kind {
            JoinKind::Semi => "semi",
            _ => "inner",
        };
        let build = match self.side {
            BuildSide::Left => "left",
            BuildSide::Right => "right",
        };
        let key = match self.cond.left {
            KeyRef::Id => format!("${}.id", self.cond.left_slot),
            KeyRef::Prop(prop) => format!("${}.p{prop}", self.cond.left_slot),
        };
        let node = ExplainNode::new(self.name())
            .prop("kind", kind)
            .prop("build", build)
            .prop("key", key);
        match self.side {
            BuildSide::Right => node.input(self.probe.explain()).input(self.build.explain()),
            BuildSide::Left => node.input(self.build.explain()).input(self.probe.explain()),
        }
    }
}
