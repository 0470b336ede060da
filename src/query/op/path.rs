//! Bounded-repetition traversal of outgoing references.
//!
//! Traversal is depth first over an explicit frame stack so iteration can be
//! suspended after every yielded node. A frame expands one node within one
//! segment: it walks the segment's properties, and within a multi-valued
//! property its elements, handing out one referenced identity at a time.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::query::context::QueryCtx;
use crate::query::explain::ExplainNode;
use crate::query::expr::Expr;
use crate::query::op::{load_props, new_row, pull, OpBase, Operator, SlotSpec, Step, StreamProps};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::storage::{meta, Cardinality, Intent, OpKind, PinHandle};
use crate::types::{PinError, PinId, PropId, Result, Value};

/// One hop pattern of a path expression.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathSeg {
    /// Reference properties followed by this segment.
    pub props: Vec<PropId>,
    /// Minimum number of hops.
    #[serde(default)]
    pub rmin: u32,
    /// Maximum number of hops.
    pub rmax: u32,
    /// Predicate every node reached by this segment must satisfy, evaluated
    /// with the node in slot 0.
    #[serde(default)]
    pub filter: Option<Expr>,
}

impl PathSeg {
    /// Segment following `props` between `rmin` and `rmax` times.
    pub fn new(props: impl Into<Vec<PropId>>, rmin: u32, rmax: u32) -> Self {
        Self {
            props: props.into(),
            rmin,
            rmax,
            filter: None,
        }
    }

    /// Adds a per-hop filter.
    pub fn with_filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }

    fn describe(&self) -> String {
        let props: Vec<String> = self.props.iter().map(|p| format!("p{p}")).collect();
        format!("{}{{{},{}}}", props.join("|"), self.rmin, self.rmax)
    }
}

struct Frame {
    node: PinHandle,
    seg: usize,
    rep: u32,
    prop_idx: usize,
    coll_idx: usize,
    value: Option<Value>,
}

impl Frame {
    fn new(node: PinHandle, seg: usize, rep: u32) -> Self {
        Self {
            node,
            seg,
            rep,
            prop_idx: 0,
            coll_idx: 0,
            value: None,
        }
    }
}

/// Expands every start row of its child along a list of [`PathSeg`]s and
/// yields the reached nodes.
pub struct PathOp {
    base: OpBase,
    child: Box<dyn Operator>,
    segs: Vec<PathSeg>,
    stack: Vec<Frame>,
    start: Vec<PinHandle>,
    dedup: bool,
    seen: FxHashSet<PinId>,
}

impl PathOp {
    /// Traverses `segs` from every node produced by `child`.
    pub fn new(ctx: QueryCtx, child: Box<dyn Operator>, segs: Vec<PathSeg>) -> Result<Self> {
        if child.width() != 1 {
            return Err(PinError::Invalid("path start must be a single slot"));
        }
        if segs.is_empty() {
            return Err(PinError::Invalid("path needs at least one segment"));
        }
        let max_depth = ctx.config().max_path_depth;
        for seg in &segs {
            if seg.rmin > seg.rmax {
                return Err(PinError::Invalid("path segment has rmin above rmax"));
            }
            if seg.rmax > max_depth {
                return Err(PinError::ResourceLimit("path repetition exceeds max_path_depth"));
            }
            if seg.filter.as_ref().and_then(Expr::max_slot).is_some_and(|slot| slot > 0) {
                return Err(PinError::Invalid("path filter reads beyond slot 0"));
            }
        }
        Ok(Self {
            base: OpBase::new(ctx),
            child,
            segs,
            stack: Vec::new(),
            start: new_row(1),
            dedup: false,
            seen: FxHashSet::default(),
        })
    }

    fn trailing_optional(&self, seg: usize) -> bool {
        self.segs[seg + 1..].iter().all(|s| s.rmin == 0)
    }

    /// Visibility and lock checks for a node entering the traversal.
    fn admit(&self, handle: &mut PinHandle) -> Result<()> {
        let store = self.base.ctx().store();
        if !handle.body_loaded() {
            store.load_body(handle, Intent::Read)?;
        }
        if handle.meta() & meta::HIDDEN != 0 {
            return Err(PinError::NotFound);
        }
        if handle.meta() & meta::DELETED != 0 {
            return Err(PinError::Deleted);
        }
        store.check_lock_and_acl(handle, OpKind::Read)
    }

    fn accepts(&self, handle: &mut PinHandle, seg: usize) -> Result<bool> {
        self.admit(handle)?;
        let Some(filter) = &self.segs[seg].filter else {
            return Ok(true);
        };
        let props: Vec<PropId> = filter.needed_props().into_iter().map(|(_, p)| p).collect();
        load_props(self.base.ctx(), handle, &props)?;
        filter.eval(std::slice::from_ref(handle), self.base.ctx())
    }

    /// Registers the state `(node, seg, rep)` and the zero-hop states of the
    /// following segments it may move into. Returns the node when it is a
    /// result of the path.
    fn enter(&mut self, node: PinHandle, seg: usize, rep: u32) -> Option<PinHandle> {
        let seg_min = self.segs[seg].rmin;
        let yields = rep >= seg_min && self.trailing_optional(seg);
        let (mut s, mut r) = (seg, rep);
        loop {
            if r < self.segs[s].rmax {
                self.stack.push(Frame::new(node.clone(), s, r));
            }
            if r >= self.segs[s].rmin && s + 1 < self.segs.len() {
                s += 1;
                r = 0;
            } else {
                break;
            }
        }
        if !yields {
            return None;
        }
        match node.id() {
            Some(id) if self.dedup && !self.seen.insert(id) => None,
            _ => Some(node),
        }
    }

    /// Next referenced identity of the top frame.
    fn next_neighbor(&mut self) -> Result<Option<PinId>> {
        let store = self.base.ctx().store();
        let Some(frame) = self.stack.last_mut() else {
            return Ok(None);
        };
        let props = &self.segs[frame.seg].props;
        loop {
            if frame.value.is_none() {
                let Some(prop) = props.get(frame.prop_idx) else {
                    return Ok(None);
                };
                frame.value = Some(store.get_property(&frame.node, *prop, Cardinality::All)?);
                frame.coll_idx = 0;
            }
            match frame.value.as_ref().and_then(|v| v.element(frame.coll_idx)) {
                Some(item) => {
                    frame.coll_idx += 1;
                    if let Some(id) = item.as_ref_id() {
                        return Ok(Some(id));
                    }
                }
                None => {
                    frame.value = None;
                    frame.prop_idx += 1;
                }
            }
        }
    }

    /// Pulls the next start row; returns the start itself when zero hops
    /// satisfy the whole path.
    fn next_start(&mut self) -> Result<Option<Option<PinHandle>>> {
        loop {
            self.base.tick()?;
            if pull(self.child.as_mut(), &mut self.start, None)? == Step::Eof {
                return Ok(None);
            }
            let mut node = std::mem::take(&mut self.start[0]);
            if node.is_empty() {
                continue;
            }
            match self.admit(&mut node) {
                Ok(()) => {}
                Err(err) if err.is_row_level() => continue,
                Err(err) => return Err(err),
            }
            self.seen.clear();
            return Ok(Some(self.enter(node, 0, 0)));
        }
    }

    fn next_inner(&mut self, out: &mut [PinHandle]) -> Result<Step> {
        loop {
            self.base.tick()?;
            if self.stack.is_empty() {
                match self.next_start()? {
                    None => return Ok(Step::Eof),
                    Some(Some(node)) => {
                        out[0] = node;
                        return Ok(Step::Row);
                    }
                    Some(None) => continue,
                }
            }
            let Some(id) = self.next_neighbor()? else {
                self.stack.pop();
                continue;
            };
            let (seg, rep) = match self.stack.last() {
                Some(frame) => (frame.seg, frame.rep + 1),
                None => continue,
            };
            let mut node = PinHandle::new(id);
            match self.accepts(&mut node, seg) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) if err.is_row_level() => continue,
                Err(err) => return Err(err),
            }
            if let Some(node) = self.enter(node, seg, rep) {
                out[0] = node;
                return Ok(Step::Row);
            }
        }
    }
}

impl Operator for PathOp {
    fn name(&self) -> &'static str {
        "Path"
    }

    fn ctx(&self) -> &QueryCtx {
        self.base.ctx()
    }

    fn connect(&mut self, slots: &[SlotSpec]) -> Result<()> {
        self.base.bind(slots, 1)?;
        self.child.connect(&[SlotSpec::default()])
    }

    fn next(&mut self, out: &mut [PinHandle], _hint: Option<PinId>) -> Result<Step> {
        if self.base.is_exhausted() {
            return Ok(Step::Eof);
        }
        let timer = profile_timer();
        let step = self.next_inner(out);
        record_profile_timer(QueryProfileKind::Path, timer);
        self.base.finish(step)
    }

    fn rewind(&mut self) -> Result<()> {
        self.child.rewind()?;
        self.stack.clear();
        self.seen.clear();
        self.base.reset();
        Ok(())
    }

    fn unique(&mut self, on: bool) {
        if self.base.is_fresh() {
            self.dedup = on;
        }
    }

    fn stream_props(&self) -> StreamProps {
        StreamProps::unordered()
    }

    fn explain(&self) -> ExplainNode {
        let segs: Vec<String> = self.segs.iter().map(PathSeg::describe).collect();
        let mut node = ExplainNode::new(self.name()).prop("segments", segs.join(" / "));
        for (idx, seg) in self.segs.iter().enumerate() {
            if let Some(filter) = &seg.filter {
                node = node.literal(format!("filter{idx}"), filter);
            }
        }
        if self.dedup {
            node = node.prop("unique", true);
        }
        node.input(self.child.explain())
    }
}
