use crate::query::context::QueryCtx;
use crate::query::explain::ExplainNode;
use crate::query::op::{OpBase, Operator, SlotSpec, Step, StreamProps};
use crate::query::order::{SortKey, SortOrder};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::storage::{KeyRange, OpKind, PinHandle};
use crate::types::{ClassId, PinError, PinId, PropId, Result, Value};

/// Where a scan leaf gets its identity list.
#[derive(Clone, Debug, PartialEq)]
pub enum ScanSource {
    /// Every PIN.
    Full {
        /// Include tombstoned PINs.
        include_deleted: bool,
    },
    /// Members of a class.
    Class {
        /// Class scanned.
        class: ClassId,
        /// Include tombstoned PINs.
        include_deleted: bool,
    },
    /// Entries of a value index within a range.
    Index {
        /// Indexed property.
        prop: PropId,
        /// Value range.
        range: KeyRange,
    },
    /// Reference values of a context parameter vector.
    Param(usize),
    /// The context environment array.
    Env,
    /// Full-text matches of a word.
    FullText {
        /// Property searched, or every property.
        prop: Option<PropId>,
        /// Word looked up.
        word: String,
    },
    /// A fixed identity list.
    Ids(Vec<PinId>),
}

impl ScanSource {
    /// Identities from this source may be hidden or deleted; a Load must
    /// check visibility.
    pub fn unchecked(&self) -> bool {
        matches!(self, ScanSource::Param(_) | ScanSource::Env | ScanSource::Ids(_))
    }
}

/// Leaf operator streaming a materialized identity list.
pub struct ScanOp {
    base: OpBase,
    source: ScanSource,
    items: Option<Vec<(PinId, Option<Value>)>>,
    pos: usize,
    id_sorted: bool,
    reversed: bool,
}

impl ScanOp {
    /// Scan over `source`.
    pub fn new(ctx: QueryCtx, source: ScanSource) -> Self {
        let id_sorted = match &source {
            ScanSource::Full { .. } | ScanSource::Class { .. } | ScanSource::FullText { .. } => {
                true
            }
            ScanSource::Ids(ids) => ids.windows(2).all(|pair| pair[0] < pair[1]),
            ScanSource::Index { .. } | ScanSource::Param(_) | ScanSource::Env => false,
        };
        Self {
            base: OpBase::new(ctx),
            source,
            items: None,
            pos: 0,
            id_sorted,
            reversed: false,
        }
    }

    /// Scan over a fixed identity list, in the given order.
    pub fn ids(ctx: QueryCtx, ids: Vec<PinId>) -> Self {
        Self::new(ctx, ScanSource::Ids(ids))
    }

    fn materialize(&mut self) -> Result<()> {
        if self.items.is_some() {
            return Ok(());
        }
        let ctx = self.base.ctx();
        let store = ctx.store();
        let bare = |ids: Vec<PinId>| ids.into_iter().map(|id| (id, None)).collect::<Vec<_>>();
        let mut items = match &self.source {
            ScanSource::Full { include_deleted } => bare(store.full_scan(*include_deleted)?),
            ScanSource::Class {
                class,
                include_deleted,
            } => bare(store.class_scan(*class, *include_deleted)?),
            ScanSource::Index { prop, range } => store
                .index_scan(*prop, range)?
                .into_iter()
                .map(|(value, id)| (id, Some(value)))
                .collect(),
            ScanSource::Param(idx) => {
                let mut ids = Vec::new();
                for value in ctx.param(*idx)? {
                    match value {
                        Value::Ref(id) => ids.push(*id),
                        Value::Null => {}
                        _ => return Err(PinError::TypeMismatch("parameter scan expects references")),
                    }
                }
                bare(ids)
            }
            ScanSource::Env => bare(ctx.env().to_vec()),
            ScanSource::FullText { prop, word } => bare(store.text_scan(*prop, word)?),
            ScanSource::Ids(ids) => bare(ids.clone()),
        };
        if self.reversed {
            items.reverse();
        }
        self.items = Some(items);
        Ok(())
    }

    fn index_prop(&self) -> Option<PropId> {
        match &self.source {
            ScanSource::Index { prop, .. } => Some(*prop),
            _ => None,
        }
    }

    fn op_kind(&self) -> OpKind {
        self.base
            .slots()
            .first()
            .map_or(OpKind::Read, |spec| OpKind::from(spec.intent))
    }

    /// Store-vetted identities still pass the lock and ACL check here;
    /// unchecked sources leave it to the Load above them.
    fn admits(&self, handle: &PinHandle) -> Result<bool> {
        if self.source.unchecked() {
            return Ok(true);
        }
        match self.base.ctx().store().check_lock_and_acl(handle, self.op_kind()) {
            Ok(()) => Ok(true),
            Err(err) if err.is_row_level() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn next_inner(&mut self, out: &mut [PinHandle], hint: Option<PinId>) -> Result<Step> {
        self.materialize()?;
        let prop = self.index_prop();
        loop {
            self.base.tick()?;
            let Some(items) = self.items.as_ref() else {
                return Err(PinError::Internal("scan not materialized"));
            };
            if let (Some(hint), true, false) = (hint, self.id_sorted, self.reversed) {
                let rest = &items[self.pos..];
                self.pos += rest.partition_point(|(id, _)| *id < hint);
            }
            let Some((id, value)) = items.get(self.pos) else {
                return Ok(Step::Eof);
            };
            self.pos += 1;
            let value = value.clone();
            out[0].bind(*id);
            if !self.admits(&out[0])? {
                out[0].clear();
                continue;
            }
            if let (Some(prop), Some(value)) = (prop, value) {
                out[0].set_prop(prop, value);
            }
            return Ok(Step::Row);
        }
    }
}

impl Operator for ScanOp {
    fn name(&self) -> &'static str {
        match self.source {
            ScanSource::Full { .. } => "FullScan",
            ScanSource::Class { .. } => "ClassScan",
            ScanSource::Index { .. } => "IndexScan",
            ScanSource::Param(_) | ScanSource::Env => "ExprScan",
            ScanSource::FullText { .. } => "FullTextScan",
            ScanSource::Ids(_) => "IdScan",
        }
    }

    fn ctx(&self) -> &QueryCtx {
        self.base.ctx()
    }

    fn connect(&mut self, slots: &[SlotSpec]) -> Result<()> {
        self.base.bind(slots, 1)
    }

    fn next(&mut self, out: &mut [PinHandle], hint: Option<PinId>) -> Result<Step> {
        if self.base.is_exhausted() {
            return Ok(Step::Eof);
        }
        let timer = profile_timer();
        let step = self.next_inner(out, hint);
        record_profile_timer(QueryProfileKind::Scan, timer);
        self.base.finish(step)
    }

    fn rewind(&mut self) -> Result<()> {
        self.pos = 0;
        self.base.reset();
        Ok(())
    }

    fn count(&mut self, limit: u64) -> Result<u64> {
        self.materialize()?;
        let ids: Vec<PinId> = self
            .items
            .as_ref()
            .map(|items| items.iter().skip(self.pos).map(|(id, _)| *id).collect())
            .unwrap_or_default();
        self.pos += ids.len();
        self.base.mark_exhausted();
        let mut remaining = 0u64;
        let mut handle = PinHandle::empty();
        for id in ids {
            self.base.tick()?;
            handle.bind(id);
            if self.admits(&handle)? {
                remaining += 1;
            }
        }
        if remaining > limit {
            return Err(PinError::Timeout);
        }
        Ok(remaining)
    }

    fn reverse(&mut self) {
        if self.id_sorted && self.base.is_fresh() && self.pos == 0 {
            self.reversed = !self.reversed;
            if let Some(items) = self.items.as_mut() {
                items.reverse();
            }
        }
    }

    fn stream_props(&self) -> StreamProps {
        if let Some(prop) = self.index_prop() {
            return StreamProps {
                order: Some(SortOrder::new([SortKey::prop(0, prop), SortKey::id(0)])),
                unique: false,
                resident: vec![prop],
            };
        }
        if !self.id_sorted {
            return StreamProps::unordered();
        }
        let mut props = StreamProps::id_sorted();
        if self.reversed {
            props.order = Some(SortOrder::by_id().reversed());
        }
        props
    }

    fn explain(&self) -> ExplainNode {
        let node = ExplainNode::new(self.name());
        match &self.source {
            ScanSource::Full { include_deleted } => {
                node.prop("include_deleted", include_deleted)
            }
            ScanSource::Class { class, .. } => node.prop("class", class),
            ScanSource::Index { prop, range } => {
                node.prop("prop", prop).literal("range", range.describe())
            }
            ScanSource::Param(idx) => node.prop("param", idx),
            ScanSource::Env => node.prop("source", "env"),
            ScanSource::FullText { prop, word } => node
                .prop("prop", prop.map_or_else(|| "*".to_string(), |p| p.to_string()))
                .literal("word", word),
            ScanSource::Ids(ids) => node.prop("ids", ids.len()),
        }
    }
}
