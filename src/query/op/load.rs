use crate::query::context::QueryCtx;
use crate::query::explain::ExplainNode;
use crate::query::op::{load_props, OpBase, Operator, SlotSpec, Step, StreamProps};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::storage::{meta, Intent, OpKind, PinHandle};
use crate::types::{PinError, PinId, PropId, Result};

/// Materializes bodies: visibility and lock/ACL checks, then the requested
/// properties of every non-empty slot.
pub struct LoadOp {
    base: OpBase,
    child: Box<dyn Operator>,
    props: Vec<PropId>,
    slot_props: Vec<Vec<PropId>>,
    intent: Intent,
    include_deleted: bool,
}

impl LoadOp {
    /// Loads `props` into slot 0 (plus whatever connect requests).
    pub fn new(ctx: QueryCtx, child: Box<dyn Operator>, props: Vec<PropId>) -> Self {
        let width = child.width();
        let mut slot_props = vec![Vec::new(); width];
        if let Some(first) = slot_props.first_mut() {
            first.clone_from(&props);
        }
        Self {
            base: OpBase::new(ctx),
            child,
            props,
            slot_props,
            intent: Intent::Read,
            include_deleted: false,
        }
    }

    /// Loads bodies with `intent`.
    pub fn with_intent(mut self, intent: Intent) -> Self {
        self.intent = intent;
        self
    }

    /// Lets tombstoned PINs through.
    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }

    fn load_slot(&self, handle: &mut PinHandle, props: &[PropId]) -> Result<()> {
        let store = self.base.ctx().store();
        if !handle.body_loaded() {
            store.load_body(handle, self.intent)?;
        }
        if handle.meta() & meta::HIDDEN != 0 {
            return Err(PinError::NotFound);
        }
        if handle.meta() & meta::DELETED != 0 && !self.include_deleted {
            return Err(PinError::Deleted);
        }
        store.check_lock_and_acl(handle, OpKind::from(self.intent))?;
        load_props(self.base.ctx(), handle, props)
    }

    fn next_inner(&mut self, out: &mut [PinHandle], hint: Option<PinId>) -> Result<Step> {
        loop {
            self.base.tick()?;
            if self.child.next(out, hint)? == Step::Eof {
                return Ok(Step::Eof);
            }
            let mut rejected = false;
            for (slot, handle) in out.iter_mut().enumerate() {
                if handle.is_empty() {
                    continue;
                }
                let props = self.slot_props.get(slot).map(Vec::as_slice).unwrap_or(&[]);
                match self.load_slot(handle, props) {
                    Ok(()) => {}
                    Err(err) if err.is_row_level() => {
                        rejected = true;
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
            if !rejected {
                return Ok(Step::Row);
            }
        }
    }
}

impl Operator for LoadOp {
    fn name(&self) -> &'static str {
        "Load"
    }

    fn width(&self) -> usize {
        self.child.width()
    }

    fn ctx(&self) -> &QueryCtx {
        self.base.ctx()
    }

    fn connect(&mut self, slots: &[SlotSpec]) -> Result<()> {
        self.base.bind(slots, self.width())?;
        for (wanted, spec) in self.slot_props.iter_mut().zip(slots) {
            for prop in &spec.props {
                if !wanted.contains(prop) {
                    wanted.push(*prop);
                }
            }
            if spec.intent == Intent::Write {
                self.intent = Intent::Write;
            }
        }
        self.child.connect(slots)
    }

    fn next(&mut self, out: &mut [PinHandle], hint: Option<PinId>) -> Result<Step> {
        if self.base.is_exhausted() {
            return Ok(Step::Eof);
        }
        let timer = profile_timer();
        let step = self.next_inner(out, hint);
        record_profile_timer(QueryProfileKind::Load, timer);
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
        for prop in self.slot_props.first().into_iter().flatten() {
            if !props.resident.contains(prop) {
                props.resident.push(*prop);
            }
        }
        props
    }

    fn explain(&self) -> ExplainNode {
        let props: Vec<String> = self.props.iter().map(|p| format!("p{p}")).collect();
        let mut node = ExplainNode::new(self.name()).prop("props", props.join(","));
        if self.include_deleted {
            node = node.prop("include_deleted", true);
        }
        if self.intent == Intent::Write {
            node = node.prop("intent", "write");
        }
        node.input(self.child.explain())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::op::new_row;
    use crate::query::op::testutil::*;
    use crate::storage::{MemStore, PinRecord};
    use crate::types::Value;

    fn store() -> MemStore {
        MemStore::new()
            .with_pin(PinRecord::new(1).with_prop(1, "a"))
            .with_pin(PinRecord::new(2).with_prop(1, "b").hidden())
            .with_pin(PinRecord::new(3).with_prop(1, "c").denied())
            .with_pin(PinRecord::new(4).with_prop(1, "d").deleted())
            .with_pin(PinRecord::new(5).with_prop(1, "e"))
    }

    #[test]
    fn rejected_rows_are_absorbed() {
        let ctx = ctx_for(store());
        let mut op = LoadOp::new(ctx.clone(), ids(&ctx, &[1, 2, 3, 4, 5, 6]), vec![PropId(1)]);
        assert_eq!(drain_ids(&mut op), vec![1, 5]);
    }

    #[test]
    fn include_deleted_keeps_tombstones() {
        let ctx = ctx_for(store());
        let mut op = LoadOp::new(ctx.clone(), ids(&ctx, &[4, 5]), vec![]).include_deleted(true);
        assert_eq!(drain_ids(&mut op), vec![4, 5]);
    }

    #[test]
    fn loads_requested_and_connected_props() {
        let store = MemStore::new().with_pin(PinRecord::new(1).with_prop(1, 5i64).with_prop(2, 6i64));
        let ctx = ctx_for(store);
        let mut op = LoadOp::new(ctx.clone(), ids(&ctx, &[1]), vec![PropId(1)]);
        op.connect(&[SlotSpec::with_props(vec![PropId(2)])]).unwrap();
        let mut row = new_row(1);
        assert_eq!(op.next(&mut row, None).unwrap(), Step::Row);
        assert_eq!(row[0].prop(PropId(1)), Some(&Value::Int(5)));
        assert_eq!(row[0].prop(PropId(2)), Some(&Value::Int(6)));
        assert!(op.stream_props().has_resident(&[PropId(1), PropId(2)]));
        assert_eq!(op.next(&mut row, None).unwrap(), Step::Eof);
    }

    #[test]
    fn rewind_repeats_rows_and_reloads_props() {
        let ctx = ctx_for(store());
        let mut op = LoadOp::new(ctx.clone(), ids(&ctx, &[5, 3, 1]), vec![PropId(1)]);
        op.connect(&[SlotSpec::default()]).unwrap();
        let mut row = new_row(1);
        assert_eq!(op.next(&mut row, None).unwrap(), Step::Row);
        assert_eq!(row[0].prop(PropId(1)), Some(&Value::from("e")));
        op.rewind().unwrap();
        let mut seen = Vec::new();
        loop {
            row[0].clear();
            if op.next(&mut row, None).unwrap() == Step::Eof {
                break;
            }
            seen.push((row[0].id().map(|id| id.0), row[0].prop(PropId(1)).cloned()));
        }
        assert_eq!(
            seen,
            vec![(Some(5), Some(Value::from("e"))), (Some(1), Some(Value::from("a")))]
        );
    }

    #[test]
    fn write_intent_rejects_read_only() {
        let mut record = PinRecord::new(1);
        record.read_only = true;
        let store = MemStore::new().with_pin(record).with_pin(PinRecord::new(2));
        let ctx = ctx_for(store);
        let mut op = LoadOp::new(ctx.clone(), ids(&ctx, &[1, 2]), vec![]).with_intent(Intent::Write);
        assert_eq!(drain_ids(&mut op), vec![2]);
    }
}
