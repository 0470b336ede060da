use serde::{Deserialize, Serialize};

use crate::query::context::QueryCtx;
use crate::query::explain::ExplainNode;
use crate::query::op::{new_row, pull, OpBase, Operator, SlotSpec, Step, StreamProps};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::storage::PinHandle;
use crate::types::{PinError, PinId, PropId, Result};

/// Set operation performed by [`MergeOp`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetOpKind {
    /// Identities present in any input.
    Union,
    /// Identities present in every input.
    Intersect,
    /// Identities of the first input absent from the second.
    Except,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum InputState {
    NeedsAdvance,
    Positioned,
    Done,
}

struct Input {
    op: Box<dyn Operator>,
    row: Vec<PinHandle>,
    state: InputState,
}

impl Input {
    fn id(&self) -> Option<PinId> {
        match self.state {
            InputState::Positioned => self.row[0].id(),
            _ => None,
        }
    }

    fn advance(&mut self, hint: Option<PinId>) -> Result<()> {
        self.state = match pull(self.op.as_mut(), &mut self.row, hint)? {
            Step::Row if self.row[0].is_empty() => {
                return Err(PinError::Internal("set operation input row without identity"))
            }
            Step::Row => InputState::Positioned,
            Step::Eof => InputState::Done,
        };
        Ok(())
    }
}

/// K-way merge of identity-sorted, duplicate-free inputs.
pub struct MergeOp {
    base: OpBase,
    kind: SetOpKind,
    inputs: Vec<Input>,
}

impl MergeOp {
    /// Merges `children`, each of which must be identity sorted and unique.
    pub fn new(ctx: QueryCtx, kind: SetOpKind, children: Vec<Box<dyn Operator>>) -> Result<Self> {
        let arity_ok = match kind {
            SetOpKind::Union => !children.is_empty(),
            SetOpKind::Intersect => children.len() >= 2,
            SetOpKind::Except => children.len() == 2,
        };
        if !arity_ok {
            return Err(PinError::Invalid("set operation arity"));
        }
        let mut inputs = Vec::with_capacity(children.len());
        for op in children {
            let props = op.stream_props();
            if op.width() != 1 || !props.is_id_sorted() || !props.unique {
                return Err(PinError::Invalid(
                    "set operation input must be identity sorted and unique",
                ));
            }
            inputs.push(Input {
                op,
                row: new_row(1),
                state: InputState::NeedsAdvance,
            });
        }
        Ok(Self {
            base: OpBase::new(ctx),
            kind,
            inputs,
        })
    }

    fn emit(&mut self, idx: usize, out: &mut [PinHandle]) {
        let input = &mut self.inputs[idx];
        std::mem::swap(&mut out[0], &mut input.row[0]);
        input.state = InputState::NeedsAdvance;
    }

    fn next_union(&mut self, out: &mut [PinHandle], hint: Option<PinId>) -> Result<Step> {
        self.base.tick()?;
        for input in &mut self.inputs {
            if input.state == InputState::NeedsAdvance {
                input.advance(hint)?;
            }
        }
        let Some(min) = self.inputs.iter().filter_map(Input::id).min() else {
            return Ok(Step::Eof);
        };
        let mut emitted = None;
        for (idx, input) in self.inputs.iter_mut().enumerate() {
            if input.id() == Some(min) {
                if emitted.is_none() {
                    emitted = Some(idx);
                } else {
                    input.state = InputState::NeedsAdvance;
                }
            }
        }
        match emitted {
            Some(idx) => {
                self.emit(idx, out);
                Ok(Step::Row)
            }
            None => Err(PinError::Internal("union lost its minimum")),
        }
    }

    fn next_intersect(&mut self, out: &mut [PinHandle], hint: Option<PinId>) -> Result<Step> {
        let mut target = hint;
        for input in &mut self.inputs {
            if input.state == InputState::NeedsAdvance {
                input.advance(target)?;
            }
            match input.state {
                InputState::Done => return Ok(Step::Eof),
                _ => target = target.max(input.id()),
            }
        }
        loop {
            self.base.tick()?;
            let mut aligned = true;
            for input in &mut self.inputs {
                if input.id() < target {
                    aligned = false;
                    input.advance(target)?;
                    if input.state == InputState::Done {
                        return Ok(Step::Eof);
                    }
                    target = target.max(input.id());
                }
            }
            if aligned {
                break;
            }
        }
        let mut bits = 0;
        for input in &self.inputs[1..] {
            bits |= input.row[0].meta();
        }
        for input in &mut self.inputs[1..] {
            input.state = InputState::NeedsAdvance;
        }
        self.emit(0, out);
        out[0].add_meta(bits);
        Ok(Step::Row)
    }

    fn next_except(&mut self, out: &mut [PinHandle], hint: Option<PinId>) -> Result<Step> {
        loop {
            self.base.tick()?;
            let [first, second] = self.inputs.as_mut_slice() else {
                return Err(PinError::Internal("except needs two inputs"));
            };
            if first.state == InputState::NeedsAdvance {
                first.advance(hint)?;
            }
            let Some(current) = first.id() else {
                return Ok(Step::Eof);
            };
            while second.state != InputState::Done
                && (second.state == InputState::NeedsAdvance || second.id() < Some(current))
            {
                second.advance(Some(current))?;
            }
            if second.id() == Some(current) {
                first.state = InputState::NeedsAdvance;
                continue;
            }
            self.emit(0, out);
            return Ok(Step::Row);
        }
    }
}

impl Operator for MergeOp {
    fn name(&self) -> &'static str {
        match self.kind {
            SetOpKind::Union => "Union",
            SetOpKind::Intersect => "Intersect",
            SetOpKind::Except => "Except",
        }
    }

    fn ctx(&self) -> &QueryCtx {
        self.base.ctx()
    }

    fn connect(&mut self, slots: &[SlotSpec]) -> Result<()> {
        self.base.bind(slots, 1)?;
        for input in &mut self.inputs {
            input.op.connect(slots)?;
        }
        Ok(())
    }

    fn next(&mut self, out: &mut [PinHandle], hint: Option<PinId>) -> Result<Step> {
        if self.base.is_exhausted() {
            return Ok(Step::Eof);
        }
        let timer = profile_timer();
        let step = match self.kind {
            SetOpKind::Union => self.next_union(out, hint),
            SetOpKind::Intersect => self.next_intersect(out, hint),
            SetOpKind::Except => self.next_except(out, hint),
        };
        record_profile_timer(QueryProfileKind::Merge, timer);
        self.base.finish(step)
    }

    fn rewind(&mut self) -> Result<()> {
        for input in &mut self.inputs {
            input.op.rewind()?;
            input.row[0].clear();
            input.state = InputState::NeedsAdvance;
        }
        self.base.reset();
        Ok(())
    }

    fn get_data(&mut self, handle: &mut PinHandle, props: &[PropId]) -> Result<()> {
        self.inputs[0].op.get_data(handle, props)
    }

    fn stream_props(&self) -> StreamProps {
        let mut props = StreamProps::id_sorted();
        let mut resident = self.inputs[0].op.stream_props().resident;
        if self.kind == SetOpKind::Union {
            for input in &self.inputs[1..] {
                let other = input.op.stream_props().resident;
                resident.retain(|prop| other.contains(prop));
            }
        }
        props.resident = resident;
        props
    }

    fn explain(&self) -> ExplainNode {
        let mut node = ExplainNode::new(self.name()).prop("inputs", self.inputs.len());
        for input in &self.inputs {
            node = node.input(input.op.explain());
        }
        node
    }
}
