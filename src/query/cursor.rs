//! Statement-level driver over a built operator tree.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::debug;

use crate::query::builder::BuildCtx;
use crate::query::context::QueryCtx;
use crate::query::explain::ExplainNode;
use crate::query::logical::QueryVar;
use crate::query::op::{cleanup_row, new_row, Operator, SlotSpec, Step};
use crate::storage::PinHandle;
use crate::types::Result;

/// Owns the root operator and its result row; yields one row per
/// [`Iterator::next`] call with the requested properties resident.
pub struct Cursor {
    root: Box<dyn Operator>,
    slots: Vec<SlotSpec>,
    row: Vec<PinHandle>,
    rows: u64,
    done: bool,
}

impl Cursor {
    /// Connects `root` with default slot bindings.
    pub fn new(root: Box<dyn Operator>) -> Result<Self> {
        let slots = vec![SlotSpec::default(); root.width()];
        Self::with_slots(root, slots)
    }

    /// Connects `root` with `slots`.
    pub fn with_slots(mut root: Box<dyn Operator>, slots: Vec<SlotSpec>) -> Result<Self> {
        root.connect(&slots)?;
        let row = new_row(root.width());
        Ok(Self {
            root,
            slots,
            row,
            rows: 0,
            done: false,
        })
    }

    /// Builds `var` over `ctx` and connects it, requesting the properties
    /// each variable names.
    pub fn open(ctx: &QueryCtx, var: &QueryVar) -> Result<Self> {
        let root = BuildCtx::new(ctx.clone()).build(var)?;
        let slots = var
            .slot_props()
            .into_iter()
            .map(SlotSpec::with_props)
            .collect();
        Self::with_slots(root, slots)
    }

    /// Result slots per row.
    pub fn width(&self) -> usize {
        self.row.len()
    }

    /// Rows returned so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Discards up to `n` rows.
    pub fn skip_rows(&mut self, n: u64) -> Result<u64> {
        self.root.skip(n)
    }

    /// Counts the remaining rows; more than `limit` is a timeout.
    pub fn count_rows(&mut self, limit: u64) -> Result<u64> {
        self.root.count(limit)
    }

    /// Restarts the statement.
    pub fn rewind(&mut self) -> Result<()> {
        self.root.rewind()?;
        self.rows = 0;
        self.done = false;
        Ok(())
    }

    /// Explain tree of the running plan.
    pub fn explain(&self) -> ExplainNode {
        self.root.explain()
    }

    /// Cancellation token; setting it aborts the statement at the next poll.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.root.ctx().session().abort_flag()
    }

    fn fetch(&mut self) -> Result<Option<Vec<PinHandle>>> {
        loop {
            cleanup_row(&mut self.row);
            if self.root.next(&mut self.row, None)? == Step::Eof {
                return Ok(None);
            }
            let mut rejected = false;
            for (handle, spec) in self.row.iter_mut().zip(&self.slots) {
                if spec.props.is_empty() || handle.is_empty() {
                    continue;
                }
                match self.root.get_data(handle, &spec.props) {
                    Ok(()) => {}
                    Err(err) if err.is_row_level() => {
                        rejected = true;
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
            if !rejected {
                return Ok(Some(self.row.clone()));
            }
        }
    }
}

impl Iterator for Cursor {
    type Item = Result<Vec<PinHandle>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fetch() {
            Ok(Some(row)) => {
                self.rows += 1;
                Some(Ok(row))
            }
            Ok(None) => {
                self.done = true;
                debug!(rows = self.rows, root = self.root.name(), "query.cursor.done");
                None
            }
            Err(err) => {
                self.done = true;
                debug!(error = %err, rows = self.rows, "query.cursor.failed");
                Some(Err(err))
            }
        }
    }
}
