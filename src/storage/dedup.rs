//! Bounded in-memory identity set used by hash joins.

use rustc_hash::FxHashSet;

use crate::types::{PinError, PinId, Result};

/// Insert/contains set over identities with an upper bound on resident size.
#[derive(Debug)]
pub struct DedupStore {
    ids: FxHashSet<PinId>,
    limit: usize,
}

impl DedupStore {
    /// Creates an empty store holding at most `limit` identities.
    pub fn new(limit: usize) -> Self {
        Self {
            ids: FxHashSet::default(),
            limit,
        }
    }

    /// Inserts `id`, returning false when it was already present.
    ///
    /// Growing past the limit is a resource error; nothing spills.
    pub fn insert(&mut self, id: PinId) -> Result<bool> {
        if self.ids.contains(&id) {
            return Ok(false);
        }
        if self.ids.len() >= self.limit {
            return Err(PinError::DedupOverflow { limit: self.limit });
        }
        self.ids.insert(id);
        Ok(true)
    }

    /// Membership test.
    pub fn contains(&self, id: PinId) -> bool {
        self.ids.contains(&id)
    }

    /// Number of resident identities.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true when nothing has been inserted.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Drops every identity.
    pub fn clear(&mut self) {
        self.ids.clear();
    }
}
