//! Collaborator contracts consumed by the query engine.
//!
//! The page layer, lock manager and index structures live behind
//! [`PinStore`]; operators only call through this trait.

use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::storage::handle::PinHandle;
use crate::types::{ClassId, PageAddr, PinId, PropId, Result, Value};

/// Access intent passed to [`PinStore::load_body`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Shared read access.
    #[default]
    Read,
    /// Body will be updated by the statement.
    Write,
}

/// How multi-valued properties are returned by [`PinStore::get_property`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Cardinality {
    /// First element only.
    Single,
    /// Whole collection.
    All,
}

/// Operation checked by [`PinStore::check_lock_and_acl`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpKind {
    /// Read the PIN.
    Read,
    /// Modify the PIN.
    Update,
    /// Delete the PIN.
    Delete,
}

impl From<Intent> for OpKind {
    fn from(intent: Intent) -> Self {
        match intent {
            Intent::Read => OpKind::Read,
            Intent::Write => OpKind::Update,
        }
    }
}

/// Value range over one indexed property.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyRange {
    /// Lower bound.
    pub lower: Bound<Value>,
    /// Upper bound.
    pub upper: Bound<Value>,
}

impl KeyRange {
    /// Range matching exactly `value`.
    pub fn eq(value: Value) -> Self {
        Self {
            lower: Bound::Included(value.clone()),
            upper: Bound::Included(value),
        }
    }

    /// Range with explicit bounds.
    pub fn new(lower: Bound<Value>, upper: Bound<Value>) -> Self {
        Self { lower, upper }
    }

    /// Whether `value` falls inside the range. Nulls never match.
    pub fn contains(&self, value: &Value) -> Result<bool> {
        if value.is_null() {
            return Ok(false);
        }
        let meets_low = match &self.lower {
            Bound::Unbounded => true,
            Bound::Included(lit) if lit.is_null() => return Ok(false),
            Bound::Excluded(lit) if lit.is_null() => return Ok(false),
            Bound::Included(lit) => value.compare(lit, false)?.is_ge(),
            Bound::Excluded(lit) => value.compare(lit, false)?.is_gt(),
        };
        if !meets_low {
            return Ok(false);
        }
        let meets_high = match &self.upper {
            Bound::Unbounded => true,
            Bound::Included(lit) if lit.is_null() => return Ok(false),
            Bound::Excluded(lit) if lit.is_null() => return Ok(false),
            Bound::Included(lit) => value.compare(lit, false)?.is_le(),
            Bound::Excluded(lit) => value.compare(lit, false)?.is_lt(),
        };
        Ok(meets_high)
    }

    /// Human readable form for explain output.
    pub fn describe(&self) -> String {
        let low = match &self.lower {
            Bound::Unbounded => "(-inf".to_string(),
            Bound::Included(v) => format!("[{v:?}"),
            Bound::Excluded(v) => format!("({v:?}"),
        };
        let high = match &self.upper {
            Bound::Unbounded => "+inf)".to_string(),
            Bound::Included(v) => format!("{v:?}]"),
            Bound::Excluded(v) => format!("{v:?})"),
        };
        format!("{low}, {high}")
    }
}

/// Storage, lock manager, and index collaborator.
///
/// Calls may block on page or row locks; the engine treats that as ordinary
/// suspension. Denials are reported as [`crate::types::PinError::NoAccess`]
/// or [`crate::types::PinError::NotFound`], never as hard errors.
pub trait PinStore: Send + Sync {
    /// Resolves an identity to the address of its body.
    fn resolve_address(&self, id: PinId) -> Result<PageAddr>;

    /// Fetches the body, caching the address and metadata bits on the handle.
    fn load_body(&self, handle: &mut PinHandle, intent: Intent) -> Result<()>;

    /// Reads one property; absent properties come back as [`Value::Null`].
    fn get_property(&self, handle: &PinHandle, prop: PropId, mode: Cardinality)
        -> Result<Value>;

    /// Lock and ACL check performed before trusting a loaded row.
    fn check_lock_and_acl(&self, handle: &PinHandle, op: OpKind) -> Result<()>;

    /// Whether an equality/range index exists on `prop`.
    fn has_index(&self, prop: PropId) -> bool;

    /// Every PIN, identity ascending.
    fn full_scan(&self, include_deleted: bool) -> Result<Vec<PinId>>;

    /// Members of a class, identity ascending.
    fn class_scan(&self, class: ClassId, include_deleted: bool) -> Result<Vec<PinId>>;

    /// Index entries within `range`, ordered by value then identity.
    fn index_scan(&self, prop: PropId, range: &KeyRange) -> Result<Vec<(Value, PinId)>>;

    /// PINs whose text (in `prop`, or any property) contains `word`,
    /// identity ascending.
    fn text_scan(&self, prop: Option<PropId>, word: &str) -> Result<Vec<PinId>>;
}
