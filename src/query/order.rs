//! Sort descriptors shared by Sort, the merge combinators and the builder.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::storage::PinHandle;
use crate::types::{PropId, Value};

/// What a sort key reads from a slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortExpr {
    /// The slot's identity.
    Id,
    /// A property of the slot.
    Prop(PropId),
}

/// Sort direction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

/// One component of a [`SortOrder`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    /// Result slot the key reads.
    #[serde(default)]
    pub slot: usize,
    /// Key expression.
    pub expr: SortExpr,
    /// Direction.
    #[serde(default)]
    pub dir: Direction,
    /// Case-insensitive string comparison.
    #[serde(default)]
    pub nocase: bool,
}

impl SortKey {
    /// Ascending identity key on `slot`.
    pub fn id(slot: usize) -> Self {
        Self {
            slot,
            expr: SortExpr::Id,
            dir: Direction::Asc,
            nocase: false,
        }
    }

    /// Ascending property key on `slot`.
    pub fn prop(slot: usize, prop: PropId) -> Self {
        Self {
            slot,
            expr: SortExpr::Prop(prop),
            dir: Direction::Asc,
            nocase: false,
        }
    }

    /// Same key, descending.
    pub fn desc(mut self) -> Self {
        self.dir = Direction::Desc;
        self
    }

    /// Key value of `handle`; missing properties and empty slots read as null.
    pub fn value(&self, handle: &PinHandle) -> Value {
        match self.expr {
            SortExpr::Id => handle.id().map(Value::Ref).unwrap_or(Value::Null),
            SortExpr::Prop(prop) => handle.prop(prop).cloned().unwrap_or(Value::Null),
        }
    }

    /// Compares two key values under this key's flags.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let ord = a.total_cmp(b, self.nocase);
        match self.dir {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        }
    }
}

/// Ordered list of sort keys.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SortOrder {
    keys: SmallVec<[SortKey; 2]>,
}

impl SortOrder {
    /// Order from explicit keys.
    pub fn new(keys: impl IntoIterator<Item = SortKey>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    /// Ascending identity order on slot 0.
    pub fn by_id() -> Self {
        Self::new([SortKey::id(0)])
    }

    /// The keys in priority order.
    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    /// Returns true when a stream in this order is also in `required` order.
    pub fn satisfies(&self, required: &SortOrder) -> bool {
        required.keys.len() <= self.keys.len()
            && required.keys.iter().zip(&self.keys).all(|(want, have)| want == have)
    }

    /// Returns true for ascending identity order on slot 0.
    pub fn is_id_asc(&self) -> bool {
        self.keys.first() == Some(&SortKey::id(0))
    }

    /// Properties each slot needs resident before comparing rows.
    pub fn props(&self) -> Vec<(usize, PropId)> {
        let mut props = Vec::new();
        for key in &self.keys {
            if let SortExpr::Prop(prop) = key.expr {
                if !props.contains(&(key.slot, prop)) {
                    props.push((key.slot, prop));
                }
            }
        }
        props
    }

    /// Compares two rows key by key.
    pub fn compare_rows(&self, a: &[PinHandle], b: &[PinHandle]) -> Ordering {
        for key in &self.keys {
            let (Some(left), Some(right)) = (a.get(key.slot), b.get(key.slot)) else {
                continue;
            };
            let ord = key.compare(&key.value(left), &key.value(right));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Same keys with every direction flipped.
    pub fn reversed(&self) -> Self {
        Self::new(self.keys.iter().map(|key| SortKey {
            dir: match key.dir {
                Direction::Asc => Direction::Desc,
                Direction::Desc => Direction::Asc,
            },
            ..*key
        }))
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, key) in self.keys.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            match key.expr {
                SortExpr::Id => write!(f, "${}.id", key.slot)?,
                SortExpr::Prop(prop) => write!(f, "${}.p{}", key.slot, prop)?,
            }
            if key.dir == Direction::Desc {
                f.write_str(" desc")?;
            }
            if key.nocase {
                f.write_str(" nocase")?;
            }
        }
        Ok(())
    }
}
