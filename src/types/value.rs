//! Property value representation shared by handles, predicates, and join keys.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::{PinError, PinId, Result};

/// Typed property value.
///
/// Serialized with an explicit type tag so JSON datasets and query files stay
/// unambiguous.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    /// Null literal.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit floating point number.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Arbitrary binary payload.
    Bytes(Vec<u8>),
    /// Milliseconds since Unix epoch.
    DateTime(i64),
    /// Reference to another PIN.
    Ref(PinId),
    /// Multi-valued property.
    Coll(Vec<Value>),
}

impl Value {
    /// Returns true for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the referenced identity for [`Value::Ref`].
    pub fn as_ref_id(&self) -> Option<PinId> {
        match self {
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// Number of elements: collection length, 0 for null, 1 otherwise.
    pub fn cardinality(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Coll(items) => items.len(),
            _ => 1,
        }
    }

    /// Element at `idx` treating scalars as one-element collections.
    pub fn element(&self, idx: usize) -> Option<&Value> {
        match self {
            Value::Null => None,
            Value::Coll(items) => items.get(idx),
            other => (idx == 0).then_some(other),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) | Value::DateTime(_) => 2,
            Value::String(_) => 3,
            Value::Bytes(_) => 4,
            Value::Ref(_) => 5,
            Value::Coll(_) => 6,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(v) | Value::DateTime(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Total order used by sort keys and merge joins.
    ///
    /// Values of different kinds order by kind (null first); numbers compare
    /// by magnitude across int/float/datetime.
    pub fn total_cmp(&self, other: &Value, nocase: bool) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) | (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => {
                if nocase {
                    cmp_nocase(a, b)
                } else {
                    a.cmp(b)
                }
            }
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Ref(a), Value::Ref(b)) => a.cmp(b),
            (Value::Coll(a), Value::Coll(b)) => {
                for (x, y) in a.iter().zip(b) {
                    let ord = x.total_cmp(y, nocase);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => self.rank().cmp(&other.rank()),
            },
        }
    }

    /// Predicate comparison; incompatible kinds are a type mismatch.
    pub fn compare(&self, other: &Value, nocase: bool) -> Result<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Ok(Ordering::Equal),
            (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Ok(if nocase {
                cmp_nocase(a, b)
            } else {
                a.cmp(b)
            }),
            (Value::Bytes(a), Value::Bytes(b)) => Ok(a.cmp(b)),
            (Value::Ref(a), Value::Ref(b)) => Ok(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => a
                    .partial_cmp(&b)
                    .ok_or(PinError::TypeMismatch("number comparison invalid")),
                _ => Err(PinError::TypeMismatch("incompatible property comparison")),
            },
        }
    }

    /// Case-insensitive substring match used by `contains` predicates.
    pub fn contains_text(&self, needle: &str) -> bool {
        match self {
            Value::String(s) => s.to_lowercase().contains(&needle.to_lowercase()),
            Value::Coll(items) => items.iter().any(|item| item.contains_text(needle)),
            _ => false,
        }
    }
}

fn cmp_nocase(a: &str, b: &str) -> Ordering {
    let left = a.chars().flat_map(char::to_lowercase);
    let right = b.chars().flat_map(char::to_lowercase);
    left.cmp(right)
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<PinId> for Value {
    fn from(value: PinId) -> Self {
        Value::Ref(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_order_ranks_kinds_and_mixes_numbers() {
        assert_eq!(
            Value::Null.total_cmp(&Value::Int(1), false),
            Ordering::Less
        );
        assert_eq!(
            Value::Int(2).total_cmp(&Value::Float(1.5), false),
            Ordering::Greater
        );
        assert_eq!(
            Value::from("abc").total_cmp(&Value::from("ABD"), true),
            Ordering::Less
        );
        assert_eq!(
            Value::from("abc").total_cmp(&Value::from("ABC"), true),
            Ordering::Equal
        );
    }

    #[test]
    fn predicate_compare_rejects_mixed_kinds() {
        assert!(Value::Int(1).compare(&Value::from("1"), false).is_err());
        assert_eq!(
            Value::Int(3).compare(&Value::Float(3.0), false).unwrap(),
            Ordering::Equal
        );
    }

    #[test]
    fn serde_uses_type_tags() {
        let json = serde_json::to_string(&Value::Ref(PinId(7))).unwrap();
        assert_eq!(json, r#"{"t":"Ref","v":7}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::Ref(PinId(7)));
    }

    #[test]
    fn scalar_behaves_as_single_element() {
        let v = Value::Ref(PinId(3));
        assert_eq!(v.cardinality(), 1);
        assert_eq!(v.element(0), Some(&v));
        assert_eq!(v.element(1), None);
        assert_eq!(Value::Null.cardinality(), 0);
    }
}
