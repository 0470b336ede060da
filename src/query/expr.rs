//! Boolean predicate trees evaluated over result rows.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::query::context::QueryCtx;
use crate::storage::PinHandle;
use crate::types::{PinError, PropId, Result, Value};

/// Value source inside a predicate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// Property of the handle in `slot`.
    Prop {
        /// Result slot.
        slot: usize,
        /// Property read.
        prop: PropId,
    },
    /// Identity of the handle in `slot`, as a reference value.
    Id {
        /// Result slot.
        slot: usize,
    },
    /// Literal value.
    Lit(Value),
    /// Parameter vector of the query context.
    Param(usize),
}

impl Operand {
    fn resolve(&self, row: &[PinHandle], ctx: &QueryCtx) -> Result<Value> {
        match self {
            Operand::Prop { slot, prop } => {
                let handle = slot_handle(row, *slot)?;
                Ok(handle.prop(*prop).cloned().unwrap_or(Value::Null))
            }
            Operand::Id { slot } => {
                let handle = slot_handle(row, *slot)?;
                Ok(handle.id().map(Value::Ref).unwrap_or(Value::Null))
            }
            Operand::Lit(value) => Ok(value.clone()),
            Operand::Param(idx) => {
                let values = ctx.param(*idx)?;
                Ok(match values {
                    [] => Value::Null,
                    [single] => single.clone(),
                    many => Value::Coll(many.to_vec()),
                })
            }
        }
    }

    fn is_null_literal(&self) -> bool {
        matches!(self, Operand::Lit(Value::Null))
    }

    fn collect_props(&self, out: &mut Vec<(usize, PropId)>) {
        if let Operand::Prop { slot, prop } = self {
            if !out.contains(&(*slot, *prop)) {
                out.push((*slot, *prop));
            }
        }
    }

    fn max_slot(&self) -> Option<usize> {
        match self {
            Operand::Prop { slot, .. } | Operand::Id { slot } => Some(*slot),
            Operand::Lit(_) | Operand::Param(_) => None,
        }
    }
}

fn slot_handle(row: &[PinHandle], slot: usize) -> Result<&PinHandle> {
    row.get(slot)
        .ok_or(PinError::Invalid("predicate slot outside result row"))
}

/// Comparison operator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
}

impl CmpOp {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord.is_eq(),
            CmpOp::Ne => ord.is_ne(),
            CmpOp::Lt => ord.is_lt(),
            CmpOp::Le => ord.is_le(),
            CmpOp::Gt => ord.is_gt(),
            CmpOp::Ge => ord.is_ge(),
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// Boolean predicate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// Binary comparison.
    Cmp {
        /// Comparison operator.
        op: CmpOp,
        /// Left operand.
        lhs: Operand,
        /// Right operand.
        rhs: Operand,
        /// Case-insensitive string comparison.
        #[serde(default)]
        nocase: bool,
    },
    /// Range test with optional bounds.
    Between {
        /// Tested operand.
        operand: Operand,
        /// Lower bound.
        low: Bound<Value>,
        /// Upper bound.
        high: Bound<Value>,
    },
    /// Membership in a literal list.
    In {
        /// Tested operand.
        operand: Operand,
        /// Candidate values.
        values: Vec<Value>,
    },
    /// Operand is null or absent.
    IsNull(Operand),
    /// Operand is present and not null.
    IsNotNull(Operand),
    /// Case-insensitive substring match on strings.
    Contains {
        /// Tested operand.
        operand: Operand,
        /// Substring searched.
        needle: String,
    },
    /// Conjunction; empty is true.
    And(Vec<Expr>),
    /// Disjunction; empty is false.
    Or(Vec<Expr>),
    /// Negation.
    Not(Box<Expr>),
}

impl Expr {
    /// `slot.prop = value`.
    pub fn prop_eq(slot: usize, prop: PropId, value: impl Into<Value>) -> Self {
        Expr::Cmp {
            op: CmpOp::Eq,
            lhs: Operand::Prop { slot, prop },
            rhs: Operand::Lit(value.into()),
            nocase: false,
        }
    }

    /// `slot.prop <op> value`.
    pub fn prop_cmp(slot: usize, prop: PropId, op: CmpOp, value: impl Into<Value>) -> Self {
        Expr::Cmp {
            op,
            lhs: Operand::Prop { slot, prop },
            rhs: Operand::Lit(value.into()),
            nocase: false,
        }
    }

    /// Conjunction of `self` and `other`, flattening nested ands.
    pub fn and(self, other: Expr) -> Self {
        match (self, other) {
            (Expr::And(mut left), Expr::And(right)) => {
                left.extend(right);
                Expr::And(left)
            }
            (Expr::And(mut left), other) => {
                left.push(other);
                Expr::And(left)
            }
            (this, Expr::And(mut right)) => {
                right.insert(0, this);
                Expr::And(right)
            }
            (this, other) => Expr::And(vec![this, other]),
        }
    }

    /// Evaluates the predicate; properties must already be resident.
    pub fn eval(&self, row: &[PinHandle], ctx: &QueryCtx) -> Result<bool> {
        match self {
            Expr::Cmp {
                op,
                lhs,
                rhs,
                nocase,
            } => {
                let left = lhs.resolve(row, ctx)?;
                if rhs.is_null_literal() {
                    return Ok(match op {
                        CmpOp::Eq => left.is_null(),
                        CmpOp::Ne => !left.is_null(),
                        _ => false,
                    });
                }
                let right = rhs.resolve(row, ctx)?;
                eval_cmp(*op, &left, &right, *nocase)
            }
            Expr::Between { operand, low, high } => {
                let value = operand.resolve(row, ctx)?;
                any_element(&value, |item| eval_between(item, low, high))
            }
            Expr::In { operand, values } => {
                let value = operand.resolve(row, ctx)?;
                any_element(&value, |item| {
                    for candidate in values.iter().filter(|v| !v.is_null()) {
                        match item.compare(candidate, false) {
                            Ok(ord) if ord.is_eq() => return Ok(true),
                            Ok(_) | Err(PinError::TypeMismatch(_)) => {}
                            Err(err) => return Err(err),
                        }
                    }
                    Ok(false)
                })
            }
            Expr::IsNull(operand) => Ok(operand.resolve(row, ctx)?.is_null()),
            Expr::IsNotNull(operand) => Ok(!operand.resolve(row, ctx)?.is_null()),
            Expr::Contains { operand, needle } => {
                Ok(operand.resolve(row, ctx)?.contains_text(needle))
            }
            Expr::And(children) => {
                for child in children {
                    if !child.eval(row, ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Expr::Or(children) => {
                for child in children {
                    if child.eval(row, ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Expr::Not(child) => Ok(!child.eval(row, ctx)?),
        }
    }

    /// `(slot, prop)` pairs that must be resident before [`Expr::eval`].
    pub fn needed_props(&self) -> Vec<(usize, PropId)> {
        let mut out = Vec::new();
        self.collect_props(&mut out);
        out
    }

    fn collect_props(&self, out: &mut Vec<(usize, PropId)>) {
        match self {
            Expr::Cmp { lhs, rhs, .. } => {
                lhs.collect_props(out);
                rhs.collect_props(out);
            }
            Expr::Between { operand, .. }
            | Expr::In { operand, .. }
            | Expr::IsNull(operand)
            | Expr::IsNotNull(operand)
            | Expr::Contains { operand, .. } => operand.collect_props(out),
            Expr::And(children) | Expr::Or(children) => {
                for child in children {
                    child.collect_props(out);
                }
            }
            Expr::Not(child) => child.collect_props(out),
        }
    }

    /// Highest result slot the predicate reads.
    pub fn max_slot(&self) -> Option<usize> {
        match self {
            Expr::Cmp { lhs, rhs, .. } => lhs.max_slot().max(rhs.max_slot()),
            Expr::Between { operand, .. }
            | Expr::In { operand, .. }
            | Expr::IsNull(operand)
            | Expr::IsNotNull(operand)
            | Expr::Contains { operand, .. } => operand.max_slot(),
            Expr::And(children) | Expr::Or(children) => {
                children.iter().filter_map(Expr::max_slot).max()
            }
            Expr::Not(child) => child.max_slot(),
        }
    }
}

fn any_element<F>(value: &Value, mut test: F) -> Result<bool>
where
    F: FnMut(&Value) -> Result<bool>,
{
    match value {
        Value::Null => Ok(false),
        Value::Coll(items) => {
            for item in items {
                if test(item)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        scalar => test(scalar),
    }
}

fn eval_cmp(op: CmpOp, left: &Value, right: &Value, nocase: bool) -> Result<bool> {
    if left.is_null() || right.is_null() {
        return Ok(false);
    }
    match (left, right) {
        (Value::Coll(_), Value::Coll(_)) => Ok(op.holds(left.total_cmp(right, nocase))),
        (Value::Coll(_), scalar) => {
            any_element(left, |item| Ok(op.holds(item.compare(scalar, nocase)?)))
        }
        (scalar, Value::Coll(_)) => {
            any_element(right, |item| Ok(op.holds(scalar.compare(item, nocase)?)))
        }
        _ => Ok(op.holds(left.compare(right, nocase)?)),
    }
}

fn eval_between(value: &Value, low: &Bound<Value>, high: &Bound<Value>) -> Result<bool> {
    let low_ok = match low {
        Bound::Unbounded => true,
        Bound::Included(lit) | Bound::Excluded(lit) if lit.is_null() => return Ok(false),
        Bound::Included(lit) => value.compare(lit, false)?.is_ge(),
        Bound::Excluded(lit) => value.compare(lit, false)?.is_gt(),
    };
    if !low_ok {
        return Ok(false);
    }
    Ok(match high {
        Bound::Unbounded => true,
        Bound::Included(lit) | Bound::Excluded(lit) if lit.is_null() => false,
        Bound::Included(lit) => value.compare(lit, false)?.is_le(),
        Bound::Excluded(lit) => value.compare(lit, false)?.is_lt(),
    })
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Prop { slot, prop } => write!(f, "${slot}.p{prop}"),
            Operand::Id { slot } => write!(f, "${slot}.id"),
            Operand::Lit(value) => write!(f, "{value:?}"),
            Operand::Param(idx) => write!(f, ":{idx}"),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Cmp {
                op,
                lhs,
                rhs,
                nocase,
            } => {
                write!(f, "{lhs} {} {rhs}", op.symbol())?;
                if *nocase {
                    f.write_str(" nocase")?;
                }
                Ok(())
            }
            Expr::Between { operand, low, high } => {
                write!(f, "{operand} between {low:?} and {high:?}")
            }
            Expr::In { operand, values } => write!(f, "{operand} in {values:?}"),
            Expr::IsNull(operand) => write!(f, "{operand} is null"),
            Expr::IsNotNull(operand) => write!(f, "{operand} is not null"),
            Expr::Contains { operand, needle } => write!(f, "{operand} contains {needle:?}"),
            Expr::And(children) | Expr::Or(children) => {
                let joiner = if matches!(self, Expr::And(_)) {
                    " and "
                } else {
                    " or "
                };
                f.write_str("(")?;
                for (idx, child) in children.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(joiner)?;
                    }
                    write!(f, "{child}")?;
                }
                f.write_str(")")
            }
            Expr::Not(child) => write!(f, "not {child}"),
        }
    }
}
