//! Sweep tags.
//!
//! A [`Tag`] marks a position in a task's options that varies across a sweep.
//! Tags compare and hash by identity only: two tags created with the same
//! label are different parameters and occupy different axes of the sweep.
//!
//! A [`TagExpr`] is a reference to a tag with an optional chain of numeric
//! transforms, so that `2.0 * width + 1.0` follows the `width` axis while
//! feeding the transformed value into the options.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::{Hash, Hasher};
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::core::ArcStr;
use crate::error::SweepError;
use crate::value::Value;

static NEXT_TAG: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Persisted id → live tag, for the document being read on this thread.
    static REMAP: RefCell<Option<HashMap<u64, Tag>>> = const { RefCell::new(None) };
}

/// An identity-bearing placeholder for a swept parameter.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "TagRecord", into = "TagRecord")]
pub struct Tag {
    id: u64,
    label: ArcStr,
}

/// On-disk representation of a tag. The id only ties together occurrences of
/// one tag within a single document.
#[derive(Serialize, Deserialize)]
struct TagRecord {
    id: u64,
    label: String,
}

/// A deserialized tag never takes over its persisted id, so it cannot alias a
/// tag created in this process. Inside [`with_fresh_tags`] every occurrence
/// of one persisted id maps to the same new tag; outside of it each
/// occurrence gets its own.
impl From<TagRecord> for Tag {
    fn from(record: TagRecord) -> Self {
        REMAP.with_borrow_mut(|remap| match remap {
            Some(remap) => remap
                .entry(record.id)
                .or_insert_with(|| Tag::new(&record.label))
                .clone(),
            None => Tag::new(&record.label),
        })
    }
}

/// Restores the enclosing remap when a deserialization scope ends, even by
/// unwinding.
struct RemapScope(Option<HashMap<u64, Tag>>);

impl Drop for RemapScope {
    fn drop(&mut self) {
        let outer = self.0.take();
        REMAP.set(outer);
    }
}

/// Runs `read` with one consistent mapping from persisted tag ids to fresh
/// tags. Wrap every deserialization of one document in a single call.
pub(crate) fn with_fresh_tags<R>(read: impl FnOnce() -> R) -> R {
    let _scope = RemapScope(REMAP.replace(Some(HashMap::new())));
    read()
}

impl From<Tag> for TagRecord {
    fn from(tag: Tag) -> Self {
        Self {
            id: tag.id,
            label: tag.label.to_string(),
        }
    }
}

impl Tag {
    /// Creates a new tag with a fresh identity.
    pub fn new(label: impl AsRef<str>) -> Self {
        Self {
            id: NEXT_TAG.fetch_add(1, Ordering::Relaxed),
            label: label.as_ref().into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Diagnostic label, not used for equality.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns a tag with the same label and a distinct identity.
    pub fn replace(&self) -> Tag {
        Tag::new(&*self.label)
    }

    /// A reference to this tag without any arithmetic.
    pub fn expr(&self) -> TagExpr {
        TagExpr {
            tag: self.clone(),
            ops: Vec::new(),
        }
    }

    pub fn powf(&self, exponent: f64) -> TagExpr {
        self.expr().powf(exponent)
    }

    pub fn abs(&self) -> TagExpr {
        self.expr().abs()
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Tag {}

impl Hash for Tag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for Tag {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tag {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label)
    }
}

impl Debug for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tag({}#{})", self.label, self.id)
    }
}

/// A numeric transform applied to a bound value.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagOp {
    Add(f64),
    Mul(f64),
    Div(f64),
    Powf(f64),
    Neg,
    Abs,
}

impl TagOp {
    /// Integer arithmetic, for as long as every constant is integral. `None`
    /// means the result must be computed in floating point.
    fn apply_int(self, x: i64) -> Option<i64> {
        fn integral(c: f64) -> Option<i64> {
            (c.fract() == 0.0 && c.abs() < i64::MAX as f64).then_some(c as i64)
        }

        match self {
            TagOp::Add(c) => x.checked_add(integral(c)?),
            TagOp::Mul(c) => x.checked_mul(integral(c)?),
            TagOp::Powf(c) => x.checked_pow(u32::try_from(integral(c)?).ok()?),
            TagOp::Neg => x.checked_neg(),
            TagOp::Abs => x.checked_abs(),
            TagOp::Div(_) => None,
        }
    }

    fn apply(self, x: f64) -> f64 {
        match self {
            TagOp::Add(c) => x + c,
            TagOp::Mul(c) => x * c,
            TagOp::Div(c) => x / c,
            TagOp::Powf(c) => x.powf(c),
            TagOp::Neg => -x,
            TagOp::Abs => x.abs(),
        }
    }
}

/// A tag reference as it appears inside an option structure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagExpr {
    #[serde(rename = "$tag")]
    pub tag: Tag,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ops: Vec<TagOp>,
}

impl TagExpr {
    pub fn powf(self, exponent: f64) -> TagExpr {
        self.then(TagOp::Powf(exponent))
    }

    pub fn abs(self) -> TagExpr {
        self.then(TagOp::Abs)
    }

    fn then(mut self, op: TagOp) -> TagExpr {
        self.ops.push(op);
        self
    }

    /// Resolves this reference against the value bound to its tag.
    ///
    /// Without arithmetic the bound value is passed through untouched, so
    /// tags may stand for strings, sequences or whole sub-structures.
    ///
    /// An integer stays an integer through additions, multiplications and
    /// non-negative powers by integral constants, negation and `abs`. Any
    /// division, fractional constant or overflow yields a float.
    pub fn apply(&self, bound: &Value) -> Result<Value, SweepError> {
        if self.ops.is_empty() {
            return Ok(bound.clone());
        }

        if let Value::Int(x) = *bound
            && let Some(n) = self.ops.iter().try_fold(x, |acc, op| op.apply_int(acc))
        {
            return Ok(Value::Int(n));
        }

        let x = bound
            .as_f64()
            .ok_or_else(|| SweepError::NonNumericTag(self.tag.clone()))?;

        Ok(Value::Float(self.ops.iter().fold(x, |acc, op| op.apply(acc))))
    }
}

impl From<Tag> for TagExpr {
    fn from(tag: Tag) -> Self {
        tag.expr()
    }
}

impl From<&Tag> for TagExpr {
    fn from(tag: &Tag) -> Self {
        tag.expr()
    }
}

macro_rules! impl_arith {
    ($($T:ty),*) => {$(
        impl Add<f64> for $T {
            type Output = TagExpr;
            fn add(self, rhs: f64) -> TagExpr {
                TagExpr::from(self).then(TagOp::Add(rhs))
            }
        }

        impl Add<$T> for f64 {
            type Output = TagExpr;
            fn add(self, rhs: $T) -> TagExpr {
                TagExpr::from(rhs).then(TagOp::Add(self))
            }
        }

        impl Sub<f64> for $T {
            type Output = TagExpr;
            fn sub(self, rhs: f64) -> TagExpr {
                TagExpr::from(self).then(TagOp::Add(-rhs))
            }
        }

        impl Sub<$T> for f64 {
            type Output = TagExpr;
            fn sub(self, rhs: $T) -> TagExpr {
                TagExpr::from(rhs).then(TagOp::Neg).then(TagOp::Add(self))
            }
        }

        impl Mul<f64> for $T {
            type Output = TagExpr;
            fn mul(self, rhs: f64) -> TagExpr {
                TagExpr::from(self).then(TagOp::Mul(rhs))
            }
        }

        impl Mul<$T> for f64 {
            type Output = TagExpr;
            fn mul(self, rhs: $T) -> TagExpr {
                TagExpr::from(rhs).then(TagOp::Mul(self))
            }
        }

        impl Div<f64> for $T {
            type Output = TagExpr;
            fn div(self, rhs: f64) -> TagExpr {
                TagExpr::from(self).then(TagOp::Div(rhs))
            }
        }

        impl Neg for $T {
            type Output = TagExpr;
            fn neg(self) -> TagExpr {
                TagExpr::from(self).then(TagOp::Neg)
            }
        }
    )*};
}

impl_arith!(Tag, &Tag, TagExpr);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identity_not_label() {
        let a = Tag::new("voltage");
        let b = Tag::new("voltage");

        assert_ne!(a, b);
        assert_eq!(a, a.clone());

        let set: HashSet<_> = [a.clone(), b.clone(), a.clone()].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_replace_keeps_label() {
        let a = Tag::new("width");
        let b = a.replace();

        assert_ne!(a, b);
        assert_eq!(a.label(), b.label());
    }

    #[test]
    fn test_arithmetic() {
        let t = Tag::new("x");

        let expr = 2.0 * &t + 1.0;
        assert_eq!(expr.apply(&Value::Float(3.0)).unwrap(), Value::Float(7.0));

        let expr = 10.0 - &t;
        assert_eq!(expr.apply(&Value::Int(4)).unwrap(), Value::Int(6));

        let expr = (-t.expr()).abs().powf(2.0) / 4.0;
        assert_eq!(expr.apply(&Value::Float(-4.0)).unwrap(), Value::Float(4.0));
    }

    #[test]
    fn test_integer_arithmetic_stays_integral() {
        let t = Tag::new("cells");

        assert_eq!((&t + 1.0).apply(&Value::Int(3)).unwrap(), Value::Int(4));
        assert_eq!(t.powf(2.0).apply(&Value::Int(-3)).unwrap(), Value::Int(9));
        assert_eq!((&t * 0.5).apply(&Value::Int(3)).unwrap(), Value::Float(1.5));
        assert_eq!((&t / 2.0).apply(&Value::Int(4)).unwrap(), Value::Float(2.0));
        assert_eq!(t.powf(-1.0).apply(&Value::Int(2)).unwrap(), Value::Float(0.5));
        assert_eq!(
            (&t * 2.0).apply(&Value::Int(i64::MAX)).unwrap(),
            Value::Float(i64::MAX as f64 * 2.0)
        );
    }

    #[test]
    fn test_deserialized_tag_is_fresh() {
        let live = Tag::new("voltage");
        let json = format!(r#"{{"id":{},"label":"width"}}"#, live.id());

        let parsed: Tag = serde_json::from_str(&json).unwrap();
        assert_ne!(parsed, live);
        assert_eq!(parsed.label(), "width");

        let (a, b): (Tag, Tag) = with_fresh_tags(|| {
            let a = serde_json::from_str(&json).unwrap();
            let b = serde_json::from_str(&json).unwrap();
            (a, b)
        });
        assert_eq!(a, b);
        assert_ne!(a, live);
        assert_ne!(a, parsed);
    }

    #[test]
    fn test_plain_reference_passes_through() {
        let t = Tag::new("material");
        let bound = Value::from("InAs");

        assert_eq!(t.expr().apply(&bound).unwrap(), bound);
    }

    #[test]
    fn test_arithmetic_on_string_fails() {
        let t = Tag::new("material");
        let err = (t.clone() + 1.0).apply(&Value::from("GaAs")).unwrap_err();

        assert!(matches!(err, SweepError::NonNumericTag(tag) if tag == t));
    }
}
