//! Tag extraction and substitution over option trees.

use std::collections::{HashMap, HashSet};

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::bindings::Point;
use crate::error::SweepError;
use crate::tag::{Tag, TagExpr};
use crate::value::Value;

/// Collects every tag reachable from `value`.
///
/// Mappings are descended through their values only.
pub fn extract_tags(value: &Value) -> HashSet<Tag> {
    let mut tags = HashSet::new();
    collect_tags(value, &mut tags);
    tags
}

fn collect_tags(value: &Value, tags: &mut HashSet<Tag>) {
    match value {
        Value::Tag(expr) => {
            tags.insert(expr.tag.clone());
        }
        Value::Seq(items) => items.iter().for_each(|item| collect_tags(item, tags)),
        Value::Map(map) => map.values().for_each(|item| collect_tags(item, tags)),
        _ => {}
    }
}

/// Rebuilds `value` with every tag replaced by its value at `point`.
pub fn substitute(value: &Value, point: &Point) -> Result<Value, SweepError> {
    Ok(match value {
        Value::Tag(expr) => {
            let bound = point
                .get(&expr.tag)
                .ok_or_else(|| SweepError::MissingBinding(expr.tag.clone()))?;
            expr.apply(bound)?
        }
        Value::Seq(items) => Value::Seq(
            items
                .iter()
                .map(|item| substitute(item, point))
                .collect::<Result<_, _>>()?,
        ),
        Value::Map(map) => Value::Map(
            map.iter()
                .map(|(key, item)| Ok((key.clone(), substitute(item, point)?)))
                .collect::<Result<_, SweepError>>()?,
        ),
        other => other.clone(),
    })
}

/// Substitutes the same point into many structures.
pub fn substitute_all(values: &[Value], point: &Point) -> Result<Vec<Value>, SweepError> {
    values.iter().map(|value| substitute(value, point)).collect()
}

/// Substitutes every point into one structure, in parallel.
///
/// The output keeps the order of `points`.
pub fn substitute_points(value: &Value, points: &[Point]) -> Result<Vec<Value>, SweepError> {
    points
        .par_iter()
        .map(|point| substitute(value, point))
        .collect()
}

/// Swaps tag identities according to `mapping`, keeping any arithmetic.
///
/// Tags without an entry are left untouched.
pub fn retag(value: &Value, mapping: &HashMap<Tag, Tag>) -> Value {
    match value {
        Value::Tag(expr) => Value::Tag(TagExpr {
            tag: mapping.get(&expr.tag).unwrap_or(&expr.tag).clone(),
            ops: expr.ops.clone(),
        }),
        Value::Seq(items) => Value::Seq(items.iter().map(|item| retag(item, mapping)).collect()),
        Value::Map(map) => Value::Map(
            map.iter()
                .map(|(key, item)| (key.clone(), retag(item, mapping)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_tags_left(value: &Value) -> bool {
        extract_tags(value).is_empty()
    }

    #[test]
    fn test_extract_nested() {
        let a = Tag::new("a");
        let b = Tag::new("b");

        let value = Value::map([
            ("x", Value::from(&a)),
            (
                "nested",
                Value::map([
                    ("list", Value::seq([Value::from(1), Value::from(&b)])),
                    ("again", Value::from(&a + 1.0)),
                ]),
            ),
            ("plain", Value::from("text")),
        ]);

        let tags = extract_tags(&value);
        assert_eq!(tags.len(), 2);
        assert!(tags.contains(&a));
        assert!(tags.contains(&b));
    }

    #[test]
    fn test_substitute_preserves_shape() {
        let a = Tag::new("a");
        let b = Tag::new("b");

        let value = Value::map([
            ("x", Value::from(&a)),
            ("ys", Value::seq([Value::from(&b), Value::from(2.0 * &a)])),
            ("label", Value::from("gate")),
        ]);

        let point: Point = [(a.clone(), Value::from(3)), (b.clone(), Value::from("InAs"))]
            .into_iter()
            .collect();

        let out = substitute(&value, &point).unwrap();

        assert_eq!(
            out,
            Value::map([
                ("x", Value::from(3)),
                ("ys", Value::seq([Value::from("InAs"), Value::from(6.0)])),
                ("label", Value::from("gate")),
            ])
        );
        assert!(no_tags_left(&out));
        // input untouched
        assert_eq!(extract_tags(&value).len(), 2);
    }

    #[test]
    fn test_substitute_missing_binding() {
        let a = Tag::new("a");
        let b = Tag::new("b");
        let value = Value::seq([Value::from(&a), Value::from(&b)]);
        let point: Point = [(a, Value::from(1))].into_iter().collect();

        match substitute(&value, &point) {
            Err(SweepError::MissingBinding(tag)) => assert_eq!(tag, b),
            other => panic!("expected MissingBinding, got {other:?}"),
        }
    }

    #[test]
    fn test_same_label_different_tags() {
        let a1 = Tag::new("a");
        let a2 = Tag::new("a");
        let value = Value::seq([Value::from(&a1), Value::from(&a2)]);
        let point: Point = [(a1, Value::from(1)), (a2, Value::from(2))].into_iter().collect();

        assert_eq!(
            substitute(&value, &point).unwrap(),
            Value::seq([Value::from(1), Value::from(2)])
        );
    }

    #[test]
    fn test_batch_variants() {
        let a = Tag::new("a");
        let value = Value::map([("v", Value::from(&a))]);
        let points: Vec<Point> = (0..16)
            .map(|i| [(a.clone(), Value::from(i))].into_iter().collect())
            .collect();

        let outs = substitute_points(&value, &points).unwrap();
        assert_eq!(outs.len(), 16);
        for (i, out) in outs.iter().enumerate() {
            assert_eq!(out.get("v"), Some(&Value::from(i)));
        }

        let many = substitute_all(&[value.clone(), Value::from(&a)], &points[3]).unwrap();
        assert_eq!(many[1], Value::from(3));
    }

    #[test]
    fn test_retag() {
        let a = Tag::new("a");
        let fresh = a.replace();
        let value = Value::seq([Value::from(&a + 1.0), Value::from(5)]);

        let mapping = [(a.clone(), fresh.clone())].into_iter().collect();
        let out = retag(&value, &mapping);

        assert!(extract_tags(&out).contains(&fresh));
        assert!(!extract_tags(&out).contains(&a));
        assert_eq!(out.at(0), Some(&Value::from(&fresh + 1.0)));
    }
}
