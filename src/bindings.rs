use std::collections::HashMap;

use crate::error::SweepError;
use crate::index::Shape;
use crate::tag::Tag;
use crate::value::Value;

/// One sweep point: the concrete value of every tag in scope.
pub type Point = HashMap<Tag, Value>;

/// Ordered tag → values assignment defining the axes of a sweep.
///
/// The order in which tags are bound is the global axis order; the last
/// bound tag varies fastest when the sweep is enumerated.
#[derive(Clone, Debug, Default)]
pub struct Bindings {
    axes: Vec<(Tag, Vec<Value>)>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `tag` to `values`. Rebinding a tag replaces its values but keeps
    /// its axis position.
    pub fn bind<I, V>(mut self, tag: &Tag, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.insert(tag, values);
        self
    }

    pub fn insert<I, V>(&mut self, tag: &Tag, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();

        match self.axes.iter_mut().find(|(t, _)| t == tag) {
            Some((_, slot)) => *slot = values,
            None => self.axes.push((tag.clone(), values)),
        }
    }

    /// Number of axes.
    pub fn len(&self) -> usize {
        self.axes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    pub fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.axes.iter().map(|(tag, _)| tag)
    }

    pub fn values(&self, tag: &Tag) -> Option<&[Value]> {
        self.axes
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, values)| values.as_slice())
    }

    /// Axis position of `tag` in the global order.
    pub fn position(&self, tag: &Tag) -> Option<usize> {
        self.axes.iter().position(|(t, _)| t == tag)
    }

    pub fn shape(&self) -> Shape {
        Shape::new(self.axes.iter().map(|(_, values)| values.len()).collect())
    }

    pub(crate) fn axes(&self) -> &[(Tag, Vec<Value>)] {
        &self.axes
    }

    /// The point at the given full-sweep coordinates.
    pub fn point(&self, coords: &[usize]) -> Point {
        self.axes
            .iter()
            .zip(coords)
            .map(|((tag, values), &i)| (tag.clone(), values[i].clone()))
            .collect()
    }

    pub(crate) fn validate(&self) -> Result<(), SweepError> {
        match self.axes.iter().find(|(_, values)| values.is_empty()) {
            Some((tag, _)) => Err(SweepError::EmptyBinding(tag.clone())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebind_keeps_position() {
        let a = Tag::new("a");
        let b = Tag::new("b");

        let bindings = Bindings::new()
            .bind(&a, [0, 1])
            .bind(&b, [10, 20, 30])
            .bind(&a, [5]);

        assert_eq!(bindings.position(&a), Some(0));
        assert_eq!(bindings.values(&a), Some(&[Value::Int(5)][..]));
        assert_eq!(bindings.shape().dims(), &[1, 3]);
    }

    #[test]
    fn test_empty_binding_rejected() {
        let a = Tag::new("a");
        let bindings = Bindings::new().bind(&a, Vec::<f64>::new());

        assert!(matches!(bindings.validate(), Err(SweepError::EmptyBinding(t)) if t == a));
    }
}
