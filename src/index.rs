use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Position in the full sweep, as the row-major ordinal of its coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FullIndex(pub usize);

/// Position in a task's reduced sweep, as the row-major ordinal of its
/// coordinates over the task's own axes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReducedIndex(pub usize);

impl FullIndex {
    pub fn index(self) -> usize {
        self.0
    }
}

impl ReducedIndex {
    pub fn index(self) -> usize {
        self.0
    }
}

impl Display for FullIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for ReducedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Extents of a cartesian index space, first axis slowest.
///
/// A shape with no axes has exactly one element.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Coordinates to ordinal. Coordinates must be in range.
    pub fn ravel(&self, coords: &[usize]) -> usize {
        debug_assert_eq!(coords.len(), self.dims.len());
        self.dims
            .iter()
            .zip(coords)
            .fold(0, |acc, (&dim, &coord)| acc * dim + coord)
    }

    /// Ordinal to coordinates.
    pub fn unravel(&self, mut flat: usize) -> Vec<usize> {
        let mut coords = vec![0; self.dims.len()];
        for (coord, &dim) in coords.iter_mut().zip(&self.dims).rev() {
            *coord = flat % dim;
            flat /= dim;
        }
        coords
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ravel_unravel() {
        let shape = Shape::new(vec![2, 3, 4]);
        assert_eq!(shape.len(), 24);

        for flat in 0..shape.len() {
            assert_eq!(shape.ravel(&shape.unravel(flat)), flat);
        }

        // last axis fastest
        assert_eq!(shape.unravel(1), vec![0, 0, 1]);
        assert_eq!(shape.unravel(4), vec![0, 1, 0]);
        assert_eq!(shape.unravel(12), vec![1, 0, 0]);
    }

    #[test]
    fn test_scalar_shape() {
        let shape = Shape::default();
        assert_eq!(shape.len(), 1);
        assert_eq!(shape.unravel(0), Vec::<usize>::new());
        assert_eq!(shape.ravel(&[]), 0);
    }
}
