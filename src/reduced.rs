use std::collections::HashSet;

use crate::bindings::{Bindings, Point};
use crate::error::SweepError;
use crate::index::{FullIndex, ReducedIndex, Shape};
use crate::tag::Tag;

/// The restriction of a sweep to the tags one task depends on.
///
/// Many full indices collapse onto one reduced index when they differ only on
/// axes the task ignores. Both directions of the mapping are precomputed:
/// full → reduced is used to fetch upstream results during dispatch, and
/// reduced → full (the fiber) to scatter results back over the full sweep.
#[derive(Debug, Clone)]
pub struct ReducedSweep {
    /// The full sweep this was reduced from.
    bindings: Bindings,
    /// Tags in global axis order.
    tags: Vec<Tag>,
    /// Reduced extents, one per tag.
    shape: Shape,
    /// The reduced sweep points.
    points: Vec<Point>,
    /// Indexed by full index.
    reduced_of: Vec<ReducedIndex>,
    /// Indexed by reduced index, ascending.
    fibers: Vec<Vec<FullIndex>>,
}

impl ReducedSweep {
    /// Restricts the sweep defined by `bindings` to `tags`.
    ///
    /// Every tag must be bound.
    pub fn new(bindings: &Bindings, tags: &HashSet<Tag>) -> Result<Self, SweepError> {
        let mut axes = tags
            .iter()
            .map(|tag| {
                bindings
                    .position(tag)
                    .map(|axis| (axis, tag.clone()))
                    .ok_or_else(|| SweepError::MissingBinding(tag.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        axes.sort_by_key(|(axis, _)| *axis);

        let full_shape = bindings.shape();
        let shape = Shape::new(axes.iter().map(|&(axis, _)| full_shape.dims()[axis]).collect());

        let mut reduced_of = Vec::with_capacity(full_shape.len());
        let mut fibers = vec![Vec::new(); shape.len()];
        let mut coords = Vec::with_capacity(axes.len());

        for flat in 0..full_shape.len() {
            let full = full_shape.unravel(flat);

            coords.clear();
            coords.extend(axes.iter().map(|&(axis, _)| full[axis]));

            let reduced = shape.ravel(&coords);
            reduced_of.push(ReducedIndex(reduced));
            fibers[reduced].push(FullIndex(flat));
        }

        let tags: Vec<Tag> = axes.into_iter().map(|(_, tag)| tag).collect();

        let points = (0..shape.len())
            .map(|reduced| {
                let coords = shape.unravel(reduced);
                tags.iter()
                    .zip(coords)
                    .map(|(tag, i)| {
                        let values = bindings.values(tag).unwrap_or_default();
                        (tag.clone(), values[i].clone())
                    })
                    .collect()
            })
            .collect();

        Ok(Self {
            bindings: bindings.clone(),
            tags,
            shape,
            points,
            reduced_of,
            fibers,
        })
    }

    /// Bindings of the full sweep.
    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    /// The reduced tag order.
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Number of distinct reduced indices.
    pub fn len(&self) -> usize {
        self.fibers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fibers.is_empty()
    }

    /// Size of the full sweep this was reduced from.
    pub fn full_len(&self) -> usize {
        self.reduced_of.len()
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn point(&self, index: ReducedIndex) -> Option<&Point> {
        self.points.get(index.0)
    }

    /// Projects a full index onto this sweep's axes.
    pub fn convert_to_reduced_index(&self, full: FullIndex) -> Option<ReducedIndex> {
        self.reduced_of.get(full.0).copied()
    }

    /// All full indices projecting onto `index`, ascending.
    pub fn convert_to_total_indices(&self, index: ReducedIndex) -> &[FullIndex] {
        self.fibers.get(index.0).map(Vec::as_slice).unwrap_or_default()
    }

    /// The smallest full index in the fiber of `index`.
    pub fn representative(&self, index: ReducedIndex) -> Option<FullIndex> {
        self.convert_to_total_indices(index).first().copied()
    }

    pub fn indices(&self) -> impl Iterator<Item = ReducedIndex> + use<> {
        (0..self.len()).map(ReducedIndex)
    }
}
