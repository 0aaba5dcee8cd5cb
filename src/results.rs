//! Gathered results held in local memory.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::bindings::{Bindings, Point};
use crate::core::{Dynamic, Hash32};
use crate::engine::task_graph;
use crate::error::SweepError;
use crate::index::{FullIndex, ReducedIndex};
use crate::reduced::ReducedSweep;
use crate::subst::substitute;
use crate::task::Task;
use crate::value::Value;

/// Every result of one task, indexed by reduced index.
#[derive(Clone)]
pub struct ReducedSweepResults {
    task: Task,
    sweep: Arc<ReducedSweep>,
    results: Vec<Dynamic>,
}

impl ReducedSweepResults {
    pub(crate) fn new(task: Task, sweep: Arc<ReducedSweep>, results: Vec<Dynamic>) -> Self {
        debug_assert_eq!(sweep.len(), results.len());
        Self {
            task,
            sweep,
            results,
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn sweep(&self) -> &ReducedSweep {
        &self.sweep
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get<T: Any>(&self, index: ReducedIndex) -> Result<&T, SweepError> {
        let result = self.results.get(index.index()).ok_or_else(|| {
            SweepError::StructuralMismatch(format!(
                "reduced index {index} is out of range for task '{}'",
                self.task
            ))
        })?;

        result.downcast_ref::<T>().ok_or_else(|| self.wrong_type::<T>())
    }

    /// The result serving full index `full`.
    pub fn get_result<T: Any>(&self, full: FullIndex) -> Result<&T, SweepError> {
        let index = self.sweep.convert_to_reduced_index(full).ok_or_else(|| {
            SweepError::StructuralMismatch(format!(
                "full index {full} is out of range for task '{}'",
                self.task
            ))
        })?;

        self.get(index)
    }

    /// The single result of a task that does not depend on any tag.
    pub fn only<T: Any>(&self) -> Result<&T, SweepError> {
        if self.len() != 1 {
            return Err(SweepError::StructuralMismatch(format!(
                "task '{}' has {} results, expected exactly one",
                self.task,
                self.len()
            )));
        }

        self.get(ReducedIndex(0))
    }

    /// `(index, point, result)` for every reduced index, in order.
    pub fn iter(&self) -> impl Iterator<Item = (ReducedIndex, &Point, &Dynamic)> {
        self.sweep
            .points()
            .iter()
            .zip(&self.results)
            .enumerate()
            .map(|(i, (point, result))| (ReducedIndex(i), point, result))
    }

    /// Every `(point, result)` pair, downcast to `T`.
    pub fn points_to_data<T: Any>(&self) -> Result<Vec<(&Point, &T)>, SweepError> {
        self.iter()
            .map(|(_, point, result)| {
                result
                    .downcast_ref::<T>()
                    .map(|value| (point, value))
                    .ok_or_else(|| self.wrong_type::<T>())
            })
            .collect()
    }

    fn wrong_type<T>(&self) -> SweepError {
        SweepError::StructuralMismatch(format!(
            "task '{}' produces {}, not {}",
            self.task,
            self.task.output_type_name(),
            std::any::type_name::<T>()
        ))
    }

    /// Writes every result below `dir` through the output type's
    /// [`Data`](crate::Data) implementation.
    ///
    /// Files are named after the fingerprint of what produced them, so
    /// [`load`](Self::load) only accepts results computed from the same
    /// options and upstream.
    pub fn persist(&self, dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, SweepError> {
        let hashes = fingerprints(&self.task, self.sweep.bindings())?;
        let mut paths = Vec::with_capacity(self.len());

        for ((index, _, result), hash) in self.iter().zip(hashes) {
            let path = result_path(&self.task, dir, index, hash);
            self.task.reduction().save(result, &path)?;
            paths.push(path);
        }

        tracing::info!(task = %self.task, count = paths.len(), %dir, "persisted results");
        Ok(paths)
    }

    /// Reads back what [`persist`](Self::persist) wrote for `task` over
    /// `sweep`.
    ///
    /// Fails with [`SweepError::StructuralMismatch`] if a result is missing or
    /// does not decode as the task's output type.
    pub fn load(task: &Task, sweep: Arc<ReducedSweep>, dir: &Utf8Path) -> Result<Self, SweepError> {
        let hashes = fingerprints(task, sweep.bindings())?;
        let mut results = Vec::with_capacity(sweep.len());

        for (index, hash) in sweep.indices().zip(hashes) {
            let path = result_path(task, dir, index, hash);

            if !path.exists() {
                return Err(SweepError::StructuralMismatch(format!(
                    "no persisted result of task '{task}' at {path}"
                )));
            }

            let result = task.reduction().load(&path).map_err(|e| {
                SweepError::StructuralMismatch(format!(
                    "{path} does not hold a {}: {e}",
                    task.output_type_name()
                ))
            })?;

            results.push(result);
        }

        tracing::info!(task = %task, count = results.len(), %dir, "loaded results");
        Ok(Self::new(task.clone(), sweep, results))
    }
}

fn result_path(task: &Task, dir: &Utf8Path, index: ReducedIndex, hash: Hash32) -> Utf8PathBuf {
    dir.join(task.name())
        .join(format!("{index}-{}.cbor", hash.to_hex()))
}

/// Fingerprints of every result of `root` over the sweep of `bindings`, by
/// reduced index.
///
/// Each task of the graph is hashed once per reduced index, upstream first.
/// A gathered task has one fingerprint covering all of its indices.
pub(crate) fn fingerprints(root: &Task, bindings: &Bindings) -> Result<Vec<Hash32>, SweepError> {
    let (graph, order) = task_graph(root)?;
    let mut done: HashMap<u64, (ReducedSweep, Vec<Hash32>)> = HashMap::new();

    let missing = |task: &Task| {
        SweepError::StructuralMismatch(format!("task '{task}' has no fingerprint"))
    };

    for node in order {
        let task = &graph[node];
        let sweep = ReducedSweep::new(bindings, task.tags())?;

        let mut options = Vec::with_capacity(sweep.len());
        let mut upstream = Vec::with_capacity(sweep.len());

        for (index, point) in sweep.indices().zip(sweep.points()) {
            let full = sweep.representative(index).ok_or_else(|| missing(task))?;

            options.push(substitute(task.options(), point)?);
            upstream.push(
                task.upstream()
                    .iter()
                    .map(|task| {
                        let (sweep, hashes) = done.get(&task.instance()).ok_or_else(|| missing(task))?;
                        sweep
                            .convert_to_reduced_index(full)
                            .and_then(|index| hashes.get(index.index()))
                            .copied()
                            .ok_or_else(|| missing(task))
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            );
        }

        let hashes = if task.is_gathered() {
            let hash = Hash32::fingerprint(task.class(), &Value::Seq(options), &upstream.concat())?;
            vec![hash; sweep.len()]
        } else {
            options
                .iter()
                .zip(&upstream)
                .map(|(options, upstream)| Hash32::fingerprint(task.class(), options, upstream))
                .collect::<Result<Vec<_>, _>>()?
        };

        done.insert(task.instance(), (sweep, hashes));
    }

    done.remove(&root.instance())
        .map(|(_, hashes)| hashes)
        .ok_or_else(|| missing(root))
}

impl std::fmt::Debug for ReducedSweepResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReducedSweepResults")
            .field("task", &self.task.to_string())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::Tag;
    use crate::task::{GatherContext, GatherReduction, Inputs, ReduceContext, Reduction};

    struct Constant;

    impl Reduction for Constant {
        const CLASS: &'static str = "constant";
        type Output = f64;

        fn reduce(&self, _: &ReduceContext, options: &Value, _: &Inputs) -> anyhow::Result<f64> {
            Ok(options.get("value").and_then(Value::as_f64).unwrap_or_default())
        }
    }

    struct Sum;

    impl GatherReduction for Sum {
        const CLASS: &'static str = "sum";
        type Output = f64;

        fn reduce_gathered(&self, _: &GatherContext, _: &[Value], inputs: &[Inputs]) -> anyhow::Result<f64> {
            let total = inputs
                .iter()
                .map(|inputs| inputs.get::<f64>(0).copied())
                .sum::<Result<f64, _>>()?;
            Ok(total)
        }
    }

    #[test]
    fn test_fingerprint_follows_point() {
        let a = Tag::new("a");
        let bindings = Bindings::new().bind(&a, [0, 1]);

        let base = Task::new(Constant).options(Value::map([("value", &a)])).build();
        let top = Task::new(Constant).depends_on(&base).build();

        let hashes = fingerprints(&top, &bindings).unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes, fingerprints(&top, &bindings).unwrap());
        assert_ne!(hashes[0], hashes[1]);

        assert!(matches!(
            fingerprints(&top, &Bindings::new()),
            Err(SweepError::MissingBinding(_))
        ));
    }

    #[test]
    fn test_fingerprint_diamond_ladder() {
        let a = Tag::new("a");
        let bindings = Bindings::new().bind(&a, [0, 1, 2]);

        // 2^64 paths from the top to the base
        let mut top = Task::new(Constant).options(Value::map([("value", &a)])).build();
        for _ in 0..64 {
            let left = Task::new(Constant).depends_on(&top).build();
            let right = Task::new(Constant).options(Value::map([("value", 1)])).depends_on(&top).build();
            top = Task::new(Constant).depends_on(&left).depends_on(&right).build();
        }

        let hashes = fingerprints(&top, &bindings).unwrap();
        assert_eq!(hashes.len(), 3);
        assert_ne!(hashes[0], hashes[2]);
    }

    #[test]
    fn test_gathered_fingerprint_covers_every_index() {
        let a = Tag::new("a");
        let base = Task::new(Constant).options(Value::map([("value", &a)])).build();
        let sum = Task::gathered(Sum).depends_on(&base).build();

        let hashes = fingerprints(&sum, &Bindings::new().bind(&a, [0, 1, 2])).unwrap();
        assert_eq!(hashes.len(), 3);
        assert!(hashes.iter().all(|hash| *hash == hashes[0]));

        // one more point changes what was gathered
        let wider = fingerprints(&sum, &Bindings::new().bind(&a, [0, 1, 2, 3])).unwrap();
        assert_ne!(wider[0], hashes[0]);
    }
}
