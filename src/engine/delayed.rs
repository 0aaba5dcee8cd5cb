use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::backend::Outcome;
use crate::bindings::Point;
use crate::core::Dynamic;
use crate::data::Data;
use crate::engine::{RunEnv, downcast, execute, execute_gathered};
use crate::error::{SweepError, TaskFailure};
use crate::index::{FullIndex, ReducedIndex};
use crate::reduced::ReducedSweep;
use crate::results::ReducedSweepResults;
use crate::task::Task;
use crate::utils;
use crate::value::Value;

/// What a node needs to compute its result.
#[derive(Clone)]
enum Recipe {
    Single {
        point: Point,
        options: Value,
        upstream: Vec<Arc<DelayedNode>>,
        env: Arc<RunEnv>,
    },
    /// Every reduced index of a gathered task, indexed by reduced index.
    Gathered {
        points: Vec<Point>,
        options: Vec<Value>,
        upstream: Vec<Vec<Arc<DelayedNode>>>,
        env: Arc<RunEnv>,
    },
}

/// One memoized reduction of the delayed engine.
///
/// Evaluating a node evaluates its upstream nodes first. The outcome is
/// stored in the node, so the reduction runs at most once however many
/// full indices or downstream nodes ask for it, even from several threads.
pub struct DelayedNode {
    task: Task,
    index: ReducedIndex,
    recipe: Option<Recipe>,
    cell: OnceLock<Outcome>,
}

impl DelayedNode {
    pub(crate) fn new(
        task: Task,
        index: ReducedIndex,
        point: Point,
        options: Value,
        upstream: Vec<Arc<DelayedNode>>,
        env: Arc<RunEnv>,
    ) -> Self {
        Self {
            task,
            index,
            recipe: Some(Recipe::Single {
                point,
                options,
                upstream,
                env,
            }),
            cell: OnceLock::new(),
        }
    }

    /// One node standing for every reduced index of a gathered task. Add it
    /// at each of them.
    pub(crate) fn gathered(
        task: Task,
        points: Vec<Point>,
        options: Vec<Value>,
        upstream: Vec<Vec<Arc<DelayedNode>>>,
        env: Arc<RunEnv>,
    ) -> Self {
        Self {
            task,
            index: ReducedIndex(0),
            recipe: Some(Recipe::Gathered {
                points,
                options,
                upstream,
                env,
            }),
            cell: OnceLock::new(),
        }
    }

    /// A node whose result is already known, e.g. loaded from disk.
    pub fn resolved<T: Data>(task: &Task, index: ReducedIndex, value: T) -> Self {
        Self {
            task: task.clone(),
            index,
            recipe: None,
            cell: OnceLock::from(Ok(Arc::new(value) as Dynamic)),
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn index(&self) -> ReducedIndex {
        self.index
    }

    pub fn is_evaluated(&self) -> bool {
        self.cell.get().is_some()
    }

    /// The outcome if already evaluated. Never evaluates.
    pub fn peek(&self) -> Option<&Outcome> {
        self.cell.get()
    }

    /// Evaluates this node and its upstream, once.
    ///
    /// A failed upstream node fails this node with the same failure.
    pub fn evaluate(&self) -> &Outcome {
        self.cell.get_or_init(|| {
            let Some(recipe) = &self.recipe else {
                return Err(TaskFailure::new(
                    self.task.to_string(),
                    self.index,
                    anyhow::anyhow!("node has neither a value nor a recipe"),
                ));
            };

            match recipe {
                Recipe::Single {
                    point,
                    options,
                    upstream,
                    env,
                } => {
                    let inputs = upstream
                        .iter()
                        .map(|node| node.evaluate().clone())
                        .collect::<Result<Vec<_>, _>>()?;

                    execute(env, &self.task, self.index, point, options, &inputs)
                }
                Recipe::Gathered {
                    points,
                    options,
                    upstream,
                    env,
                } => {
                    let inputs = upstream
                        .iter()
                        .map(|nodes| {
                            nodes
                                .iter()
                                .map(|node| node.evaluate().clone())
                                .collect::<Result<Vec<_>, _>>()
                        })
                        .collect::<Result<Vec<_>, _>>()?;

                    execute_gathered(env, &self.task, points, options, &inputs)
                }
            }
        })
    }

    /// An unevaluated copy sharing the upstream nodes. Resolved nodes are
    /// shared as they are.
    fn fresh(self: &Arc<Self>) -> Arc<Self> {
        match &self.recipe {
            Some(recipe) => Arc::new(Self {
                task: self.task.clone(),
                index: self.index,
                recipe: Some(recipe.clone()),
                cell: OnceLock::new(),
            }),
            None => self.clone(),
        }
    }
}

impl std::fmt::Debug for DelayedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedNode")
            .field("task", &self.task.to_string())
            .field("index", &self.index)
            .field("evaluated", &self.is_evaluated())
            .finish()
    }
}

/// Deferred computation graph of one task over its reduced sweep.
///
/// Holds one node per reduced index. Nodes are added while the graph is
/// built; [`calculate_futures`](Self::calculate_futures) evaluates all of
/// them and seals the structure.
pub struct ReducedSweepDelayed {
    task: Task,
    sweep: Arc<ReducedSweep>,
    nodes: Vec<Option<Arc<DelayedNode>>>,
    sealed: bool,
    parallel: bool,
    progress: bool,
}

impl ReducedSweepDelayed {
    pub(crate) fn new(task: Task, sweep: Arc<ReducedSweep>, parallel: bool, progress: bool) -> Self {
        let nodes = vec![None; sweep.len()];
        Self {
            task,
            sweep,
            nodes,
            sealed: false,
            parallel,
            progress,
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn sweep(&self) -> &ReducedSweep {
        &self.sweep
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Places `node` at `index`, replacing any earlier node.
    pub fn add(&mut self, index: ReducedIndex, node: Arc<DelayedNode>) -> Result<(), SweepError> {
        if self.sealed {
            return Err(SweepError::Sealed(self.task.to_string()));
        }

        let len = self.nodes.len();
        let slot = self.nodes.get_mut(index.index()).ok_or_else(|| {
            SweepError::StructuralMismatch(format!(
                "reduced index {index} is out of range for task '{}' ({len} indices)",
                self.task
            ))
        })?;

        *slot = Some(node);
        Ok(())
    }

    pub fn get_delayed(&self, index: ReducedIndex) -> Result<&Arc<DelayedNode>, SweepError> {
        self.nodes
            .get(index.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                SweepError::StructuralMismatch(format!(
                    "task '{}' has no node at reduced index {index}",
                    self.task
                ))
            })
    }

    /// The node serving full index `full`, evaluated or not.
    pub fn get_object(&self, full: FullIndex) -> Result<&Arc<DelayedNode>, SweepError> {
        let index = self.sweep.convert_to_reduced_index(full).ok_or_else(|| {
            SweepError::StructuralMismatch(format!(
                "full index {full} is out of range for task '{}'",
                self.task
            ))
        })?;

        self.get_delayed(index)
    }

    /// A structurally identical, unevaluated copy. Upstream nodes are shared,
    /// so whatever they already computed is not computed again. A node held
    /// at several indices stays a single node in the copy.
    pub fn copy_empty(&self) -> Self {
        let mut copies: HashMap<*const DelayedNode, Arc<DelayedNode>> = HashMap::new();

        Self {
            task: self.task.clone(),
            sweep: self.sweep.clone(),
            nodes: self
                .nodes
                .iter()
                .map(|node| {
                    node.as_ref().map(|node| {
                        copies
                            .entry(Arc::as_ptr(node))
                            .or_insert_with(|| node.fresh())
                            .clone()
                    })
                })
                .collect(),
            sealed: false,
            parallel: self.parallel,
            progress: self.progress,
        }
    }

    /// Evaluates every node and seals the structure.
    ///
    /// Every failure is kept in its node; the one at the lowest reduced index
    /// is returned. Calling this again only re-reports.
    pub fn calculate_futures(&mut self) -> Result<(), SweepError> {
        let nodes = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| {
                node.as_ref().ok_or_else(|| {
                    SweepError::StructuralMismatch(format!(
                        "reduced index {i} of task '{}' was never added",
                        self.task
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.sealed = true;

        // a gathered task holds one node at every index
        let mut seen = HashSet::new();
        let nodes: Vec<&Arc<DelayedNode>> = nodes
            .into_iter()
            .filter(|node| seen.insert(Arc::as_ptr(node)))
            .collect();

        let span = tracing::info_span!("calculate", task = %self.task);
        utils::progress_start(&span, nodes.len(), self.progress);
        let _enter = span.enter();

        if self.parallel {
            nodes.par_iter().for_each(|node| {
                node.evaluate();
                utils::progress_inc(&span);
            });
        } else {
            for node in &nodes {
                node.evaluate();
                utils::progress_inc(&span);
            }
        }

        let mut failures = nodes
            .iter()
            .filter_map(|node| node.peek().and_then(|outcome| outcome.as_ref().err()));

        match failures.next() {
            Some(failure) => {
                let failed = 1 + failures.count();
                tracing::warn!(failed, total = nodes.len(), "sweep evaluated with failures");
                Err(failure.clone().into())
            }
            None => {
                tracing::info!(total = nodes.len(), "sweep evaluated");
                Ok(())
            }
        }
    }

    /// The result at `full`, evaluating its node if needed.
    pub fn result<T: Any>(&self, full: FullIndex) -> Result<&T, SweepError> {
        downcast(&self.task, self.get_object(full)?.evaluate())
    }

    pub fn outcome(&self, full: FullIndex) -> Result<&Outcome, SweepError> {
        Ok(self.get_object(full)?.evaluate())
    }

    /// Evaluates everything and collects the results in local memory.
    pub fn results(&mut self) -> Result<ReducedSweepResults, SweepError> {
        self.calculate_futures()?;

        let results = self
            .nodes
            .iter()
            .flatten()
            .map(|node| node.evaluate().clone().map_err(SweepError::from))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ReducedSweepResults::new(
            self.task.clone(),
            self.sweep.clone(),
            results,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::bindings::Bindings;
    use crate::task::{Inputs, ReduceContext, Reduction};

    struct Count(Arc<AtomicUsize>);

    impl Reduction for Count {
        const CLASS: &'static str = "count";
        type Output = i64;

        fn reduce(&self, ctx: &ReduceContext, _: &Value, _: &Inputs) -> anyhow::Result<i64> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(ctx.index.index() as i64)
        }
    }

    fn engine(calls: &Arc<AtomicUsize>) -> (Task, ReducedSweepDelayed) {
        let task = Task::new(Count(calls.clone())).build();
        let sweep = Arc::new(ReducedSweep::new(&Bindings::new(), &HashSet::new()).unwrap());
        let env = Arc::new(RunEnv::default());

        let mut engine = ReducedSweepDelayed::new(task.clone(), sweep, true, false);
        let node = DelayedNode::new(
            task.clone(),
            ReducedIndex(0),
            Point::new(),
            Value::Null,
            vec![],
            env,
        );
        engine.add(ReducedIndex(0), Arc::new(node)).unwrap();

        (task, engine)
    }

    #[test]
    fn test_sealed_after_calculate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (task, mut engine) = engine(&calls);

        assert!(!engine.get_object(FullIndex(0)).unwrap().is_evaluated());
        engine.calculate_futures().unwrap();
        engine.calculate_futures().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(engine.is_sealed());

        let late = DelayedNode::resolved(&task, ReducedIndex(0), 7i64);
        assert!(matches!(
            engine.add(ReducedIndex(0), Arc::new(late)),
            Err(SweepError::Sealed(_))
        ));
    }

    #[test]
    fn test_missing_node() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = Task::new(Count(calls)).build();
        let sweep = Arc::new(ReducedSweep::new(&Bindings::new(), &HashSet::new()).unwrap());
        let mut engine = ReducedSweepDelayed::new(task, sweep, false, false);

        assert!(matches!(
            engine.calculate_futures(),
            Err(SweepError::StructuralMismatch(_))
        ));
        assert!(!engine.is_sealed());
    }

    #[test]
    fn test_copy_empty_is_unevaluated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_, mut engine) = engine(&calls);
        engine.calculate_futures().unwrap();

        let mut copy = engine.copy_empty();
        assert!(!copy.is_sealed());
        assert!(!copy.get_object(FullIndex(0)).unwrap().is_evaluated());

        copy.calculate_futures().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(copy.result::<i64>(FullIndex(0)).unwrap(), &0);
    }

    #[test]
    fn test_resolved_node() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (task, mut engine) = engine(&calls);

        engine
            .add(ReducedIndex(0), Arc::new(DelayedNode::resolved(&task, ReducedIndex(0), 41i64)))
            .unwrap();

        assert_eq!(engine.result::<i64>(FullIndex(0)).unwrap(), &41);
        assert!(matches!(
            engine.result::<f64>(FullIndex(0)),
            Err(SweepError::StructuralMismatch(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.copy_empty().result::<i64>(FullIndex(0)).unwrap(), &41);
    }
}
