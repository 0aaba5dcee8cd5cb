//! Execution of a task graph over a sweep.
//!
//! A run first reduces every task of the graph to the tags it depends on,
//! then hands one unit of work per reduced index to an engine: either a
//! graph of memoized [`DelayedNode`]s, or futures submitted to a
//! [`Backend`](crate::Backend). Upstream results are wired by projecting the
//! representative full index of each reduced index onto the upstream task's
//! reduced sweep.

mod delayed;
mod diagnostics;
mod futures;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use camino::Utf8PathBuf;
use petgraph::graph::{Graph, NodeIndex};

use crate::backend::{Backend, Future, Outcome, Work, lock};
use crate::bindings::Point;
use crate::core::Dynamic;
use crate::error::{SweepError, TaskFailure};
use crate::index::{FullIndex, ReducedIndex};
use crate::manager::{Strategy, SweepManager};
use crate::reduced::ReducedSweep;
use crate::results::ReducedSweepResults;
use crate::subst::substitute_points;
use crate::task::{GatherContext, Inputs, ReduceContext, Task};
use crate::value::Value;

pub use delayed::{DelayedNode, ReducedSweepDelayed};
pub use diagnostics::{Diagnostics, TaskExecution};
pub use futures::ReducedSweepFutures;

/// State shared by every reduction of one run.
#[derive(Default)]
pub(crate) struct RunEnv {
    output_dir: Option<Utf8PathBuf>,
    diagnostics: Mutex<Diagnostics>,
}

impl RunEnv {
    fn record(&self, task: &Task, index: ReducedIndex, execution: TaskExecution) {
        lock(&self.diagnostics).record(task, index, execution);
    }
}

/// Runs one reduction, turning errors and panics into a [`TaskFailure`].
pub(crate) fn execute(
    env: &RunEnv,
    task: &Task,
    index: ReducedIndex,
    point: &Point,
    options: &Value,
    inputs: &[Dynamic],
) -> Outcome {
    let span = tracing::info_span!("reduce", task = %task, index = index.index());
    let _enter = span.enter();

    let ctx = ReduceContext {
        task,
        index,
        point,
        output_dir: env.output_dir.as_deref(),
        span: span.clone(),
    };
    let inputs = Inputs::new(task, inputs);

    guarded(env, task, index, || task.reduction().reduce(&ctx, options, &inputs))
}

/// Runs a gathered reduction over every reduced index of `task` at once.
///
/// Timing and failures are reported under reduced index 0.
pub(crate) fn execute_gathered(
    env: &RunEnv,
    task: &Task,
    points: &[Point],
    options: &[Value],
    inputs: &[Vec<Dynamic>],
) -> Outcome {
    let span = tracing::info_span!("reduce_gathered", task = %task, indices = points.len());
    let _enter = span.enter();

    let ctx = GatherContext {
        task,
        points,
        output_dir: env.output_dir.as_deref(),
        span: span.clone(),
    };
    let inputs: Vec<Inputs> = inputs.iter().map(|items| Inputs::new(task, items)).collect();

    guarded(env, task, ReducedIndex(0), || {
        task.reduction().reduce_gathered(&ctx, options, &inputs)
    })
}

fn guarded(
    env: &RunEnv,
    task: &Task,
    index: ReducedIndex,
    reduce: impl FnOnce() -> anyhow::Result<Dynamic>,
) -> Outcome {
    let start = Instant::now();

    // A panicking reduction only ever sees its own inputs, which are
    // immutable, so nothing shared is left half-written.
    let output = match std::panic::catch_unwind(AssertUnwindSafe(reduce)) {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!(panic_message(&*panic))),
    };

    env.record(
        task,
        index,
        TaskExecution {
            start,
            duration: start.elapsed(),
        },
    );

    output.map_err(|cause| {
        tracing::error!("{cause:#}");
        TaskFailure::new(task.to_string(), index, cause)
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    }
}

/// Reads a successful outcome as `T`.
pub(crate) fn downcast<'a, T: Any>(task: &Task, outcome: &'a Outcome) -> Result<&'a T, SweepError> {
    match outcome {
        Ok(value) => value.downcast_ref::<T>().ok_or_else(|| {
            SweepError::StructuralMismatch(format!(
                "task '{task}' produces {}, not {}",
                task.output_type_name(),
                std::any::type_name::<T>()
            ))
        }),
        Err(failure) => Err(failure.clone().into()),
    }
}

/// The task graph below `root`, deduplicated by task identity, and its
/// topological order (upstream first).
pub(crate) fn task_graph(root: &Task) -> Result<(Graph<Task, ()>, Vec<NodeIndex>), SweepError> {
    fn visit(task: &Task, graph: &mut Graph<Task, ()>, seen: &mut HashMap<u64, NodeIndex>) -> NodeIndex {
        if let Some(&index) = seen.get(&task.instance()) {
            return index;
        }

        let index = graph.add_node(task.clone());
        seen.insert(task.instance(), index);

        for upstream in task.upstream() {
            let source = visit(upstream, graph, seen);
            graph.add_edge(source, index, ());
        }

        index
    }

    let mut graph = Graph::new();
    visit(root, &mut graph, &mut HashMap::new());

    let order = petgraph::algo::toposort(&graph, None).map_err(|cycle| {
        SweepError::StructuralMismatch(format!(
            "task graph has a cycle through '{}'",
            graph[cycle.node_id()]
        ))
    })?;

    Ok((graph, order))
}

/// A task with its reduced sweep and the options substituted at every
/// reduced index.
struct Prepared {
    task: Task,
    sweep: Arc<ReducedSweep>,
    options: Vec<Value>,
}

impl Prepared {
    fn representative(&self, index: ReducedIndex) -> Result<FullIndex, SweepError> {
        self.sweep.representative(index).ok_or_else(|| {
            SweepError::StructuralMismatch(format!(
                "reduced index {index} of task '{}' has no full index",
                self.task
            ))
        })
    }

    fn point(&self, index: ReducedIndex) -> Point {
        self.sweep.point(index).cloned().unwrap_or_default()
    }
}

enum Engine {
    Delayed(HashMap<u64, ReducedSweepDelayed>),
    Futures(HashMap<u64, ReducedSweepFutures>),
}

/// Handle to a task graph executing over a sweep.
///
/// Whatever the strategy, results become available through the same calls;
/// [`SweepRun::wait`] is the only call that blocks on the whole sweep.
pub struct SweepRun {
    root: Task,
    graph: Graph<Task, ()>,
    order: Vec<NodeIndex>,
    sweeps: HashMap<u64, Arc<ReducedSweep>>,
    engine: Engine,
    env: Arc<RunEnv>,
}

impl SweepRun {
    pub(crate) fn start(
        manager: &SweepManager,
        root: &Task,
        strategy: Strategy,
    ) -> Result<Self, SweepError> {
        let span = tracing::info_span!("sweep", task = %root, points = manager.len());
        let _enter = span.enter();

        let (graph, order) = task_graph(root)?;

        let env = Arc::new(RunEnv {
            output_dir: manager.get_output_dir().map(ToOwned::to_owned),
            diagnostics: Mutex::default(),
        });

        let mut prepared = Vec::with_capacity(order.len());
        for &node in &order {
            let task = graph[node].clone();
            let sweep = Arc::new(ReducedSweep::new(manager.bindings(), task.tags())?);
            let options = substitute_points(task.options(), sweep.points())?;

            tracing::debug!(task = %task, reduced = sweep.len(), "reduced sweep");
            prepared.push(Prepared {
                task,
                sweep,
                options,
            });
        }

        let eager = matches!(strategy, Strategy::Eager);
        let engine = match strategy {
            Strategy::Eager | Strategy::Delayed => Engine::Delayed(build_delayed(
                &prepared,
                &env,
                manager.is_parallel(),
                manager.shows_progress(),
            )?),
            Strategy::Futures(backend) => Engine::Futures(submit_futures(
                &prepared,
                &env,
                backend,
                manager.shows_progress(),
            )?),
        };

        let sweeps = prepared
            .into_iter()
            .map(|p| (p.task.instance(), p.sweep))
            .collect();

        let mut run = SweepRun {
            root: root.clone(),
            graph,
            order,
            sweeps,
            engine,
            env,
        };

        if eager && let Err(e) = run.wait() {
            tracing::warn!("eager evaluation failed: {e}");
        }

        Ok(run)
    }

    /// The task this run was started for.
    pub fn root(&self) -> &Task {
        &self.root
    }

    /// Every task of the graph, upstream first.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().map(|&node| &self.graph[node])
    }

    pub(crate) fn graph(&self) -> &Graph<Task, ()> {
        &self.graph
    }

    pub fn reduced_sweep(&self, task: &Task) -> Option<&ReducedSweep> {
        self.sweeps.get(&task.instance()).map(|sweep| &**sweep)
    }

    /// The delayed engine of `task`, if this run uses one.
    pub fn delayed(&self, task: &Task) -> Option<&ReducedSweepDelayed> {
        match &self.engine {
            Engine::Delayed(engines) => engines.get(&task.instance()),
            Engine::Futures(_) => None,
        }
    }

    /// The futures engine of `task`, if this run uses one.
    pub fn futures(&self, task: &Task) -> Option<&ReducedSweepFutures> {
        match &self.engine {
            Engine::Futures(engines) => engines.get(&task.instance()),
            Engine::Delayed(_) => None,
        }
    }

    /// Evaluates or gathers every task and reports the first failure, in
    /// topological order and then by reduced index.
    ///
    /// Results of indices that did not fail stay available afterwards.
    pub fn wait(&mut self) -> Result<(), SweepError> {
        let mut first = None;

        match &mut self.engine {
            Engine::Delayed(engines) => {
                for node in &self.order {
                    let instance = self.graph[*node].instance();
                    if let Some(engine) = engines.get_mut(&instance)
                        && let Err(e) = engine.calculate_futures()
                    {
                        first.get_or_insert(e);
                    }
                }
            }
            Engine::Futures(engines) => {
                for node in &self.order {
                    let instance = self.graph[*node].instance();
                    if let Some(engine) = engines.get(&instance)
                        && let Err(e) = engine.wait()
                    {
                        first.get_or_insert(e);
                    }
                }
            }
        }

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The root task's result at `full`.
    pub fn result<T: Any>(&self, full: FullIndex) -> Result<&T, SweepError> {
        self.result_of(&self.root, full)
    }

    /// The result of any task of the graph at `full`.
    ///
    /// Under the delayed engine this evaluates the node on demand; under the
    /// futures engine it requires a prior [`SweepRun::wait`].
    pub fn result_of<T: Any>(&self, task: &Task, full: FullIndex) -> Result<&T, SweepError> {
        match &self.engine {
            Engine::Delayed(engines) => engines
                .get(&task.instance())
                .ok_or_else(|| not_in_run(task))?
                .result(full),
            Engine::Futures(engines) => engines
                .get(&task.instance())
                .ok_or_else(|| not_in_run(task))?
                .result(full),
        }
    }

    /// Gathers the root task's results.
    pub fn results(&mut self) -> Result<ReducedSweepResults, SweepError> {
        let root = self.root.clone();
        self.results_of(&root)
    }

    /// Under the delayed engine, the upstream of `task` is evaluated first,
    /// one task at a time in topological order, so a parallel evaluation
    /// never waits on a node another worker is still computing.
    pub fn results_of(&mut self, task: &Task) -> Result<ReducedSweepResults, SweepError> {
        match &mut self.engine {
            Engine::Delayed(engines) => {
                let upstream = upstream_instances(task);

                for node in &self.order {
                    let instance = self.graph[*node].instance();
                    if upstream.contains(&instance)
                        && let Some(engine) = engines.get_mut(&instance)
                        && let Err(e) = engine.calculate_futures()
                    {
                        tracing::debug!(task = %engine.task(), "upstream failed: {e}");
                    }
                }

                engines
                    .get_mut(&task.instance())
                    .ok_or_else(|| not_in_run(task))?
                    .results()
            }
            Engine::Futures(engines) => engines
                .get(&task.instance())
                .ok_or_else(|| not_in_run(task))?
                .results(),
        }
    }

    /// Timings of every reduction run so far.
    pub fn diagnostics(&self) -> Diagnostics {
        lock(&self.env.diagnostics).clone()
    }
}

/// Instances of every task strictly upstream of `task`.
fn upstream_instances(task: &Task) -> HashSet<u64> {
    let mut seen = HashSet::new();
    let mut stack: Vec<&Task> = task.upstream().iter().collect();

    while let Some(task) = stack.pop() {
        if seen.insert(task.instance()) {
            stack.extend(task.upstream());
        }
    }

    seen
}

fn not_in_run(task: &Task) -> SweepError {
    SweepError::StructuralMismatch(format!("task '{task}' is not part of this run"))
}

fn build_delayed(
    prepared: &[Prepared],
    env: &Arc<RunEnv>,
    parallel: bool,
    progress: bool,
) -> Result<HashMap<u64, ReducedSweepDelayed>, SweepError> {
    let mut engines: HashMap<u64, ReducedSweepDelayed> = HashMap::new();

    let upstream_of = |engines: &HashMap<u64, ReducedSweepDelayed>, task: &Task, full: FullIndex| {
        task.upstream()
            .iter()
            .map(|task| {
                engines
                    .get(&task.instance())
                    .ok_or_else(|| not_in_run(task))?
                    .get_object(full)
                    .cloned()
            })
            .collect::<Result<Vec<_>, _>>()
    };

    for p in prepared {
        let mut engine = ReducedSweepDelayed::new(p.task.clone(), p.sweep.clone(), parallel, progress);

        if p.task.is_gathered() {
            let upstream = p
                .sweep
                .indices()
                .map(|index| upstream_of(&engines, &p.task, p.representative(index)?))
                .collect::<Result<Vec<_>, _>>()?;

            let node = Arc::new(DelayedNode::gathered(
                p.task.clone(),
                p.sweep.points().to_vec(),
                p.options.clone(),
                upstream,
                env.clone(),
            ));

            for index in p.sweep.indices() {
                engine.add(index, node.clone())?;
            }
        } else {
            for (index, options) in p.sweep.indices().zip(&p.options) {
                let upstream = upstream_of(&engines, &p.task, p.representative(index)?)?;

                let node = DelayedNode::new(
                    p.task.clone(),
                    index,
                    p.point(index),
                    options.clone(),
                    upstream,
                    env.clone(),
                );
                engine.add(index, Arc::new(node))?;
            }
        }

        engines.insert(p.task.instance(), engine);
    }

    Ok(engines)
}

fn submit_futures(
    prepared: &[Prepared],
    env: &Arc<RunEnv>,
    backend: Arc<dyn Backend>,
    progress: bool,
) -> Result<HashMap<u64, ReducedSweepFutures>, SweepError> {
    let mut engines: HashMap<u64, ReducedSweepFutures> = HashMap::new();

    let deps_of = |engines: &HashMap<u64, ReducedSweepFutures>, task: &Task, full: FullIndex| {
        task.upstream()
            .iter()
            .map(|task| {
                engines
                    .get(&task.instance())
                    .ok_or_else(|| not_in_run(task))?
                    .get_future(full)
            })
            .collect::<Result<Vec<_>, _>>()
    };

    for p in prepared {
        let engine = ReducedSweepFutures::new(p.task.clone(), p.sweep.clone(), backend.clone(), progress);

        if p.task.is_gathered() {
            let deps = p
                .sweep
                .indices()
                .map(|index| deps_of(&engines, &p.task, p.representative(index)?))
                .collect::<Result<Vec<_>, _>>()?;
            let all: Vec<Future> = deps.iter().flatten().cloned().collect();

            let env = env.clone();
            let task = p.task.clone();
            let points = p.sweep.points().to_vec();
            let options = p.options.clone();

            let work: Work = Box::new(move || -> Outcome {
                let inputs = deps
                    .iter()
                    .map(|deps| resolve(&task, ReducedIndex(0), deps))
                    .collect::<Result<Vec<_>, _>>()?;

                execute_gathered(&env, &task, &points, &options, &inputs)
            });
            engine.add_gathered(work, &all)?;
        } else {
            for (index, options) in p.sweep.indices().zip(&p.options) {
                let deps = deps_of(&engines, &p.task, p.representative(index)?)?;

                let work = work_unit(
                    env.clone(),
                    p.task.clone(),
                    index,
                    p.point(index),
                    options.clone(),
                    deps.clone(),
                );
                engine.add(index, work, &deps)?;
            }
        }

        engines.insert(p.task.instance(), engine);
    }

    Ok(engines)
}

fn work_unit(
    env: Arc<RunEnv>,
    task: Task,
    index: ReducedIndex,
    point: Point,
    options: Value,
    deps: Vec<Future>,
) -> Work {
    Box::new(move || -> Outcome {
        let inputs = resolve(&task, index, &deps)?;
        execute(&env, &task, index, &point, &options, &inputs)
    })
}

/// The outcomes of completed dependencies, or the first upstream failure.
fn resolve(task: &Task, index: ReducedIndex, deps: &[Future]) -> Result<Vec<Dynamic>, TaskFailure> {
    deps.iter()
        .map(|dep| match dep.outcome() {
            Some(outcome) => outcome.clone(),
            None => Err(TaskFailure::new(
                task.to_string(),
                index,
                anyhow::anyhow!("an upstream future was still pending when the work started"),
            )),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::Bindings;
    use crate::tag::Tag;
    use crate::task::Reduction;

    struct Count;

    impl Reduction for Count {
        const CLASS: &'static str = "count";
        type Output = Vec<i64>;

        fn reduce(&self, _: &ReduceContext, _: &Value, inputs: &Inputs) -> anyhow::Result<Vec<i64>> {
            Ok(vec![inputs.len() as i64])
        }
    }

    #[test]
    fn test_task_graph_diamond() {
        let source = Task::new(Count).name("source").build();
        let left = Task::new(Count).name("left").depends_on(&source).build();
        let right = Task::new(Count).name("right").depends_on(&source).build();
        let sink = Task::new(Count).name("sink").depends_on(&left).depends_on(&right).build();

        let (graph, order) = task_graph(&sink).unwrap();
        assert_eq!(graph.node_count(), 4);
        assert_eq!(graph.edge_count(), 4);

        let names: Vec<&str> = order.iter().map(|&node| graph[node].name()).collect();
        assert_eq!(names.first(), Some(&"source"));
        assert_eq!(names.last(), Some(&"sink"));
    }

    #[test]
    fn test_panic_message() {
        let panic = std::panic::catch_unwind(|| panic!("out of memory")).unwrap_err();
        assert_eq!(panic_message(&*panic), "Task panicked: out of memory");

        let panic = std::panic::catch_unwind(|| std::panic::panic_any(7_u8)).unwrap_err();
        assert_eq!(panic_message(&*panic), "Task panicked with unknown payload");
    }

    #[test]
    fn test_downcast_wrong_type() {
        let task = Task::new(Count).build();
        let outcome: Outcome = Ok(Arc::new(vec![1_i64]));

        assert_eq!(downcast::<Vec<i64>>(&task, &outcome).unwrap(), &vec![1]);
        assert!(matches!(
            downcast::<f64>(&task, &outcome),
            Err(SweepError::StructuralMismatch(_))
        ));
    }

    #[test]
    fn test_render_mermaid() {
        let x = Tag::new("x");
        let manager = SweepManager::construct_cartesian_product(Bindings::new().bind(&x, [1, 2]))
            .unwrap()
            .progress(false);

        let source = Task::new(Count).name("source").options(Value::map([("x", &x)])).build();
        let sink = Task::new(Count).name("sink").depends_on(&source).build();

        let run = manager.run(&sink, Strategy::Delayed).unwrap();
        let before = run.diagnostics().render_mermaid(&run);
        assert!(before.starts_with("graph LR"));
        assert!(before.contains("0/2"));
        assert!(before.contains("#ADD8E6"));

        assert_eq!(run.result::<Vec<i64>>(FullIndex(1)).unwrap(), &vec![1]);

        let after = run.diagnostics().render_mermaid(&run);
        assert!(after.contains("1/2 in"));
        assert!(after.contains("Vec&lt;i64&gt;"));
    }
}
