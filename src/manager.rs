use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::backend::{Backend, InlineBackend, PoolBackend};
use crate::bindings::{Bindings, Point};
use crate::engine::SweepRun;
use crate::error::SweepError;
use crate::index::FullIndex;
use crate::reduced::ReducedSweep;
use crate::results::ReducedSweepResults;
use crate::task::Task;

/// How a run executes its reductions.
#[derive(Clone)]
pub enum Strategy {
    /// Build the delayed graph and evaluate it before returning.
    Eager,
    /// Build the delayed graph; evaluate on [`SweepRun::wait`] or on demand.
    Delayed,
    /// Submit every reduction to a backend right away.
    Futures(Arc<dyn Backend>),
}

impl Strategy {
    /// Futures run inline, as soon as their dependencies complete.
    pub fn inline() -> Self {
        Strategy::Futures(Arc::new(InlineBackend))
    }

    /// Futures run on a dedicated pool of `workers` threads.
    pub fn pool(workers: usize) -> Result<Self, SweepError> {
        Ok(Strategy::Futures(Arc::new(PoolBackend::new(workers)?)))
    }
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Eager => write!(f, "Eager"),
            Strategy::Delayed => write!(f, "Delayed"),
            Strategy::Futures(backend) => write!(f, "Futures({})", backend.name()),
        }
    }
}

/// The full sweep: the cartesian product of all bindings, plus the
/// configuration runs are started with.
#[derive(Debug, Clone)]
pub struct SweepManager {
    bindings: Bindings,
    points: Vec<Point>,
    output_dir: Option<Utf8PathBuf>,
    parallel: bool,
    progress: bool,
}

impl SweepManager {
    /// Enumerates every combination of bound values, the last bound tag
    /// varying fastest.
    ///
    /// Every binding must be non-empty.
    pub fn construct_cartesian_product(bindings: Bindings) -> Result<Self, SweepError> {
        bindings.validate()?;

        let shape = bindings.shape();
        let points = (0..shape.len())
            .map(|flat| bindings.point(&shape.unravel(flat)))
            .collect();

        tracing::info!(axes = bindings.len(), points = shape.len(), "constructed sweep");

        Ok(Self {
            bindings,
            points,
            output_dir: None,
            parallel: false,
            progress: true,
        })
    }

    /// A sweep of exactly one point and no tags.
    pub fn single() -> Self {
        Self {
            bindings: Bindings::new(),
            points: vec![Point::new()],
            output_dir: None,
            parallel: false,
            progress: true,
        }
    }

    /// Directory reductions may write to, see
    /// [`ReduceContext::output_path`](crate::ReduceContext::output_path).
    pub fn output_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Evaluate independent delayed nodes on the rayon pool.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn get_output_dir(&self) -> Option<&Utf8Path> {
        self.output_dir.as_deref()
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    pub fn shows_progress(&self) -> bool {
        self.progress
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    /// All full-sweep points, in full index order.
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn point(&self, index: FullIndex) -> Option<&Point> {
        self.points.get(index.index())
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn indices(&self) -> impl Iterator<Item = FullIndex> + use<> {
        (0..self.len()).map(FullIndex)
    }

    /// One empty slot per full index.
    pub fn create_empty_sweep<T>(&self) -> Vec<Option<T>> {
        std::iter::repeat_with(|| None).take(self.len()).collect()
    }

    /// The reduced sweep of `task` against these bindings.
    pub fn reduce_to(&self, task: &Task) -> Result<ReducedSweep, SweepError> {
        ReducedSweep::new(&self.bindings, task.tags())
    }

    /// Runs `task` and its upstream over this sweep.
    pub fn run(&self, task: &Task, strategy: Strategy) -> Result<SweepRun, SweepError> {
        tracing::info!(task = %task, ?strategy, "starting run");
        SweepRun::start(self, task, strategy)
    }

    /// Loads results of `task` persisted by
    /// [`ReducedSweepResults::persist`].
    pub fn load_results(&self, task: &Task, dir: &Utf8Path) -> Result<ReducedSweepResults, SweepError> {
        ReducedSweepResults::load(task, Arc::new(self.reduce_to(task)?), dir)
    }
}
