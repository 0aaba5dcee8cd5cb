//! Tasks and the reductions they run.
use std::any::Any;
use std::collections::HashSet;
use std::fmt::{Debug, Display};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};

use crate::bindings::Point;
use crate::core::Dynamic;
use crate::data::Data;
use crate::engine::SweepRun;
use crate::error::{DataError, SweepError};
use crate::index::ReducedIndex;
use crate::manager::{Strategy, SweepManager};
use crate::subst::extract_tags;
use crate::tag::Tag;
use crate::value::Value;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(0);

/// A class of computation that can be swept.
///
/// `reduce` must be a pure function of its options and inputs; the only side
/// effect allowed is an explicit write below [`ReduceContext::output_path`].
///
/// ```rust,ignore
/// #[derive(Default)]
/// struct Capacitance;
///
/// impl Reduction for Capacitance {
///     const CLASS: &'static str = "capacitance";
///     type Output = f64;
///
///     fn reduce(&self, _: &ReduceContext, options: &Value, inputs: &Inputs) -> anyhow::Result<f64> {
///         let field: &Vec<f64> = inputs.get(0)?;
///         let voltage = options.get("voltage").and_then(Value::as_f64).unwrap_or(0.0);
///         Ok(field.iter().sum::<f64>() / voltage)
///     }
/// }
/// ```
pub trait Reduction: Send + Sync + 'static {
    /// Stable identifier used by the [`Registry`](crate::Registry) and in
    /// persisted descriptions.
    const CLASS: &'static str;

    /// The concrete output type of this reduction.
    type Output: Data;

    fn reduce(
        &self,
        ctx: &ReduceContext<'_>,
        options: &Value,
        inputs: &Inputs<'_>,
    ) -> anyhow::Result<Self::Output>;
}

/// A class of computation that runs once over every reduced index of its
/// task, such as meshing all geometries of a sweep in one batch.
///
/// The single output stands for every reduced index, so downstream tasks
/// receive it whatever point they are evaluated at.
pub trait GatherReduction: Send + Sync + 'static {
    /// Stable identifier, sharing one namespace with [`Reduction::CLASS`].
    const CLASS: &'static str;

    type Output: Data;

    /// `options[i]` and `inputs[i]` belong to reduced index `i`.
    fn reduce_gathered(
        &self,
        ctx: &GatherContext<'_>,
        options: &[Value],
        inputs: &[Inputs<'_>],
    ) -> anyhow::Result<Self::Output>;
}

/// The type-erased side of [`Reduction`] and [`GatherReduction`], so one
/// graph can hold reductions with different output types.
pub(crate) trait ErasedReduction: Send + Sync {
    fn class(&self) -> &'static str;

    fn output_type_name(&self) -> &'static str;

    /// Whether the engines must call [`reduce_gathered`](Self::reduce_gathered)
    /// instead of [`reduce`](Self::reduce).
    fn is_gathered(&self) -> bool;

    fn reduce(
        &self,
        ctx: &ReduceContext<'_>,
        options: &Value,
        inputs: &Inputs<'_>,
    ) -> anyhow::Result<Dynamic>;

    fn reduce_gathered(
        &self,
        ctx: &GatherContext<'_>,
        options: &[Value],
        inputs: &[Inputs<'_>],
    ) -> anyhow::Result<Dynamic>;

    fn save(&self, output: &Dynamic, path: &Utf8Path) -> Result<(), DataError>;

    fn load(&self, path: &Utf8Path) -> Result<Dynamic, DataError>;
}

fn save_as<T: Data>(output: &Dynamic, path: &Utf8Path) -> Result<(), DataError> {
    output
        .downcast_ref::<T>()
        .ok_or(DataError::WrongType {
            expected: std::any::type_name::<T>(),
        })?
        .save(path)
}

fn load_as<T: Data>(path: &Utf8Path) -> Result<Dynamic, DataError> {
    Ok(Arc::new(T::load(path)?))
}

// This is where the type erasure actually happens.
impl<R: Reduction> ErasedReduction for R {
    fn class(&self) -> &'static str {
        R::CLASS
    }

    fn output_type_name(&self) -> &'static str {
        std::any::type_name::<R::Output>()
    }

    fn is_gathered(&self) -> bool {
        false
    }

    fn reduce(
        &self,
        ctx: &ReduceContext<'_>,
        options: &Value,
        inputs: &Inputs<'_>,
    ) -> anyhow::Result<Dynamic> {
        Ok(Arc::new(<R as Reduction>::reduce(self, ctx, options, inputs)?))
    }

    fn reduce_gathered(
        &self,
        _: &GatherContext<'_>,
        _: &[Value],
        _: &[Inputs<'_>],
    ) -> anyhow::Result<Dynamic> {
        anyhow::bail!("'{}' reduces one index at a time", R::CLASS)
    }

    fn save(&self, output: &Dynamic, path: &Utf8Path) -> Result<(), DataError> {
        save_as::<R::Output>(output, path)
    }

    fn load(&self, path: &Utf8Path) -> Result<Dynamic, DataError> {
        load_as::<R::Output>(path)
    }
}

/// Erases a [`GatherReduction`]. A separate wrapper, since a second blanket
/// impl would overlap the one for [`Reduction`].
pub(crate) struct Gathered<G>(pub(crate) G);

impl<G: GatherReduction> ErasedReduction for Gathered<G> {
    fn class(&self) -> &'static str {
        G::CLASS
    }

    fn output_type_name(&self) -> &'static str {
        std::any::type_name::<G::Output>()
    }

    fn is_gathered(&self) -> bool {
        true
    }

    fn reduce(&self, _: &ReduceContext<'_>, _: &Value, _: &Inputs<'_>) -> anyhow::Result<Dynamic> {
        anyhow::bail!("'{}' only reduces all of its indices at once", G::CLASS)
    }

    fn reduce_gathered(
        &self,
        ctx: &GatherContext<'_>,
        options: &[Value],
        inputs: &[Inputs<'_>],
    ) -> anyhow::Result<Dynamic> {
        Ok(Arc::new(self.0.reduce_gathered(ctx, options, inputs)?))
    }

    fn save(&self, output: &Dynamic, path: &Utf8Path) -> Result<(), DataError> {
        save_as::<G::Output>(output, path)
    }

    fn load(&self, path: &Utf8Path) -> Result<Dynamic, DataError> {
        load_as::<G::Output>(path)
    }
}

/// Everything a reduction can see about the point it is evaluated at.
pub struct ReduceContext<'a> {
    pub task: &'a Task,
    pub index: ReducedIndex,
    /// Values of the tags this task depends on.
    pub point: &'a Point,
    pub output_dir: Option<&'a Utf8Path>,
    pub span: tracing::Span,
}

impl ReduceContext<'_> {
    /// A path reserved for this task at this reduced index, or `None` when the
    /// manager has no output directory.
    pub fn output_path(&self, file: &str) -> Option<Utf8PathBuf> {
        self.output_dir.map(|dir| {
            dir.join(self.task.to_string())
                .join(self.index.to_string())
                .join(file)
        })
    }
}

/// What a gathered reduction sees: every reduced point of its task at once.
pub struct GatherContext<'a> {
    pub task: &'a Task,
    /// Indexed by reduced index.
    pub points: &'a [Point],
    pub output_dir: Option<&'a Utf8Path>,
    pub span: tracing::Span,
}

impl GatherContext<'_> {
    /// A path reserved for this task, or `None` when the manager has no
    /// output directory.
    pub fn output_path(&self, file: &str) -> Option<Utf8PathBuf> {
        self.output_dir
            .map(|dir| dir.join(self.task.to_string()).join(file))
    }
}

/// Upstream results, in the order the upstream tasks were declared.
pub struct Inputs<'a> {
    task: &'a Task,
    items: &'a [Dynamic],
}

impl<'a> Inputs<'a> {
    pub(crate) fn new(task: &'a Task, items: &'a [Dynamic]) -> Self {
        Self { task, items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The result of the `i`-th upstream task.
    pub fn get<T: Any>(&self, i: usize) -> Result<&'a T, SweepError> {
        let item = self.items.get(i).ok_or_else(|| {
            SweepError::StructuralMismatch(format!(
                "task '{}' has {} inputs, requested input {i}",
                self.task,
                self.items.len()
            ))
        })?;

        item.downcast_ref::<T>().ok_or_else(|| {
            SweepError::StructuralMismatch(format!(
                "input {i} of task '{}' is not a {}",
                self.task,
                std::any::type_name::<T>()
            ))
        })
    }
}

struct TaskInner {
    name: String,
    instance: u64,
    options: Value,
    upstream: Vec<Task>,
    tags: HashSet<Tag>,
    reduction: Arc<dyn ErasedReduction>,
}

/// One node of a task graph: a reduction, its (possibly tagged) options and
/// the tasks whose results it consumes.
///
/// Tasks are immutable and cheap to clone. Two tasks are the same task only
/// if they are clones of one another.
#[derive(Clone)]
pub struct Task(Arc<TaskInner>);

impl Task {
    pub fn new<R: Reduction>(reduction: R) -> TaskBuilder {
        TaskBuilder {
            name: R::CLASS.to_string(),
            options: Value::Null,
            upstream: Vec::new(),
            reduction: Arc::new(reduction),
        }
    }

    /// A task running `reduction` once over all of its reduced indices.
    pub fn gathered<G: GatherReduction>(reduction: G) -> TaskBuilder {
        TaskBuilder {
            name: G::CLASS.to_string(),
            options: Value::Null,
            upstream: Vec::new(),
            reduction: Arc::new(Gathered(reduction)),
        }
    }

    pub(crate) fn from_erased(
        name: String,
        options: Value,
        upstream: Vec<Task>,
        reduction: Arc<dyn ErasedReduction>,
    ) -> Self {
        let mut tags = extract_tags(&options);
        for task in &upstream {
            tags.extend(task.tags().iter().cloned());
        }

        Task(Arc::new(TaskInner {
            name,
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            options,
            upstream,
            tags,
            reduction,
        }))
    }

    /// Human readable name, not necessarily unique.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn class(&self) -> &'static str {
        self.0.reduction.class()
    }

    /// Monotonic counter telling apart tasks of the same class.
    pub fn instance(&self) -> u64 {
        self.0.instance
    }

    pub fn options(&self) -> &Value {
        &self.0.options
    }

    pub fn upstream(&self) -> &[Task] {
        &self.0.upstream
    }

    /// Every tag this task depends on, directly or through its upstream.
    pub fn tags(&self) -> &HashSet<Tag> {
        &self.0.tags
    }

    pub fn output_type_name(&self) -> &'static str {
        self.0.reduction.output_type_name()
    }

    /// Whether this task runs once over all of its reduced indices.
    pub fn is_gathered(&self) -> bool {
        self.0.reduction.is_gathered()
    }

    pub(crate) fn reduction(&self) -> &dyn ErasedReduction {
        &*self.0.reduction
    }

    /// Runs this task and its upstream over the sweep of `manager`.
    pub fn run(&self, manager: &SweepManager, strategy: Strategy) -> Result<SweepRun, SweepError> {
        manager.run(self, strategy)
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.instance() == other.instance()
    }
}

impl Eq for Task {}

impl Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.name(), self.instance())
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name())
            .field("class", &self.class())
            .field("instance", &self.instance())
            .field("options", self.options())
            .field("upstream", &self.upstream().iter().map(Task::to_string).collect::<Vec<_>>())
            .finish()
    }
}

pub struct TaskBuilder {
    name: String,
    options: Value,
    upstream: Vec<Task>,
    reduction: Arc<dyn ErasedReduction>,
}

impl TaskBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn options(mut self, options: impl Into<Value>) -> Self {
        self.options = options.into();
        self
    }

    /// Appends an upstream task; its result becomes the next input.
    pub fn depends_on(mut self, task: &Task) -> Self {
        self.upstream.push(task.clone());
        self
    }

    pub fn build(self) -> Task {
        Task::from_erased(self.name, self.options, self.upstream, self.reduction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Constant;

    impl Reduction for Constant {
        const CLASS: &'static str = "constant";
        type Output = f64;

        fn reduce(&self, _: &ReduceContext, options: &Value, _: &Inputs) -> anyhow::Result<f64> {
            Ok(options.get("value").and_then(Value::as_f64).unwrap_or_default())
        }
    }

    #[test]
    fn test_tags_are_collected_transitively() {
        let a = Tag::new("a");
        let b = Tag::new("b");

        let first = Task::new(Constant)
            .options(Value::map([("value", &a)]))
            .build();
        let second = Task::new(Constant)
            .options(Value::map([("value", Value::from(&b * 2.0))]))
            .depends_on(&first)
            .build();

        assert_eq!(first.tags(), &HashSet::from([a.clone()]));
        assert_eq!(second.tags(), &HashSet::from([a, b]));
        assert_eq!(second.upstream(), &[first.clone()]);
    }

    #[test]
    fn test_instances_are_distinct() {
        let one = Task::new(Constant).build();
        let two = Task::new(Constant).build();

        assert_eq!(one.name(), "constant");
        assert_eq!(one.class(), "constant");
        assert!(one.instance() < two.instance());
        assert_ne!(one, two);
        assert_eq!(one, one.clone());
        assert_eq!(one.to_string(), format!("constant#{}", one.instance()));
    }

    #[test]
    fn test_inputs_type_mismatch() {
        let task = Task::new(Constant).build();
        let items: Vec<Dynamic> = vec![Arc::new(1.5f64)];
        let inputs = Inputs::new(&task, &items);

        assert_eq!(inputs.get::<f64>(0).unwrap(), &1.5);
        assert!(matches!(inputs.get::<String>(0), Err(SweepError::StructuralMismatch(_))));
        assert!(matches!(inputs.get::<f64>(1), Err(SweepError::StructuralMismatch(_))));
    }

    struct Batch;

    impl GatherReduction for Batch {
        const CLASS: &'static str = "batch";
        type Output = Vec<f64>;

        fn reduce_gathered(
            &self,
            _: &GatherContext,
            options: &[Value],
            _: &[Inputs],
        ) -> anyhow::Result<Vec<f64>> {
            Ok(options.iter().filter_map(|o| o.get("value")?.as_f64()).collect())
        }
    }

    #[test]
    fn test_gathered_erasure() {
        let batch = Task::gathered(Batch).options(Value::map([("value", 1.0)])).build();
        let single = Task::new(Constant).build();

        assert!(batch.is_gathered());
        assert!(!single.is_gathered());
        assert_eq!(batch.class(), "batch");
        assert_eq!(batch.output_type_name(), std::any::type_name::<Vec<f64>>());

        let ctx = GatherContext {
            task: &batch,
            points: &[Point::new(), Point::new()],
            output_dir: None,
            span: tracing::Span::none(),
        };
        let options = [Value::map([("value", 1.0)]), Value::map([("value", 2.0)])];
        let output = batch.reduction().reduce_gathered(&ctx, &options, &[]).unwrap();
        assert_eq!(output.downcast_ref::<Vec<f64>>(), Some(&vec![1.0, 2.0]));

        assert!(single.reduction().reduce_gathered(&ctx, &options, &[]).is_err());
        assert!(ctx.output_path("mesh.msh").is_none());
    }
}
