use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SweepError;
use crate::task::{ErasedReduction, GatherReduction, Gathered, Reduction, Task};
use crate::value::Value;

type Factory = Arc<dyn Fn() -> Arc<dyn ErasedReduction> + Send + Sync>;

/// Maps task class identifiers to constructors.
///
/// Used to rebuild task graphs from a persisted
/// [`SweepDescription`](crate::SweepDescription). Populate it once at startup
/// with every reduction the program knows about.
#[derive(Clone, Default)]
pub struct Registry {
    factories: HashMap<String, Factory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reduction constructed with [`Default`].
    pub fn register<R>(&mut self) -> Result<&mut Self, SweepError>
    where
        R: Reduction + Default,
    {
        self.register_with(R::default)
    }

    /// Registers a reduction under [`Reduction::CLASS`] with a custom
    /// constructor.
    pub fn register_with<R, F>(&mut self, factory: F) -> Result<&mut Self, SweepError>
    where
        R: Reduction,
        F: Fn() -> R + Send + Sync + 'static,
    {
        self.insert(
            R::CLASS,
            Arc::new(move || Arc::new(factory()) as Arc<dyn ErasedReduction>),
        )
    }

    /// Registers a gathered reduction constructed with [`Default`].
    pub fn register_gathered<G>(&mut self) -> Result<&mut Self, SweepError>
    where
        G: GatherReduction + Default,
    {
        self.insert(
            G::CLASS,
            Arc::new(|| Arc::new(Gathered(G::default())) as Arc<dyn ErasedReduction>),
        )
    }

    fn insert(&mut self, class: &'static str, factory: Factory) -> Result<&mut Self, SweepError> {
        if self.factories.contains_key(class) {
            return Err(SweepError::DuplicateTaskClass(class.to_string()));
        }

        tracing::debug!(class, "registered task class");
        self.factories.insert(class.to_string(), factory);

        Ok(self)
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    /// Registered identifiers, sorted.
    pub fn classes(&self) -> Vec<&str> {
        let mut classes: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        classes.sort_unstable();
        classes
    }

    /// Builds a task of class `class`.
    pub fn task(
        &self,
        class: &str,
        name: impl Into<String>,
        options: Value,
        upstream: Vec<Task>,
    ) -> Result<Task, SweepError> {
        let factory = self
            .factories
            .get(class)
            .ok_or_else(|| SweepError::UnknownTaskClass(class.to_string()))?;

        Ok(Task::from_erased(name.into(), options, upstream, factory()))
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("classes", &self.classes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{GatherContext, Inputs, ReduceContext};

    #[derive(Default)]
    struct Mesh;

    impl Reduction for Mesh {
        const CLASS: &'static str = "mesh";
        type Output = Vec<f64>;

        fn reduce(&self, _: &ReduceContext, _: &Value, _: &Inputs) -> anyhow::Result<Vec<f64>> {
            Ok(vec![0.0, 1.0])
        }
    }

    struct OtherMesh;

    impl Reduction for OtherMesh {
        const CLASS: &'static str = "mesh";
        type Output = f64;

        fn reduce(&self, _: &ReduceContext, _: &Value, _: &Inputs) -> anyhow::Result<f64> {
            Ok(0.0)
        }
    }

    #[test]
    fn test_duplicate_class_rejected() {
        let mut registry = Registry::new();
        registry.register::<Mesh>().unwrap();

        match registry.register_with(|| OtherMesh) {
            Err(SweepError::DuplicateTaskClass(class)) => assert_eq!(class, "mesh"),
            other => panic!("expected DuplicateTaskClass, got {other:?}"),
        }

        // the first registration survives
        let task = registry.task("mesh", "coarse", Value::Null, vec![]).unwrap();
        assert_eq!(task.output_type_name(), std::any::type_name::<Vec<f64>>());
    }

    #[test]
    fn test_unknown_class() {
        let registry = Registry::new();

        assert!(matches!(
            registry.task("poisson", "p", Value::Null, vec![]),
            Err(SweepError::UnknownTaskClass(class)) if class == "poisson"
        ));
    }

    #[test]
    fn test_build_named_task() {
        let mut registry = Registry::new();
        registry.register::<Mesh>().unwrap();

        let task = registry.task("mesh", "fine", Value::map([("h", 0.1)]), vec![]).unwrap();
        assert_eq!(task.name(), "fine");
        assert_eq!(task.class(), "mesh");
        assert!(registry.contains("mesh"));
        assert_eq!(registry.classes(), vec!["mesh"]);
    }

    #[derive(Default)]
    struct MeshAll;

    impl GatherReduction for MeshAll {
        const CLASS: &'static str = "mesh";
        type Output = Vec<f64>;

        fn reduce_gathered(
            &self,
            _: &GatherContext,
            options: &[Value],
            _: &[Inputs],
        ) -> anyhow::Result<Vec<f64>> {
            Ok(vec![0.0; options.len()])
        }
    }

    #[test]
    fn test_gathered_class_shares_namespace() {
        let mut registry = Registry::new();
        registry.register_gathered::<MeshAll>().unwrap();

        let task = registry.task("mesh", "all", Value::Null, vec![]).unwrap();
        assert!(task.is_gathered());

        assert!(matches!(
            registry.register::<Mesh>(),
            Err(SweepError::DuplicateTaskClass(class)) if class == "mesh"
        ));
    }
}
