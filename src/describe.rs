//! Persisted sweep descriptions.
//!
//! A [`SweepDescription`] records the bindings and the task graph of a sweep
//! by class identifier, so the same sweep can be rebuilt later through a
//! [`Registry`] without the original task values at hand.

use std::collections::HashMap;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::bindings::Bindings;
use crate::engine::task_graph;
use crate::error::SweepError;
use crate::manager::SweepManager;
use crate::registry::Registry;
use crate::subst::{extract_tags, retag};
use crate::tag::{Tag, with_fresh_tags};
use crate::task::Task;
use crate::value::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingDescription {
    pub tag: Tag,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescription {
    pub class: String,
    pub name: String,
    pub options: Value,
    /// Positions of upstream tasks in [`SweepDescription::tasks`], in input
    /// order.
    #[serde(default)]
    pub upstream: Vec<usize>,
}

/// Bindings plus task graph, upstream tasks listed first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepDescription {
    pub bindings: Vec<BindingDescription>,
    pub tasks: Vec<TaskDescription>,
    /// Position of the task the sweep was described for.
    pub root: usize,
}

impl SweepDescription {
    /// Describes `root` and its upstream over the sweep of `manager`.
    pub fn capture(manager: &SweepManager, root: &Task) -> Result<Self, SweepError> {
        let (graph, order) = task_graph(root)?;

        let position: HashMap<u64, usize> = order
            .iter()
            .enumerate()
            .map(|(i, &node)| (graph[node].instance(), i))
            .collect();

        let tasks = order
            .iter()
            .map(|&node| {
                let task = &graph[node];
                TaskDescription {
                    class: task.class().to_string(),
                    name: task.name().to_string(),
                    options: task.options().clone(),
                    upstream: task
                        .upstream()
                        .iter()
                        .filter_map(|upstream| position.get(&upstream.instance()).copied())
                        .collect(),
                }
            })
            .collect();

        let bindings = manager
            .bindings()
            .axes()
            .iter()
            .map(|(tag, values)| BindingDescription {
                tag: tag.clone(),
                values: values.clone(),
            })
            .collect();

        let root = position.get(&root.instance()).copied().ok_or_else(|| {
            SweepError::StructuralMismatch(format!("task '{root}' is missing from its own graph"))
        })?;

        Ok(Self {
            bindings,
            tasks,
            root,
        })
    }

    /// A copy in which every tag is replaced by a fresh one, consistently
    /// across bindings and options.
    pub fn fork(&self) -> Self {
        let mut mapping: HashMap<Tag, Tag> = HashMap::new();

        let tags = self
            .bindings
            .iter()
            .map(|binding| binding.tag.clone())
            .chain(self.tasks.iter().flat_map(|task| extract_tags(&task.options)));

        for tag in tags {
            mapping.entry(tag).or_insert_with_key(Tag::replace);
        }

        Self {
            bindings: self
                .bindings
                .iter()
                .map(|binding| BindingDescription {
                    tag: mapping[&binding.tag].clone(),
                    values: binding.values.clone(),
                })
                .collect(),
            tasks: self
                .tasks
                .iter()
                .map(|task| TaskDescription {
                    options: retag(&task.options, &mapping),
                    ..task.clone()
                })
                .collect(),
            root: self.root,
        }
    }

    pub fn to_json(&self) -> Result<String, SweepError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses a description. Tags get fresh identities, so they never alias
    /// tags created in this process, and stay shared between the bindings
    /// and the options that reference them.
    pub fn from_json(json: &str) -> Result<Self, SweepError> {
        Ok(with_fresh_tags(|| serde_json::from_str(json))?)
    }

    pub fn save(&self, path: &Utf8Path) -> Result<(), SweepError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, self.to_json()?)?;
        tracing::info!(%path, tasks = self.tasks.len(), "saved sweep description");
        Ok(())
    }

    pub fn load(path: &Utf8Path) -> Result<Self, SweepError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Builds the manager and the root task back through `registry`.
    pub fn rebuild(&self, registry: &Registry) -> Result<(SweepManager, Task), SweepError> {
        let mut bindings = Bindings::new();
        for binding in &self.bindings {
            bindings.insert(&binding.tag, binding.values.iter().cloned());
        }

        let manager = if bindings.is_empty() {
            SweepManager::single()
        } else {
            SweepManager::construct_cartesian_product(bindings)?
        };

        let mut tasks: Vec<Task> = Vec::with_capacity(self.tasks.len());
        for (i, desc) in self.tasks.iter().enumerate() {
            let upstream = desc
                .upstream
                .iter()
                .map(|&j| {
                    tasks.get(j).cloned().ok_or_else(|| {
                        SweepError::StructuralMismatch(format!(
                            "task {i} ('{}') depends on task {j}, which is not listed before it",
                            desc.name
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            tasks.push(registry.task(&desc.class, desc.name.as_str(), desc.options.clone(), upstream)?);
        }

        let root = tasks.get(self.root).cloned().ok_or_else(|| {
            SweepError::StructuralMismatch(format!(
                "root task {} is out of range ({} tasks)",
                self.root,
                tasks.len()
            ))
        })?;

        tracing::debug!(task = %root, tasks = tasks.len(), "rebuilt sweep");
        Ok((manager, root))
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::index::FullIndex;
    use crate::manager::Strategy;
    use crate::task::{Inputs, ReduceContext, Reduction};

    #[derive(Default)]
    struct Field;

    impl Reduction for Field {
        const CLASS: &'static str = "field";
        type Output = Vec<f64>;

        fn reduce(&self, _: &ReduceContext, options: &Value, _: &Inputs) -> anyhow::Result<Vec<f64>> {
            let voltage = options.get("voltage").and_then(Value::as_f64).unwrap_or_default();
            let width = options.get("width").and_then(Value::as_f64).unwrap_or_default();
            Ok(vec![voltage, voltage * width])
        }
    }

    #[derive(Default)]
    struct Energy;

    impl Reduction for Energy {
        const CLASS: &'static str = "energy";
        type Output = f64;

        fn reduce(&self, _: &ReduceContext, _: &Value, inputs: &Inputs) -> anyhow::Result<f64> {
            let field: &Vec<f64> = inputs.get(0)?;
            Ok(field.iter().map(|x| x * x).sum())
        }
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register::<Field>()
            .and_then(|r| r.register::<Energy>())
            .unwrap();
        registry
    }

    fn sweep() -> (SweepManager, Task, Tag) {
        let voltage = Tag::new("voltage");
        let width = Tag::new("width");
        let manager = SweepManager::construct_cartesian_product(
            Bindings::new()
                .bind(&voltage, [0.5, 1.0])
                .bind(&width, [10.0, 20.0, 30.0]),
        )
        .unwrap()
        .progress(false);

        let field = Task::new(Field)
            .options(Value::map([
                ("voltage", Value::from(&voltage)),
                ("width", Value::from(2.0 * &width)),
            ]))
            .build();
        let energy = Task::new(Energy).name("energy").depends_on(&field).build();

        (manager, energy, voltage)
    }

    fn energies(manager: &SweepManager, task: &Task) -> Vec<f64> {
        let mut run = manager.run(task, Strategy::Delayed).unwrap();
        let results = run.results().unwrap();
        manager
            .indices()
            .map(|full| *results.get_result::<f64>(full).unwrap())
            .collect()
    }

    #[test]
    fn test_rebuild_reproduces_results() {
        let (manager, energy, voltage) = sweep();
        let description = SweepDescription::capture(&manager, &energy).unwrap();

        assert_eq!(description.tasks.len(), 2);
        assert_eq!(description.tasks[description.root].name, "energy");
        assert_eq!(description.tasks[description.root].upstream, vec![0]);

        let json = description.to_json().unwrap();
        let parsed = SweepDescription::from_json(&json).unwrap();
        let bound = &parsed.bindings[0].tag;
        assert_ne!(bound, &voltage);
        assert!(extract_tags(&parsed.tasks[0].options).contains(bound));

        let (rebuilt, root) = parsed.rebuild(&registry()).unwrap();

        assert_eq!(rebuilt.len(), manager.len());
        assert!(rebuilt.bindings().tags().all(|tag| *tag != voltage));
        assert_eq!(energies(&rebuilt.progress(false), &root), energies(&manager, &energy));
    }

    #[test]
    fn test_fork_is_consistent() {
        let (manager, energy, voltage) = sweep();
        let forked = SweepDescription::capture(&manager, &energy).unwrap().fork();

        let bound: Vec<&Tag> = forked.bindings.iter().map(|b| &b.tag).collect();
        let used = extract_tags(&forked.tasks[0].options);

        assert!(!bound.contains(&&voltage));
        assert_eq!(used.len(), 2);
        assert!(used.iter().all(|tag| bound.contains(&tag)));
    }

    #[test]
    fn test_unknown_class() {
        let (manager, energy, _) = sweep();
        let description = SweepDescription::capture(&manager, &energy).unwrap();

        let mut registry = Registry::new();
        registry.register::<Energy>().unwrap();

        assert!(matches!(
            description.rebuild(&registry),
            Err(SweepError::UnknownTaskClass(class)) if class == "field"
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("sweeps/device.json")).unwrap();

        let (manager, energy, _) = sweep();
        SweepDescription::capture(&manager, &energy)
            .unwrap()
            .save(&path)
            .unwrap();

        let (rebuilt, root) = SweepDescription::load(&path)
            .unwrap()
            .rebuild(&registry())
            .unwrap();

        assert_eq!(root.class(), "energy");
        assert_eq!(root.upstream()[0].class(), "field");

        let mut run = rebuilt.run(&root, Strategy::inline()).unwrap();
        run.wait().unwrap();
        // voltage 0.5, width 10 -> field [0.5, 10]
        assert_eq!(run.result::<f64>(FullIndex(0)).unwrap(), &(0.25 + 100.0));
    }
}
