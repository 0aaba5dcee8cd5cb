use std::collections::HashMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::engine::SweepRun;
use crate::index::ReducedIndex;
use crate::task::Task;

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Execution metrics of a sweep run.
///
/// Returned by [`SweepRun::diagnostics`]; holds one entry per reduction that
/// actually ran.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    /// Keyed by task instance and reduced index.
    pub execution_times: HashMap<(u64, ReducedIndex), TaskExecution>,
}

impl Diagnostics {
    pub(crate) fn record(&mut self, task: &Task, index: ReducedIndex, execution: TaskExecution) {
        self.execution_times
            .insert((task.instance(), index), execution);
    }

    /// How many reductions of `task` ran.
    pub fn reductions(&self, task: &Task) -> usize {
        self.execution_times
            .keys()
            .filter(|(instance, _)| *instance == task.instance())
            .count()
    }

    /// Summed duration of every reduction of `task`.
    pub fn total(&self, task: &Task) -> Duration {
        self.execution_times
            .iter()
            .filter(|((instance, _), _)| *instance == task.instance())
            .map(|(_, execution)| execution.duration)
            .sum()
    }

    /// Renders the task graph as a Mermaid diagram, color-coded by the total
    /// time spent in each task.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Nothing ran yet
    pub fn render_mermaid(&self, run: &SweepRun) -> String {
        let mut f = String::new();
        _ = self.write_mermaid(&mut f, run);
        f
    }

    fn write_mermaid(&self, f: &mut String, run: &SweepRun) -> std::fmt::Result {
        let graph = run.graph();
        writeln!(f, "graph LR")?;

        let totals: HashMap<u64, Duration> = graph
            .node_weights()
            .filter(|task| self.reductions(task) > 0)
            .map(|task| (task.instance(), self.total(task)))
            .collect();

        let min_time = totals
            .values()
            .map(Duration::as_secs_f64)
            .fold(f64::MAX, f64::min);
        let mut max_time = totals
            .values()
            .map(Duration::as_secs_f64)
            .fold(f64::MIN, f64::max);

        // Avoid divide by zero if all tasks took same time
        if totals.is_empty() || (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for index in graph.node_indices() {
            let task = &graph[index];
            let name = task.to_string().replace('"', "\\\"");
            let size = run.reduced_sweep(task).map_or(0, |sweep| sweep.len());

            let (label_extra, color_code) = match totals.get(&task.instance()) {
                Some(&duration) => {
                    let t = (duration.as_secs_f64() - min_time) / (max_time - min_time);
                    (
                        format!("{}/{size} in {duration:.2?}", self.reductions(task)),
                        gradient(t),
                    )
                }
                None => (format!("0/{size}"), "#ADD8E6".to_string()),
            };

            writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, label_extra)?;
            writeln!(f, "    style {} fill:{}", index.index(), color_code)?;
        }

        for edge in graph.raw_edges() {
            let type_name = graph[edge.source()]
                .output_type_name()
                .replace('<', "&lt;")
                .replace('>', "&gt;");

            writeln!(
                f,
                "    {} -- \"{}\" --> {}",
                edge.source().index(),
                type_name,
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn gradient(t: f64) -> String {
    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };

    format!("#{r:02X}{g:02X}00")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gradient() {
        assert_eq!(gradient(0.0), "#00FF00");
        assert_eq!(gradient(0.5), "#FFFF00");
        assert_eq!(gradient(1.0), "#FF0000");
    }
}
