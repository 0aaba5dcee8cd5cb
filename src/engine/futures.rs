use std::any::Any;
use std::sync::{Arc, Mutex, OnceLock};

use crate::backend::{Backend, Future, Outcome, Work, lock};
use crate::bindings::Point;
use crate::core::Dynamic;
use crate::engine::downcast;
use crate::error::SweepError;
use crate::index::{FullIndex, ReducedIndex};
use crate::reduced::ReducedSweep;
use crate::results::ReducedSweepResults;
use crate::task::Task;
use crate::utils;

/// One task's reduced sweep running on a [`Backend`].
///
/// Work for a reduced index is submitted as soon as it is added. Results are
/// only exposed once [`wait`](Self::wait) has returned, whatever order the
/// backend completed them in.
pub struct ReducedSweepFutures {
    task: Task,
    sweep: Arc<ReducedSweep>,
    backend: Arc<dyn Backend>,
    progress: bool,
    /// Registration of slots is serialized; each slot is written once.
    slots: Mutex<Vec<Option<Future>>>,
    gathered: OnceLock<Vec<Future>>,
}

impl ReducedSweepFutures {
    pub(crate) fn new(
        task: Task,
        sweep: Arc<ReducedSweep>,
        backend: Arc<dyn Backend>,
        progress: bool,
    ) -> Self {
        let slots = Mutex::new(vec![None; sweep.len()]);
        Self {
            task,
            sweep,
            backend,
            progress,
            slots,
            gathered: OnceLock::new(),
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn sweep(&self) -> &ReducedSweep {
        &self.sweep
    }

    pub fn backend(&self) -> &dyn Backend {
        &*self.backend
    }

    pub fn is_gathered(&self) -> bool {
        self.gathered.get().is_some()
    }

    /// Submits `work` for `index`, to start once `deps` complete.
    pub fn add(&self, index: ReducedIndex, work: Work, deps: &[Future]) -> Result<Future, SweepError> {
        if self.is_gathered() {
            return Err(SweepError::Sealed(self.task.to_string()));
        }

        let mut slots = lock(&self.slots);
        let len = slots.len();
        let slot = slots.get_mut(index.index()).ok_or_else(|| {
            SweepError::StructuralMismatch(format!(
                "reduced index {index} is out of range for task '{}' ({len} indices)",
                self.task
            ))
        })?;

        if slot.is_some() {
            return Err(SweepError::StructuralMismatch(format!(
                "reduced index {index} of task '{}' was already submitted",
                self.task
            )));
        }

        tracing::debug!(
            task = %self.task,
            index = index.index(),
            backend = self.backend.name(),
            "submitting"
        );

        let future = self.backend.submit(work, deps);
        *slot = Some(future.clone());
        Ok(future)
    }

    /// Submits the single unit of work of a gathered task and places its
    /// future at every reduced index.
    pub fn add_gathered(&self, work: Work, deps: &[Future]) -> Result<Future, SweepError> {
        if self.is_gathered() {
            return Err(SweepError::Sealed(self.task.to_string()));
        }

        let mut slots = lock(&self.slots);
        if slots.iter().any(Option::is_some) {
            return Err(SweepError::StructuralMismatch(format!(
                "task '{}' already has work submitted",
                self.task
            )));
        }

        tracing::debug!(
            task = %self.task,
            indices = slots.len(),
            backend = self.backend.name(),
            "submitting gathered"
        );

        let future = self.backend.submit(work, deps);
        slots.fill(Some(future.clone()));
        Ok(future)
    }

    /// The future serving full index `full`. Never blocks.
    pub fn get_future(&self, full: FullIndex) -> Result<Future, SweepError> {
        let index = self.sweep.convert_to_reduced_index(full).ok_or_else(|| {
            SweepError::StructuralMismatch(format!(
                "full index {full} is out of range for task '{}'",
                self.task
            ))
        })?;

        lock(&self.slots)
            .get(index.index())
            .cloned()
            .flatten()
            .ok_or_else(|| {
                SweepError::StructuralMismatch(format!(
                    "task '{}' has nothing submitted at reduced index {index}",
                    self.task
                ))
            })
    }

    /// Blocks until every submitted future has completed or failed.
    ///
    /// Returns the failure at the lowest reduced index, if any. Results of
    /// the other indices stay retrievable either way.
    pub fn wait(&self) -> Result<(), SweepError> {
        let futures = match self.gathered.get() {
            Some(futures) => futures,
            None => {
                let snapshot = lock(&self.slots)
                    .iter()
                    .enumerate()
                    .map(|(i, slot)| {
                        slot.clone().ok_or_else(|| {
                            SweepError::StructuralMismatch(format!(
                                "reduced index {i} of task '{}' was never submitted",
                                self.task
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                let span = tracing::info_span!("gather", task = %self.task);
                utils::progress_start(&span, snapshot.len(), self.progress);
                let _enter = span.enter();

                for future in &snapshot {
                    future.wait();
                    utils::progress_inc(&span);
                }

                self.gathered.get_or_init(|| snapshot)
            }
        };

        let mut failures = futures
            .iter()
            .filter_map(|future| future.outcome().and_then(|outcome| outcome.as_ref().err()));

        match failures.next() {
            Some(failure) => {
                let failed = 1 + failures.count();
                tracing::warn!(failed, total = futures.len(), task = %self.task, "gathered with failures");
                Err(failure.clone().into())
            }
            None => Ok(()),
        }
    }

    fn gathered(&self) -> Result<&[Future], SweepError> {
        self.gathered
            .get()
            .map(Vec::as_slice)
            .ok_or_else(|| SweepError::NotGathered(self.task.to_string()))
    }

    pub fn outcome(&self, full: FullIndex) -> Result<&Outcome, SweepError> {
        let futures = self.gathered()?;
        let future = self
            .sweep
            .convert_to_reduced_index(full)
            .and_then(|index| futures.get(index.index()))
            .ok_or_else(|| {
                SweepError::StructuralMismatch(format!(
                    "full index {full} is out of range for task '{}'",
                    self.task
                ))
            })?;

        Ok(future.wait())
    }

    /// The result at `full`. Fails with [`SweepError::NotGathered`] before
    /// [`wait`](Self::wait) has returned.
    pub fn result<T: Any>(&self, full: FullIndex) -> Result<&T, SweepError> {
        downcast(&self.task, self.outcome(full)?)
    }

    /// Waits for the sweep, then calls `f` for every reduced index in order.
    pub fn get_each_element_function<F>(&self, mut f: F) -> Result<(), SweepError>
    where
        F: FnMut(ReducedIndex, &Point, &Dynamic),
    {
        self.wait()?;

        for (index, future) in self.gathered()?.iter().enumerate() {
            let index = ReducedIndex(index);
            let point = self.sweep.point(index).ok_or_else(|| {
                SweepError::StructuralMismatch(format!("no point at reduced index {index}"))
            })?;

            if let Ok(value) = future.wait() {
                f(index, point, value);
            }
        }

        Ok(())
    }

    /// Waits for the sweep and collects the results in local memory.
    pub fn results(&self) -> Result<ReducedSweepResults, SweepError> {
        self.wait()?;

        let results = self
            .gathered()?
            .iter()
            .map(|future| future.wait().clone().map_err(SweepError::from))
            .collect::<Result<Vec<Dynamic>, _>>()?;

        Ok(ReducedSweepResults::new(
            self.task.clone(),
            self.sweep.clone(),
            results,
        ))
    }
}
