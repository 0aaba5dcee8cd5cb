//! Future-producing execution backends.
//!
//! A [`Backend`] accepts a unit of work together with the futures it depends
//! on, and returns a [`Future`] for the work's outcome. The backend decides
//! where and when the work runs, but must not start it before every
//! dependency has completed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::core::Dynamic;
use crate::error::{SweepError, TaskFailure};

/// Result of one unit of work.
pub type Outcome = Result<Dynamic, TaskFailure>;

/// A unit of work submitted to a backend.
pub type Work = Box<dyn FnOnce() -> Outcome + Send>;

type Listener = Box<dyn FnOnce() + Send>;

pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Schedules `work` to run once all of `deps` have completed.
    fn submit(&self, work: Work, deps: &[Future]) -> Future;
}

struct State {
    outcome: OnceLock<Outcome>,
    listeners: Mutex<Vec<Listener>>,
    done: Condvar,
}

/// A handle to an outcome that may not exist yet.
///
/// Completion is one-shot; the first call to [`Future::complete`] wins.
#[derive(Clone)]
pub struct Future(Arc<State>);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Future {
    /// A future with no outcome yet.
    pub fn pending() -> Self {
        Future(Arc::new(State {
            outcome: OnceLock::new(),
            listeners: Mutex::new(Vec::new()),
            done: Condvar::new(),
        }))
    }

    /// A future that is already complete.
    pub fn ready(outcome: Outcome) -> Self {
        let future = Self::pending();
        future.complete(outcome);
        future
    }

    pub fn is_done(&self) -> bool {
        self.0.outcome.get().is_some()
    }

    /// The outcome, if complete. Never blocks.
    pub fn outcome(&self) -> Option<&Outcome> {
        self.0.outcome.get()
    }

    /// Blocks until the outcome is available.
    pub fn wait(&self) -> &Outcome {
        let mut guard = lock(&self.0.listeners);
        loop {
            if let Some(outcome) = self.0.outcome.get() {
                return outcome;
            }
            guard = self
                .0
                .done
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stores the outcome and runs every listener. Later calls are ignored.
    pub fn complete(&self, outcome: Outcome) {
        let listeners = {
            let mut guard = lock(&self.0.listeners);
            if self.0.outcome.set(outcome).is_err() {
                return;
            }
            self.0.done.notify_all();
            std::mem::take(&mut *guard)
        };

        for listener in listeners {
            listener();
        }
    }

    /// Runs `f` once this future completes, immediately if it already has.
    pub fn subscribe(&self, f: impl FnOnce() + Send + 'static) {
        let mut guard = lock(&self.0.listeners);
        if self.is_done() {
            drop(guard);
            f();
        } else {
            guard.push(Box::new(f));
        }
    }
}

impl std::fmt::Debug for Future {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.outcome() {
            None => "pending",
            Some(Ok(_)) => "ok",
            Some(Err(_)) => "failed",
        };
        write!(f, "Future({state})")
    }
}

/// Runs `f` once every future in `deps` has completed.
pub fn when_all(deps: &[Future], f: impl FnOnce() + Send + 'static) {
    if deps.is_empty() {
        return f();
    }

    let remaining = Arc::new(AtomicUsize::new(deps.len()));
    let f = Arc::new(Mutex::new(Some(f)));

    for dep in deps {
        let remaining = remaining.clone();
        let f = f.clone();

        dep.subscribe(move || {
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1
                && let Some(f) = lock(&f).take()
            {
                f();
            }
        });
    }
}

/// Runs work on the thread that completes its last dependency, or on the
/// submitting thread when there are none.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineBackend;

impl Backend for InlineBackend {
    fn name(&self) -> &str {
        "inline"
    }

    fn submit(&self, work: Work, deps: &[Future]) -> Future {
        let future = Future::pending();
        let handle = future.clone();
        when_all(deps, move || handle.complete(work()));
        future
    }
}

/// Runs work on a dedicated rayon thread pool.
///
/// Work is only spawned once its dependencies are complete, so no worker ever
/// blocks waiting for another.
#[derive(Clone)]
pub struct PoolBackend {
    pool: Arc<rayon::ThreadPool>,
}

impl PoolBackend {
    pub fn new(workers: usize) -> Result<Self, SweepError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("parasweep-{i}"))
            .build()?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl Backend for PoolBackend {
    fn name(&self) -> &str {
        "pool"
    }

    fn submit(&self, work: Work, deps: &[Future]) -> Future {
        let future = Future::pending();
        let handle = future.clone();
        let pool = self.pool.clone();

        when_all(deps, move || {
            pool.spawn(move || handle.complete(work()));
        });

        future
    }
}

impl std::fmt::Debug for PoolBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBackend")
            .field("workers", &self.workers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::index::ReducedIndex;

    fn value(x: f64) -> Outcome {
        Ok(Arc::new(x))
    }

    fn read(outcome: &Outcome) -> f64 {
        *outcome.as_ref().unwrap().downcast_ref::<f64>().unwrap()
    }

    #[test]
    fn test_complete_once() {
        let future = Future::pending();
        assert!(!future.is_done());
        assert!(future.outcome().is_none());

        future.complete(value(1.0));
        future.complete(value(2.0));

        assert!(future.is_done());
        assert_eq!(read(future.wait()), 1.0);
    }

    #[test]
    fn test_inline_waits_for_dependencies() {
        let dep = Future::pending();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        let future = InlineBackend.submit(
            Box::new(move || {
                flag.store(true, Ordering::SeqCst);
                value(3.0)
            }),
            &[dep.clone()],
        );

        assert!(!ran.load(Ordering::SeqCst));
        assert!(!future.is_done());

        dep.complete(value(0.0));

        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(read(future.wait()), 3.0);
    }

    #[test]
    fn test_pool_chain() {
        let backend = PoolBackend::new(2).unwrap();
        assert_eq!(backend.workers(), 2);

        let first = backend.submit(Box::new(|| value(1.0)), &[]);
        let upstream = first.clone();
        let second = backend.submit(
            Box::new(move || {
                let x = read(upstream.outcome().unwrap());
                value(x + 1.0)
            }),
            &[first],
        );

        assert_eq!(read(second.wait()), 2.0);
    }

    #[test]
    fn test_failure_is_an_outcome() {
        let future = InlineBackend.submit(
            Box::new(|| -> Outcome {
                Err(TaskFailure::new("solve#0", ReducedIndex(4), anyhow::anyhow!("diverged")))
            }),
            &[],
        );

        match future.wait() {
            Err(failure) => assert_eq!(failure.index, ReducedIndex(4)),
            Ok(_) => panic!("expected a failure"),
        }
    }
}
