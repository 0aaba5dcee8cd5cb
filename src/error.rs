use std::sync::Arc;

use thiserror::Error;

use crate::index::ReducedIndex;
use crate::tag::Tag;

/// A reduction that failed for one reduced index.
///
/// The cause is shared behind an [`Arc`] so the same failure can be observed
/// from every full index in the fiber, and from every downstream task that
/// depended on it.
#[derive(Debug, Error, Clone)]
#[error("Task '{task}' failed at reduced index {index}:\n{cause}")]
pub struct TaskFailure {
    pub task: String,
    pub index: ReducedIndex,
    pub cause: Arc<anyhow::Error>,
}

impl TaskFailure {
    pub fn new(task: impl Into<String>, index: ReducedIndex, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            task: task.into(),
            index,
            cause: Arc::new(cause.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("Tag '{0}' is referenced but has no binding in this sweep")]
    MissingBinding(Tag),

    #[error("Tag '{0}' is bound to an empty list of values")]
    EmptyBinding(Tag),

    #[error("Unknown task class '{0}'")]
    UnknownTaskClass(String),

    #[error("Task class '{0}' is already registered")]
    DuplicateTaskClass(String),

    #[error(transparent)]
    TaskFailure(#[from] TaskFailure),

    #[error("Structural mismatch: {0}")]
    StructuralMismatch(String),

    #[error("Sweep for task '{0}' has already been evaluated and is read-only")]
    Sealed(String),

    #[error("Results of task '{0}' are not available before wait() returns")]
    NotGathered(String),

    #[error("Tag '{0}' carries arithmetic but is bound to a non-numeric value")]
    NonNumericTag(Tag),

    #[error("Options could not be parsed as {0}:\n{1}")]
    InvalidOptions(String, serde_json::Error),

    #[error("Couldn't build the worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Couldn't read or write the sweep description.\n{0}")]
    Description(#[from] serde_json::Error),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the [`Data`](crate::Data) persistence contract.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("Couldn't access data file.\n{0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Couldn't encode data.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't decode data.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("Expected a value of type {expected}")]
    WrongType { expected: &'static str },
}
