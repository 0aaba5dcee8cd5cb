#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod backend;
mod bindings;
mod core;
mod data;
mod describe;
mod engine;
mod error;
mod index;
mod manager;
mod reduced;
mod registry;
mod results;
pub mod subst;
mod tag;
mod task;
mod utils;
mod value;

pub use crate::backend::{Backend, Future, InlineBackend, Outcome, PoolBackend, Work, when_all};
pub use crate::bindings::{Bindings, Point};
pub use crate::core::{Dynamic, Hash32};
pub use crate::data::Data;
pub use crate::describe::{BindingDescription, SweepDescription, TaskDescription};
pub use crate::engine::{
    DelayedNode, Diagnostics, ReducedSweepDelayed, ReducedSweepFutures, SweepRun, TaskExecution,
};
pub use crate::error::*;
pub use crate::index::{FullIndex, ReducedIndex, Shape};
pub use crate::manager::{Strategy, SweepManager};
pub use crate::reduced::ReducedSweep;
pub use crate::registry::Registry;
pub use crate::results::ReducedSweepResults;
pub use crate::subst::{extract_tags, substitute};
pub use crate::tag::{Tag, TagExpr, TagOp};
pub use crate::task::{
    GatherContext, GatherReduction, Inputs, ReduceContext, Reduction, Task, TaskBuilder,
};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
pub use crate::value::Value;
