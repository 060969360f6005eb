#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cache;
mod core;
mod diagnostics;
mod error;
mod graph;
#[cfg(feature = "logging")]
mod logging;
mod merge;
mod needed;
mod pipeline;
mod reorder;
mod resolver;
mod task;

pub use crate::cache::CacheStore;
pub use crate::core::{Environment, Value};
pub use crate::diagnostics::{
    print_unmet, render_needed_graph, render_unmet, write_needed_graph, write_unmet,
};
pub use crate::error::{CacheError, EngineError};
pub use crate::graph::{Graph, Resolution, TaskDef};
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::pipeline::{Condition, Fragment, Pipeline, Step, Unit};
pub use crate::resolver::SENTINEL;
pub use crate::task::{Inputs, Producer, Scope, producer};
