//! Interpreter core for flowstate.
//!
//! Runs state machine definitions from `flowstate-types` against
//! host-registered handlers. The crate owns the path engine, intrinsic
//! functions, choice rules, the per-state data-flow pipeline, retry/catch,
//! the Map worker pool and cancellation. It performs no I/O of its own
//! beyond calling handlers and reading the optional config file.

pub mod choice;
pub mod config;
pub mod context;
pub mod dataflow;
pub mod effect;
pub mod handler;
pub mod intrinsic;
pub mod machine;
pub mod map;
pub mod path;
pub mod retry;
mod state_runner;
pub mod validate;

pub use config::load_engine_config;
pub use context::{ContextBuilder, ExecutionContext, ExecutionInfo, LogSink, MapScope, StepMeta};
pub use effect::{Effect, StepExecutor};
pub use handler::{BoxHandler, FnHandler, Handler, HandlerRegistry};
pub use machine::{Outcome, execute, parse_definition, run_machine};
pub use validate::validate_definition;
