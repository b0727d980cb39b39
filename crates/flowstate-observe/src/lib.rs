//! Observability for flowstate executions.
//!
//! - `tracing_setup`: global subscriber with an `EnvFilter` and a fmt layer
//! - `reporter`: a [`LogSink`](flowstate_core::LogSink) that renders an
//!   indented execution trace

pub mod reporter;
pub mod tracing_setup;

pub use reporter::ConsoleReporter;
