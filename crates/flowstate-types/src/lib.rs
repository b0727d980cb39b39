//! Shared domain types for flowstate.
//!
//! This crate contains the declarative side of the interpreter: machine
//! definitions, the state tagged union, retry/catch rules, the runtime error
//! taxonomy and engine configuration.
//!
//! Depends only on serde, serde_json and thiserror.

pub mod config;
pub mod definition;
pub mod error;
pub mod execution;

pub use config::EngineConfig;
pub use definition::{
    CatchRule, ChoiceRule, ChoiceState, FailState, ItemBatcher, MachineDefinition, MapState,
    ParallelState, PassState, ResourceRef, RetryRule, State, StateKind, StateType, TaskState,
    WaitState,
};
pub use error::{DefinitionError, ErrorKind, StatesError, ALL_ERRORS};
pub use execution::ExecutionStatus;
