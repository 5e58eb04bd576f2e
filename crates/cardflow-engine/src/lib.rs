//! Card graph executor, handler dispatch, validation, and connection selection.
//!
//! This crate walks a graph of task cards: it invokes each card's handler,
//! branches on the reported outcome, retries or jumps per the card's failure
//! policy, honours cooperative cancellation, and releases any simulated key a
//! stopped run was holding.

pub mod edge_selection;
pub mod engine;
pub mod events;
pub mod graph;
pub mod handler;
pub mod handlers;
pub mod input;
pub mod pool;
pub mod validation;
pub mod wait;

pub use edge_selection::{select_connection, ConnectionIndex};
pub use engine::{
    CardExecutor, ExecutorConfig, RunHandle, RunRequest, RunResult, RunStatus, STOPPED_MESSAGE,
};
pub use events::{EventEmitter, RunEvent};
pub use graph::{Card, CardDef, CardGraph, Connection, ConnectionType, FailurePolicy, GraphDef};
pub use handler::{
    default_registry, default_registry_with_pool, CardCall, CardHandler, DataSource, DynHandler,
    HandlerRegistry, NoopHandler, StopWorkflowHandler,
};
pub use handlers::{DelayHandler, KeyPressHandler, SetVariableHandler, TextMatchHandler};
pub use input::{InputAction, InputBackend, LoggingInput, RecordingInput};
pub use pool::{detected_pool_size, pool_size_for, MatchPool, PoolMatch};
pub use validation::{validate, validate_or_raise, Diagnostic, LintContext, LintRule, Severity};
pub use wait::{sleep_cancellable, DEFAULT_WAIT_SLICE};
