//! Card handler trait, per-call invocation data, and handler registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use cardflow_types::{
    CardId, CardflowError, ExecutionMode, HandlerOutcome, Region, Result, RunCounters, RunId,
    SharedContext, TargetEndpoint,
};

use crate::events::{EventEmitter, RunEvent};
use crate::graph::Card;
use crate::input::InputBackend;
use crate::pool::MatchPool;

// ---------------------------------------------------------------------------
// DataSource: optional data-fetch callback
// ---------------------------------------------------------------------------

/// Lets a handler pull data it does not own (a cached screenshot path, a
/// value from the host application) by key.
pub trait DataSource: Send + Sync {
    fn fetch(&self, key: &str) -> Option<serde_json::Value>;
}

// ---------------------------------------------------------------------------
// CardCall: everything a handler receives
// ---------------------------------------------------------------------------

pub struct CardCall<'a> {
    pub run_id: RunId,
    pub card: &'a Card,
    pub counters: &'a mut RunCounters,
    pub context: &'a SharedContext,
    pub mode: ExecutionMode,
    pub endpoint: Option<&'a TargetEndpoint>,
    pub region: Option<Region>,
    pub data: Option<&'a dyn DataSource>,
    pub cancel: &'a CancellationToken,
    pub input: &'a dyn InputBackend,
    events: &'a EventEmitter,
}

impl<'a> CardCall<'a> {
    pub fn new(
        run_id: RunId,
        card: &'a Card,
        counters: &'a mut RunCounters,
        context: &'a SharedContext,
        cancel: &'a CancellationToken,
        input: &'a dyn InputBackend,
        events: &'a EventEmitter,
    ) -> Self {
        Self {
            run_id,
            card,
            counters,
            context,
            mode: ExecutionMode::default(),
            endpoint: None,
            region: None,
            data: None,
            cancel,
            input,
            events,
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_endpoint(mut self, endpoint: Option<&'a TargetEndpoint>) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_region(mut self, region: Option<Region>) -> Self {
        self.region = region;
        self
    }

    pub fn with_data(mut self, data: Option<&'a dyn DataSource>) -> Self {
        self.data = data;
        self
    }

    pub fn card_id(&self) -> CardId {
        self.card.id
    }

    /// The cancellation predicate. Long-running handlers poll this.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Emit a step-detail event for this run.
    pub fn detail(&self, text: impl Into<String>) {
        self.events.emit(RunEvent::StepDetail {
            run_id: self.run_id,
            text: text.into(),
        });
    }

    /// Shorthand for a handler error attributed to this card.
    pub fn error(&self, message: impl Into<String>) -> CardflowError {
        CardflowError::HandlerError {
            task_type: self.card.task_type.clone(),
            card: self.card.id,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// CardHandler trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CardHandler: Send + Sync {
    /// The task-type key this handler serves (e.g. "delay", "text_match").
    fn task_type(&self) -> &str;

    /// Execute this handler for one card.
    ///
    /// An `Err` is treated by the executor exactly like a reported failure.
    async fn execute(&self, call: &mut CardCall<'_>) -> Result<HandlerOutcome>;
}

// ---------------------------------------------------------------------------
// DynHandler: object-safe wrapper
// ---------------------------------------------------------------------------

pub struct DynHandler(Box<dyn CardHandler>);

impl DynHandler {
    pub fn new(handler: impl CardHandler + 'static) -> Self {
        Self(Box::new(handler))
    }

    pub fn task_type(&self) -> &str {
        self.0.task_type()
    }

    pub async fn execute(&self, call: &mut CardCall<'_>) -> Result<HandlerOutcome> {
        self.0.execute(call).await
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Maps task-type keys to handlers. Built before runs start and shared
/// read-only by all of them.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, DynHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its task type.
    ///
    /// Rejects an empty task type and a task type that is already taken.
    pub fn register(&mut self, handler: impl CardHandler + 'static) -> Result<()> {
        let task_type = handler.task_type().trim().to_string();
        if task_type.is_empty() {
            return Err(CardflowError::Registration(
                "handler task type must not be empty".into(),
            ));
        }
        if self.handlers.contains_key(&task_type) {
            return Err(CardflowError::Registration(format!(
                "task type '{task_type}' is already registered"
            )));
        }
        self.handlers.insert(task_type, DynHandler::new(handler));
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<&DynHandler> {
        self.handlers.get(task_type)
    }

    pub fn has(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

pub struct NoopHandler;

#[async_trait]
impl CardHandler for NoopHandler {
    fn task_type(&self) -> &str {
        "noop"
    }

    async fn execute(&self, _call: &mut CardCall<'_>) -> Result<HandlerOutcome> {
        Ok(HandlerOutcome::success())
    }
}

/// Ends the run successfully, whatever comes after it in the graph.
pub struct StopWorkflowHandler;

#[async_trait]
impl CardHandler for StopWorkflowHandler {
    fn task_type(&self) -> &str {
        "stop_workflow"
    }

    async fn execute(&self, call: &mut CardCall<'_>) -> Result<HandlerOutcome> {
        call.detail(format!("Card {} requested workflow stop", call.card_id()));
        Ok(HandlerOutcome::stop_workflow())
    }
}

// ---------------------------------------------------------------------------
// Default registry factory
// ---------------------------------------------------------------------------

/// Registry with every built-in handler, sharing one detected-size match pool.
pub fn default_registry() -> HandlerRegistry {
    default_registry_with_pool(Arc::new(MatchPool::detected()))
}

/// Registry with every built-in handler, using the given match pool.
pub fn default_registry_with_pool(pool: Arc<MatchPool>) -> HandlerRegistry {
    let mut reg = HandlerRegistry::new();
    let builtins: [Result<()>; 6] = [
        reg.register(NoopHandler),
        reg.register(StopWorkflowHandler),
        reg.register(crate::handlers::DelayHandler),
        reg.register(crate::handlers::SetVariableHandler),
        reg.register(crate::handlers::KeyPressHandler),
        reg.register(crate::handlers::TextMatchHandler::new(pool)),
    ];
    for result in builtins {
        if let Err(e) = result {
            tracing::error!(error = %e, "Built-in handler registration failed");
        }
    }
    reg
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
