//! Run executor: the card traversal loop.
//!
//! A run walks one graph from its start card. Each step invokes the card's
//! handler and picks the next card from the outcome; a handler-forced target
//! beats the card's failure policy, which beats the connection index.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cardflow_types::{
    Action, CardId, CardflowError, ContextStore, ExecutionMode, HandlerOutcome, Region, Result,
    RunCounters, RunId, SharedContext, Target, TargetEndpoint,
};

use crate::edge_selection::{select_connection, ConnectionIndex};
use crate::events::{EventEmitter, RunEvent};
use crate::graph::{Card, CardGraph};
use crate::handler::{default_registry, CardCall, DataSource, HandlerRegistry};
use crate::input::{InputBackend, LoggingInput};
use crate::wait::{sleep_cancellable, DEFAULT_WAIT_SLICE};

/// Message of a run that ended because cancellation was requested.
pub const STOPPED_MESSAGE: &str = "Run stopped by request";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Wait between retries of a card that sets no `retry_interval_ms`.
    pub default_retry_interval_ms: u64,
    /// Longest uninterrupted sleep inside a retry wait. Capped at 100 ms.
    pub wait_slice_ms: u64,
    /// Retries allowed per card before it falls through to failure routing.
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub event_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_retry_interval_ms: 1000,
            wait_slice_ms: DEFAULT_WAIT_SLICE.as_millis() as u64,
            max_retries: None,
            event_capacity: 256,
        }
    }
}

impl ExecutorConfig {
    pub fn from_json(source: &str) -> Result<Self> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.default_retry_interval_ms)
    }

    pub fn wait_slice(&self) -> Duration {
        match self.wait_slice_ms {
            0 => DEFAULT_WAIT_SLICE,
            ms => Duration::from_millis(ms).min(DEFAULT_WAIT_SLICE),
        }
    }
}

// ---------------------------------------------------------------------------
// Run request / result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: RunId,
    pub start: CardId,
    pub mode: ExecutionMode,
    pub endpoint: Option<TargetEndpoint>,
    pub region: Option<Region>,
}

impl RunRequest {
    /// A request with a fresh run id.
    pub fn new(start: impl Into<CardId>) -> Self {
        Self {
            run_id: RunId::new(),
            start: start.into(),
            mode: ExecutionMode::default(),
            endpoint: None,
            region: None,
        }
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_endpoint(mut self, endpoint: TargetEndpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_region(mut self, region: Region) -> Self {
        self.region = Some(region);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Stopped,
}

/// How a run ended.
///
/// `success` is `true` for both `Completed` and `Stopped`; callers that need
/// to tell a requested stop apart look at `status` (or the message).
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    pub success: bool,
    pub message: String,
    /// Cards in the order they were invoked, retries included.
    pub executed: Vec<CardId>,
    pub counters: RunCounters,
    /// Cards that were mid-retry when the run ended.
    pub retry_counts: HashMap<CardId, u32>,
}

struct Finish {
    status: RunStatus,
    message: String,
}

impl Finish {
    fn completed(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Completed,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            message: message.into(),
        }
    }

    fn stopped() -> Self {
        Self {
            status: RunStatus::Stopped,
            message: STOPPED_MESSAGE.to_string(),
        }
    }
}

/// State owned by a single run's worker.
struct RunState {
    current: CardId,
    retry_counts: HashMap<CardId, u32>,
    executed: Vec<CardId>,
    counters: RunCounters,
}

/// What to do after a card's outcome has been interpreted.
enum Step {
    Goto(CardId),
    Retry,
    Finish(Finish),
}

// ---------------------------------------------------------------------------
// CardExecutor
// ---------------------------------------------------------------------------

/// Drives card graphs. Clones share one registry and one context store, so
/// a clone can be moved into a spawned run.
#[derive(Clone)]
pub struct CardExecutor {
    registry: Arc<HandlerRegistry>,
    contexts: ContextStore,
    input: Arc<dyn InputBackend>,
    data: Option<Arc<dyn DataSource>>,
    events: EventEmitter,
    config: ExecutorConfig,
}

impl CardExecutor {
    pub fn new(registry: HandlerRegistry) -> Self {
        let config = ExecutorConfig::default();
        Self {
            registry: Arc::new(registry),
            contexts: ContextStore::new(),
            input: Arc::new(LoggingInput),
            data: None,
            events: EventEmitter::new(config.event_capacity),
            config,
        }
    }

    /// Executor pre-loaded with the built-in handlers.
    pub fn with_default_registry() -> Self {
        Self::new(default_registry())
    }

    /// Replaces the configuration. Existing event subscribers are detached
    /// when the channel capacity changes.
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        if config.event_capacity != self.config.event_capacity {
            self.events = EventEmitter::new(config.event_capacity);
        }
        self.config = config;
        self
    }

    pub fn with_input(mut self, input: Arc<dyn InputBackend>) -> Self {
        self.input = input;
        self
    }

    pub fn with_data_source(mut self, data: Arc<dyn DataSource>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_context_store(mut self, contexts: ContextStore) -> Self {
        self.contexts = contexts;
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn contexts(&self) -> &ContextStore {
        &self.contexts
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Start a run on its own task.
    pub fn spawn(&self, graph: Arc<CardGraph>, request: RunRequest) -> RunHandle {
        let cancel = CancellationToken::new();
        let run_id = request.run_id;
        let executor = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { executor.run(&graph, request, &token).await });
        RunHandle {
            run_id,
            cancel,
            task,
        }
    }

    /// Run to completion on the calling task.
    ///
    /// Never returns an error: configuration problems (a missing start or
    /// target card) end the run with a failed result.
    pub async fn run(
        &self,
        graph: &CardGraph,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> RunResult {
        let run_id = request.run_id;
        let context = self.contexts.context(run_id).await;
        let mut state = RunState {
            current: request.start,
            retry_counts: HashMap::new(),
            executed: Vec::new(),
            counters: RunCounters::new(),
        };

        tracing::info!(run = %run_id, graph = %graph.name, start = %request.start, "Run started");
        self.events.emit(RunEvent::RunStarted {
            run_id,
            start: request.start,
        });

        let finish = self
            .drive(graph, &request, &context, &mut state, cancel)
            .await;
        if cancel.is_cancelled() && finish.status != RunStatus::Stopped {
            self.release_held_key(&request, &mut state).await;
        }

        self.contexts.discard(run_id).await;
        let success = finish.status != RunStatus::Failed;
        tracing::info!(
            run = %run_id,
            status = ?finish.status,
            cards = state.executed.len(),
            message = %finish.message,
            "Run finished"
        );
        self.events.emit(RunEvent::RunFinished {
            run_id,
            success,
            message: finish.message.clone(),
        });

        RunResult {
            run_id,
            status: finish.status,
            success,
            message: finish.message,
            executed: state.executed,
            counters: state.counters,
            retry_counts: state.retry_counts,
        }
    }

    async fn drive(
        &self,
        graph: &CardGraph,
        request: &RunRequest,
        context: &SharedContext,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> Finish {
        let run_id = request.run_id;
        let index = ConnectionIndex::build(graph.connections());

        loop {
            if cancel.is_cancelled() {
                return self.stop(request, context, state).await;
            }

            let Some(card) = graph.card(state.current) else {
                let err = if state.executed.is_empty() {
                    CardflowError::StartCardNotFound {
                        card: state.current,
                    }
                } else {
                    CardflowError::CardNotFound {
                        card: state.current,
                    }
                };
                tracing::error!(run = %run_id, error = %err, "Run aborted");
                self.events.emit(RunEvent::Error {
                    run_id,
                    card_id: Some(state.current),
                    message: err.to_string(),
                });
                return Finish::failed(err.to_string());
            };

            tracing::debug!(run = %run_id, card = %card.id, task_type = %card.task_type, "Executing card");
            self.events.emit(RunEvent::CardExecuting {
                run_id,
                card_id: card.id,
                task_type: card.task_type.clone(),
            });
            state.executed.push(card.id);

            let outcome = self.invoke(card, request, context, state, cancel).await;
            self.events.emit(RunEvent::CardFinished {
                run_id,
                card_id: card.id,
                success: outcome.success,
            });

            // A stop that lands mid-card wins over whatever the handler reported.
            if cancel.is_cancelled() {
                tracing::info!(run = %run_id, card = %card.id, "Stop requested while card was running");
                return self.stop(request, context, state).await;
            }

            if outcome.target == Some(Target::StopWorkflow) {
                return Finish::completed(format!("Card {} ended the workflow", card.id));
            }

            let outcome = self.check_contract(run_id, card, outcome);
            if outcome.success && outcome.action != Action::RetrySame {
                state.retry_counts.remove(&card.id);
            }

            let step = match self.resolve(run_id, card, &outcome, &index) {
                Step::Retry => self.retry(run_id, card, state, &index, cancel).await,
                other => other,
            };
            match step {
                Step::Goto(next) => state.current = next,
                Step::Retry => {}
                Step::Finish(finish) => return finish,
            }
        }
    }

    /// Call the card's handler, turning every failure mode into a plain
    /// failed outcome.
    async fn invoke(
        &self,
        card: &Card,
        request: &RunRequest,
        context: &SharedContext,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> HandlerOutcome {
        let run_id = request.run_id;
        let Some(handler) = self.registry.get(&card.task_type) else {
            let err = CardflowError::UnknownTaskType {
                task_type: card.task_type.clone(),
                card: card.id,
            };
            self.report(run_id, card.id, &err);
            return HandlerOutcome::failure();
        };

        let mut call = CardCall::new(
            run_id,
            card,
            &mut state.counters,
            context,
            cancel,
            self.input.as_ref(),
            &self.events,
        )
        .with_mode(request.mode)
        .with_endpoint(request.endpoint.as_ref())
        .with_region(request.region)
        .with_data(self.data.as_deref());

        match AssertUnwindSafe(handler.execute(&mut call))
            .catch_unwind()
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                self.report(run_id, card.id, &err);
                HandlerOutcome::failure()
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let err = CardflowError::HandlerPanic {
                    task_type: card.task_type.clone(),
                    card: card.id,
                    message,
                };
                self.report(run_id, card.id, &err);
                HandlerOutcome::failure()
            }
        }
    }

    /// A `JUMP` needs somewhere to go: the handler's target or the card's
    /// configured one. Without either the outcome degrades to a failure.
    fn check_contract(&self, run_id: RunId, card: &Card, outcome: HandlerOutcome) -> HandlerOutcome {
        let jump_without_target = outcome.action == Action::Jump
            && !matches!(outcome.target, Some(Target::Card(_)))
            && card.on_failure.jump_target.is_none();
        if !jump_without_target {
            return outcome;
        }
        let err = CardflowError::ContractViolation {
            card: card.id,
            message: "JUMP requested without a target".into(),
        };
        self.report(run_id, card.id, &err);
        HandlerOutcome::failure()
    }

    /// A handler-supplied card target always wins over the card's failure
    /// policy; an explicit action other than `NEXT` bypasses the policy.
    fn resolve(
        &self,
        run_id: RunId,
        card: &Card,
        outcome: &HandlerOutcome,
        index: &ConnectionIndex,
    ) -> Step {
        let forced = match outcome.target {
            Some(Target::Card(id)) => Some(id),
            _ => None,
        };

        let action = match outcome.action {
            Action::Next if outcome.success => return Self::follow(index, card, forced, true),
            Action::Next => match forced {
                Some(target) => return Step::Goto(target),
                None => card.on_failure.action,
            },
            explicit => explicit,
        };

        match action {
            Action::Next => Self::follow(index, card, forced, false),
            Action::Stop if outcome.success => {
                Step::Finish(Finish::completed(format!("Card {} stopped the run", card.id)))
            }
            Action::Stop => {
                tracing::warn!(run = %run_id, card = %card.id, task_type = %card.task_type, "Card failed, stopping run");
                Step::Finish(Finish::failed(format!(
                    "Card {} ({}) failed and its policy is to stop",
                    card.id, card.task_type
                )))
            }
            Action::Jump => match forced.or(card.on_failure.jump_target) {
                Some(target) => Step::Goto(target),
                None => {
                    tracing::warn!(
                        run = %run_id,
                        card = %card.id,
                        "Jump policy has no target, following connections"
                    );
                    Self::connect(index, card, false)
                }
            },
            Action::RetrySame => Step::Retry,
        }
    }

    /// Forced target first, then the connection index.
    fn follow(index: &ConnectionIndex, card: &Card, forced: Option<CardId>, success: bool) -> Step {
        match forced {
            Some(target) => Step::Goto(target),
            None => Self::connect(index, card, success),
        }
    }

    async fn retry(
        &self,
        run_id: RunId,
        card: &Card,
        state: &mut RunState,
        index: &ConnectionIndex,
        cancel: &CancellationToken,
    ) -> Step {
        let attempt = {
            let count = state.retry_counts.entry(card.id).or_insert(0);
            *count += 1;
            *count
        };

        if let Some(max) = self.config.max_retries {
            if attempt > max {
                state.retry_counts.remove(&card.id);
                tracing::warn!(run = %run_id, card = %card.id, max, "Retry limit reached");
                self.events.emit(RunEvent::Error {
                    run_id,
                    card_id: Some(card.id),
                    message: format!("Card {} exceeded {max} retries", card.id),
                });
                return Self::connect(index, card, false);
            }
        }

        tracing::debug!(run = %run_id, card = %card.id, attempt, "Retrying card");
        self.events.emit(RunEvent::CardRetrying {
            run_id,
            card_id: card.id,
            attempt,
        });

        let interval = card
            .on_failure
            .retry_interval
            .unwrap_or_else(|| self.config.retry_interval());
        // A cut-short wait is picked up by the cancellation check at the top
        // of the loop.
        sleep_cancellable(interval, self.config.wait_slice(), cancel).await;
        Step::Retry
    }

    fn connect(index: &ConnectionIndex, card: &Card, success: bool) -> Step {
        match select_connection(index, card.id, success) {
            Some(conn) => Step::Goto(conn.end),
            None => Step::Finish(Finish::completed(format!(
                "Run finished at card {}",
                card.id
            ))),
        }
    }

    async fn stop(
        &self,
        request: &RunRequest,
        context: &SharedContext,
        state: &mut RunState,
    ) -> Finish {
        self.release_held_key(request, state).await;
        context.clear_all_recognition().await;
        Finish::stopped()
    }

    async fn release_held_key(&self, request: &RunRequest, state: &mut RunState) {
        let Some(key) = state.counters.held_key().map(str::to_string) else {
            return;
        };
        match self.input.release_key(&key, request.endpoint.as_ref()).await {
            Ok(()) => {
                state.counters.take_held_key();
                tracing::info!(run = %request.run_id, key = %key, "Released held key on stop");
            }
            // The key stays recorded so the result shows it is still down.
            Err(e) => {
                tracing::warn!(run = %request.run_id, key = %key, error = %e, "Failed to release held key")
            }
        }
    }

    fn report(&self, run_id: RunId, card: CardId, err: &CardflowError) {
        tracing::error!(run = %run_id, card = %card, error = %err, "Card failed");
        self.events.emit(RunEvent::Error {
            run_id,
            card_id: Some(card),
            message: err.to_string(),
        });
    }
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

/// Handle to a run started with [`CardExecutor::spawn`].
pub struct RunHandle {
    run_id: RunId,
    cancel: CancellationToken,
    task: JoinHandle<RunResult>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Request cancellation. The run stops at its next check.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn join(self) -> Result<RunResult> {
        self.task
            .await
            .map_err(|e| CardflowError::Other(format!("Run task failed: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
