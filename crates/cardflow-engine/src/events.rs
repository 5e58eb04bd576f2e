//! Run lifecycle events.
//!
//! Emits [`RunEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (UI, loggers) can follow run progress. Emission is
//! fire-and-forget: no acknowledgement, no back-pressure.

use serde::{Deserialize, Serialize};

use cardflow_types::{CardId, RunId};

/// Events emitted during a run. Every event names the run it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        start: CardId,
    },
    RunFinished {
        run_id: RunId,
        success: bool,
        message: String,
    },
    CardExecuting {
        run_id: RunId,
        card_id: CardId,
        task_type: String,
    },
    CardFinished {
        run_id: RunId,
        card_id: CardId,
        success: bool,
    },
    CardRetrying {
        run_id: RunId,
        card_id: CardId,
        attempt: u32,
    },
    Error {
        run_id: RunId,
        card_id: Option<CardId>,
        message: String,
    },
    StepDetail {
        run_id: RunId,
        text: String,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::RunFinished { run_id, .. }
            | RunEvent::CardExecuting { run_id, .. }
            | RunEvent::CardFinished { run_id, .. }
            | RunEvent::CardRetrying { run_id, .. }
            | RunEvent::Error { run_id, .. }
            | RunEvent::StepDetail { run_id, .. } => *run_id,
        }
    }
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
