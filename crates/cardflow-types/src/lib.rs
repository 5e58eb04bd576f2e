//! Shared types, errors, counters, and context for the Cardflow executor.
//!
//! This crate provides the foundational types used across the other Cardflow crates:
//! - `CardflowError`: unified error taxonomy
//! - `Action` / `HandlerOutcome`: what a handler reports back to the executor
//! - `RunCounters`: per-run state that survives across handler calls
//! - `SharedContext` / `ContextStore`: per-run hand-off of recognition results

pub mod context;
pub mod counters;

pub use context::{
    CardScratch, ContextStore, LatestProducer, MultiGroupProgress, RecognitionResult,
    RecognizedItem, SharedContext,
};
pub use counters::RunCounters;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unified error type for all Cardflow subsystems.
#[derive(Debug, thiserror::Error)]
pub enum CardflowError {
    // === Configuration Errors ===
    #[error("Start card {card} not found")]
    StartCardNotFound { card: CardId },

    #[error("Card {card} not found")]
    CardNotFound { card: CardId },

    #[error("Graph configuration error: {0}")]
    Configuration(String),

    #[error("Graph validation failed: {0}")]
    ValidationError(String),

    // === Handler Errors ===
    #[error("Handler '{task_type}' failed on card {card}: {message}")]
    HandlerError {
        task_type: String,
        card: CardId,
        message: String,
    },

    #[error("Handler '{task_type}' panicked on card {card}: {message}")]
    HandlerPanic {
        task_type: String,
        card: CardId,
        message: String,
    },

    #[error("No handler registered for task type '{task_type}' (card {card})")]
    UnknownTaskType { task_type: String, card: CardId },

    #[error("Handler contract violated on card {card}: {message}")]
    ContractViolation { card: CardId, message: String },

    #[error("Cannot register handler: {0}")]
    Registration(String),

    // === Input Errors ===
    #[error("Input backend error: {0}")]
    Input(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl CardflowError {
    /// Returns `true` for errors that abort a run without consulting any card policy.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CardflowError::StartCardNotFound { .. }
                | CardflowError::CardNotFound { .. }
                | CardflowError::Configuration(_)
                | CardflowError::ValidationError(_)
        )
    }
}

/// A convenience alias for `Result<T, CardflowError>`.
pub type Result<T> = std::result::Result<T, CardflowError>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Integer identifier of a card in the execution graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CardId(pub i64);

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for CardId {
    fn from(id: i64) -> Self {
        CardId(id)
    }
}

/// Identifier of one run. The nil uuid is reserved for the default run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub uuid::Uuid);

impl RunId {
    /// The run used when a caller asks for "the current context" without naming one.
    pub const DEFAULT: RunId = RunId(uuid::Uuid::nil());

    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4())
    }

    pub fn is_default(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Action: branching instruction reported by a handler or configured on a card
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    #[default]
    Next,
    Jump,
    Stop,
    RetrySame,
}

impl Action {
    /// Translate a persisted label into an action.
    ///
    /// Accepts the canonical snake_case names as well as the human-readable
    /// labels written by the graph editor ("Next step", "Stop workflow", ...).
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label
            .trim()
            .to_lowercase()
            .replace(['-', ' '], "_");
        match normalized.as_str() {
            "next" | "next_step" | "continue" => Some(Action::Next),
            "jump" | "jump_to" | "jump_to_card" | "goto" => Some(Action::Jump),
            "stop" | "stop_workflow" | "abort" => Some(Action::Stop),
            "retry_same" | "retry" | "retry_this_step" | "retry_step" => Some(Action::RetrySame),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Next => "next",
            Action::Jump => "jump",
            Action::Stop => "stop",
            Action::RetrySame => "retry_same",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// HandlerOutcome: the (success, action, target) triple
// ---------------------------------------------------------------------------

/// Where a handler wants the run to go next, overriding graph connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Card(CardId),
    /// Reserved sentinel: end the run successfully regardless of `success`.
    StopWorkflow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub success: bool,
    pub action: Action,
    pub target: Option<Target>,
}

impl HandlerOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            action: Action::Next,
            target: None,
        }
    }

    pub fn failure() -> Self {
        Self {
            success: false,
            action: Action::Next,
            target: None,
        }
    }

    /// Failed attempt that should re-run the same card.
    pub fn retry() -> Self {
        Self {
            success: false,
            action: Action::RetrySame,
            target: None,
        }
    }

    pub fn jump_to(card: CardId) -> Self {
        Self {
            success: true,
            action: Action::Jump,
            target: Some(Target::Card(card)),
        }
    }

    pub fn stop_workflow() -> Self {
        Self {
            success: true,
            action: Action::Next,
            target: Some(Target::StopWorkflow),
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }
}

// ---------------------------------------------------------------------------
// Invocation environment
// ---------------------------------------------------------------------------

/// How input is delivered to the target endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Foreground,
    Background,
}

/// The window (or other input sink) a run is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetEndpoint {
    pub handle: u64,
    #[serde(default)]
    pub title: Option<String>,
}

/// A rectangle in target-endpoint coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn center(&self) -> (i32, i32) {
        (
            self.x + (self.width / 2) as i32,
            self.y + (self.height / 2) as i32,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_card_not_found() {
        let err = CardflowError::CardNotFound { card: CardId(7) };
        assert_eq!(err.to_string(), "Card 7 not found");
    }

    #[test]
    fn error_display_handler_error() {
        let err = CardflowError::HandlerError {
            task_type: "text_match".into(),
            card: CardId(3),
            message: "no recognition result".into(),
        };
        assert_eq!(
            err.to_string(),
            "Handler 'text_match' failed on card 3: no recognition result"
        );
    }

    #[test]
    fn error_display_unknown_task_type() {
        let err = CardflowError::UnknownTaskType {
            task_type: "teleport".into(),
            card: CardId(9),
        };
        assert_eq!(
            err.to_string(),
            "No handler registered for task type 'teleport' (card 9)"
        );
    }

    #[test]
    fn configuration_classification() {
        assert!(CardflowError::StartCardNotFound { card: CardId(1) }.is_configuration());
        assert!(CardflowError::CardNotFound { card: CardId(1) }.is_configuration());
        assert!(!CardflowError::Input("stuck".into()).is_configuration());
        assert!(!CardflowError::Other("x".into()).is_configuration());
    }

    #[test]
    fn action_from_label_accepts_editor_labels() {
        assert_eq!(Action::from_label("next"), Some(Action::Next));
        assert_eq!(Action::from_label("Next step"), Some(Action::Next));
        assert_eq!(Action::from_label("STOP"), Some(Action::Stop));
        assert_eq!(Action::from_label("Stop workflow"), Some(Action::Stop));
        assert_eq!(Action::from_label("jump-to"), Some(Action::Jump));
        assert_eq!(Action::from_label("retry_same"), Some(Action::RetrySame));
        assert_eq!(Action::from_label("Retry this step"), Some(Action::RetrySame));
        assert_eq!(Action::from_label("explode"), None);
    }

    #[test]
    fn action_serde_uses_snake_case() {
        let json = serde_json::to_string(&Action::RetrySame).unwrap();
        assert_eq!(json, "\"retry_same\"");
        let back: Action = serde_json::from_str("\"jump\"").unwrap();
        assert_eq!(back, Action::Jump);
    }

    #[test]
    fn outcome_constructors() {
        assert!(HandlerOutcome::success().success);
        assert_eq!(HandlerOutcome::failure().action, Action::Next);
        assert_eq!(HandlerOutcome::retry().action, Action::RetrySame);
        assert_eq!(
            HandlerOutcome::jump_to(CardId(4)).target,
            Some(Target::Card(CardId(4)))
        );
        assert_eq!(
            HandlerOutcome::stop_workflow().target,
            Some(Target::StopWorkflow)
        );
    }

    #[test]
    fn default_run_id_is_nil() {
        assert!(RunId::DEFAULT.is_default());
        assert!(!RunId::new().is_default());
        assert_ne!(RunId::new(), RunId::new());
    }

    #[test]
    fn region_center() {
        let r = Region { x: 10, y: 20, width: 100, height: 40 };
        assert_eq!(r.center(), (60, 40));
    }
}
