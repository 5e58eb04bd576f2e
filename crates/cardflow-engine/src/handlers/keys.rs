//! Simulated key presses.
//!
//! Parameters:
//! - `key`: key name handed to the input backend (optional for `release`)
//! - `mode`: `tap` (default), `hold`, or `release`
//! - `duration_ms`: for `hold`, release after this long

use std::time::Duration;

use async_trait::async_trait;
use cardflow_types::{HandlerOutcome, Result};

use crate::handler::{CardCall, CardHandler};
use crate::wait::{sleep_cancellable, DEFAULT_WAIT_SLICE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyMode {
    Tap,
    Hold,
    Release,
}

impl KeyMode {
    fn parse(label: Option<&str>) -> Option<Self> {
        match label.map(|l| l.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("tap") | Some("press") => Some(Self::Tap),
            Some("hold") | Some("down") => Some(Self::Hold),
            Some("release") | Some("up") => Some(Self::Release),
            _ => None,
        }
    }
}

/// A held key is recorded in the run counters so the executor can release
/// it if the run is cancelled before the card lets go.
pub struct KeyPressHandler;

#[async_trait]
impl CardHandler for KeyPressHandler {
    fn task_type(&self) -> &str {
        "key_press"
    }

    async fn execute(&self, call: &mut CardCall<'_>) -> Result<HandlerOutcome> {
        let mode = KeyMode::parse(call.card.param_str("mode")).ok_or_else(|| {
            call.error(format!(
                "Unknown key mode '{}'",
                call.card.param_str("mode").unwrap_or_default()
            ))
        })?;
        let key = call.card.param_str("key").map(str::to_string);

        match mode {
            KeyMode::Tap => {
                let key = key.ok_or_else(|| call.error("Missing 'key' parameter"))?;
                call.input.press_key(&key, call.endpoint).await?;
                call.input.release_key(&key, call.endpoint).await?;
                call.detail(format!("Tapped '{key}'"));
                Ok(HandlerOutcome::success())
            }
            KeyMode::Hold => {
                let key = key.ok_or_else(|| call.error("Missing 'key' parameter"))?;
                // Forget the previous key only once it is really up.
                if let Some(previous) = call.counters.held_key().map(str::to_string) {
                    call.input.release_key(&previous, call.endpoint).await?;
                    call.counters.take_held_key();
                }
                call.input.press_key(&key, call.endpoint).await?;
                call.counters.set_held_key(key.clone());

                let Some(ms) = call.card.param_i64("duration_ms").filter(|ms| *ms > 0) else {
                    call.detail(format!("Holding '{key}'"));
                    return Ok(HandlerOutcome::success());
                };

                let held = sleep_cancellable(
                    Duration::from_millis(ms as u64),
                    DEFAULT_WAIT_SLICE,
                    call.cancel,
                )
                .await;
                if !held {
                    // Leave the key recorded; the executor releases it on stop.
                    return Ok(HandlerOutcome::failure());
                }
                call.input.release_key(&key, call.endpoint).await?;
                call.counters.take_held_key();
                call.detail(format!("Held '{key}' for {ms}ms"));
                Ok(HandlerOutcome::success())
            }
            KeyMode::Release => {
                let held = call.counters.held_key().map(str::to_string);
                let Some(key) = key.or_else(|| held.clone()) else {
                    tracing::debug!(card = %call.card_id(), "No key held, nothing to release");
                    return Ok(HandlerOutcome::success());
                };
                call.input.release_key(&key, call.endpoint).await?;
                if held.as_deref() == Some(key.as_str()) {
                    call.counters.take_held_key();
                }
                call.detail(format!("Released '{key}'"));
                Ok(HandlerOutcome::success())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventEmitter;
    use crate::graph::Card;
    use crate::input::{InputAction, RecordingInput};
    use cardflow_types::{CardflowError, RunCounters, RunId, SharedContext};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        counters: RunCounters,
        context: SharedContext,
        cancel: CancellationToken,
        input: RecordingInput,
        events: EventEmitter,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                counters: RunCounters::new(),
                context: SharedContext::new(RunId::new()),
                cancel: CancellationToken::new(),
                input: RecordingInput::new(),
                events: EventEmitter::new(16),
            }
        }

        async fn run(&mut self, card: &Card) -> Result<HandlerOutcome> {
            let mut call = CardCall::new(
                self.context.run_id(),
                card,
                &mut self.counters,
                &self.context,
                &self.cancel,
                &self.input,
                &self.events,
            );
            KeyPressHandler.execute(&mut call).await
        }
    }

    #[tokio::test]
    async fn tap_presses_and_releases() {
        let mut h = Harness::new();
        let card = Card::new(1, "key_press").with_param("key", json!("space"));

        assert!(h.run(&card).await.unwrap().success);
        assert_eq!(
            h.input.actions(),
            vec![InputAction::Press("space".into()), InputAction::Release("space".into())]
        );
        assert!(h.counters.held_key().is_none());
    }

    #[tokio::test]
    async fn missing_key_is_an_error() {
        let mut h = Harness::new();
        let card = Card::new(1, "key_press");
        let err = h.run(&card).await.unwrap_err();
        assert!(err.to_string().contains("'key'"));
    }

    #[tokio::test]
    async fn unknown_mode_is_an_error() {
        let mut h = Harness::new();
        let card = Card::new(1, "key_press")
            .with_param("key", json!("w"))
            .with_param("mode", json!("wiggle"));
        assert!(h.run(&card).await.is_err());
    }

    #[tokio::test]
    async fn hold_without_duration_records_held_key() {
        let mut h = Harness::new();
        let card = Card::new(1, "key_press")
            .with_param("key", json!("w"))
            .with_param("mode", json!("hold"));

        assert!(h.run(&card).await.unwrap().success);
        assert_eq!(h.counters.held_key(), Some("w"));
        assert_eq!(h.input.keys_down(), vec!["w".to_string()]);
    }

    #[tokio::test]
    async fn hold_releases_previous_key_first() {
        let mut h = Harness::new();
        h.counters.set_held_key("a");
        let card = Card::new(1, "key_press")
            .with_param("key", json!("d"))
            .with_param("mode", json!("hold"));

        h.run(&card).await.unwrap();
        assert_eq!(
            h.input.actions(),
            vec![InputAction::Release("a".into()), InputAction::Press("d".into())]
        );
        assert_eq!(h.counters.held_key(), Some("d"));
    }

    #[tokio::test]
    async fn failed_release_keeps_previous_key_recorded() {
        let mut h = Harness::new();
        h.input = RecordingInput::failing_releases();
        h.counters.set_held_key("a");
        let card = Card::new(1, "key_press")
            .with_param("key", json!("d"))
            .with_param("mode", json!("hold"));

        let err = h.run(&card).await.unwrap_err();
        assert!(matches!(err, CardflowError::Input(_)));
        assert_eq!(h.counters.held_key(), Some("a"));
        assert!(h.input.actions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_hold_releases_after_duration() {
        let mut h = Harness::new();
        let card = Card::new(1, "key_press")
            .with_param("key", json!("shift"))
            .with_param("mode", json!("hold"))
            .with_param("duration_ms", json!(500));

        assert!(h.run(&card).await.unwrap().success);
        assert!(h.input.keys_down().is_empty());
        assert!(h.counters.held_key().is_none());
    }

    #[tokio::test]
    async fn cancelled_timed_hold_keeps_key_recorded() {
        let mut h = Harness::new();
        h.cancel.cancel();
        let card = Card::new(1, "key_press")
            .with_param("key", json!("shift"))
            .with_param("mode", json!("hold"))
            .with_param("duration_ms", json!(5_000));

        assert!(!h.run(&card).await.unwrap().success);
        assert_eq!(h.counters.held_key(), Some("shift"));
    }

    #[tokio::test]
    async fn release_defaults_to_held_key() {
        let mut h = Harness::new();
        h.counters.set_held_key("w");
        let card = Card::new(1, "key_press").with_param("mode", json!("release"));

        assert!(h.run(&card).await.unwrap().success);
        assert_eq!(h.input.actions(), vec![InputAction::Release("w".into())]);
        assert!(h.counters.held_key().is_none());
    }

    #[tokio::test]
    async fn release_with_nothing_held_is_a_noop() {
        let mut h = Harness::new();
        let card = Card::new(1, "key_press").with_param("mode", json!("up"));
        assert!(h.run(&card).await.unwrap().success);
        assert!(h.input.actions().is_empty());
    }
}
