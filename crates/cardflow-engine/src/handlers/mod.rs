//! Built-in card handlers beyond noop/stop_workflow.

pub mod keys;
pub mod text_match;

pub use keys::KeyPressHandler;
pub use text_match::TextMatchHandler;

use std::time::Duration;

use async_trait::async_trait;
use cardflow_types::{HandlerOutcome, Result};

use crate::handler::{CardCall, CardHandler};
use crate::wait::{sleep_cancellable, DEFAULT_WAIT_SLICE};

// ---------------------------------------------------------------------------
// DelayHandler: waits `ms` milliseconds, cancellably
// ---------------------------------------------------------------------------

pub struct DelayHandler;

#[async_trait]
impl CardHandler for DelayHandler {
    fn task_type(&self) -> &str {
        "delay"
    }

    async fn execute(&self, call: &mut CardCall<'_>) -> Result<HandlerOutcome> {
        let ms = call
            .card
            .param_i64("ms")
            .filter(|ms| *ms >= 0)
            .ok_or_else(|| call.error("Missing or negative 'ms' parameter"))?;

        tracing::debug!(card = %call.card_id(), ms, "Delaying");
        let completed =
            sleep_cancellable(Duration::from_millis(ms as u64), DEFAULT_WAIT_SLICE, call.cancel)
                .await;

        if completed {
            Ok(HandlerOutcome::success())
        } else {
            tracing::debug!(card = %call.card_id(), "Delay interrupted by cancellation");
            Ok(HandlerOutcome::failure())
        }
    }
}

// ---------------------------------------------------------------------------
// SetVariableHandler: writes a run-wide global variable
// ---------------------------------------------------------------------------

/// Sets global variable `name` to the literal `value` parameter, or to
/// whatever the run's data source returns for the `fetch` key.
pub struct SetVariableHandler;

#[async_trait]
impl CardHandler for SetVariableHandler {
    fn task_type(&self) -> &str {
        "set_variable"
    }

    async fn execute(&self, call: &mut CardCall<'_>) -> Result<HandlerOutcome> {
        let name = call
            .card
            .param_str("name")
            .map(str::to_string)
            .ok_or_else(|| call.error("Missing 'name' parameter"))?;

        let value = match call.card.param_str("fetch") {
            Some(key) => {
                let source = call
                    .data
                    .ok_or_else(|| call.error("No data source configured for 'fetch'"))?;
                match source.fetch(key) {
                    Some(v) => v,
                    None => {
                        call.detail(format!("Data source has no value for '{key}'"));
                        return Ok(HandlerOutcome::failure());
                    }
                }
            }
            None => call
                .card
                .param("value")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        };

        call.context.set_global(name.clone(), value).await;
        call.detail(format!("Set variable '{name}'"));
        Ok(HandlerOutcome::success())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
