//! Input backend trait and built-in implementations.
//!
//! Concrete injection (window messages, emulator bridges, ...) lives outside
//! this crate. The executor only needs `release_key` so a cancelled run never
//! leaves a simulated key pressed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use cardflow_types::{CardflowError, Result, TargetEndpoint};

/// A simulated input action, as recorded by [`RecordingInput`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputAction {
    Press(String),
    Release(String),
    Click { x: i32, y: i32 },
}

#[async_trait]
pub trait InputBackend: Send + Sync {
    async fn press_key(&self, key: &str, endpoint: Option<&TargetEndpoint>) -> Result<()>;

    async fn release_key(&self, key: &str, endpoint: Option<&TargetEndpoint>) -> Result<()>;

    async fn click(&self, x: i32, y: i32, endpoint: Option<&TargetEndpoint>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// LoggingInput
// ---------------------------------------------------------------------------

/// Backend that only logs what it would inject.
pub struct LoggingInput;

#[async_trait]
impl InputBackend for LoggingInput {
    async fn press_key(&self, key: &str, endpoint: Option<&TargetEndpoint>) -> Result<()> {
        tracing::info!(key, endpoint = ?endpoint.map(|e| e.handle), "Key down");
        Ok(())
    }

    async fn release_key(&self, key: &str, endpoint: Option<&TargetEndpoint>) -> Result<()> {
        tracing::info!(key, endpoint = ?endpoint.map(|e| e.handle), "Key up");
        Ok(())
    }

    async fn click(&self, x: i32, y: i32, endpoint: Option<&TargetEndpoint>) -> Result<()> {
        tracing::info!(x, y, endpoint = ?endpoint.map(|e| e.handle), "Click");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingInput
// ---------------------------------------------------------------------------

/// Backend that records every action, for tests.
#[derive(Default)]
pub struct RecordingInput {
    actions: Mutex<Vec<InputAction>>,
    fail_releases: AtomicBool,
}

impl RecordingInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose key releases fail and are not recorded.
    pub fn failing_releases() -> Self {
        let input = Self::default();
        input.set_fail_releases(true);
        input
    }

    pub fn set_fail_releases(&self, fail: bool) {
        self.fail_releases.store(fail, Ordering::SeqCst);
    }

    pub fn actions(&self) -> Vec<InputAction> {
        self.actions.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Keys pressed and not yet released, in press order.
    pub fn keys_down(&self) -> Vec<String> {
        let mut down: Vec<String> = Vec::new();
        for action in self.actions.lock().unwrap_or_else(PoisonError::into_inner).iter() {
            match action {
                InputAction::Press(k) => {
                    if !down.contains(k) {
                        down.push(k.clone());
                    }
                }
                InputAction::Release(k) => down.retain(|d| d != k),
                InputAction::Click { .. } => {}
            }
        }
        down
    }

    fn record(&self, action: InputAction) {
        self.actions.lock().unwrap_or_else(PoisonError::into_inner).push(action);
    }
}

#[async_trait]
impl InputBackend for RecordingInput {
    async fn press_key(&self, key: &str, _endpoint: Option<&TargetEndpoint>) -> Result<()> {
        self.record(InputAction::Press(key.to_string()));
        Ok(())
    }

    async fn release_key(&self, key: &str, _endpoint: Option<&TargetEndpoint>) -> Result<()> {
        if self.fail_releases.load(Ordering::SeqCst) {
            return Err(CardflowError::Input(format!("cannot release '{key}'")));
        }
        self.record(InputAction::Release(key.to_string()));
        Ok(())
    }

    async fn click(&self, x: i32, y: i32, _endpoint: Option<&TargetEndpoint>) -> Result<()> {
        self.record(InputAction::Click { x, y });
        Ok(())
    }
}
