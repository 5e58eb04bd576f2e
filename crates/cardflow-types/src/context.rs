//! Per-run shared context store.
//!
//! Lets a downstream card consume data produced upstream (a text-recognition
//! card feeding a text-click card) without either card naming the other.
//! Each run gets its own [`SharedContext`]; a [`ContextStore`] hands them out
//! by [`RunId`] and discards them when the run ends.
//!
//! Per-card data has four clear operations of increasing scope:
//!
//! | operation                 | recognition | group progress | succeeded items |
//! |---------------------------|-------------|----------------|-----------------|
//! | `clear_recognition`       | card        | kept           | kept            |
//! | `reset_card`              | card        | card           | kept            |
//! | `clear_succeeded`         | kept        | kept           | card            |
//! | `clear_all_recognition`   | all cards   | all cards      | all cards       |
//!
//! A card whose scratch becomes empty after any clear is removed outright.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{CardId, Region, RunId};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedItem {
    pub text: String,
    pub bounds: Region,
    #[serde(default)]
    pub confidence: f32,
}

/// Output of a recognition card, stored under the producing card's id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub text: String,
    #[serde(default)]
    pub items: Vec<RecognizedItem>,
    #[serde(default)]
    pub region: Option<Region>,
}

impl RecognitionResult {
    pub fn from_items(items: Vec<RecognizedItem>) -> Self {
        let text = items
            .iter()
            .map(|i| i.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            text,
            items,
            region: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestProducer {
    pub card: CardId,
    pub at: DateTime<Utc>,
}

/// Progress through an ordered list of item groups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiGroupProgress {
    pub groups: Vec<Vec<String>>,
    pub index: usize,
    pub consumed: BTreeSet<String>,
}

impl MultiGroupProgress {
    pub fn new(groups: Vec<Vec<String>>) -> Self {
        Self {
            groups,
            index: 0,
            consumed: BTreeSet::new(),
        }
    }

    pub fn current(&self) -> Option<&[String]> {
        self.groups.get(self.index).map(Vec::as_slice)
    }

    /// Items of the current group not yet consumed, in group order.
    pub fn remaining(&self) -> Vec<String> {
        self.current()
            .map(|g| {
                g.iter()
                    .filter(|item| !self.consumed.contains(*item))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_finished(&self) -> bool {
        self.index >= self.groups.len()
    }

    /// Move to the next group. Returns `true` if a group remains.
    pub fn advance(&mut self) -> bool {
        if !self.is_finished() {
            self.index += 1;
        }
        self.consumed.clear();
        !self.is_finished()
    }
}

/// Everything the context holds for a single card.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CardScratch {
    pub recognition: Option<RecognitionResult>,
    pub groups: Option<MultiGroupProgress>,
    pub succeeded: BTreeSet<String>,
    pub values: HashMap<String, serde_json::Value>,
}

impl CardScratch {
    pub fn is_empty(&self) -> bool {
        self.recognition.is_none()
            && self.groups.is_none()
            && self.succeeded.is_empty()
            && self.values.is_empty()
    }
}

#[derive(Debug, Default)]
struct ContextData {
    cards: HashMap<CardId, CardScratch>,
    latest: Option<LatestProducer>,
    globals: HashMap<String, serde_json::Value>,
}

impl ContextData {
    fn card_mut(&mut self, card: CardId) -> &mut CardScratch {
        self.cards.entry(card).or_default()
    }

    /// Apply `f` to an existing card entry, then drop the entry if it is empty.
    fn update_existing<R>(
        &mut self,
        card: CardId,
        f: impl FnOnce(&mut CardScratch) -> R,
    ) -> Option<R> {
        let scratch = self.cards.get_mut(&card)?;
        let out = f(scratch);
        if scratch.is_empty() {
            self.cards.remove(&card);
        }
        Some(out)
    }

    fn forget_latest_if(&mut self, card: CardId) {
        if self.latest.map(|l| l.card) == Some(card) {
            self.latest = None;
        }
    }
}

// ---------------------------------------------------------------------------
// SharedContext
// ---------------------------------------------------------------------------

/// Handle to one run's context.
///
/// Cloning yields another handle to the **same** state. Only the owning run's
/// worker writes through it.
#[derive(Clone)]
pub struct SharedContext {
    run_id: RunId,
    inner: Arc<RwLock<ContextData>>,
}

impl SharedContext {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            inner: Arc::new(RwLock::new(ContextData::default())),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    // --- recognition results ---

    /// Store a recognition result produced by `card`, stamped with the current time.
    pub async fn record_recognition(&self, card: CardId, result: RecognitionResult) {
        self.record_recognition_at(card, result, Utc::now()).await;
    }

    /// Store a recognition result with an explicit timestamp.
    ///
    /// The latest-producer pointer moves when `at` is not older than the
    /// current latest; equal timestamps resolve to the later write.
    pub async fn record_recognition_at(
        &self,
        card: CardId,
        result: RecognitionResult,
        at: DateTime<Utc>,
    ) {
        let mut guard = self.inner.write().await;
        guard.card_mut(card).recognition = Some(result);
        let newer = guard.latest.map_or(true, |l| at >= l.at);
        if newer {
            guard.latest = Some(LatestProducer { card, at });
        }
        tracing::debug!(run = %self.run_id, card = %card, "Recognition result recorded");
    }

    pub async fn recognition(&self, card: CardId) -> Option<RecognitionResult> {
        self.inner
            .read()
            .await
            .cards
            .get(&card)
            .and_then(|s| s.recognition.clone())
    }

    /// The most recently written recognition result and its producer.
    pub async fn latest_recognition(&self) -> Option<(CardId, RecognitionResult)> {
        let guard = self.inner.read().await;
        let latest = guard.latest?;
        let result = guard.cards.get(&latest.card)?.recognition.clone()?;
        Some((latest.card, result))
    }

    pub async fn latest_producer(&self) -> Option<LatestProducer> {
        self.inner.read().await.latest
    }

    // --- multi-group progress ---

    /// Begin (or restart) group progress for `card`.
    pub async fn start_groups(&self, card: CardId, groups: Vec<Vec<String>>) {
        self.inner.write().await.card_mut(card).groups = Some(MultiGroupProgress::new(groups));
    }

    pub async fn group_progress(&self, card: CardId) -> Option<MultiGroupProgress> {
        self.inner
            .read()
            .await
            .cards
            .get(&card)
            .and_then(|s| s.groups.clone())
    }

    /// Mark an item of the current group as consumed.
    /// Returns `false` when the card has no group progress.
    pub async fn mark_consumed(&self, card: CardId, item: &str) -> bool {
        let mut guard = self.inner.write().await;
        match guard.cards.get_mut(&card).and_then(|s| s.groups.as_mut()) {
            Some(progress) => {
                progress.consumed.insert(item.to_string());
                true
            }
            None => false,
        }
    }

    /// Advance `card` to its next group. Returns `true` if a group remains.
    pub async fn advance_group(&self, card: CardId) -> bool {
        let mut guard = self.inner.write().await;
        match guard.cards.get_mut(&card).and_then(|s| s.groups.as_mut()) {
            Some(progress) => progress.advance(),
            None => false,
        }
    }

    // --- succeeded-item bookkeeping ---

    pub async fn mark_succeeded(&self, card: CardId, item: &str) {
        self.inner
            .write()
            .await
            .card_mut(card)
            .succeeded
            .insert(item.to_string());
    }

    pub async fn has_succeeded(&self, card: CardId, item: &str) -> bool {
        self.inner
            .read()
            .await
            .cards
            .get(&card)
            .is_some_and(|s| s.succeeded.contains(item))
    }

    pub async fn succeeded_items(&self, card: CardId) -> BTreeSet<String> {
        self.inner
            .read()
            .await
            .cards
            .get(&card)
            .map(|s| s.succeeded.clone())
            .unwrap_or_default()
    }

    // --- generic per-card values ---

    pub async fn set_value(&self, card: CardId, key: impl Into<String>, value: serde_json::Value) {
        self.inner
            .write()
            .await
            .card_mut(card)
            .values
            .insert(key.into(), value);
    }

    pub async fn value(&self, card: CardId, key: &str) -> Option<serde_json::Value> {
        self.inner
            .read()
            .await
            .cards
            .get(&card)
            .and_then(|s| s.values.get(key).cloned())
    }

    pub async fn remove_value(&self, card: CardId, key: &str) -> Option<serde_json::Value> {
        self.inner
            .write()
            .await
            .update_existing(card, |s| s.values.remove(key))
            .flatten()
    }

    // --- global variables ---

    pub async fn set_global(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.write().await.globals.insert(key.into(), value);
    }

    pub async fn global(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().await.globals.get(key).cloned()
    }

    pub async fn remove_global(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.write().await.globals.remove(key)
    }

    pub async fn globals(&self) -> HashMap<String, serde_json::Value> {
        self.inner.read().await.globals.clone()
    }

    // --- clears ---

    /// Clear only `card`'s transient recognition fields.
    pub async fn clear_recognition(&self, card: CardId) {
        let mut guard = self.inner.write().await;
        guard.update_existing(card, |s| s.recognition = None);
        guard.forget_latest_if(card);
    }

    /// Clear `card`'s recognition fields and its multi-group progress.
    pub async fn reset_card(&self, card: CardId) {
        let mut guard = self.inner.write().await;
        guard.update_existing(card, |s| {
            s.recognition = None;
            s.groups = None;
        });
        guard.forget_latest_if(card);
    }

    /// Clear only `card`'s already-succeeded item bookkeeping.
    pub async fn clear_succeeded(&self, card: CardId) {
        self.inner
            .write()
            .await
            .update_existing(card, |s| s.succeeded.clear());
    }

    /// Clear recognition data of every card: results, group progress,
    /// succeeded items, and the latest-producer pointer.
    pub async fn clear_all_recognition(&self) {
        let mut guard = self.inner.write().await;
        for scratch in guard.cards.values_mut() {
            scratch.recognition = None;
            scratch.groups = None;
            scratch.succeeded.clear();
        }
        guard.cards.retain(|_, s| !s.is_empty());
        guard.latest = None;
        tracing::debug!(run = %self.run_id, "All recognition data cleared");
    }

    // --- inspection ---

    /// Ids of cards that currently hold any scratch data, ascending.
    pub async fn card_ids(&self) -> Vec<CardId> {
        let mut ids: Vec<_> = self.inner.read().await.cards.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn scratch(&self, card: CardId) -> Option<CardScratch> {
        self.inner.read().await.cards.get(&card).cloned()
    }

    pub async fn is_empty(&self) -> bool {
        let guard = self.inner.read().await;
        guard.cards.is_empty() && guard.globals.is_empty() && guard.latest.is_none()
    }
}

// ---------------------------------------------------------------------------
// ContextStore
// ---------------------------------------------------------------------------

/// Hands out one [`SharedContext`] per run id.
///
/// Contexts are created lazily on first access and removed by [`discard`](Self::discard)
/// when the run ends. Distinct run ids never share state.
#[derive(Clone, Default)]
pub struct ContextStore {
    runs: Arc<RwLock<HashMap<RunId, SharedContext>>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The context for `run`, created if absent.
    pub async fn context(&self, run: RunId) -> SharedContext {
        if let Some(ctx) = self.runs.read().await.get(&run) {
            return ctx.clone();
        }
        self.runs
            .write()
            .await
            .entry(run)
            .or_insert_with(|| SharedContext::new(run))
            .clone()
    }

    /// Convenience lookup: the named run's context, or the default run's when `None`.
    pub async fn current(&self, run: Option<RunId>) -> SharedContext {
        self.context(run.unwrap_or(RunId::DEFAULT)).await
    }

    pub async fn get(&self, run: RunId) -> Option<SharedContext> {
        self.runs.read().await.get(&run).cloned()
    }

    pub async fn contains(&self, run: RunId) -> bool {
        self.runs.read().await.contains_key(&run)
    }

    /// Drop the run's context entirely. Returns `true` if one existed.
    pub async fn discard(&self, run: RunId) -> bool {
        let removed = self.runs.write().await.remove(&run).is_some();
        if removed {
            tracing::debug!(run = %run, "Context discarded");
        }
        removed
    }

    pub async fn run_count(&self) -> usize {
        self.runs.read().await.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
