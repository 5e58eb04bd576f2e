//! Click recognized text.
//!
//! Reads a recognition result produced upstream (the `source` card, or the
//! most recent producer when no source is given), looks for any wanted label
//! of the current group among the recognized items, and clicks the first hit.
//!
//! Parameters:
//! - `groups`: ordered list of label lists, or `texts` / `text` for one group
//! - `source`: producer card id
//! - `region`: `{x, y, width, height}` limiting where labels count; the run's
//!   region applies when absent
//! - `repeat_until_all`: re-run this card until every group is done
//! - `complete_target`: card to jump to once every group is done

use std::sync::Arc;

use async_trait::async_trait;
use cardflow_types::{Action, CardId, HandlerOutcome, RecognitionResult, RecognizedItem, Region, Result};

use crate::handler::{CardCall, CardHandler};
use crate::pool::MatchPool;

pub struct TextMatchHandler {
    pool: Arc<MatchPool>,
}

impl TextMatchHandler {
    pub fn new(pool: Arc<MatchPool>) -> Self {
        Self { pool }
    }
}

fn wanted_groups(call: &CardCall<'_>) -> Vec<Vec<String>> {
    let strings = |v: &serde_json::Value| -> Vec<String> {
        v.as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|s| s.as_str())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    if let Some(groups) = call.card.param("groups").and_then(|g| g.as_array()) {
        return groups
            .iter()
            .map(strings)
            .filter(|g| !g.is_empty())
            .collect();
    }
    if let Some(texts) = call.card.param("texts") {
        let group = strings(texts);
        return if group.is_empty() { Vec::new() } else { vec![group] };
    }
    match call.card.param_str("text").map(str::trim) {
        Some(t) if !t.is_empty() => vec![vec![t.to_string()]],
        _ => Vec::new(),
    }
}

fn inside(region: &Region, item: &RecognizedItem) -> bool {
    let (cx, cy) = item.bounds.center();
    cx >= region.x
        && cy >= region.y
        && cx < region.x + region.width as i32
        && cy < region.y + region.height as i32
}

impl TextMatchHandler {
    async fn source_result(
        &self,
        call: &CardCall<'_>,
    ) -> Option<(CardId, RecognitionResult)> {
        match call.card.param_i64("source") {
            Some(id) => {
                let source = CardId(id);
                call.context.recognition(source).await.map(|r| (source, r))
            }
            None => call.context.latest_recognition().await,
        }
    }

    /// Labels still to click in the current group, starting or restarting
    /// group progress as needed. `None` once every group is done.
    async fn pending(&self, call: &CardCall<'_>) -> Result<Option<Vec<String>>> {
        let me = call.card_id();
        let restart = match call.context.group_progress(me).await {
            Some(progress) => progress.is_finished(),
            None => true,
        };
        if restart {
            let groups = wanted_groups(call);
            if groups.is_empty() {
                return Err(call.error("Missing 'groups', 'texts' or 'text' parameter"));
            }
            call.context.start_groups(me, groups).await;
        }

        loop {
            let Some(progress) = call.context.group_progress(me).await else {
                return Ok(None);
            };
            if progress.is_finished() {
                return Ok(None);
            }
            let succeeded = call.context.succeeded_items(me).await;
            let wanted: Vec<String> = progress
                .remaining()
                .into_iter()
                .filter(|w| !succeeded.contains(w))
                .collect();
            if !wanted.is_empty() {
                return Ok(Some(wanted));
            }
            if !call.context.advance_group(me).await {
                return Ok(None);
            }
        }
    }

    async fn complete(&self, call: &CardCall<'_>) -> HandlerOutcome {
        let me = call.card_id();
        call.context.reset_card(me).await;
        call.context.clear_succeeded(me).await;
        call.detail(format!("Card {me}: all text groups matched"));
        match call.card.param_i64("complete_target") {
            Some(target) => HandlerOutcome::jump_to(CardId(target)),
            None => HandlerOutcome::success(),
        }
    }
}

#[async_trait]
impl CardHandler for TextMatchHandler {
    fn task_type(&self) -> &str {
        "text_match"
    }

    async fn execute(&self, call: &mut CardCall<'_>) -> Result<HandlerOutcome> {
        let me = call.card_id();
        let Some(wanted) = self.pending(call).await? else {
            return Ok(self.complete(call).await);
        };

        let Some((source, result)) = self.source_result(call).await else {
            call.detail(format!("Card {me}: no recognition result to match against"));
            return Ok(HandlerOutcome::failure());
        };

        let region = call.card.param_region("region").or(call.region);
        let items: Vec<RecognizedItem> = match region {
            Some(region) => result
                .items
                .into_iter()
                .filter(|item| inside(&region, item))
                .collect(),
            None => result.items,
        };

        let needles: Vec<(String, String)> = wanted
            .iter()
            .map(|w| (w.clone(), w.to_lowercase()))
            .collect();
        let found = self
            .pool
            .first_match(items, call.cancel, move |item: &RecognizedItem| {
                let haystack = item.text.to_lowercase();
                needles
                    .iter()
                    .find(|(_, needle)| haystack.contains(needle.as_str()))
                    .map(|(label, _)| (label.clone(), item.bounds))
            })
            .await;

        // Matched or not, the producer's output is spent.
        call.context.clear_recognition(source).await;

        let Some(found) = found else {
            tracing::debug!(card = %me, source = %source, ?wanted, "No wanted text recognized");
            return Ok(HandlerOutcome::failure());
        };
        let (label, bounds) = found.value;

        let (x, y) = bounds.center();
        call.input.click(x, y, call.endpoint).await?;
        call.context.mark_succeeded(me, &label).await;
        call.context.mark_consumed(me, &label).await;
        call.detail(format!("Card {me}: clicked '{label}' at ({x}, {y})"));

        if self.pending(call).await?.is_none() {
            return Ok(self.complete(call).await);
        }
        if call.card.param_bool("repeat_until_all").unwrap_or(false) {
            return Ok(HandlerOutcome::success().with_action(Action::RetrySame));
        }
        Ok(HandlerOutcome::success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventEmitter;
    use crate::graph::Card;
    use crate::input::{InputAction, RecordingInput};
    use cardflow_types::{RunCounters, RunId, SharedContext};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn item(text: &str, x: i32, y: i32) -> RecognizedItem {
        RecognizedItem {
            text: text.into(),
            bounds: Region { x, y, width: 20, height: 10 },
            confidence: 0.9,
        }
    }

    struct Harness {
        counters: RunCounters,
        context: SharedContext,
        cancel: CancellationToken,
        input: RecordingInput,
        events: EventEmitter,
        handler: TextMatchHandler,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                counters: RunCounters::new(),
                context: SharedContext::new(RunId::new()),
                cancel: CancellationToken::new(),
                input: RecordingInput::new(),
                events: EventEmitter::new(32),
                handler: TextMatchHandler::new(Arc::new(MatchPool::new(2))),
            }
        }

        async fn produce(&self, producer: i64, items: Vec<RecognizedItem>) {
            self.context
                .record_recognition(CardId(producer), RecognitionResult::from_items(items))
                .await;
        }

        async fn run(&mut self, card: &Card, region: Option<Region>) -> Result<HandlerOutcome> {
            let mut call = CardCall::new(
                self.context.run_id(),
                card,
                &mut self.counters,
                &self.context,
                &self.cancel,
                &self.input,
                &self.events,
            )
            .with_region(region);
            self.handler.execute(&mut call).await
        }
    }

    #[tokio::test]
    async fn clicks_matching_text_from_latest_producer() {
        let mut h = Harness::new();
        h.produce(1, vec![item("Options", 0, 0), item("START GAME", 100, 40)]).await;
        let card = Card::new(2, "text_match").with_param("text", json!("start"));

        let outcome = h.run(&card, None).await.unwrap();

        assert!(outcome.success);
        assert_eq!(h.input.actions(), vec![InputAction::Click { x: 110, y: 45 }]);
        // Spent recognition is cleared and the single group is finished.
        assert!(h.context.recognition(CardId(1)).await.is_none());
        assert!(h.context.scratch(CardId(2)).await.is_none());
    }

    #[tokio::test]
    async fn no_match_clears_source_and_fails() {
        let mut h = Harness::new();
        h.produce(1, vec![item("Loading...", 0, 0)]).await;
        let card = Card::new(2, "text_match").with_param("texts", json!(["Continue"]));

        let outcome = h.run(&card, None).await.unwrap();

        assert!(!outcome.success);
        assert!(h.input.actions().is_empty());
        assert!(h.context.recognition(CardId(1)).await.is_none());
        // Group progress survives a failed attempt.
        assert!(h.context.group_progress(CardId(2)).await.is_some());
    }

    #[tokio::test]
    async fn missing_recognition_is_failure() {
        let mut h = Harness::new();
        let card = Card::new(2, "text_match").with_param("text", json!("OK"));
        assert!(!h.run(&card, None).await.unwrap().success);
    }

    #[tokio::test]
    async fn missing_labels_is_an_error() {
        let mut h = Harness::new();
        let card = Card::new(2, "text_match");
        assert!(h.run(&card, None).await.is_err());
    }

    #[tokio::test]
    async fn explicit_source_is_used() {
        let mut h = Harness::new();
        h.produce(1, vec![item("Accept", 0, 0)]).await;
        h.produce(5, vec![item("Decline", 50, 50)]).await;
        let card = Card::new(2, "text_match")
            .with_param("texts", json!(["accept", "decline"]))
            .with_param("source", json!(1));

        h.run(&card, None).await.unwrap();

        assert_eq!(h.input.actions(), vec![InputAction::Click { x: 10, y: 5 }]);
        assert!(h.context.recognition(CardId(5)).await.is_some());
    }

    #[tokio::test]
    async fn region_filters_items() {
        let mut h = Harness::new();
        h.produce(1, vec![item("Buy", 0, 0), item("Buy", 300, 300)]).await;
        let card = Card::new(2, "text_match").with_param("text", json!("buy"));
        let region = Region { x: 200, y: 200, width: 200, height: 200 };

        h.run(&card, Some(region)).await.unwrap();

        assert_eq!(h.input.actions(), vec![InputAction::Click { x: 310, y: 305 }]);
    }

    #[tokio::test]
    async fn card_region_overrides_run_region() {
        let mut h = Harness::new();
        h.produce(1, vec![item("Buy", 0, 0), item("Buy", 300, 300)]).await;
        let card = Card::new(2, "text_match")
            .with_param("text", json!("buy"))
            .with_param("region", json!({"x": 0, "y": 0, "width": 100, "height": 100}));
        let run_region = Region { x: 200, y: 200, width: 200, height: 200 };

        h.run(&card, Some(run_region)).await.unwrap();

        assert_eq!(h.input.actions(), vec![InputAction::Click { x: 10, y: 5 }]);
    }

    #[tokio::test]
    async fn walks_groups_then_completes_with_target() {
        let mut h = Harness::new();
        let card = Card::new(2, "text_match")
            .with_param("groups", json!([["Daily", "Weekly"], ["Claim"]]))
            .with_param("repeat_until_all", json!(true))
            .with_param("complete_target", json!(9));

        h.produce(1, vec![item("Weekly", 0, 0)]).await;
        let first = h.run(&card, None).await.unwrap();
        assert!(first.success);
        assert_eq!(first.action, Action::RetrySame);
        assert!(h.context.has_succeeded(CardId(2), "Weekly").await);

        h.produce(1, vec![item("Daily", 0, 0)]).await;
        let second = h.run(&card, None).await.unwrap();
        assert_eq!(second.action, Action::RetrySame);
        let progress = h.context.group_progress(CardId(2)).await.unwrap();
        assert_eq!(progress.index, 1);
        assert!(progress.consumed.is_empty());

        h.produce(1, vec![item("Claim reward", 0, 0)]).await;
        let third = h.run(&card, None).await.unwrap();
        assert_eq!(third, HandlerOutcome::jump_to(CardId(9)));
        assert!(h.context.group_progress(CardId(2)).await.is_none());
        assert!(h.context.succeeded_items(CardId(2)).await.is_empty());
        assert_eq!(h.input.actions().len(), 3);
    }

    #[tokio::test]
    async fn already_succeeded_labels_are_skipped() {
        let mut h = Harness::new();
        h.context.mark_succeeded(CardId(2), "Daily").await;
        h.produce(1, vec![item("Daily", 0, 0), item("Weekly", 40, 0)]).await;
        let card = Card::new(2, "text_match").with_param("texts", json!(["Daily", "Weekly"]));

        h.run(&card, None).await.unwrap();

        assert_eq!(h.input.actions(), vec![InputAction::Click { x: 50, y: 5 }]);
    }
}
