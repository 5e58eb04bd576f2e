use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cardflow_types::{Action, CardId, CardflowError, Region, Result};

/// Parameter key holding the card's on-failure policy label.
pub const ON_FAILURE_KEY: &str = "on_failure";
/// Parameter key holding the jump target for a `jump` policy.
pub const JUMP_TARGET_KEY: &str = "jump_target";
/// Parameter key overriding the executor's retry interval for this card.
pub const RETRY_INTERVAL_KEY: &str = "retry_interval_ms";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Success,
    Failure,
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub start: CardId,
    pub end: CardId,
    #[serde(rename = "type")]
    pub kind: ConnectionType,
}

impl Connection {
    pub fn new(start: impl Into<CardId>, end: impl Into<CardId>, kind: ConnectionType) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            kind,
        }
    }
}

/// What the executor does when a card's handler reports failure without an
/// explicit action of its own.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FailurePolicy {
    pub action: Action,
    pub jump_target: Option<CardId>,
    pub retry_interval: Option<Duration>,
}

impl FailurePolicy {
    pub fn stop() -> Self {
        Self {
            action: Action::Stop,
            ..Self::default()
        }
    }

    pub fn jump(target: impl Into<CardId>) -> Self {
        Self {
            action: Action::Jump,
            jump_target: Some(target.into()),
            retry_interval: None,
        }
    }

    pub fn retry_every(interval: Duration) -> Self {
        Self {
            action: Action::RetrySame,
            jump_target: None,
            retry_interval: Some(interval),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Card {
    pub id: CardId,
    pub task_type: String,
    pub parameters: HashMap<String, serde_json::Value>,
    pub on_failure: FailurePolicy,
}

/// Persisted shape of a card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardDef {
    pub id: CardId,
    pub task_type: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

/// Persisted shape of a whole graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDef {
    #[serde(default)]
    pub name: Option<String>,
    pub cards: Vec<CardDef>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

// --- Parameter extraction helpers ---

fn get_i64_param(params: &HashMap<String, serde_json::Value>, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| match v {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn parse_failure_policy(
    id: CardId,
    params: &HashMap<String, serde_json::Value>,
) -> Result<FailurePolicy> {
    let action = match params.get(ON_FAILURE_KEY) {
        None | Some(serde_json::Value::Null) => Action::Next,
        Some(serde_json::Value::String(label)) => Action::from_label(label).ok_or_else(|| {
            CardflowError::Configuration(format!(
                "Card {id} has unknown on_failure policy '{label}'"
            ))
        })?,
        Some(other) => {
            return Err(CardflowError::Configuration(format!(
                "Card {id} has non-string on_failure policy: {other}"
            )))
        }
    };
    let jump_target = get_i64_param(params, JUMP_TARGET_KEY).map(CardId);
    let retry_interval = get_i64_param(params, RETRY_INTERVAL_KEY)
        .filter(|ms| *ms >= 0)
        .map(|ms| Duration::from_millis(ms as u64));

    Ok(FailurePolicy {
        action,
        jump_target,
        retry_interval,
    })
}

impl Card {
    pub fn new(id: impl Into<CardId>, task_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            parameters: HashMap::new(),
            on_failure: FailurePolicy::default(),
        }
    }

    pub fn from_def(def: CardDef) -> Result<Self> {
        let on_failure = parse_failure_policy(def.id, &def.parameters)?;
        Ok(Self {
            id: def.id,
            task_type: def.task_type,
            parameters: def.parameters,
            on_failure,
        })
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.parameters.get(key)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }

    pub fn param_i64(&self, key: &str) -> Option<i64> {
        get_i64_param(&self.parameters, key)
    }

    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.parameters.get(key).and_then(|v| match v {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::String(s) => Some(s == "true"),
            _ => None,
        })
    }

    pub fn param_region(&self, key: &str) -> Option<Region> {
        self.parameters
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

// ---------------------------------------------------------------------------
// CardGraph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CardGraph {
    pub name: String,
    cards: HashMap<CardId, Card>,
    connections: Vec<Connection>,
}

impl CardGraph {
    /// Build a graph. Connection endpoints are not checked here; a dangling
    /// target surfaces when a run reaches it.
    pub fn new(
        name: impl Into<String>,
        cards: Vec<Card>,
        connections: Vec<Connection>,
    ) -> Result<Self> {
        let mut by_id = HashMap::with_capacity(cards.len());
        for card in cards {
            let id = card.id;
            if by_id.insert(id, card).is_some() {
                return Err(CardflowError::Configuration(format!(
                    "Duplicate card id {id}"
                )));
            }
        }
        Ok(Self {
            name: name.into(),
            cards: by_id,
            connections,
        })
    }

    pub fn from_def(def: GraphDef) -> Result<Self> {
        let cards = def
            .cards
            .into_iter()
            .map(Card::from_def)
            .collect::<Result<Vec<_>>>()?;
        Self::new(def.name.unwrap_or_default(), cards, def.connections)
    }

    pub fn from_json(source: &str) -> Result<Self> {
        let def: GraphDef = serde_json::from_str(source)?;
        Self::from_def(def)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        let mut graph = Self::from_json(&source)?;
        if graph.name.is_empty() {
            graph.name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        tracing::debug!(path = %path.display(), cards = graph.cards.len(), "Graph loaded");
        Ok(graph)
    }

    pub fn card(&self, id: CardId) -> Option<&Card> {
        self.cards.get(&id)
    }

    pub fn has_card(&self, id: CardId) -> bool {
        self.cards.contains_key(&id)
    }

    /// Cards in ascending id order.
    pub fn all_cards(&self) -> Vec<&Card> {
        let mut cards: Vec<_> = self.cards.values().collect();
        cards.sort_by_key(|c| c.id);
        cards
    }

    pub fn card_count(&self) -> usize {
        self.cards.len()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_builds_cards_and_connections() {
        let graph = CardGraph::from_json(
            r#"{
                "name": "farm",
                "cards": [
                    {"id": 1, "task_type": "noop"},
                    {"id": 2, "task_type": "delay", "parameters": {"ms": 50}}
                ],
                "connections": [
                    {"start": 1, "end": 2, "type": "sequential"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(graph.name, "farm");
        assert_eq!(graph.card_count(), 2);
        assert_eq!(graph.card(CardId(2)).unwrap().param_i64("ms"), Some(50));
        assert_eq!(
            graph.connections(),
            &[Connection::new(1, 2, ConnectionType::Sequential)]
        );
    }

    #[test]
    fn failure_policy_parsed_from_parameters() {
        let graph = CardGraph::from_json(
            r#"{
                "cards": [
                    {"id": 1, "task_type": "noop",
                     "parameters": {"on_failure": "Jump to card", "jump_target": 3}},
                    {"id": 2, "task_type": "noop",
                     "parameters": {"on_failure": "retry", "retry_interval_ms": "250"}},
                    {"id": 3, "task_type": "noop"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(graph.card(CardId(1)).unwrap().on_failure, FailurePolicy::jump(3));
        assert_eq!(
            graph.card(CardId(2)).unwrap().on_failure,
            FailurePolicy::retry_every(Duration::from_millis(250))
        );
        assert_eq!(graph.card(CardId(3)).unwrap().on_failure, FailurePolicy::default());
    }

    #[test]
    fn unknown_policy_label_is_configuration_error() {
        let err = CardGraph::from_json(
            r#"{"cards": [{"id": 1, "task_type": "noop", "parameters": {"on_failure": "panic"}}]}"#,
        )
        .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("panic"));
    }

    #[test]
    fn duplicate_card_ids_rejected() {
        let err = CardGraph::new(
            "dup",
            vec![Card::new(1, "noop"), Card::new(1, "delay")],
            vec![],
        )
        .unwrap_err();
        assert!(err.to_string().contains("Duplicate card id 1"));
    }

    #[test]
    fn dangling_connection_accepted_at_build_time() {
        let graph = CardGraph::new(
            "lazy",
            vec![Card::new(1, "noop")],
            vec![Connection::new(1, 42, ConnectionType::Success)],
        )
        .unwrap();
        assert!(!graph.has_card(CardId(42)));
    }

    #[test]
    fn load_names_graph_after_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daily_quests.json");
        std::fs::write(&path, r#"{"cards": [{"id": 1, "task_type": "noop"}]}"#).unwrap();

        let graph = CardGraph::load(&path).unwrap();
        assert_eq!(graph.name, "daily_quests");
    }

    #[test]
    fn typed_parameter_accessors() {
        let card = Card::new(5, "text_match")
            .with_param("text", json!("Start"))
            .with_param("fuzzy", json!("true"))
            .with_param("region", json!({"x": 1, "y": 2, "width": 30, "height": 40}));

        assert_eq!(card.param_str("text"), Some("Start"));
        assert_eq!(card.param_bool("fuzzy"), Some(true));
        assert_eq!(
            card.param_region("region"),
            Some(Region { x: 1, y: 2, width: 30, height: 40 })
        );
        assert!(card.param_region("text").is_none());
    }

    #[test]
    fn all_cards_sorted_by_id() {
        let graph = CardGraph::new(
            "g",
            vec![Card::new(3, "a"), Card::new(1, "b"), Card::new(2, "c")],
            vec![],
        )
        .unwrap();
        let ids: Vec<_> = graph.all_cards().iter().map(|c| c.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
