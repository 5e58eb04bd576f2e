//! Graph validation: lint rules and diagnostics.
//!
//! Advisory only. The executor never calls into this module; a dangling
//! reference is reported at run time when a run reaches it. Call
//! [`validate`] to collect diagnostics or [`validate_or_raise`] to fail on
//! any `Error`-severity issue.

use std::collections::{HashSet, VecDeque};

use cardflow_types::{Action, CardId, CardflowError, Result};

use crate::graph::CardGraph;
use crate::handler::HandlerRegistry;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub card: Option<CardId>,
    pub connection: Option<(CardId, CardId)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// What a rule may know beyond the graph itself.
#[derive(Clone, Copy, Default)]
pub struct LintContext<'a> {
    pub registry: Option<&'a HandlerRegistry>,
    pub start: Option<CardId>,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &CardGraph, ctx: &LintContext<'_>) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct ConnectionEndpointsRule;
impl LintRule for ConnectionEndpointsRule {
    fn name(&self) -> &str { "connection_endpoints" }
    fn apply(&self, graph: &CardGraph, _ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        for conn in graph.connections() {
            for (end, id) in [("start", conn.start), ("end", conn.end)] {
                if !graph.has_card(id) {
                    diagnostics.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!(
                            "Connection {} -> {} has missing {end} card {id}",
                            conn.start, conn.end
                        ),
                        card: None,
                        connection: Some((conn.start, conn.end)),
                    });
                }
            }
        }
        diagnostics
    }
}

struct JumpTargetRule;
impl LintRule for JumpTargetRule {
    fn name(&self) -> &str { "jump_target" }
    fn apply(&self, graph: &CardGraph, _ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        graph
            .all_cards()
            .into_iter()
            .filter(|c| c.on_failure.action == Action::Jump)
            .filter_map(|c| {
                let message = match c.on_failure.jump_target {
                    None => format!("Card {} jumps on failure but has no jump_target", c.id),
                    Some(target) if !graph.has_card(target) => {
                        format!("Card {} jumps to missing card {target}", c.id)
                    }
                    Some(_) => return None,
                };
                Some(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message,
                    card: Some(c.id),
                    connection: None,
                })
            })
            .collect()
    }
}

struct KnownTaskTypeRule;
impl LintRule for KnownTaskTypeRule {
    fn name(&self) -> &str { "known_task_type" }
    fn apply(&self, graph: &CardGraph, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        let Some(registry) = ctx.registry else {
            return vec![];
        };
        graph
            .all_cards()
            .into_iter()
            .filter(|c| !registry.has(&c.task_type))
            .map(|c| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Card {} has unregistered task type '{}'", c.id, c.task_type),
                card: Some(c.id),
                connection: None,
            })
            .collect()
    }
}

struct StartCardRule;
impl LintRule for StartCardRule {
    fn name(&self) -> &str { "start_card" }
    fn apply(&self, graph: &CardGraph, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        match ctx.start {
            Some(start) if !graph.has_card(start) => vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Start card {start} does not exist"),
                card: Some(start),
                connection: None,
            }],
            _ => vec![],
        }
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str { "reachability" }
    fn apply(&self, graph: &CardGraph, ctx: &LintContext<'_>) -> Vec<Diagnostic> {
        let start = match ctx.start {
            Some(s) if graph.has_card(s) => s,
            _ => return vec![], // StartCardRule reports a missing start
        };

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(start);
        queue.push_back(start);

        while let Some(current) = queue.pop_front() {
            let jump = graph.card(current).and_then(|c| c.on_failure.jump_target);
            let next = graph
                .connections()
                .iter()
                .filter(|conn| conn.start == current)
                .map(|conn| conn.end)
                .chain(jump);
            for id in next {
                if visited.insert(id) {
                    queue.push_back(id);
                }
            }
        }

        graph
            .all_cards()
            .into_iter()
            .filter(|c| !visited.contains(&c.id))
            .map(|c| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!("Card {} is not reachable from start card {start}", c.id),
                card: Some(c.id),
                connection: None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
///
/// Task types are only checked when a registry is given, reachability only
/// when a start card is given.
pub fn validate(
    graph: &CardGraph,
    registry: Option<&HandlerRegistry>,
    start: Option<CardId>,
) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(ConnectionEndpointsRule),
        Box::new(JumpTargetRule),
        Box::new(KnownTaskTypeRule),
        Box::new(StartCardRule),
        Box::new(ReachabilityRule),
    ];
    let ctx = LintContext { registry, start };

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(graph, &ctx));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(
    graph: &CardGraph,
    registry: Option<&HandlerRegistry>,
    start: Option<CardId>,
) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(graph, registry, start);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.clone())
        .collect();
    if !errors.is_empty() {
        return Err(CardflowError::ValidationError(errors.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Card, Connection, ConnectionType, FailurePolicy};
    use crate::handler::{HandlerRegistry, NoopHandler};

    fn graph(cards: Vec<Card>, connections: Vec<Connection>) -> CardGraph {
        CardGraph::new("lint", cards, connections).unwrap()
    }

    fn rules_hit(diags: &[Diagnostic]) -> Vec<&str> {
        diags.iter().map(|d| d.rule.as_str()).collect()
    }

    #[test]
    fn valid_graph_passes() {
        let g = graph(
            vec![Card::new(1, "noop"), Card::new(2, "noop")],
            vec![Connection::new(1, 2, ConnectionType::Sequential)],
        );
        let mut registry = HandlerRegistry::new();
        registry.register(NoopHandler).unwrap();

        let diags = validate(&g, Some(&registry), Some(CardId(1)));
        assert!(diags.is_empty(), "Expected no diagnostics, got: {diags:?}");
    }

    #[test]
    fn dangling_connection_is_an_error() {
        let g = graph(
            vec![Card::new(1, "noop")],
            vec![Connection::new(1, 9, ConnectionType::Success)],
        );
        let diags = validate(&g, None, None);
        assert_eq!(rules_hit(&diags), vec!["connection_endpoints"]);
        assert_eq!(diags[0].connection, Some((CardId(1), CardId(9))));
        assert!(diags[0].message.contains("end card 9"));
    }

    #[test]
    fn jump_policy_without_target() {
        let mut policy = FailurePolicy::jump(3);
        policy.jump_target = None;
        let g = graph(vec![Card::new(1, "noop").with_policy(policy)], vec![]);

        let diags = validate(&g, None, None);
        assert_eq!(rules_hit(&diags), vec!["jump_target"]);
        assert!(diags[0].message.contains("no jump_target"));
    }

    #[test]
    fn jump_policy_to_missing_card() {
        let g = graph(
            vec![Card::new(1, "noop").with_policy(FailurePolicy::jump(3))],
            vec![],
        );
        let diags = validate(&g, None, None);
        assert_eq!(diags[0].card, Some(CardId(1)));
        assert!(diags[0].message.contains("missing card 3"));
    }

    #[test]
    fn unknown_task_type_only_with_registry() {
        let g = graph(vec![Card::new(1, "teleport")], vec![]);
        assert!(validate(&g, None, None).is_empty());

        let registry = HandlerRegistry::new();
        let diags = validate(&g, Some(&registry), None);
        assert_eq!(rules_hit(&diags), vec!["known_task_type"]);
    }

    #[test]
    fn missing_start_card() {
        let g = graph(vec![Card::new(1, "noop")], vec![]);
        let diags = validate(&g, None, Some(CardId(7)));
        assert_eq!(rules_hit(&diags), vec!["start_card"]);
    }

    #[test]
    fn unreachable_card_is_a_warning() {
        let g = graph(
            vec![
                Card::new(1, "noop").with_policy(FailurePolicy::jump(3)),
                Card::new(2, "noop"),
                Card::new(3, "noop"),
                Card::new(4, "noop"),
            ],
            vec![Connection::new(1, 2, ConnectionType::Success)],
        );
        let diags = validate(&g, None, Some(CardId(1)));
        let unreachable: Vec<_> = diags
            .iter()
            .filter(|d| d.rule == "reachability")
            .map(|d| d.card)
            .collect();
        assert_eq!(unreachable, vec![Some(CardId(4))]);
        assert!(diags.iter().all(|d| d.severity == Severity::Warning));
    }

    #[test]
    fn validate_or_raise_fails_on_errors_only() {
        let warn_only = graph(vec![Card::new(1, "noop"), Card::new(2, "noop")], vec![]);
        let diags = validate_or_raise(&warn_only, None, Some(CardId(1))).unwrap();
        assert_eq!(diags.len(), 1);

        let broken = graph(
            vec![Card::new(1, "noop")],
            vec![Connection::new(1, 2, ConnectionType::Sequential)],
        );
        let err = validate_or_raise(&broken, None, None).unwrap_err();
        assert!(matches!(err, CardflowError::ValidationError(_)));
        assert!(err.to_string().contains("missing end card 2"));
    }
}
