//! Connection index and next-card selection.
//!
//! After a card completes, the executor asks which outgoing connection to
//! follow: a connection typed for the outcome (`success` / `failure`) wins,
//! then a `sequential` one, else the run ends. Among connections of the same
//! type the first in input order wins.

use std::collections::HashMap;

use cardflow_types::CardId;

use crate::graph::{Connection, ConnectionType};

/// Outgoing connections per card, built once per run.
#[derive(Debug, Clone, Default)]
pub struct ConnectionIndex {
    connections: Vec<Connection>,
    /// Maps card id to a range (start, count) into `connections`.
    /// The vec is stable-sorted by `start`, so each card's outgoing
    /// connections are contiguous and keep their input order.
    adjacency: HashMap<CardId, (usize, usize)>,
}

impl ConnectionIndex {
    pub fn build(connections: &[Connection]) -> Self {
        let mut sorted = connections.to_vec();
        sorted.sort_by_key(|c| c.start);

        let mut adjacency = HashMap::new();
        let mut i = 0;
        while i < sorted.len() {
            let start = i;
            let from = sorted[i].start;
            while i < sorted.len() && sorted[i].start == from {
                i += 1;
            }
            adjacency.insert(from, (start, i - start));
        }

        Self {
            connections: sorted,
            adjacency,
        }
    }

    pub fn outgoing(&self, card: CardId) -> &[Connection] {
        match self.adjacency.get(&card) {
            Some(&(start, count)) => &self.connections[start..start + count],
            None => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Select the connection to follow after `card` finished with `success`.
/// Returns `None` when nothing applies (the run ends naturally).
pub fn select_connection(
    index: &ConnectionIndex,
    card: CardId,
    success: bool,
) -> Option<&Connection> {
    let edges = index.outgoing(card);
    let wanted = if success {
        ConnectionType::Success
    } else {
        ConnectionType::Failure
    };

    edges
        .iter()
        .find(|c| c.kind == wanted)
        .or_else(|| edges.iter().find(|c| c.kind == ConnectionType::Sequential))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionType::{Failure, Sequential, Success};

    fn index(edges: &[(i64, i64, ConnectionType)]) -> ConnectionIndex {
        let connections: Vec<_> = edges
            .iter()
            .map(|&(s, e, k)| Connection::new(s, e, k))
            .collect();
        ConnectionIndex::build(&connections)
    }

    #[test]
    fn outgoing_preserves_input_order() {
        let idx = index(&[(2, 9, Sequential), (1, 5, Success), (2, 3, Success), (1, 4, Success)]);
        let from_one: Vec<_> = idx.outgoing(CardId(1)).iter().map(|c| c.end.0).collect();
        assert_eq!(from_one, vec![5, 4]);
        let from_two: Vec<_> = idx.outgoing(CardId(2)).iter().map(|c| c.end.0).collect();
        assert_eq!(from_two, vec![9, 3]);
        assert_eq!(idx.len(), 4);
    }

    #[test]
    fn card_without_edges_has_empty_slice() {
        let idx = index(&[(1, 2, Success)]);
        assert!(idx.outgoing(CardId(2)).is_empty());
        assert!(select_connection(&idx, CardId(2), true).is_none());
    }

    #[test]
    fn matching_type_beats_sequential() {
        let idx = index(&[(1, 2, Sequential), (1, 3, Success), (1, 4, Failure)]);
        assert_eq!(select_connection(&idx, CardId(1), true).unwrap().end, CardId(3));
        assert_eq!(select_connection(&idx, CardId(1), false).unwrap().end, CardId(4));
    }

    #[test]
    fn sequential_is_fallback() {
        let idx = index(&[(1, 3, Success), (1, 2, Sequential)]);
        assert_eq!(select_connection(&idx, CardId(1), false).unwrap().end, CardId(2));
    }

    #[test]
    fn mismatched_type_without_sequential_ends() {
        let idx = index(&[(1, 3, Success)]);
        assert!(select_connection(&idx, CardId(1), false).is_none());
    }

    #[test]
    fn first_of_same_type_wins_every_time() {
        let idx = index(&[(1, 7, Success), (1, 2, Success), (1, 5, Success)]);
        for _ in 0..10 {
            assert_eq!(select_connection(&idx, CardId(1), true).unwrap().end, CardId(7));
        }
    }

    #[test]
    fn empty_index() {
        let idx = ConnectionIndex::build(&[]);
        assert!(idx.is_empty());
        assert!(idx.outgoing(CardId(1)).is_empty());
    }
}
