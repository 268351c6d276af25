use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Node identifier. Chance and decision nodes are `1..=n`, value nodes follow.
pub type Node = usize;

/// Zero-based state index of a chance or decision node.
pub type State = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Chance,
    Decision,
    Value,
}

/// Validated influence diagram structure.
///
/// Arcs are kept sorted; information sets are derived from them on request.
#[derive(Clone, Debug, Serialize)]
pub struct Diagram {
    kinds: Vec<NodeKind>,
    states: Vec<usize>,
    arcs: Vec<(Node, Node)>,
}

impl Diagram {
    /// Builds a diagram from node partitions, arcs and per-node state counts.
    ///
    /// `states[j - 1]` is the state count of node `j` for every `j` in `1..=n`.
    pub fn new(
        chance: &[Node],
        decision: &[Node],
        value: &[Node],
        arcs: &[(Node, Node)],
        states: &[usize],
    ) -> Result<Self> {
        let n = chance.len() + decision.len();

        let mut seen = BTreeSet::new();
        for &node in chance.iter().chain(decision).chain(value) {
            if !seen.insert(node) {
                return Err(Error::OverlappingPartition { node });
            }
        }

        let mut path_nodes = chance.iter().chain(decision).copied().collect::<Vec<_>>();
        path_nodes.sort_unstable();
        if path_nodes.iter().enumerate().any(|(i, &node)| node != i + 1) {
            return Err(Error::NonContiguousNodes {
                expected: n,
                found: path_nodes,
            });
        }

        let mut value_nodes = value.to_vec();
        value_nodes.sort_unstable();
        if value_nodes
            .iter()
            .enumerate()
            .any(|(i, &node)| node != n + i + 1)
        {
            return Err(Error::MisplacedValueNodes {
                first: n + 1,
                last: n + value.len(),
                found: value_nodes,
            });
        }

        if states.len() != n {
            return Err(Error::StateCountLength {
                expected: n,
                found: states.len(),
            });
        }
        if let Some(i) = states.iter().position(|&count| count == 0) {
            return Err(Error::NonPositiveStateCount {
                node: i + 1,
                count: 0,
            });
        }

        let mut kinds = vec![NodeKind::Value; n + value.len()];
        for &node in chance {
            kinds[node - 1] = NodeKind::Chance;
        }
        for &node in decision {
            kinds[node - 1] = NodeKind::Decision;
        }

        let last = kinds.len();
        let mut sorted_arcs = BTreeSet::new();
        for &(from, to) in arcs {
            if from == 0 || to == 0 || from > last || to > last {
                return Err(Error::ArcOutOfRange { from, to, last });
            }
            if from >= to {
                return Err(Error::MisorderedArc { from, to });
            }
            if kinds[from - 1] == NodeKind::Value {
                return Err(Error::ArcFromValueNode { from, to });
            }
            if !sorted_arcs.insert((from, to)) {
                return Err(Error::DuplicateArc { from, to });
            }
        }

        log::debug!(
            "diagram: {} chance, {} decision, {} value nodes, {} arcs",
            chance.len(),
            decision.len(),
            value.len(),
            sorted_arcs.len()
        );

        Ok(Self {
            kinds,
            states: states.to_vec(),
            arcs: sorted_arcs.into_iter().collect(),
        })
    }

    /// Returns the number of chance and decision nodes, i.e. the length of a path.
    #[inline]
    pub fn path_len(&self) -> usize {
        self.states.len()
    }

    /// Returns the total number of nodes including value nodes.
    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.kinds.len()
    }

    #[inline]
    pub fn kind(&self, node: Node) -> Option<NodeKind> {
        node.checked_sub(1).and_then(|i| self.kinds.get(i)).copied()
    }

    /// Returns the state count of a chance or decision node.
    #[inline]
    pub fn num_states(&self, node: Node) -> Option<usize> {
        node.checked_sub(1).and_then(|i| self.states.get(i)).copied()
    }

    /// State counts of every chance and decision node in node order.
    #[inline]
    pub fn state_counts(&self) -> &[usize] {
        &self.states
    }

    #[inline]
    pub fn arcs(&self) -> &[(Node, Node)] {
        &self.arcs
    }

    pub fn nodes_of(&self, kind: NodeKind) -> impl Iterator<Item = Node> + '_ {
        self.kinds
            .iter()
            .enumerate()
            .filter(move |&(_, &k)| k == kind)
            .map(|(i, _)| i + 1)
    }

    pub fn chance_nodes(&self) -> impl Iterator<Item = Node> + '_ {
        self.nodes_of(NodeKind::Chance)
    }

    pub fn decision_nodes(&self) -> impl Iterator<Item = Node> + '_ {
        self.nodes_of(NodeKind::Decision)
    }

    pub fn value_nodes(&self) -> impl Iterator<Item = Node> + '_ {
        self.nodes_of(NodeKind::Value)
    }

    /// Returns the nodes with an arc into `node`, in ascending order.
    pub fn information_set(&self, node: Node) -> Vec<Node> {
        self.arcs
            .iter()
            .filter(|&&(_, to)| to == node)
            .map(|&(from, _)| from)
            .collect()
    }

    /// Returns the state counts of the information set of `node`, in information set order.
    pub fn context_shape(&self, node: Node) -> Vec<usize> {
        self.information_set(node)
            .into_iter()
            .map(|i| self.states[i - 1])
            .collect()
    }

    /// Checks that `node` is a chance or decision node and `state` is one of its states.
    pub fn check_state(&self, node: Node, state: State) -> Result<()> {
        if self.kind(node) == Some(NodeKind::Value) {
            return Err(Error::UnfixableNode {
                node,
                kind: NodeKind::Value,
            });
        }
        match self.num_states(node) {
            None => Err(Error::UnknownNode { node }),
            Some(count) if state >= count => Err(Error::StateOutOfRange { node, state, count }),
            Some(_) => Ok(()),
        }
    }
}
