use crate::diagram::{Node, NodeKind, State};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of every [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed graph: bad partition, misordered arcs, non-positive state counts.
    Structural,
    /// Tensor or tuple dimensions that do not match the diagram.
    Shape,
    /// Negative entries or conditional distributions that do not sum to one.
    Probability,
    /// Arguments outside the domain of the called operation.
    Domain,
    /// Solver output that contradicts the formulation.
    Consistency,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    #[error("node {node} is listed in more than one node partition")]
    OverlappingPartition { node: Node },

    #[error("chance and decision nodes must be exactly 1..={expected}, found {found:?}")]
    NonContiguousNodes { expected: usize, found: Vec<Node> },

    #[error("value nodes must be exactly {first}..={last}, found {found:?}")]
    MisplacedValueNodes {
        first: Node,
        last: Node,
        found: Vec<Node>,
    },

    #[error("expected {expected} state counts (one per chance and decision node), found {found}")]
    StateCountLength { expected: usize, found: usize },

    #[error("node {node} has non-positive state count {count}")]
    NonPositiveStateCount { node: Node, count: usize },

    #[error("arc ({from}, {to}) references a node outside 1..={last}")]
    ArcOutOfRange { from: Node, to: Node, last: Node },

    #[error("arc ({from}, {to}) must go from a lower to a higher node index")]
    MisorderedArc { from: Node, to: Node },

    #[error("arc ({from}, {to}) leaves value node {from}; value nodes must be sinks")]
    ArcFromValueNode { from: Node, to: Node },

    #[error("arc ({from}, {to}) is listed more than once")]
    DuplicateArc { from: Node, to: Node },

    #[error("tensor data has {found} entries but shape {shape:?} requires {expected}")]
    TensorLength {
        shape: Vec<usize>,
        expected: usize,
        found: usize,
    },

    #[error("no tensor supplied for {kind:?} node {node}")]
    MissingTensor { node: Node, kind: NodeKind },

    #[error("tensor supplied for node {node}, which is not a {expected:?} node")]
    UnexpectedTensor { node: Node, expected: NodeKind },

    #[error("tensor for node {node} has shape {found:?}, expected {expected:?}")]
    TensorShape {
        node: Node,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("tuple {tuple:?} has {found} states but covers {expected} nodes")]
    TupleLength {
        tuple: Vec<State>,
        expected: usize,
        found: usize,
    },

    #[error("probability of node {node} at {index:?} is {value}; probabilities must be finite and non-negative")]
    InvalidProbability {
        node: Node,
        index: Vec<usize>,
        value: f64,
    },

    #[error("probabilities of node {node} in context {context:?} sum to {sum}, not 1")]
    ImproperDistribution {
        node: Node,
        context: Vec<State>,
        sum: f64,
    },

    #[error("consequence of node {node} at {index:?} is {value}; consequences must be finite")]
    NonFiniteConsequence {
        node: Node,
        index: Vec<usize>,
        value: f64,
    },

    #[error("path utility {value} of path {path:?} is not finite")]
    NonFiniteUtility { path: Vec<State>, value: f64 },

    #[error("probability scale factor must be positive and finite, got {value}")]
    NonPositiveScaleFactor { value: f64 },

    #[error("risk level alpha must lie in {range}, got {value}")]
    AlphaOutOfRange { value: f64, range: &'static str },

    #[error("objective weight must lie in [0, 1], got {value}")]
    WeightOutOfRange { value: f64 },

    #[error("node {node} does not exist")]
    UnknownNode { node: Node },

    #[error("node {node} is a {kind:?} node and cannot be fixed to a state")]
    UnfixableNode { node: Node, kind: NodeKind },

    #[error("state {state} of node {node} is out of range; node has {count} states")]
    StateOutOfRange {
        node: Node,
        state: State,
        count: usize,
    },

    #[error("cannot condition on state {state} of node {node}: it has zero probability")]
    ZeroProbabilityCondition { node: Node, state: State },

    #[error("decision node {node} is fixed to state {state}, which the strategy never chooses in the fixed context")]
    ContradictoryFix { node: Node, state: State },

    #[error("path space of {nodes} nodes is too large to enumerate")]
    PathSpaceOverflow { nodes: usize },

    #[error("no feasible path remains after applying forbidden paths and fixed states")]
    NoFeasiblePaths,

    #[error("active paths cut is only valid without forbidden paths and fixed states")]
    ActivePathsCutUnavailable,

    #[error("node {node} is not a decision node")]
    NotADecisionNode { node: Node },

    #[error("decision node {node} has no rule")]
    MissingRule { node: Node },

    #[error("decision node {node} has {found} rules")]
    DuplicateRule { node: Node, found: usize },

    #[error("rule for decision node {node} has {found} choices, expected one per context ({expected})")]
    RuleLength {
        node: Node,
        expected: usize,
        found: usize,
    },

    #[error("solution has no value for variable {variable}")]
    MissingValue { variable: String },

    #[error("decision node {node} in context {context:?} has {active} active indicators, expected exactly 1")]
    AmbiguousDecision {
        node: Node,
        context: Vec<State>,
        active: usize,
    },

    #[error("indicator of decision node {node} in context {context:?}, state {state} has fractional value {value}")]
    FractionalIndicator {
        node: Node,
        context: Vec<State>,
        state: State,
        value: f64,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            OverlappingPartition { .. }
            | NonContiguousNodes { .. }
            | MisplacedValueNodes { .. }
            | StateCountLength { .. }
            | NonPositiveStateCount { .. }
            | ArcOutOfRange { .. }
            | MisorderedArc { .. }
            | ArcFromValueNode { .. }
            | DuplicateArc { .. } => ErrorKind::Structural,

            TensorLength { .. }
            | MissingTensor { .. }
            | UnexpectedTensor { .. }
            | TensorShape { .. }
            | TupleLength { .. }
            | NotADecisionNode { .. }
            | MissingRule { .. }
            | DuplicateRule { .. }
            | RuleLength { .. } => ErrorKind::Shape,

            InvalidProbability { .. } | ImproperDistribution { .. } => ErrorKind::Probability,

            NonFiniteConsequence { .. }
            | NonFiniteUtility { .. }
            | NonPositiveScaleFactor { .. }
            | AlphaOutOfRange { .. }
            | WeightOutOfRange { .. }
            | UnknownNode { .. }
            | UnfixableNode { .. }
            | StateOutOfRange { .. }
            | ZeroProbabilityCondition { .. }
            | ContradictoryFix { .. }
            | PathSpaceOverflow { .. }
            | NoFeasiblePaths
            | ActivePathsCutUnavailable => ErrorKind::Domain,

            MissingValue { .. } | AmbiguousDecision { .. } | FractionalIndicator { .. } => {
                ErrorKind::Consistency
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_values() {
        let err = Error::MisorderedArc { from: 3, to: 2 };
        assert_eq!(err.kind(), ErrorKind::Structural);
        assert!(err.to_string().contains("(3, 2)"));

        let err = Error::NonPositiveScaleFactor { value: -0.5 };
        assert_eq!(err.kind(), ErrorKind::Domain);
        assert!(err.to_string().contains("-0.5"));

        let err = Error::WeightOutOfRange { value: 1.5 };
        assert_eq!(err.kind(), ErrorKind::Domain);
        assert!(err.to_string().contains("1.5"));
    }
}
