use crate::diagram::{Diagram, Node, NodeKind, State};
use crate::error::{Error, Result};
use crate::strategy::DecisionStrategy;
use crate::tensor::Probabilities;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

/// Number of paths folded by one parallel task.
const CHUNK_SIZE: usize = 1 << 12;

/// Lexicographic counter over a mixed-radix index space; the last digit turns fastest.
///
/// Each yielded item is `base[k] + digit[k]` for every position `k`.
#[derive(Clone, Debug)]
pub struct Odometer {
    base: Vec<State>,
    radices: Vec<usize>,
    digits: Vec<usize>,
    remaining: usize,
}

impl Odometer {
    /// Starts at the `start`-th index and yields at most `count` items.
    pub(crate) fn new(base: Vec<State>, radices: Vec<usize>, start: usize, count: usize) -> Self {
        let mut digits = vec![0; radices.len()];
        if count > 0 {
            let mut rest = start;
            for (digit, &radix) in digits.iter_mut().zip(&radices).rev() {
                *digit = rest % radix;
                rest /= radix;
            }
        }
        Self {
            base,
            radices,
            digits,
            remaining: count,
        }
    }

    /// Every index of a dense array of `shape`, in row-major order.
    pub(crate) fn over(shape: &[usize]) -> Self {
        let count = shape.iter().product();
        Self::new(vec![0; shape.len()], shape.to_vec(), 0, count)
    }
}

impl Iterator for Odometer {
    type Item = Vec<State>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let item = self
            .base
            .iter()
            .zip(&self.digits)
            .map(|(b, d)| b + d)
            .collect();

        for (digit, &radix) in self.digits.iter_mut().zip(&self.radices).rev() {
            *digit += 1;
            if *digit < radix {
                break;
            }
            *digit = 0;
        }

        Some(item)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Odometer {}

fn checked_len(radices: &[usize]) -> Result<usize> {
    radices
        .iter()
        .try_fold(1usize, |acc, &radix| acc.checked_mul(radix))
        .ok_or(Error::PathSpaceOverflow {
            nodes: radices.len(),
        })
}

/// The set of all paths of a diagram, optionally restricted by fixed node states.
///
/// Enumeration is lazy and restartable: every call to [`PathSpace::iter`] starts over.
#[derive(Clone, Debug)]
pub struct PathSpace {
    base: Vec<State>,
    radices: Vec<usize>,
    len: usize,
}

impl PathSpace {
    pub fn new(diagram: &Diagram) -> Result<Self> {
        Self::fixed(diagram, &BTreeMap::new())
    }

    /// Paths agreeing with every `node => state` assignment of `fixed`.
    pub fn fixed(diagram: &Diagram, fixed: &BTreeMap<Node, State>) -> Result<Self> {
        let mut base = vec![0; diagram.path_len()];
        let mut radices = diagram.state_counts().to_vec();
        for (&node, &state) in fixed {
            diagram.check_state(node, state)?;
            base[node - 1] = state;
            radices[node - 1] = 1;
        }
        let len = checked_len(&radices)?;
        Ok(Self { base, radices, len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn iter(&self) -> Odometer {
        self.range(0..self.len)
    }

    /// Paths with lexicographic rank in `range`.
    #[inline]
    pub fn range(&self, range: Range<usize>) -> Odometer {
        let end = range.end.min(self.len);
        let start = range.start.min(end);
        Odometer::new(
            self.base.clone(),
            self.radices.clone(),
            start,
            end - start,
        )
    }
}

impl<'a> IntoIterator for &'a PathSpace {
    type Item = Vec<State>;
    type IntoIter = Odometer;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// A set of state combinations of `nodes` that no path may take.
#[derive(Clone, Debug, Serialize)]
pub struct ForbiddenPath {
    nodes: Vec<Node>,
    tuples: BTreeSet<Vec<State>>,
    /// Whether any of `nodes` is a decision node.
    decisions: bool,
}

impl ForbiddenPath {
    pub fn new(
        diagram: &Diagram,
        nodes: Vec<Node>,
        tuples: impl IntoIterator<Item = Vec<State>>,
    ) -> Result<Self> {
        let mut decisions = false;
        for &node in &nodes {
            match diagram.kind(node) {
                None => return Err(Error::UnknownNode { node }),
                Some(NodeKind::Value) => {
                    return Err(Error::UnfixableNode {
                        node,
                        kind: NodeKind::Value,
                    })
                }
                Some(NodeKind::Decision) => decisions = true,
                Some(NodeKind::Chance) => {}
            }
        }

        let mut set = BTreeSet::new();
        for tuple in tuples {
            if tuple.len() != nodes.len() {
                return Err(Error::TupleLength {
                    expected: nodes.len(),
                    found: tuple.len(),
                    tuple,
                });
            }
            for (&node, &state) in nodes.iter().zip(&tuple) {
                diagram.check_state(node, state)?;
            }
            set.insert(tuple);
        }

        Ok(Self {
            nodes,
            tuples: set,
            decisions,
        })
    }

    #[inline]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Whether the policy names a decision node, so that it restricts decision strategies
    /// and not only the chance outcomes.
    #[inline]
    pub fn restricts_decisions(&self) -> bool {
        self.decisions
    }

    /// Returns whether the projection of `path` onto the nodes is a forbidden tuple.
    #[inline]
    pub fn matches(&self, path: &[State]) -> bool {
        let projection = self
            .nodes
            .iter()
            .map(|&node| path[node - 1])
            .collect::<Vec<_>>();
        self.tuples.contains(&projection)
    }
}

/// Forbidden-path policy: a path is forbidden when any member matches it.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ForbiddenPaths {
    policies: Vec<ForbiddenPath>,
}

impl ForbiddenPaths {
    #[inline]
    pub fn new(policies: Vec<ForbiddenPath>) -> Self {
        Self { policies }
    }

    #[inline]
    pub fn push(&mut self, policy: ForbiddenPath) {
        self.policies.push(policy);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    #[inline]
    pub fn contains(&self, path: &[State]) -> bool {
        self.policies.iter().any(|policy| policy.matches(path))
    }

    /// Returns whether a policy over a decision node matches `path`; no feasible strategy
    /// may reach such a path.
    #[inline]
    pub fn excludes_strategies(&self, path: &[State]) -> bool {
        self.policies
            .iter()
            .any(|policy| policy.restricts_decisions() && policy.matches(path))
    }
}

/// π(path): the chance probability product, zero if the path is forbidden or disagrees
/// with `strategy`.
pub fn path_probability(
    probabilities: &Probabilities,
    forbidden: &ForbiddenPaths,
    strategy: Option<&DecisionStrategy>,
    path: &[State],
) -> f64 {
    if forbidden.contains(path) {
        return 0.0;
    }
    if let Some(strategy) = strategy {
        if !strategy.is_compatible(path) {
            return 0.0;
        }
    }
    probabilities.path_probability(path)
}

/// Paths whose decision states follow a decision strategy, optionally restricted by fixed
/// node states.
///
/// Only chance states are enumerated; decision states are filled in node order from the
/// strategy, which is possible because every information set precedes its node.
pub struct CompatiblePaths<'a> {
    strategy: &'a DecisionStrategy,
    space: PathSpace,
    fixed: BTreeMap<Node, State>,
}

impl<'a> CompatiblePaths<'a> {
    pub fn new(
        diagram: &Diagram,
        strategy: &'a DecisionStrategy,
        fixed: &BTreeMap<Node, State>,
    ) -> Result<Self> {
        let mut base = vec![0; diagram.path_len()];
        let mut radices = diagram.state_counts().to_vec();
        for node in diagram.decision_nodes() {
            radices[node - 1] = 1;
        }

        for (&node, &state) in fixed {
            match diagram.kind(node) {
                Some(NodeKind::Value) => {
                    return Err(Error::UnfixableNode {
                        node,
                        kind: NodeKind::Value,
                    })
                }
                Some(NodeKind::Decision) => {
                    diagram.check_state(node, state)?;
                    let rule = strategy.rule(node).ok_or(Error::MissingRule { node })?;
                    let chosen_somewhere = rule.iter().any(|(context, choice)| {
                        choice == state
                            && rule.context().iter().zip(&context).all(|(n, s)| {
                                fixed.get(n).map_or(true, |f| f == s)
                            })
                    });
                    if !chosen_somewhere {
                        return Err(Error::ContradictoryFix { node, state });
                    }
                }
                _ => {
                    diagram.check_state(node, state)?;
                    base[node - 1] = state;
                    radices[node - 1] = 1;
                }
            }
        }

        let len = checked_len(&radices)?;
        Ok(Self {
            strategy,
            space: PathSpace { base, radices, len },
            fixed: fixed.clone(),
        })
    }

    /// Number of chance state combinations scanned; an upper bound on the number of paths.
    #[inline]
    pub fn len(&self) -> usize {
        self.space.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.space.is_empty()
    }

    #[inline]
    pub fn fixed(&self) -> &BTreeMap<Node, State> {
        &self.fixed
    }

    pub fn iter(&self) -> impl Iterator<Item = Vec<State>> + '_ {
        self.range(0..self.len())
    }

    fn range(&self, range: Range<usize>) -> impl Iterator<Item = Vec<State>> + '_ {
        self.space.range(range).filter_map(move |mut path| {
            if self.complete(&mut path) {
                Some(path)
            } else {
                None
            }
        })
    }

    /// Writes the strategy's decisions into `path`; false if a fixed decision disagrees.
    fn complete(&self, path: &mut [State]) -> bool {
        for rule in self.strategy.rules() {
            let choice = rule.choice_on(path);
            path[rule.node() - 1] = choice;
            if let Some(&state) = self.fixed.get(&rule.node()) {
                if state != choice {
                    return false;
                }
            }
        }
        true
    }

    /// Folds every compatible path in parallel chunks; returns the chunk results in path order.
    pub fn par_fold<T, I, F>(&self, identity: I, fold: F) -> Vec<T>
    where
        T: Send,
        I: Fn() -> T + Sync + Send,
        F: Fn(T, &[State]) -> T + Sync + Send,
    {
        let len = self.len();
        let chunks = (len + CHUNK_SIZE - 1) / CHUNK_SIZE;
        (0..chunks)
            .into_par_iter()
            .map(|chunk| {
                let start = chunk * CHUNK_SIZE;
                self.range(start..start + CHUNK_SIZE)
                    .fold(identity(), |acc, path| fold(acc, &path))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::DecisionRule;

    #[test]
    fn odometer_is_lexicographic() {
        let paths = Odometer::over(&[2, 3]).collect::<Vec<_>>();
        assert_eq!(
            paths,
            vec![
                vec![0, 0],
                vec![0, 1],
                vec![0, 2],
                vec![1, 0],
                vec![1, 1],
                vec![1, 2]
            ]
        );
        assert_eq!(Odometer::over(&[]).collect::<Vec<_>>(), vec![Vec::<State>::new()]);
    }

    #[test]
    fn range_resumes_mid_space() {
        let diagram = Diagram::new(&[1, 2, 3], &[], &[], &[], &[2, 3, 2]).unwrap();
        let space = PathSpace::new(&diagram).unwrap();
        assert_eq!(space.len(), 12);
        let all = space.iter().collect::<Vec<_>>();
        let tail = space.range(5..100).collect::<Vec<_>>();
        assert_eq!(tail, all[5..].to_vec());
        assert_eq!(space.range(3..3).count(), 0);
        // restartable
        assert_eq!(space.iter().count(), 12);
    }

    #[test]
    fn fixed_states_restrict_the_space() {
        let diagram = Diagram::new(&[1, 2], &[3], &[], &[], &[2, 3, 2]).unwrap();
        let mut fixed = BTreeMap::new();
        fixed.insert(2, 1);
        let space = PathSpace::fixed(&diagram, &fixed).unwrap();
        assert_eq!(space.len(), 4);
        assert!(space.iter().all(|path| path[1] == 1));

        fixed.insert(2, 3);
        assert!(matches!(
            PathSpace::fixed(&diagram, &fixed),
            Err(Error::StateOutOfRange { node: 2, state: 3, count: 3 })
        ));
    }

    #[test]
    fn forbidden_tuples_match_projections() {
        let diagram = Diagram::new(&[1, 2, 3], &[], &[], &[], &[2, 2, 2]).unwrap();
        let policy = ForbiddenPath::new(&diagram, vec![1, 3], vec![vec![0, 1]]).unwrap();
        let forbidden = ForbiddenPaths::new(vec![policy]);
        assert!(forbidden.contains(&[0, 0, 1]));
        assert!(forbidden.contains(&[0, 1, 1]));
        assert!(!forbidden.contains(&[1, 0, 1]));
        assert_eq!(
            PathSpace::new(&diagram)
                .unwrap()
                .iter()
                .filter(|path| !forbidden.contains(path))
                .count(),
            6
        );

        assert!(matches!(
            ForbiddenPath::new(&diagram, vec![1, 3], vec![vec![0]]),
            Err(Error::TupleLength { expected: 2, found: 1, .. })
        ));
        assert!(matches!(
            ForbiddenPath::new(&diagram, vec![4], vec![vec![0]]),
            Err(Error::UnknownNode { node: 4 })
        ));
        assert!(!forbidden.excludes_strategies(&[0, 0, 1]));
    }

    #[test]
    fn path_probability_masks_forbidden_and_incompatible_paths() {
        let (diagram, strategy) = observed_decision();
        let mut p = BTreeMap::new();
        p.insert(1, crate::tensor::Tensor::vector(vec![0.2, 0.3, 0.5]));
        let probabilities = Probabilities::new(&diagram, p).unwrap();
        let policy = ForbiddenPath::new(&diagram, vec![1, 2], vec![vec![2, 1]]).unwrap();
        assert!(policy.restricts_decisions());
        let forbidden = ForbiddenPaths::new(vec![policy]);
        assert!(forbidden.excludes_strategies(&[2, 1]));

        let none = ForbiddenPaths::default();
        assert!((path_probability(&probabilities, &none, None, &[2, 1]) - 0.5).abs() < 1e-12);
        assert_eq!(path_probability(&probabilities, &forbidden, None, &[2, 1]), 0.0);
        assert!((path_probability(&probabilities, &forbidden, None, &[2, 0]) - 0.5).abs() < 1e-12);
        // the strategy picks state 1 after chance state 0
        assert!((path_probability(&probabilities, &none, Some(&strategy), &[0, 1]) - 0.2).abs() < 1e-12);
        assert_eq!(path_probability(&probabilities, &none, Some(&strategy), &[0, 0]), 0.0);
    }

    // chance 1 -> decision 2
    fn observed_decision() -> (Diagram, DecisionStrategy) {
        let diagram = Diagram::new(&[1], &[2], &[], &[(1, 2)], &[3, 2]).unwrap();
        let rule = DecisionRule::new(&diagram, 2, vec![1, 0, 1]).unwrap();
        let strategy = DecisionStrategy::new(&diagram, vec![rule]).unwrap();
        (diagram, strategy)
    }

    #[test]
    fn compatible_paths_follow_the_strategy() {
        let (diagram, strategy) = observed_decision();
        let paths = CompatiblePaths::new(&diagram, &strategy, &BTreeMap::new()).unwrap();
        assert_eq!(
            paths.iter().collect::<Vec<_>>(),
            vec![vec![0, 1], vec![1, 0], vec![2, 1]]
        );

        let mut fixed = BTreeMap::new();
        fixed.insert(2, 1);
        let paths = CompatiblePaths::new(&diagram, &strategy, &fixed).unwrap();
        assert_eq!(paths.iter().collect::<Vec<_>>(), vec![vec![0, 1], vec![2, 1]]);
    }

    #[test]
    fn contradictory_decision_fix_is_rejected() {
        let (diagram, strategy) = observed_decision();
        let mut fixed = BTreeMap::new();
        fixed.insert(1, 1);
        fixed.insert(2, 1);
        assert!(matches!(
            CompatiblePaths::new(&diagram, &strategy, &fixed),
            Err(Error::ContradictoryFix { node: 2, state: 1 })
        ));
    }

    #[test]
    fn parallel_fold_visits_every_path_once() {
        let diagram = Diagram::new(&[1, 2, 3, 4], &[5], &[], &[(4, 5)], &[4, 5, 6, 7, 2])
            .unwrap();
        let rule = DecisionRule::new(&diagram, 5, vec![0, 1, 0, 1, 0, 1, 0]).unwrap();
        let strategy = DecisionStrategy::new(&diagram, vec![rule]).unwrap();
        let paths = CompatiblePaths::new(&diagram, &strategy, &BTreeMap::new()).unwrap();
        let counts = paths.par_fold(|| 0usize, |acc, _| acc + 1);
        assert_eq!(counts.iter().sum::<usize>(), 4 * 5 * 6 * 7);
    }
}
