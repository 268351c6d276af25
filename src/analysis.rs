use crate::diagram::{Diagram, Node, NodeKind, State};
use crate::error::{Error, Result};
use crate::paths::{path_probability, CompatiblePaths, ForbiddenPaths};
use crate::strategy::DecisionStrategy;
use crate::tensor::{PathUtility, Probabilities};
use ordered_float::NotNan;
use serde::Serialize;
use std::collections::BTreeMap;

/// Slack allowed when a cumulative probability is compared against a risk level.
const CUMULATIVE_TOLERANCE: f64 = 1e-12;

/// Probability of every state of every chance and decision node under a decision strategy,
/// conditional on the fixed states.
#[derive(Clone, Debug, Serialize)]
pub struct StateProbabilities {
    probabilities: Vec<Vec<f64>>,
    fixed: BTreeMap<Node, State>,
    mass: f64,
}

/// Sums the probability of every compatible path into its states, one vector per node.
fn state_sums(
    diagram: &Diagram,
    probabilities: &Probabilities,
    forbidden: &ForbiddenPaths,
    paths: &CompatiblePaths,
) -> Vec<Vec<f64>> {
    let counts = diagram.state_counts();
    let mut offsets = Vec::with_capacity(counts.len());
    let mut total = 0;
    for &count in counts {
        offsets.push(total);
        total += count;
    }

    let partials = paths.par_fold(
        || vec![0.0; total],
        |mut acc, path| {
            let p = path_probability(probabilities, forbidden, None, path);
            if p > 0.0 {
                for (offset, &state) in offsets.iter().zip(path) {
                    acc[offset + state] += p;
                }
            }
            acc
        },
    );

    let mut sums = vec![0.0; total];
    for partial in partials {
        for (sum, p) in sums.iter_mut().zip(partial) {
            *sum += p;
        }
    }

    offsets
        .iter()
        .zip(counts)
        .map(|(&offset, &count)| sums[offset..offset + count].to_vec())
        .collect()
}

impl StateProbabilities {
    /// Unconditional state probabilities; the empty condition has probability 1. Forbidden
    /// paths carry no probability.
    pub fn new(
        diagram: &Diagram,
        probabilities: &Probabilities,
        forbidden: &ForbiddenPaths,
        strategy: &DecisionStrategy,
    ) -> Result<Self> {
        let paths = CompatiblePaths::new(diagram, strategy, &BTreeMap::new())?;
        Ok(Self {
            probabilities: state_sums(diagram, probabilities, forbidden, &paths),
            fixed: BTreeMap::new(),
            mass: 1.0,
        })
    }

    /// Adds `node => state` to the fixed states and recomputes every state probability.
    ///
    /// The new normaliser is the previous one times the prior probability of `state`, so
    /// conditioning one state at a time never revisits the unconditioned path space.
    pub fn condition(
        &self,
        diagram: &Diagram,
        probabilities: &Probabilities,
        forbidden: &ForbiddenPaths,
        strategy: &DecisionStrategy,
        node: Node,
        state: State,
    ) -> Result<Self> {
        match diagram.kind(node) {
            None => return Err(Error::UnknownNode { node }),
            Some(NodeKind::Value) => {
                return Err(Error::UnfixableNode {
                    node,
                    kind: NodeKind::Value,
                })
            }
            Some(_) => diagram.check_state(node, state)?,
        }

        let mut fixed = self.fixed.clone();
        fixed.insert(node, state);
        let paths = CompatiblePaths::new(diagram, strategy, &fixed)?;

        let prior = self.get(node, state).unwrap_or(0.0);
        if prior <= 0.0 {
            return Err(Error::ZeroProbabilityCondition { node, state });
        }
        let mass = self.mass * prior;
        log::trace!(
            "conditioning on node {} = {}: prior {}, mass {}",
            node,
            state,
            prior,
            mass
        );

        let probabilities = state_sums(diagram, probabilities, forbidden, &paths)
            .into_iter()
            .map(|sums| sums.into_iter().map(|p| p / mass).collect())
            .collect();
        Ok(Self {
            probabilities,
            fixed,
            mass,
        })
    }

    /// Probability of `state` of chance or decision node `node`.
    #[inline]
    pub fn get(&self, node: Node, state: State) -> Option<f64> {
        node.checked_sub(1)
            .and_then(|i| self.probabilities.get(i))
            .and_then(|states| states.get(state))
            .copied()
    }

    #[inline]
    pub fn fixed(&self) -> &BTreeMap<Node, State> {
        &self.fixed
    }

    /// Probability of the fixed states themselves.
    #[inline]
    pub fn mass(&self) -> f64 {
        self.mass
    }

    /// Every chance and decision node with its state probabilities, in node order.
    pub fn iter(&self) -> impl Iterator<Item = (Node, &[f64])> + '_ {
        self.probabilities
            .iter()
            .enumerate()
            .map(|(i, states)| (i + 1, states.as_slice()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Statistics {
    pub mean: f64,
    pub std: f64,
    pub skewness: Option<f64>,
    /// Excess kurtosis.
    pub kurtosis: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct RiskMeasures {
    pub alpha: f64,
    pub value_at_risk: f64,
    pub conditional_value_at_risk: f64,
}

/// Utility atoms of one chunk of paths and the number of zero-probability paths skipped.
type Atoms = (BTreeMap<NotNan<f64>, f64>, usize);

/// Discrete distribution of path utility under a decision strategy.
///
/// Utilities are distinct and ascending; paths with equal utility are merged and paths with
/// zero probability are left out. Forbidden paths have zero probability, so the unconditional
/// distribution can hold less than unit mass.
#[derive(Clone, Debug, Serialize)]
pub struct UtilityDistribution {
    utilities: Vec<f64>,
    probabilities: Vec<f64>,
}

impl UtilityDistribution {
    pub fn new(
        diagram: &Diagram,
        probabilities: &Probabilities,
        forbidden: &ForbiddenPaths,
        strategy: &DecisionStrategy,
        utility: &impl PathUtility,
    ) -> Result<Self> {
        Self::conditional(
            diagram,
            probabilities,
            forbidden,
            strategy,
            utility,
            &BTreeMap::new(),
        )
    }

    /// Distribution over the paths agreeing with `fixed`, normalised by their total
    /// probability.
    pub fn conditional(
        diagram: &Diagram,
        probabilities: &Probabilities,
        forbidden: &ForbiddenPaths,
        strategy: &DecisionStrategy,
        utility: &impl PathUtility,
        fixed: &BTreeMap<Node, State>,
    ) -> Result<Self> {
        let paths = CompatiblePaths::new(diagram, strategy, fixed)?;

        let partials = paths.par_fold(
            || -> Result<Atoms> { Ok((BTreeMap::new(), 0)) },
            |acc, path| {
                let (mut atoms, mut dropped) = acc?;
                let p = path_probability(probabilities, forbidden, None, path);
                if p > 0.0 {
                    let value = utility.utility(path);
                    let u = NotNan::new(value).map_err(|_| Error::NonFiniteUtility {
                        path: path.to_vec(),
                        value,
                    })?;
                    *atoms.entry(u).or_insert(0.0) += p;
                } else {
                    dropped += 1;
                }
                Ok((atoms, dropped))
            },
        );

        let mut atoms = BTreeMap::new();
        let mut dropped = 0;
        for partial in partials {
            let (chunk, chunk_dropped) = partial?;
            for (u, p) in chunk {
                *atoms.entry(u).or_insert(0.0) += p;
            }
            dropped += chunk_dropped;
        }
        if dropped > 0 {
            log::debug!("{} zero-probability paths left out of the distribution", dropped);
        }

        let mut probabilities = atoms.values().copied().collect::<Vec<_>>();
        if !fixed.is_empty() {
            let mass: f64 = probabilities.iter().sum();
            if mass <= 0.0 {
                let (&node, &state) = fixed.iter().next().unwrap_or((&0, &0));
                return Err(Error::ZeroProbabilityCondition { node, state });
            }
            for p in &mut probabilities {
                *p /= mass;
            }
        }

        Ok(Self {
            utilities: atoms.keys().map(|u| u.into_inner()).collect(),
            probabilities,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.utilities.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.utilities.is_empty()
    }

    /// `(utility, probability)` pairs in ascending utility order.
    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.utilities
            .iter()
            .copied()
            .zip(self.probabilities.iter().copied())
    }

    pub fn mean(&self) -> f64 {
        self.iter().map(|(u, p)| u * p).sum()
    }

    /// Population standard deviation.
    pub fn std(&self) -> f64 {
        self.central_moment(self.mean(), 2).sqrt()
    }

    pub fn skewness(&self) -> Option<f64> {
        self.standardized_moment(3)
    }

    /// Excess kurtosis; 0 for a normal distribution.
    pub fn kurtosis(&self) -> Option<f64> {
        self.standardized_moment(4).map(|k| k - 3.0)
    }

    pub fn statistics(&self) -> Statistics {
        Statistics {
            mean: self.mean(),
            std: self.std(),
            skewness: self.skewness(),
            kurtosis: self.kurtosis(),
        }
    }

    fn central_moment(&self, mean: f64, order: i32) -> f64 {
        self.iter().map(|(u, p)| (u - mean).powi(order) * p).sum()
    }

    fn standardized_moment(&self, order: i32) -> Option<f64> {
        let mean = self.mean();
        let std = self.central_moment(mean, 2).sqrt();
        if std > 0.0 {
            Some(self.central_moment(mean, order) / std.powi(order))
        } else {
            None
        }
    }

    /// Smallest utility whose cumulative probability reaches `alpha ∈ [0, 1]`.
    pub fn value_at_risk(&self, alpha: f64) -> Result<f64> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(Error::AlphaOutOfRange {
                value: alpha,
                range: "[0, 1]",
            });
        }
        let mut cumulative = 0.0;
        for (u, p) in self.iter() {
            cumulative += p;
            if cumulative + CUMULATIVE_TOLERANCE >= alpha {
                return Ok(u);
            }
        }
        Ok(self.utilities.last().copied().unwrap_or(f64::NAN))
    }

    /// Mean of the lowest `alpha ∈ (0, 1]` probability mass of utilities.
    ///
    /// The atom at the value-at-risk contributes only the part of its probability needed to
    /// reach `alpha`, which is the quantity the CVaR objective maximizes.
    pub fn conditional_value_at_risk(&self, alpha: f64) -> Result<f64> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(Error::AlphaOutOfRange {
                value: alpha,
                range: "(0, 1]",
            });
        }
        let var = self.value_at_risk(alpha)?;
        let (tail, tail_utility) = self
            .iter()
            .take_while(|&(u, _)| u <= var)
            .fold((0.0, 0.0), |(mass, sum), (u, p)| (mass + p, sum + u * p));
        Ok((tail_utility - (tail - alpha) * var) / alpha)
    }

    pub fn risk_measures(&self, alpha: f64) -> Result<RiskMeasures> {
        Ok(RiskMeasures {
            alpha,
            value_at_risk: self.value_at_risk(alpha)?,
            conditional_value_at_risk: self.conditional_value_at_risk(alpha)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::paths::ForbiddenPath;
    use crate::strategy::DecisionRule;
    use crate::tensor::{Consequences, Tensor};

    const EPS: f64 = 1e-12;

    struct Fixture {
        diagram: Diagram,
        probabilities: Probabilities,
        consequences: Consequences,
        forbidden: ForbiddenPaths,
        strategy: DecisionStrategy,
    }

    // chance 1 -> decision 2 -> chance 3 -> value 4; the decision copies node 1
    fn fixture() -> Fixture {
        let diagram =
            Diagram::new(&[1, 3], &[2], &[4], &[(1, 2), (2, 3), (3, 4)], &[2, 2, 2]).unwrap();
        let mut p = BTreeMap::new();
        p.insert(1, Tensor::vector(vec![0.3, 0.7]));
        p.insert(3, Tensor::new(vec![2, 2], vec![0.5, 0.5, 0.9, 0.1]).unwrap());
        let probabilities = Probabilities::new(&diagram, p).unwrap();
        let mut c = BTreeMap::new();
        c.insert(4, Tensor::vector(vec![10.0, 0.0]));
        let consequences = Consequences::new(&diagram, c).unwrap();
        let rule = DecisionRule::new(&diagram, 2, vec![0, 1]).unwrap();
        let strategy = DecisionStrategy::new(&diagram, vec![rule]).unwrap();
        Fixture {
            diagram,
            probabilities,
            consequences,
            forbidden: ForbiddenPaths::default(),
            strategy,
        }
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < EPS, "{} != {}", a, b);
    }

    #[test]
    fn state_probabilities_follow_the_strategy() {
        let f = fixture();
        let sp = StateProbabilities::new(&f.diagram, &f.probabilities, &f.forbidden, &f.strategy).unwrap();
        assert_close(sp.mass(), 1.0);
        assert_close(sp.get(1, 0).unwrap(), 0.3);
        assert_close(sp.get(2, 1).unwrap(), 0.7);
        assert_close(sp.get(3, 0).unwrap(), 0.78);
        assert_close(sp.get(3, 1).unwrap(), 0.22);
        assert_eq!(sp.get(4, 0), None);
        assert_eq!(sp.iter().count(), 3);
    }

    #[test]
    fn conditioning_reuses_the_previous_mass() {
        let f = fixture();
        let sp = StateProbabilities::new(&f.diagram, &f.probabilities, &f.forbidden, &f.strategy).unwrap();
        let first = sp
            .condition(&f.diagram, &f.probabilities, &f.forbidden, &f.strategy, 1, 0)
            .unwrap();
        assert_close(first.mass(), 0.3);
        assert_close(first.get(2, 0).unwrap(), 1.0);
        assert_close(first.get(3, 0).unwrap(), 0.5);

        let second = first
            .condition(&f.diagram, &f.probabilities, &f.forbidden, &f.strategy, 3, 0)
            .unwrap();
        assert_close(second.mass(), 0.15);
        assert_close(second.get(1, 0).unwrap(), 1.0);
        assert_close(second.get(3, 1).unwrap(), 0.0);
        assert_eq!(second.fixed().len(), 2);
    }

    #[test]
    fn conditioning_rejects_impossible_states() {
        let f = fixture();
        let sp = StateProbabilities::new(&f.diagram, &f.probabilities, &f.forbidden, &f.strategy).unwrap();
        let first = sp
            .condition(&f.diagram, &f.probabilities, &f.forbidden, &f.strategy, 1, 0)
            .unwrap();

        let err = first
            .condition(&f.diagram, &f.probabilities, &f.forbidden, &f.strategy, 1, 1)
            .unwrap_err();
        assert_eq!(err, Error::ZeroProbabilityCondition { node: 1, state: 1 });
        assert_eq!(err.kind(), ErrorKind::Domain);

        assert!(matches!(
            first.condition(&f.diagram, &f.probabilities, &f.forbidden, &f.strategy, 2, 1),
            Err(Error::ContradictoryFix { node: 2, state: 1 })
        ));
        assert!(matches!(
            sp.condition(&f.diagram, &f.probabilities, &f.forbidden, &f.strategy, 4, 0),
            Err(Error::UnfixableNode { node: 4, .. })
        ));
        assert!(matches!(
            sp.condition(&f.diagram, &f.probabilities, &f.forbidden, &f.strategy, 9, 0),
            Err(Error::UnknownNode { node: 9 })
        ));
    }

    #[test]
    fn utility_distribution_merges_equal_utilities() {
        let f = fixture();
        let dist =
            UtilityDistribution::new(
                &f.diagram,
                &f.probabilities,
                &f.forbidden,
                &f.strategy,
                &f.consequences,
            )
            .unwrap();
        let atoms = dist.iter().collect::<Vec<_>>();
        assert_eq!(atoms.len(), 2);
        assert_close(atoms[0].0, 0.0);
        assert_close(atoms[0].1, 0.22);
        assert_close(atoms[1].0, 10.0);
        assert_close(atoms[1].1, 0.78);

        let stats = dist.statistics();
        assert_close(stats.mean, 7.8);
        assert!((stats.std - 17.16f64.sqrt()).abs() < 1e-9);
        assert!(stats.skewness.unwrap() < 0.0);
        assert!(stats.kurtosis.is_some());
    }

    #[test]
    fn conditional_distribution_is_normalised() {
        let f = fixture();
        let mut fixed = BTreeMap::new();
        fixed.insert(2, 1);
        let dist = UtilityDistribution::conditional(
            &f.diagram,
            &f.probabilities,
            &f.forbidden,
            &f.strategy,
            &f.consequences,
            &fixed,
        )
        .unwrap();
        let atoms = dist.iter().collect::<Vec<_>>();
        assert!((atoms[0].1 - 0.1).abs() < 1e-9);
        assert!((atoms[1].1 - 0.9).abs() < 1e-9);
    }

    #[test]
    fn risk_measures_read_the_lower_tail() {
        let f = fixture();
        let dist =
            UtilityDistribution::new(
                &f.diagram,
                &f.probabilities,
                &f.forbidden,
                &f.strategy,
                &f.consequences,
            )
            .unwrap();
        assert_close(dist.value_at_risk(0.2).unwrap(), 0.0);
        assert_close(dist.value_at_risk(0.22).unwrap(), 0.0);
        assert_close(dist.value_at_risk(0.5).unwrap(), 10.0);
        assert_close(dist.conditional_value_at_risk(0.2).unwrap(), 0.0);
        assert!((dist.conditional_value_at_risk(0.5).unwrap() - 5.6).abs() < 1e-9);
        assert!((dist.conditional_value_at_risk(1.0).unwrap() - dist.mean()).abs() < 1e-9);

        assert!(matches!(
            dist.value_at_risk(1.5),
            Err(Error::AlphaOutOfRange { .. })
        ));
        assert!(matches!(
            dist.conditional_value_at_risk(0.0),
            Err(Error::AlphaOutOfRange { .. })
        ));
        let measures = dist.risk_measures(0.5).unwrap();
        assert_close(measures.value_at_risk, 10.0);
    }

    #[test]
    fn constant_utility_has_no_shape_statistics() {
        let f = fixture();
        let mut c = BTreeMap::new();
        c.insert(4, Tensor::vector(vec![2.0, 2.0]));
        let flat = Consequences::new(&f.diagram, c).unwrap();
        let dist = UtilityDistribution::new(
            &f.diagram,
            &f.probabilities,
            &f.forbidden,
            &f.strategy,
            &flat,
        )
        .unwrap();
        assert_eq!(dist.len(), 1);
        let stats = dist.statistics();
        assert_close(stats.std, 0.0);
        assert_eq!(stats.skewness, None);
        assert_eq!(stats.kurtosis, None);
    }

    #[test]
    fn forbidden_paths_carry_no_probability() {
        let mut f = fixture();
        // chance 1 in state 0 followed by chance 3 in state 0
        f.forbidden
            .push(ForbiddenPath::new(&f.diagram, vec![1, 3], vec![vec![0, 0]]).unwrap());

        let sp = StateProbabilities::new(&f.diagram, &f.probabilities, &f.forbidden, &f.strategy)
            .unwrap();
        assert_close(sp.get(1, 0).unwrap(), 0.15);
        assert_close(sp.get(3, 0).unwrap(), 0.63);

        let dist = UtilityDistribution::new(
            &f.diagram,
            &f.probabilities,
            &f.forbidden,
            &f.strategy,
            &f.consequences,
        )
        .unwrap();
        let atoms = dist.iter().collect::<Vec<_>>();
        assert_close(atoms[0].1, 0.22);
        assert_close(atoms[1].1, 0.63);
        assert_close(dist.mean(), 6.3);

        let given = sp
            .condition(&f.diagram, &f.probabilities, &f.forbidden, &f.strategy, 1, 0)
            .unwrap();
        assert_close(given.mass(), 0.15);
        assert_close(given.get(3, 1).unwrap(), 1.0);
    }
}
