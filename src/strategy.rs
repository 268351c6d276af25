use crate::config::ConfigError;
use crate::diagram::{Diagram, Node, NodeKind, State};
use crate::error::{Error, Result};
use crate::formulation::{decision_name, DecisionVariables};
use crate::model::Solution;
use crate::paths::Odometer;
use crate::tensor::flat_index;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Distance from 0 or 1 within which a decision indicator counts as integral.
pub const INDICATOR_TOLERANCE: f64 = 1e-5;

/// Deterministic local decision rule: one state of `node` for every information set context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRule {
    node: Node,
    context: Vec<Node>,
    shape: Vec<usize>,
    choices: Vec<State>,
}

impl DecisionRule {
    /// `choices[k]` is the state chosen in the `k`-th context, contexts in row-major order.
    pub fn new(diagram: &Diagram, node: Node, choices: Vec<State>) -> Result<Self> {
        if diagram.kind(node) != Some(NodeKind::Decision) {
            return Err(Error::NotADecisionNode { node });
        }
        let shape = diagram.context_shape(node);
        let expected = shape.iter().product::<usize>();
        if choices.len() != expected {
            return Err(Error::RuleLength {
                node,
                expected,
                found: choices.len(),
            });
        }
        for &state in &choices {
            diagram.check_state(node, state)?;
        }
        Ok(Self {
            node,
            context: diagram.information_set(node),
            shape,
            choices,
        })
    }

    #[inline]
    pub fn node(&self) -> Node {
        self.node
    }

    /// Information set of the decision node.
    #[inline]
    pub fn context(&self) -> &[Node] {
        &self.context
    }

    #[inline]
    pub fn choices(&self) -> &[State] {
        &self.choices
    }

    /// State chosen when the information set takes the states `context`.
    #[inline]
    pub fn choice(&self, context: &[State]) -> State {
        self.choices[flat_index(&self.shape, context.iter().copied())]
    }

    /// State chosen given the information set states read off `path`.
    #[inline]
    pub fn choice_on(&self, path: &[State]) -> State {
        let index = flat_index(&self.shape, self.context.iter().map(|&i| path[i - 1]));
        self.choices[index]
    }

    /// Every context paired with its chosen state, contexts in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (Vec<State>, State)> + '_ {
        Odometer::over(&self.shape).zip(self.choices.iter().copied())
    }
}

/// One decision rule per decision node, ordered by node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionStrategy {
    rules: Vec<DecisionRule>,
}

impl DecisionStrategy {
    /// Checks that `rules` hold exactly one rule, built against `diagram`, per decision node.
    pub fn new(diagram: &Diagram, rules: Vec<DecisionRule>) -> Result<Self> {
        let mut checked = Vec::with_capacity(rules.len());
        for rule in rules {
            checked.push(DecisionRule::new(diagram, rule.node, rule.choices)?);
        }
        checked.sort_by_key(|rule| rule.node);

        for node in diagram.decision_nodes() {
            let found = checked.iter().filter(|rule| rule.node == node).count();
            match found {
                0 => return Err(Error::MissingRule { node }),
                1 => {}
                _ => return Err(Error::DuplicateRule { node, found }),
            }
        }

        Ok(Self { rules: checked })
    }

    /// Reads the decision strategy off solved decision indicators.
    ///
    /// In every context exactly one indicator must be 1 and the rest 0, both within
    /// [`INDICATOR_TOLERANCE`]; anything else means the solver output does not belong to the
    /// formulation and is reported rather than rounded away.
    pub fn decode(decisions: &DecisionVariables, solution: &impl Solution) -> Result<Self> {
        let mut rules = Vec::new();

        for block in decisions.blocks() {
            let node = block.node();
            let mut choices = Vec::new();

            for (k, context) in Odometer::over(block.context_shape()).enumerate() {
                let mut active = Vec::new();
                for state in 0..block.num_states() {
                    let variable = block.variable(k, state);
                    let value = solution.value(variable).ok_or_else(|| Error::MissingValue {
                        variable: decision_name(node, &context, state),
                    })?;
                    if (value - 1.0).abs() <= INDICATOR_TOLERANCE {
                        active.push(state);
                    } else if value.abs() > INDICATOR_TOLERANCE {
                        return Err(Error::FractionalIndicator {
                            node,
                            context,
                            state,
                            value,
                        });
                    }
                }
                if active.len() != 1 {
                    return Err(Error::AmbiguousDecision {
                        node,
                        context,
                        active: active.len(),
                    });
                }
                choices.push(active[0]);
            }

            rules.push(DecisionRule {
                node,
                context: block.context().to_vec(),
                shape: block.context_shape().to_vec(),
                choices,
            });
        }

        log::debug!("decoded strategy for {} decision nodes", rules.len());
        Ok(Self { rules })
    }

    #[inline]
    pub fn rules(&self) -> &[DecisionRule] {
        &self.rules
    }

    pub fn rule(&self, node: Node) -> Option<&DecisionRule> {
        self.rules.iter().find(|rule| rule.node == node)
    }

    /// Returns whether every decision state of `path` is the one the strategy chooses.
    #[inline]
    pub fn is_compatible(&self, path: &[State]) -> bool {
        self.rules
            .iter()
            .all(|rule| path[rule.node - 1] == rule.choice_on(path))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::result::Result<(), ConfigError> {
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    /// Loads a strategy saved by [`DecisionStrategy::save`] and checks it against `diagram`.
    pub fn load(
        path: impl AsRef<Path>,
        diagram: &Diagram,
    ) -> std::result::Result<Self, ConfigError> {
        let reader = BufReader::new(File::open(path)?);
        let strategy: Self = bincode::deserialize_from(reader)?;
        Ok(Self::new(diagram, strategy.rules)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::{LinearModel, Variable};
    use std::collections::HashMap;

    // chance 1 (2 states) -> decision 2 (3 states)
    fn diagram() -> Diagram {
        Diagram::new(&[1], &[2], &[3], &[(1, 2), (2, 3)], &[2, 3]).unwrap()
    }

    fn solved(decisions: &DecisionVariables, picks: &[State]) -> HashMap<Variable, f64> {
        let block = decisions.block(2).unwrap();
        let mut solution = HashMap::new();
        for (k, &pick) in picks.iter().enumerate() {
            for state in 0..3 {
                let value = if state == pick { 1.0 } else { 0.0 };
                solution.insert(block.variable(k, state), value);
            }
        }
        solution
    }

    #[test]
    fn decodes_one_choice_per_context() {
        let diagram = diagram();
        let mut model = LinearModel::new();
        let decisions = DecisionVariables::new(&mut model, &diagram);
        let mut solution = solved(&decisions, &[2, 0]);
        let block = decisions.block(2).unwrap();
        solution.insert(block.variable(0, 2), 0.999_999_9);
        solution.insert(block.variable(1, 1), 1e-9);

        let strategy = DecisionStrategy::decode(&decisions, &solution).unwrap();
        let rule = strategy.rule(2).unwrap();
        assert_eq!(rule.choices(), &[2, 0]);
        assert_eq!(rule.choice(&[1]), 0);
        assert!(strategy.is_compatible(&[0, 2]));
        assert!(!strategy.is_compatible(&[1, 2]));

        let again = DecisionStrategy::decode(&decisions, &solution).unwrap();
        assert_eq!(strategy, again);
    }

    #[test]
    fn reports_inconsistent_indicators() {
        let diagram = diagram();
        let mut model = LinearModel::new();
        let decisions = DecisionVariables::new(&mut model, &diagram);
        let block = decisions.block(2).unwrap();

        let mut two_active = solved(&decisions, &[2, 0]);
        two_active.insert(block.variable(1, 1), 1.0);
        let err = DecisionStrategy::decode(&decisions, &two_active).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert!(matches!(err, Error::AmbiguousDecision { node: 2, active: 2, .. }));

        let mut none_active = solved(&decisions, &[2, 0]);
        none_active.insert(block.variable(0, 2), 0.0);
        assert!(matches!(
            DecisionStrategy::decode(&decisions, &none_active),
            Err(Error::AmbiguousDecision { active: 0, .. })
        ));

        let mut fractional = solved(&decisions, &[2, 0]);
        fractional.insert(block.variable(0, 1), 0.5);
        assert!(matches!(
            DecisionStrategy::decode(&decisions, &fractional),
            Err(Error::FractionalIndicator { state: 1, .. })
        ));

        let mut missing = solved(&decisions, &[2, 0]);
        missing.remove(&block.variable(1, 2));
        assert!(matches!(
            DecisionStrategy::decode(&decisions, &missing),
            Err(Error::MissingValue { ref variable }) if variable == "z2_1_2"
        ));
    }

    #[test]
    fn manual_rules_are_validated() {
        let diagram = diagram();
        assert!(matches!(
            DecisionRule::new(&diagram, 1, vec![0, 0]),
            Err(Error::NotADecisionNode { node: 1 })
        ));
        assert!(matches!(
            DecisionRule::new(&diagram, 2, vec![0]),
            Err(Error::RuleLength { expected: 2, found: 1, .. })
        ));
        assert!(matches!(
            DecisionRule::new(&diagram, 2, vec![0, 3]),
            Err(Error::StateOutOfRange { state: 3, .. })
        ));
        assert!(matches!(
            DecisionStrategy::new(&diagram, Vec::new()),
            Err(Error::MissingRule { node: 2 })
        ));
        let rule = DecisionRule::new(&diagram, 2, vec![0, 1]).unwrap();
        assert!(matches!(
            DecisionStrategy::new(&diagram, vec![rule.clone(), rule]),
            Err(Error::DuplicateRule { node: 2, found: 2 })
        ));
    }

    #[test]
    fn strategy_round_trips_through_a_file() {
        let diagram = diagram();
        let rule = DecisionRule::new(&diagram, 2, vec![1, 2]).unwrap();
        let strategy = DecisionStrategy::new(&diagram, vec![rule]).unwrap();
        let path = std::env::temp_dir().join(format!("strategy-{}.bin", std::process::id()));
        strategy.save(&path).unwrap();
        let loaded = DecisionStrategy::load(&path, &diagram).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(strategy, loaded);
    }
}
