//! Decision Programming formulation of an influence diagram.
//!
//! Decision variables `z` pick one state per decision node and information set context.
//! Path compatibility variables `x` are bounded above by the `z` of every decision on
//! their path and below by their conjunction, so in an integer solution `x(s) = 1` exactly
//! for the paths a strategy reaches. Forbidden paths get no variable; those fixing a
//! decision state also exclude every strategy that would reach them. Objectives are linear
//! in `x`.

use crate::diagram::{Diagram, Node, State};
use crate::error::{Error, Result};
use crate::model::{LinearExpr, Model, Relation, Sense, Variable, VariableKind};
use crate::paths::{ForbiddenPaths, Odometer, PathSpace};
use crate::tensor::{flat_index, PathUtility, Probabilities};
use std::collections::{BTreeMap, BTreeSet};

/// Name of the decision indicator of `node` in `context` choosing `state`, e.g. `z3_0_1`.
pub(crate) fn decision_name(node: Node, context: &[State], state: State) -> String {
    let mut name = format!("z{}", node);
    for s in context.iter().chain(Some(&state)) {
        name.push_str(&format!("_{}", s));
    }
    name
}

/// Name of the path compatibility variable of `path`, e.g. `x_0_1_1`.
fn path_name(prefix: &str, path: &[State]) -> String {
    let mut name = prefix.to_string();
    for s in path {
        name.push_str(&format!("_{}", s));
    }
    name
}

#[inline]
pub(crate) fn check_scale_factor(scale_factor: f64) -> Result<()> {
    if scale_factor > 0.0 && scale_factor.is_finite() {
        Ok(())
    } else {
        Err(Error::NonPositiveScaleFactor {
            value: scale_factor,
        })
    }
}

fn finite_utility(utility: &impl PathUtility, path: &[State]) -> Result<f64> {
    let value = utility.utility(path);
    if value.is_finite() {
        Ok(value)
    } else {
        Err(Error::NonFiniteUtility {
            path: path.to_vec(),
            value,
        })
    }
}

/// Binary indicators of one decision node, laid out (context..., state) in row-major order.
#[derive(Clone, Debug)]
pub struct DecisionBlock {
    node: Node,
    context: Vec<Node>,
    context_shape: Vec<usize>,
    num_states: usize,
    variables: Vec<Variable>,
}

impl DecisionBlock {
    #[inline]
    pub fn node(&self) -> Node {
        self.node
    }

    #[inline]
    pub fn context(&self) -> &[Node] {
        &self.context
    }

    #[inline]
    pub fn context_shape(&self) -> &[usize] {
        &self.context_shape
    }

    #[inline]
    pub fn num_states(&self) -> usize {
        self.num_states
    }

    #[inline]
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Indicator of `state` in the `context_index`-th context (row-major).
    #[inline]
    pub fn variable(&self, context_index: usize, state: State) -> Variable {
        self.variables[context_index * self.num_states + state]
    }

    /// Indicator of the decision state `path` takes, in the context `path` induces.
    #[inline]
    pub fn variable_on(&self, path: &[State]) -> Variable {
        let k = flat_index(
            &self.context_shape,
            self.context.iter().map(|&i| path[i - 1]),
        );
        self.variable(k, path[self.node - 1])
    }
}

/// Decision indicators of every decision node.
#[derive(Clone, Debug)]
pub struct DecisionVariables {
    blocks: Vec<DecisionBlock>,
}

impl DecisionVariables {
    /// Adds one binary per (context, state) and the constraint that exactly one state is
    /// chosen in every context.
    pub fn new(model: &mut impl Model, diagram: &Diagram) -> Self {
        let mut blocks = Vec::new();

        for node in diagram.decision_nodes() {
            let context = diagram.information_set(node);
            let context_shape = diagram.context_shape(node);
            let num_states = diagram.num_states(node).unwrap_or(1);
            let mut variables = Vec::new();

            for states in Odometer::over(&context_shape) {
                let mut one_choice = LinearExpr::new();
                for state in 0..num_states {
                    let name = decision_name(node, &states, state);
                    let z = model.add_variable(name, VariableKind::Binary, Some(0.0), Some(1.0));
                    one_choice.add_term(z, 1.0);
                    variables.push(z);
                }
                model.add_constraint(one_choice, Relation::Eq, 1.0);
            }

            blocks.push(DecisionBlock {
                node,
                context,
                context_shape,
                num_states,
                variables,
            });
        }

        log::debug!(
            "decision variables: {} binaries over {} decision nodes",
            blocks.iter().map(|b| b.variables.len()).sum::<usize>(),
            blocks.len()
        );
        Self { blocks }
    }

    #[inline]
    pub fn blocks(&self) -> &[DecisionBlock] {
        &self.blocks
    }

    pub fn block(&self, node: Node) -> Option<&DecisionBlock> {
        self.blocks.iter().find(|block| block.node == node)
    }
}

/// Options controlling which paths get compatibility variables and which cuts are added.
#[derive(Clone, Debug)]
pub struct CompatibilityOptions {
    pub forbidden: ForbiddenPaths,
    /// Paths must agree with these `node => state` assignments.
    pub fixed: BTreeMap<Node, State>,
    /// Adds `Σ x(s) π(s) = 1` (or `≤ 1` with fixed states or forbidden paths).
    pub probability_cut: bool,
    /// Adds `Σ x(s) = Π |S_c|`; only valid without forbidden paths and fixed states.
    pub active_paths_cut: bool,
    /// Multiplies path probabilities in the probability cut.
    pub scale_factor: f64,
}

impl Default for CompatibilityOptions {
    fn default() -> Self {
        Self {
            forbidden: ForbiddenPaths::default(),
            fixed: BTreeMap::new(),
            probability_cut: true,
            active_paths_cut: false,
            scale_factor: 1.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CompatiblePath {
    pub path: Vec<State>,
    pub variable: Variable,
    /// Chance probability product of the path, unscaled.
    pub probability: f64,
}

/// One compatibility variable per feasible path, in lexicographic path order.
#[derive(Clone, Debug)]
pub struct PathCompatibilityVariables {
    paths: Vec<CompatiblePath>,
}

impl PathCompatibilityVariables {
    pub fn new(
        model: &mut impl Model,
        diagram: &Diagram,
        decisions: &DecisionVariables,
        probabilities: &Probabilities,
        options: &CompatibilityOptions,
    ) -> Result<Self> {
        check_scale_factor(options.scale_factor)?;
        if options.active_paths_cut
            && !(options.forbidden.is_empty() && options.fixed.is_empty())
        {
            return Err(Error::ActivePathsCutUnavailable);
        }

        let space = PathSpace::fixed(diagram, &options.fixed)?;
        let num_decisions = decisions.blocks().len();
        let mut paths = Vec::new();
        let mut excluded = BTreeSet::new();
        let mut num_forbidden = 0;

        for path in space.iter() {
            let indicators = decisions
                .blocks()
                .iter()
                .map(|block| block.variable_on(&path))
                .collect::<Vec<_>>();

            if options.forbidden.contains(&path) {
                num_forbidden += 1;
                if num_decisions > 0 && options.forbidden.excludes_strategies(&path) {
                    excluded.insert(indicators);
                }
                continue;
            }

            let x = model.add_variable(
                path_name("x", &path),
                VariableKind::Continuous,
                Some(0.0),
                Some(1.0),
            );
            let mut reached = LinearExpr::term(x, 1.0);
            for &z in &indicators {
                model.add_constraint(
                    LinearExpr::term(x, 1.0) + LinearExpr::term(z, -1.0),
                    Relation::Le,
                    0.0,
                );
                reached.add_term(z, -1.0);
            }
            // x(s) ≥ Σ z(s) - (|D| - 1)
            model.add_constraint(reached, Relation::Ge, 1.0 - num_decisions as f64);

            let probability = probabilities.path_probability(&path);
            paths.push(CompatiblePath {
                path,
                variable: x,
                probability,
            });
        }

        if paths.is_empty() {
            return Err(Error::NoFeasiblePaths);
        }

        // Σ z(s) ≤ |D| - 1 keeps every strategy off a forbidden decision combination
        for indicators in &excluded {
            let mut expr = LinearExpr::new();
            for &z in indicators {
                expr.add_term(z, 1.0);
            }
            model.add_constraint(expr, Relation::Le, num_decisions as f64 - 1.0);
        }

        if options.probability_cut {
            let mut mass = LinearExpr::new();
            for p in &paths {
                mass.add_term(p.variable, p.probability * options.scale_factor);
            }
            let relation = if options.fixed.is_empty() && options.forbidden.is_empty() {
                Relation::Eq
            } else {
                Relation::Le
            };
            model.add_constraint(mass, relation, options.scale_factor);
        }

        if options.active_paths_cut {
            let count = diagram
                .chance_nodes()
                .filter_map(|node| diagram.num_states(node))
                .product::<usize>();
            let mut active = LinearExpr::new();
            for p in &paths {
                active.add_term(p.variable, 1.0);
            }
            model.add_constraint(active, Relation::Eq, count as f64);
        }

        log::debug!(
            "path compatibility variables: {} paths, {} forbidden, {} excluded decision combinations",
            paths.len(),
            num_forbidden,
            excluded.len()
        );
        Ok(Self { paths })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CompatiblePath> {
        self.paths.iter()
    }

    /// Compatibility variable of `path`, if the path is feasible.
    pub fn get(&self, path: &[State]) -> Option<Variable> {
        self.paths
            .binary_search_by(|p| p.path.as_slice().cmp(path))
            .ok()
            .map(|i| self.paths[i].variable)
    }
}

impl<'a> IntoIterator for &'a PathCompatibilityVariables {
    type Item = &'a CompatiblePath;
    type IntoIter = std::slice::Iter<'a, CompatiblePath>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// `Σ x(s) π(s) U(s) · scale_factor` over every feasible path.
pub fn expected_value(
    paths: &PathCompatibilityVariables,
    utility: &impl PathUtility,
    scale_factor: f64,
) -> Result<LinearExpr> {
    check_scale_factor(scale_factor)?;
    let mut expr = LinearExpr::new();
    for p in paths {
        let coefficient = p.probability * scale_factor * finite_utility(utility, &p.path)?;
        if coefficient != 0.0 {
            expr.add_term(p.variable, coefficient);
        }
    }
    Ok(expr)
}

/// Conditional value-at-risk of the path utility distribution at level `alpha ∈ (0, 1]`.
///
/// Adds a threshold variable `η` and, per path, binaries `λ, λ'` marking utilities below
/// and at-or-below `η` plus continuous weights `ρ ≤ ρ'` carrying the tail probability. The
/// `ρ'` weights sum to `alpha · scale_factor` and the returned expression is their
/// utility-weighted mean. Degenerates to the constant utility when every path agrees.
pub fn conditional_value_at_risk(
    model: &mut impl Model,
    paths: &PathCompatibilityVariables,
    utility: &impl PathUtility,
    alpha: f64,
    scale_factor: f64,
) -> Result<LinearExpr> {
    if !(alpha > 0.0 && alpha <= 1.0) {
        return Err(Error::AlphaOutOfRange {
            value: alpha,
            range: "(0, 1]",
        });
    }
    check_scale_factor(scale_factor)?;

    let utilities = paths
        .iter()
        .map(|p| finite_utility(utility, &p.path))
        .collect::<Result<Vec<_>>>()?;
    let mut sorted = utilities.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let (u_min, u_max) = match (sorted.first(), sorted.last()) {
        (Some(&min), Some(&max)) => (min, max),
        _ => return Err(Error::NoFeasiblePaths),
    };
    let min_gap = sorted
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|&gap| gap > 0.0)
        .fold(f64::INFINITY, f64::min);
    if !min_gap.is_finite() {
        log::warn!("every path has utility {}; CVaR is constant", u_min);
        return Ok(LinearExpr::constant(u_min));
    }

    let big_m = u_max - u_min;
    let epsilon = min_gap / 2.0;
    let prefix = format!("cvar{}", alpha);

    let eta = model.add_variable(
        format!("{}_eta", prefix),
        VariableKind::Continuous,
        Some(u_min),
        Some(u_max),
    );

    let mut tail_mass = LinearExpr::new();
    let mut cvar = LinearExpr::new();

    for (p, &u) in paths.iter().zip(&utilities) {
        let name = |role: &str| path_name(&format!("{}_{}", prefix, role), &p.path);
        let lambda = model.add_variable(name("lambda"), VariableKind::Binary, Some(0.0), Some(1.0));
        let lambda_bar =
            model.add_variable(name("lambda_bar"), VariableKind::Binary, Some(0.0), Some(1.0));
        let rho = model.add_variable(name("rho"), VariableKind::Continuous, Some(0.0), None);
        let rho_bar = model.add_variable(name("rho_bar"), VariableKind::Continuous, Some(0.0), None);
        let weight = p.probability * scale_factor;

        // λ = 1 iff η > u
        model.add_constraint(
            LinearExpr::term(eta, 1.0) + LinearExpr::term(lambda, -big_m),
            Relation::Le,
            u,
        );
        model.add_constraint(
            LinearExpr::term(eta, 1.0) + LinearExpr::term(lambda, -(big_m + epsilon)),
            Relation::Ge,
            u - big_m,
        );
        // λ' = 1 iff η ≥ u
        model.add_constraint(
            LinearExpr::term(eta, 1.0) + LinearExpr::term(lambda_bar, -(big_m + epsilon)),
            Relation::Le,
            u - epsilon,
        );
        model.add_constraint(
            LinearExpr::term(eta, 1.0) + LinearExpr::term(lambda_bar, -big_m),
            Relation::Ge,
            u - big_m,
        );

        model.add_constraint(
            LinearExpr::term(rho, 1.0) + LinearExpr::term(lambda, -scale_factor),
            Relation::Le,
            0.0,
        );
        model.add_constraint(
            LinearExpr::term(rho_bar, 1.0) + LinearExpr::term(lambda_bar, -scale_factor),
            Relation::Le,
            0.0,
        );
        model.add_constraint(
            LinearExpr::term(rho, 1.0) + LinearExpr::term(rho_bar, -1.0),
            Relation::Le,
            0.0,
        );
        model.add_constraint(
            LinearExpr::term(rho_bar, 1.0) + LinearExpr::term(p.variable, -weight),
            Relation::Le,
            0.0,
        );
        // strictly-below-η paths carry their full probability
        model.add_constraint(
            LinearExpr::term(p.variable, weight)
                + LinearExpr::term(lambda, scale_factor)
                + LinearExpr::term(rho, -1.0),
            Relation::Le,
            scale_factor,
        );

        tail_mass.add_term(rho_bar, 1.0);
        cvar.add_term(rho_bar, u / (alpha * scale_factor));
    }

    model.add_constraint(tail_mass, Relation::Eq, alpha * scale_factor);
    log::debug!(
        "cvar at alpha {}: {} auxiliary path blocks, utilities in [{}, {}]",
        alpha,
        paths.len(),
        u_min,
        u_max
    );
    Ok(cvar)
}

/// Objective assembled by [`formulate`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Objective {
    ExpectedValue,
    ConditionalValueAtRisk { alpha: f64 },
    /// `weight · E[U] + (1 - weight) · CVaR_alpha(U)`.
    Combined { alpha: f64, weight: f64 },
}

/// Variables created by [`formulate`].
#[derive(Clone, Debug)]
pub struct Formulation {
    pub decisions: DecisionVariables,
    pub paths: PathCompatibilityVariables,
}

/// Builds the complete model: decision and compatibility variables, cuts, and a maximized
/// objective.
pub fn formulate(
    model: &mut impl Model,
    diagram: &Diagram,
    probabilities: &Probabilities,
    utility: &impl PathUtility,
    options: &CompatibilityOptions,
    objective: Objective,
) -> Result<Formulation> {
    let decisions = DecisionVariables::new(model, diagram);
    let paths = PathCompatibilityVariables::new(model, diagram, &decisions, probabilities, options)?;
    let scale = options.scale_factor;

    let expr = match objective {
        Objective::ExpectedValue => expected_value(&paths, utility, scale)?,
        Objective::ConditionalValueAtRisk { alpha } => {
            conditional_value_at_risk(model, &paths, utility, alpha, scale)?
        }
        Objective::Combined { alpha, weight } => {
            if !(0.0..=1.0).contains(&weight) {
                return Err(Error::WeightOutOfRange { value: weight });
            }
            let ev = expected_value(&paths, utility, scale)?;
            let cvar = conditional_value_at_risk(model, &paths, utility, alpha, scale)?;
            ev * weight + cvar * (1.0 - weight)
        }
    };
    model.set_objective(expr, Sense::Maximize);

    Ok(Formulation { decisions, paths })
}
