//! Exhaustive strategy search over tiny diagrams, used as an oracle for the formulation.

#![allow(dead_code)]

use influence_diagram::formulation::CompatiblePath;
use influence_diagram::{
    DecisionRule, DecisionStrategy, Diagram, ForbiddenPaths, Formulation, LinearModel,
    PathUtility, Probabilities, State, UtilityDistribution, Variable,
};
use std::collections::HashMap;

pub const TOL: f64 = 1e-9;

/// Every deterministic decision strategy of `diagram`.
pub fn strategies(diagram: &Diagram) -> Vec<DecisionStrategy> {
    let mut partial: Vec<Vec<DecisionRule>> = vec![Vec::new()];
    for node in diagram.decision_nodes() {
        let contexts = diagram.context_shape(node).iter().product::<usize>();
        let states = diagram.num_states(node).unwrap();
        let mut rules = Vec::new();
        for code in 0..states.pow(contexts as u32) {
            let mut rest = code;
            let mut choices = Vec::with_capacity(contexts);
            for _ in 0..contexts {
                choices.push(rest % states);
                rest /= states;
            }
            rules.push(DecisionRule::new(diagram, node, choices).unwrap());
        }
        partial = partial
            .into_iter()
            .flat_map(|prefix| {
                rules.iter().map(move |rule| {
                    let mut next = prefix.clone();
                    next.push(rule.clone());
                    next
                })
            })
            .collect();
    }
    partial
        .into_iter()
        .map(|rules| DecisionStrategy::new(diagram, rules).unwrap())
        .collect()
}

/// Integer solution induced by `strategy`: decision indicators and compatibility variables.
pub fn assignment(formulation: &Formulation, strategy: &DecisionStrategy) -> HashMap<Variable, f64> {
    let mut solution = HashMap::new();
    for block in formulation.decisions.blocks() {
        let rule = strategy.rule(block.node()).unwrap();
        for (k, &choice) in rule.choices().iter().enumerate() {
            for state in 0..block.num_states() {
                let value = if state == choice { 1.0 } else { 0.0 };
                solution.insert(block.variable(k, state), value);
            }
        }
    }
    for p in formulation.paths.iter() {
        let value = if strategy.is_compatible(&p.path) { 1.0 } else { 0.0 };
        solution.insert(p.variable, value);
    }
    solution
}

fn path_suffix(path: &[State]) -> String {
    path.iter().map(|s| format!("_{}", s)).collect()
}

/// Adds the auxiliary CVaR variables at their optimal values for `strategy` to `solution`:
/// the threshold at the value-at-risk and the tail weights filled in path order.
pub fn cvar_assignment(
    model: &LinearModel,
    formulation: &Formulation,
    diagram: &Diagram,
    probabilities: &Probabilities,
    forbidden: &ForbiddenPaths,
    utility: &impl PathUtility,
    strategy: &DecisionStrategy,
    alpha: f64,
    scale_factor: f64,
    solution: &mut HashMap<Variable, f64>,
) {
    let by_name = model
        .variables()
        .iter()
        .enumerate()
        .map(|(i, def)| (def.name.clone(), Variable::new(i)))
        .collect::<HashMap<_, _>>();
    let prefix = format!("cvar{}", alpha);

    let eta = UtilityDistribution::new(diagram, probabilities, forbidden, strategy, utility)
        .unwrap()
        .value_at_risk(alpha)
        .unwrap();
    solution.insert(by_name[&format!("{}_eta", prefix)], eta);

    let weight = |p: &CompatiblePath| {
        solution_x(strategy, &p.path) * p.probability * scale_factor
    };
    let below = formulation
        .paths
        .iter()
        .filter(|p| utility.utility(&p.path) < eta)
        .map(|p| weight(p))
        .sum::<f64>();
    let mut remaining = alpha * scale_factor - below;

    for p in formulation.paths.iter() {
        let u = utility.utility(&p.path);
        let w = weight(p);
        let (lambda, lambda_bar, rho, rho_bar) = if u < eta {
            (1.0, 1.0, w, w)
        } else if u == eta {
            let share = remaining.min(w).max(0.0);
            remaining -= share;
            (0.0, 1.0, 0.0, share)
        } else {
            (0.0, 0.0, 0.0, 0.0)
        };
        let suffix = path_suffix(&p.path);
        for (role, value) in [
            ("lambda", lambda),
            ("lambda_bar", lambda_bar),
            ("rho", rho),
            ("rho_bar", rho_bar),
        ] {
            solution.insert(by_name[&format!("{}_{}{}", prefix, role, suffix)], value);
        }
    }
}

fn solution_x(strategy: &DecisionStrategy, path: &[State]) -> f64 {
    if strategy.is_compatible(path) {
        1.0
    } else {
        0.0
    }
}

/// Whether flipping any single compatibility variable of the integer solution induced by
/// `strategy` makes an expected-value model infeasible, i.e. `z` alone determines `x`.
pub fn pinned(model: &LinearModel, formulation: &Formulation, strategy: &DecisionStrategy) -> bool {
    let solution = assignment(formulation, strategy);
    formulation.paths.iter().all(|p| {
        let mut flipped = solution.clone();
        flipped.insert(p.variable, 1.0 - solution[&p.variable]);
        !model.is_feasible(&flipped, TOL)
    })
}

/// Best feasible strategy of an expected-value model and its objective value; the first
/// strategy wins ties. Panics if a feasible strategy leaves any compatibility variable free.
pub fn best(
    model: &LinearModel,
    formulation: &Formulation,
    diagram: &Diagram,
) -> Option<(DecisionStrategy, f64)> {
    let mut best: Option<(DecisionStrategy, f64)> = None;
    for strategy in strategies(diagram) {
        let solution = assignment(formulation, &strategy);
        if !model.is_feasible(&solution, TOL) {
            continue;
        }
        assert!(pinned(model, formulation, &strategy), "x is not determined by z");
        let value = model.objective_value(&solution).unwrap();
        if best.as_ref().map_or(true, |(_, v)| value > *v + TOL) {
            best = Some((strategy, value));
        }
    }
    best
}
