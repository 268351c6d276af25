//! Boundary to the external optimization solver.
//!
//! Formulation builders only talk to a [`Model`]; solvers hand back a [`Solution`].
//! [`LinearModel`] records everything in memory so it can be inspected, checked against a
//! candidate solution, or written out in LP format for any MILP solver.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::{self, Write};
use std::ops::{Add, AddAssign, Mul};

/// Handle of a variable created by a [`Model`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Variable(usize);

impl Variable {
    #[inline]
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    Continuous,
    Binary,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Le,
    Ge,
    Eq,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Sense {
    Maximize,
    Minimize,
}

/// Affine expression `Σ coefficient · variable + constant`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LinearExpr {
    terms: Vec<(Variable, f64)>,
    constant: f64,
}

impl LinearExpr {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn constant(value: f64) -> Self {
        Self {
            terms: Vec::new(),
            constant: value,
        }
    }

    #[inline]
    pub fn term(variable: Variable, coefficient: f64) -> Self {
        Self {
            terms: vec![(variable, coefficient)],
            constant: 0.0,
        }
    }

    #[inline]
    pub fn add_term(&mut self, variable: Variable, coefficient: f64) {
        self.terms.push((variable, coefficient));
    }

    #[inline]
    pub fn add_constant(&mut self, value: f64) {
        self.constant += value;
    }

    #[inline]
    pub fn terms(&self) -> &[(Variable, f64)] {
        &self.terms
    }

    #[inline]
    pub fn constant_term(&self) -> f64 {
        self.constant
    }

    /// Value of the expression under `solution`; `None` if a variable has no value.
    pub fn evaluate(&self, solution: &impl Solution) -> Option<f64> {
        self.terms
            .iter()
            .try_fold(self.constant, |acc, &(variable, coefficient)| {
                Some(acc + coefficient * solution.value(variable)?)
            })
    }
}

impl Add for LinearExpr {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

impl AddAssign for LinearExpr {
    fn add_assign(&mut self, rhs: Self) {
        self.terms.extend(rhs.terms);
        self.constant += rhs.constant;
    }
}

impl Mul<f64> for LinearExpr {
    type Output = Self;

    fn mul(mut self, rhs: f64) -> Self {
        for (_, coefficient) in &mut self.terms {
            *coefficient *= rhs;
        }
        self.constant *= rhs;
        self
    }
}

/// Optimization model the formulation is written into.
pub trait Model {
    /// Creates a variable with optional bounds and returns its handle.
    fn add_variable(
        &mut self,
        name: String,
        kind: VariableKind,
        lower: Option<f64>,
        upper: Option<f64>,
    ) -> Variable;

    /// Adds the constraint `expr relation rhs`.
    fn add_constraint(&mut self, expr: LinearExpr, relation: Relation, rhs: f64);

    /// Replaces the objective.
    fn set_objective(&mut self, expr: LinearExpr, sense: Sense);
}

/// Variable values returned by a solver.
pub trait Solution {
    fn value(&self, variable: Variable) -> Option<f64>;
}

impl Solution for HashMap<Variable, f64> {
    #[inline]
    fn value(&self, variable: Variable) -> Option<f64> {
        self.get(&variable).copied()
    }
}

impl Solution for BTreeMap<Variable, f64> {
    #[inline]
    fn value(&self, variable: Variable) -> Option<f64> {
        self.get(&variable).copied()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VariableDef {
    pub name: String,
    pub kind: VariableKind,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Constraint {
    pub expr: LinearExpr,
    pub relation: Relation,
    pub rhs: f64,
}

impl Constraint {
    /// Returns whether `solution` satisfies the constraint within `tolerance`.
    pub fn is_satisfied(&self, solution: &impl Solution, tolerance: f64) -> bool {
        match self.expr.evaluate(solution) {
            None => false,
            Some(lhs) => match self.relation {
                Relation::Le => lhs <= self.rhs + tolerance,
                Relation::Ge => lhs >= self.rhs - tolerance,
                Relation::Eq => (lhs - self.rhs).abs() <= tolerance,
            },
        }
    }
}

/// In-memory [`Model`] recording every variable, constraint and the objective.
#[derive(Clone, Debug, Default, Serialize)]
pub struct LinearModel {
    variables: Vec<VariableDef>,
    constraints: Vec<Constraint>,
    objective: Option<(LinearExpr, Sense)>,
}

impl Model for LinearModel {
    fn add_variable(
        &mut self,
        name: String,
        kind: VariableKind,
        lower: Option<f64>,
        upper: Option<f64>,
    ) -> Variable {
        self.variables.push(VariableDef {
            name,
            kind,
            lower,
            upper,
        });
        Variable::new(self.variables.len() - 1)
    }

    fn add_constraint(&mut self, expr: LinearExpr, relation: Relation, rhs: f64) {
        self.constraints.push(Constraint {
            expr,
            relation,
            rhs,
        });
    }

    fn set_objective(&mut self, expr: LinearExpr, sense: Sense) {
        self.objective = Some((expr, sense));
    }
}

static SOLUTION_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:\d+\s+)?([A-Za-z_][A-Za-z0-9_\[\],.]*)\s+([-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)")
        .expect("valid solution line pattern")
});

impl LinearModel {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn variables(&self) -> &[VariableDef] {
        &self.variables
    }

    #[inline]
    pub fn variable(&self, variable: Variable) -> Option<&VariableDef> {
        self.variables.get(variable.index())
    }

    #[inline]
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    #[inline]
    pub fn objective(&self) -> Option<&(LinearExpr, Sense)> {
        self.objective.as_ref()
    }

    pub fn num_binaries(&self) -> usize {
        self.variables
            .iter()
            .filter(|v| v.kind == VariableKind::Binary)
            .count()
    }

    /// Objective value under `solution`.
    pub fn objective_value(&self, solution: &impl Solution) -> Option<f64> {
        self.objective
            .as_ref()
            .and_then(|(expr, _)| expr.evaluate(solution))
    }

    /// Checks bounds, integrality and every constraint against `solution`.
    pub fn is_feasible(&self, solution: &impl Solution, tolerance: f64) -> bool {
        let bounds_ok = self.variables.iter().enumerate().all(|(i, def)| {
            let value = match solution.value(Variable::new(i)) {
                Some(value) => value,
                None => return false,
            };
            def.lower.map_or(true, |lb| value >= lb - tolerance)
                && def.upper.map_or(true, |ub| value <= ub + tolerance)
                && (def.kind == VariableKind::Continuous
                    || (value - value.round()).abs() <= tolerance)
        });
        bounds_ok
            && self
                .constraints
                .iter()
                .all(|constraint| constraint.is_satisfied(solution, tolerance))
    }

    /// Parses a solver solution with one `name value` pair per line.
    ///
    /// Lines naming unknown variables are ignored; variables absent from the text are
    /// absent from the result.
    pub fn read_solution(&self, text: &str) -> HashMap<Variable, f64> {
        let by_name = self
            .variables
            .iter()
            .enumerate()
            .map(|(i, def)| (def.name.as_str(), Variable::new(i)))
            .collect::<HashMap<_, _>>();

        let mut solution = HashMap::new();
        for line in text.lines() {
            if let Some(cs) = SOLUTION_LINE.captures(line) {
                let variable = by_name.get(&cs[1]);
                let value = cs[2].parse::<f64>();
                if let (Some(&variable), Ok(value)) = (variable, value) {
                    solution.insert(variable, value);
                }
            }
        }
        solution
    }

    /// Name of `variable`, for error messages.
    pub fn name_of(&self, variable: Variable) -> String {
        self.variable(variable)
            .map_or_else(|| format!("#{}", variable.index()), |def| def.name.clone())
    }

    /// Looks up the value of `variable`, reporting its name when missing.
    pub fn require(&self, solution: &impl Solution, variable: Variable) -> Result<f64> {
        solution.value(variable).ok_or_else(|| Error::MissingValue {
            variable: self.name_of(variable),
        })
    }

    /// Writes the model in CPLEX LP format.
    pub fn write_lp(&self, out: &mut impl Write) -> io::Result<()> {
        let sense = match self.objective {
            Some((_, Sense::Minimize)) => "Minimize",
            _ => "Maximize",
        };
        writeln!(out, "{}", sense)?;
        write!(out, " obj:")?;
        match &self.objective {
            Some((expr, _)) => self.write_expr(out, expr, true)?,
            None => write!(out, " 0")?,
        }
        writeln!(out)?;

        writeln!(out, "Subject To")?;
        for (i, constraint) in self.constraints.iter().enumerate() {
            write!(out, " c{}:", i)?;
            self.write_expr(out, &constraint.expr, false)?;
            let relation = match constraint.relation {
                Relation::Le => "<=",
                Relation::Ge => ">=",
                Relation::Eq => "=",
            };
            writeln!(
                out,
                " {} {}",
                relation,
                LpNumber(constraint.rhs - constraint.expr.constant_term())
            )?;
        }

        writeln!(out, "Bounds")?;
        for def in &self.variables {
            match (def.lower, def.upper) {
                (Some(lb), Some(ub)) => {
                    writeln!(out, " {} <= {} <= {}", LpNumber(lb), def.name, LpNumber(ub))?
                }
                (Some(lb), None) => writeln!(out, " {} >= {}", def.name, LpNumber(lb))?,
                (None, Some(ub)) => writeln!(out, " -inf <= {} <= {}", def.name, LpNumber(ub))?,
                (None, None) => writeln!(out, " {} free", def.name)?,
            }
        }

        let binaries = self
            .variables
            .iter()
            .filter(|def| def.kind == VariableKind::Binary)
            .collect::<Vec<_>>();
        if !binaries.is_empty() {
            writeln!(out, "Binaries")?;
            for def in binaries {
                writeln!(out, " {}", def.name)?;
            }
        }
        writeln!(out, "End")
    }

    fn write_expr(&self, out: &mut impl Write, expr: &LinearExpr, constant: bool) -> io::Result<()> {
        let mut merged = BTreeMap::new();
        for &(variable, coefficient) in expr.terms() {
            *merged.entry(variable).or_insert(0.0) += coefficient;
        }
        let mut empty = true;
        for (variable, coefficient) in merged {
            if coefficient == 0.0 {
                continue;
            }
            let sign = if coefficient < 0.0 { '-' } else { '+' };
            write!(
                out,
                " {} {} {}",
                sign,
                LpNumber(coefficient.abs()),
                self.name_of(variable)
            )?;
            empty = false;
        }
        if constant && expr.constant_term() != 0.0 {
            let sign = if expr.constant_term() < 0.0 { '-' } else { '+' };
            write!(out, " {} {}", sign, LpNumber(expr.constant_term().abs()))?;
            empty = false;
        }
        if empty {
            write!(out, " 0")?;
        }
        Ok(())
    }
}

/// Integral values print without a decimal point; others use the shortest round-trip form.
struct LpNumber(f64);

impl fmt::Display for LpNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == self.0.trunc() && self.0.abs() < 1e15 {
            write!(f, "{}", self.0 as i64)
        } else {
            write!(f, "{:?}", self.0)
        }
    }
}
