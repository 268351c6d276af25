use crate::diagram::{Diagram, Node, NodeKind, State};
use crate::error::Error;
use crate::formulation::{self, CompatibilityOptions, Formulation, Objective};
use crate::model::Model;
use crate::paths::{ForbiddenPath, ForbiddenPaths};
use crate::tensor::{Consequences, Probabilities, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed diagram file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed strategy file: {0}")]
    Bincode(#[from] bincode::Error),

    #[error(transparent)]
    Diagram(#[from] Error),
}

/// Optional display names; anything unnamed prints as its index.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Labels {
    #[serde(default)]
    pub nodes: BTreeMap<Node, String>,
    #[serde(default)]
    pub states: BTreeMap<Node, Vec<String>>,
}

impl Labels {
    pub fn node(&self, node: Node) -> String {
        self.nodes
            .get(&node)
            .cloned()
            .unwrap_or_else(|| node.to_string())
    }

    pub fn state(&self, node: Node, state: State) -> String {
        self.states
            .get(&node)
            .and_then(|names| names.get(state))
            .cloned()
            .unwrap_or_else(|| state.to_string())
    }
}

/// Forbidden state combinations over a subset of nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForbiddenConfig {
    pub nodes: Vec<Node>,
    pub tuples: Vec<Vec<State>>,
}

fn default_probability_cut() -> bool {
    true
}

fn default_scale_factor() -> f64 {
    1.0
}

/// JSON description of an influence diagram and its formulation options.
///
/// Tensors are flat row-major vectors keyed by node; their shapes follow from the arcs and
/// state counts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiagramConfig {
    pub chance: Vec<Node>,
    pub decision: Vec<Node>,
    pub value: Vec<Node>,
    pub arcs: Vec<(Node, Node)>,
    pub states: Vec<usize>,
    pub probabilities: BTreeMap<Node, Vec<f64>>,
    pub consequences: BTreeMap<Node, Vec<f64>>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub forbidden: Vec<ForbiddenConfig>,
    #[serde(default)]
    pub fixed: BTreeMap<Node, State>,
    #[serde(default = "default_probability_cut")]
    pub probability_cut: bool,
    #[serde(default)]
    pub active_paths_cut: bool,
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
}

impl DiagramConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Validates everything and assembles the immutable diagram bundle.
    pub fn build(&self) -> Result<InfluenceDiagram, Error> {
        let diagram = Diagram::new(
            &self.chance,
            &self.decision,
            &self.value,
            &self.arcs,
            &self.states,
        )?;

        let probabilities = Probabilities::new(
            &diagram,
            tensors(&diagram, NodeKind::Chance, &self.probabilities)?,
        )?;
        let consequences = Consequences::new(
            &diagram,
            tensors(&diagram, NodeKind::Value, &self.consequences)?,
        )?;

        let mut forbidden = ForbiddenPaths::default();
        for policy in &self.forbidden {
            forbidden.push(ForbiddenPath::new(
                &diagram,
                policy.nodes.clone(),
                policy.tuples.clone(),
            )?);
        }
        for (&node, &state) in &self.fixed {
            diagram.check_state(node, state)?;
        }
        formulation::check_scale_factor(self.scale_factor)?;

        log::debug!(
            "built diagram: {} chance, {} decision, {} value nodes, {} arcs",
            self.chance.len(),
            self.decision.len(),
            self.value.len(),
            self.arcs.len()
        );
        Ok(InfluenceDiagram {
            diagram,
            probabilities,
            consequences,
            labels: self.labels.clone(),
            options: CompatibilityOptions {
                forbidden,
                fixed: self.fixed.clone(),
                probability_cut: self.probability_cut,
                active_paths_cut: self.active_paths_cut,
                scale_factor: self.scale_factor,
            },
        })
    }
}

/// Shapes every flat vector of `data` by the information set of its node.
fn tensors(
    diagram: &Diagram,
    kind: NodeKind,
    data: &BTreeMap<Node, Vec<f64>>,
) -> Result<BTreeMap<Node, Tensor>, Error> {
    let mut tensors = BTreeMap::new();
    for (&node, values) in data {
        if diagram.kind(node) != Some(kind) {
            return Err(Error::UnexpectedTensor {
                node,
                expected: kind,
            });
        }
        let mut shape = diagram.context_shape(node);
        if let Some(count) = diagram.num_states(node) {
            shape.push(count);
        }
        tensors.insert(node, Tensor::new(shape, values.clone())?);
    }
    Ok(tensors)
}

/// A validated diagram with its tensors, labels and formulation options.
#[derive(Clone, Debug)]
pub struct InfluenceDiagram {
    pub diagram: Diagram,
    pub probabilities: Probabilities,
    pub consequences: Consequences,
    pub labels: Labels,
    pub options: CompatibilityOptions,
}

impl InfluenceDiagram {
    /// Writes the full formulation with the additive path utility into `model`.
    pub fn formulate(
        &self,
        model: &mut impl Model,
        objective: Objective,
    ) -> Result<Formulation, Error> {
        formulation::formulate(
            model,
            &self.diagram,
            &self.probabilities,
            &self.consequences,
            &self.options,
            objective,
        )
    }
}
