use crate::diagram::{Diagram, Node, NodeKind, State};
use crate::error::{Error, Result};
use crate::paths::{Odometer, PathSpace};
use serde::Serialize;
use std::collections::BTreeMap;
use std::iter::once;

/// Largest allowed deviation of a conditional distribution's sum from 1.
pub const PROBABILITY_TOLERANCE: f64 = 1e-6;

/// Row-major offset of `index` within `shape`.
#[inline]
pub(crate) fn flat_index(shape: &[usize], index: impl IntoIterator<Item = usize>) -> usize {
    shape
        .iter()
        .zip(index)
        .fold(0, |acc, (&dim, i)| acc * dim + i)
}

/// Dense row-major array with explicit shape.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let expected = shape.iter().product::<usize>();
        if data.len() != expected {
            return Err(Error::TensorLength {
                shape,
                expected,
                found: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// One-dimensional tensor, e.g. the distribution of a chance node without information set.
    #[inline]
    pub fn vector(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Zero-dimensional tensor, e.g. the consequence of a value node without information set.
    #[inline]
    pub fn scalar(value: f64) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    /// Fills a tensor of `shape` by evaluating `f` at every index in row-major order.
    pub fn from_fn(shape: Vec<usize>, mut f: impl FnMut(&[usize]) -> f64) -> Self {
        let data = Odometer::over(&shape).map(|index| f(&index)).collect();
        Self { shape, data }
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    #[inline]
    pub fn at(&self, index: impl IntoIterator<Item = usize>) -> f64 {
        self.data[flat_index(&self.shape, index)]
    }
}

#[derive(Clone, Debug, Serialize)]
struct NodeTable {
    node: Node,
    context: Vec<Node>,
    tensor: Tensor,
}

impl NodeTable {
    /// Reads the entry selected by the states of `path`; `own` appends the node's own state.
    #[inline]
    fn on_path(&self, path: &[State], own: bool) -> f64 {
        let index = self.context.iter().map(|&i| path[i - 1]);
        if own {
            self.tensor.at(index.chain(once(path[self.node - 1])))
        } else {
            self.tensor.at(index)
        }
    }
}

/// Takes the tensor of every node of `kind` out of `tensors`, checking its shape.
fn collect_tables(
    diagram: &Diagram,
    kind: NodeKind,
    mut tensors: BTreeMap<Node, Tensor>,
) -> Result<Vec<NodeTable>> {
    if let Some(&node) = tensors.keys().find(|&&node| diagram.kind(node) != Some(kind)) {
        return Err(Error::UnexpectedTensor {
            node,
            expected: kind,
        });
    }

    let mut tables = Vec::new();
    for node in diagram.nodes_of(kind) {
        let tensor = tensors
            .remove(&node)
            .ok_or(Error::MissingTensor { node, kind })?;
        let mut expected = diagram.context_shape(node);
        if let Some(count) = diagram.num_states(node) {
            expected.push(count);
        }
        if tensor.shape() != expected.as_slice() {
            return Err(Error::TensorShape {
                node,
                expected,
                found: tensor.shape().to_vec(),
            });
        }
        tables.push(NodeTable {
            node,
            context: diagram.information_set(node),
            tensor,
        });
    }
    Ok(tables)
}

/// Conditional probability tables of every chance node.
#[derive(Clone, Debug, Serialize)]
pub struct Probabilities {
    tables: Vec<NodeTable>,
}

impl Probabilities {
    /// Validates one tensor per chance node, shaped (information set states..., node states).
    ///
    /// Every slice over the node's own states must be non-negative and sum to 1 within
    /// [`PROBABILITY_TOLERANCE`].
    pub fn new(diagram: &Diagram, tensors: BTreeMap<Node, Tensor>) -> Result<Self> {
        let tables = collect_tables(diagram, NodeKind::Chance, tensors)?;

        for table in &tables {
            let shape = table.tensor.shape();
            let (num_states, context_shape) = match shape.split_last() {
                Some((&n, rest)) => (n, rest),
                None => continue,
            };
            let slices = table.tensor.data().chunks(num_states);
            for (context, slice) in Odometer::over(context_shape).zip(slices) {
                for (state, &p) in slice.iter().enumerate() {
                    if !(p.is_finite() && p >= 0.0) {
                        let mut index = context.clone();
                        index.push(state);
                        return Err(Error::InvalidProbability {
                            node: table.node,
                            index,
                            value: p,
                        });
                    }
                }
                let sum = slice.iter().sum::<f64>();
                if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
                    return Err(Error::ImproperDistribution {
                        node: table.node,
                        context,
                        sum,
                    });
                }
            }
        }

        Ok(Self { tables })
    }

    pub fn nodes(&self) -> impl Iterator<Item = Node> + '_ {
        self.tables.iter().map(|table| table.node)
    }

    pub fn tensor(&self, node: Node) -> Option<&Tensor> {
        self.tables
            .iter()
            .find(|table| table.node == node)
            .map(|table| &table.tensor)
    }

    /// Product of the chance node conditional probabilities along `path`.
    ///
    /// Decision nodes do not contribute a factor.
    #[inline]
    pub fn path_probability(&self, path: &[State]) -> f64 {
        self.tables
            .iter()
            .map(|table| table.on_path(path, true))
            .product()
    }

    /// Returns whether `state` has zero probability in every context of chance node `node`.
    pub fn is_inactive(&self, node: Node, state: State) -> bool {
        self.tensor(node).map_or(false, |tensor| {
            let num_states = tensor.shape().last().copied().unwrap_or(1);
            tensor
                .data()
                .chunks(num_states)
                .all(|slice| slice.get(state).map_or(true, |&p| p == 0.0))
        })
    }
}

/// Consequence tables of every value node.
#[derive(Clone, Debug, Serialize)]
pub struct Consequences {
    tables: Vec<NodeTable>,
}

impl Consequences {
    /// Validates one tensor per value node, shaped by its information set states.
    pub fn new(diagram: &Diagram, tensors: BTreeMap<Node, Tensor>) -> Result<Self> {
        let tables = collect_tables(diagram, NodeKind::Value, tensors)?;
        for table in &tables {
            let values = Odometer::over(table.tensor.shape()).zip(table.tensor.data());
            for (index, &value) in values {
                if !value.is_finite() {
                    return Err(Error::NonFiniteConsequence {
                        node: table.node,
                        index,
                        value,
                    });
                }
            }
        }
        Ok(Self { tables })
    }

    pub fn tensor(&self, node: Node) -> Option<&Tensor> {
        self.tables
            .iter()
            .find(|table| table.node == node)
            .map(|table| &table.tensor)
    }

    /// Consequence of a single value node on `path`.
    pub fn consequence(&self, node: Node, path: &[State]) -> Option<f64> {
        self.tables
            .iter()
            .find(|table| table.node == node)
            .map(|table| table.on_path(path, false))
    }
}

/// Aggregates the value node consequences of a path into a single utility.
pub trait PathUtility: Sync {
    /// Returns the utility of a complete path.
    fn utility(&self, path: &[State]) -> f64;
}

impl<U: PathUtility + ?Sized> PathUtility for &U {
    #[inline]
    fn utility(&self, path: &[State]) -> f64 {
        (**self).utility(path)
    }
}

/// Additive aggregation: the sum of all value node consequences.
impl PathUtility for Consequences {
    #[inline]
    fn utility(&self, path: &[State]) -> f64 {
        self.tables
            .iter()
            .map(|table| table.on_path(path, false))
            .sum()
    }
}

/// Path utility translated by a constant.
#[derive(Clone, Debug)]
pub struct ShiftedUtility<U> {
    inner: U,
    shift: f64,
}

impl<U: PathUtility> ShiftedUtility<U> {
    #[inline]
    pub fn new(inner: U, shift: f64) -> Self {
        Self { inner, shift }
    }

    /// Shifts `inner` so that the smallest utility over all paths of `diagram` becomes 1.
    pub fn positive(inner: U, diagram: &Diagram) -> Result<Self> {
        let min = PathSpace::new(diagram)?
            .iter()
            .map(|path| inner.utility(&path))
            .fold(f64::INFINITY, f64::min);
        Ok(Self::new(inner, 1.0 - min))
    }

    #[inline]
    pub fn shift(&self) -> f64 {
        self.shift
    }
}

impl<U: PathUtility> PathUtility for ShiftedUtility<U> {
    #[inline]
    fn utility(&self, path: &[State]) -> f64 {
        self.inner.utility(path) + self.shift
    }
}
