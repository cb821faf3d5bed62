//! The view a backward function has of the graph while it runs.

use std::collections::HashMap;
use std::rc::Rc;

use super::array_node::{ArrayNode, validate_gradient};
use super::op_node::OpNode;
use super::retained::{ArrayParams, RetainedInputToken, RetainedOutputToken};
use crate::array::Array;
use crate::error::GradError;

/// Arrays resolved from retained tokens while one op node is processed.
///
/// Shared by all backward entries of the node so that every entry sees the
/// same rebuilt array.
#[derive(Default)]
pub(crate) struct RetainedArrays {
    inputs: HashMap<usize, Array>,
    outputs: HashMap<usize, Array>,
}

/// Context passed to one invocation of a backward function.
pub struct BackwardContext<'a> {
    op_node: &'a Rc<OpNode>,
    input_indices: &'a [usize],
    output_grads: &'a [Option<Array>],
    zero_output_grads: Vec<Option<Array>>,
    input_grads: Vec<Option<Array>>,
    retained: &'a mut RetainedArrays,
}

impl<'a> BackwardContext<'a> {
    pub(crate) fn new(
        op_node: &'a Rc<OpNode>,
        input_indices: &'a [usize],
        output_grads: &'a [Option<Array>],
        retained: &'a mut RetainedArrays,
    ) -> Self {
        Self {
            op_node,
            input_indices,
            output_grads,
            zero_output_grads: vec![None; output_grads.len()],
            input_grads: vec![None; input_indices.len()],
            retained,
        }
    }

    /// Name of the operation being differentiated.
    pub fn op_name(&self) -> &str {
        self.op_node.name()
    }

    pub fn output_count(&self) -> usize {
        self.output_grads.len()
    }

    /// Number of inputs this backward function serves.
    pub fn input_count(&self) -> usize {
        self.input_indices.len()
    }

    /// Whether a gradient was propagated to output `index`.
    pub fn has_output_grad(&self, index: usize) -> bool {
        self.output_grads.get(index).is_some_and(Option::is_some)
    }

    /// Gradient of output `index`.
    ///
    /// An output that received no gradient reads as zeros. The zero array is
    /// created once per invocation and is never stored on the graph.
    pub fn output_grad(&mut self, index: usize) -> Result<Array, GradError> {
        let Some(grad) = self.output_grads.get(index) else {
            return Err(GradError::protocol(format!(
                "{}: output index {index} out of range ({} outputs)",
                self.op_node.name(),
                self.output_grads.len()
            )));
        };
        if let Some(grad) = grad {
            return Ok(grad.clone());
        }
        let props = self.op_node.output_array_props(index);
        let zeros = self.zero_output_grads[index]
            .get_or_insert_with(|| Array::zeros(&props.shape, props.dtype, &props.device));
        Ok(zeros.clone())
    }

    /// Whether input `k` of this function is tracked on the graph being
    /// differentiated. Gradients set for untracked inputs are discarded.
    pub fn is_input_grad_required(&self, k: usize) -> bool {
        self.input_indices
            .get(k)
            .is_some_and(|&index| self.op_node.input_array_node(index).is_some())
    }

    /// Set the gradient of input `k`, the position of the input within the
    /// target this function was defined for.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if `k` is out of range, and a dimension,
    /// dtype or device error if `grad` does not match the input.
    pub fn set_input_grad(&mut self, k: usize, grad: Array) -> Result<(), GradError> {
        let Some(&index) = self.input_indices.get(k) else {
            return Err(GradError::protocol(format!(
                "{}: gradient index {k} out of range ({} inputs in target)",
                self.op_node.name(),
                self.input_indices.len()
            )));
        };
        if let Some(node) = self.op_node.input_array_node(index) {
            validate_gradient(node.shape(), node.dtype(), node.device(), &grad)?;
        }
        self.input_grads[k] = Some(grad);
        Ok(())
    }

    /// The forward value of a retained input.
    pub fn get_retained_input(&mut self, token: &RetainedInputToken) -> Result<Array, GradError> {
        let index = token.index();
        if index >= self.op_node.input_count() {
            return Err(GradError::protocol(format!(
                "{}: retained input {index} out of range",
                self.op_node.name()
            )));
        }
        if let Some(array) = self.retained.inputs.get(&index) {
            return Ok(array.clone());
        }
        let array = resolve_retained(
            self.op_node.input_array_node(index),
            self.op_node.outer_graphs_input_array_nodes(index),
            token.params(),
        );
        self.retained.inputs.insert(index, array.clone());
        Ok(array)
    }

    /// The forward value of a retained output.
    pub fn get_retained_output(
        &mut self,
        token: &RetainedOutputToken,
    ) -> Result<Array, GradError> {
        let index = token.index();
        if index >= self.op_node.output_count() {
            return Err(GradError::protocol(format!(
                "{}: retained output {index} out of range",
                self.op_node.name()
            )));
        }
        if let Some(array) = self.retained.outputs.get(&index) {
            return Ok(array.clone());
        }
        let array = resolve_retained(
            self.op_node.output_array_node(index),
            self.op_node.outer_graphs_output_array_nodes(index),
            token.params(),
        );
        self.retained.outputs.insert(index, array.clone());
        Ok(array)
    }

    /// Gradients produced by the function, keyed by operation input index.
    pub(crate) fn into_input_grads(self) -> Vec<(usize, Array)> {
        self.input_indices
            .iter()
            .zip(self.input_grads)
            .filter_map(|(&index, grad)| grad.map(|g| (index, g)))
            .collect()
    }
}

/// Find a live body for a retained array, or rebuild one from `params` and
/// attach the outer-graph nodes to it.
fn resolve_retained(
    node: Option<Rc<ArrayNode>>,
    outer_nodes: Vec<Rc<ArrayNode>>,
    params: &ArrayParams,
) -> Array {
    if let Some(array) = node.and_then(|n| n.array()) {
        return array;
    }
    if let Some(array) = outer_nodes.iter().find_map(|n| n.array()) {
        return array;
    }
    let array = params.rebuild();
    for outer in outer_nodes {
        outer.set_body(Rc::downgrade(array.body()));
        array.body().add_node(outer);
    }
    array
}
