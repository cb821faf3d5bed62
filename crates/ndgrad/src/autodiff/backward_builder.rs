//! Graph construction for operation implementers.
//!
//! An operation computes its outputs first, then describes how to
//! differentiate them:
//!
//! ```
//! use ndgrad::autodiff::BackwardBuilder;
//! use ndgrad::operations::multiply_scalar;
//! use ndgrad::{Array, Context, GradError};
//!
//! fn double(x: &Array) -> Result<Array, GradError> {
//!     let y = Array::from_vec(x.to_vec().iter().map(|v| v * 2.0).collect(), x.shape(), x.device())?;
//!     let builder = BackwardBuilder::new("double", &[x], &[&y])?;
//!     let target = builder.create_target(&[0])?;
//!     if target.is_definition_required() {
//!         target.define(|ctx| {
//!             let gy = ctx.output_grad(0)?;
//!             ctx.set_input_grad(0, multiply_scalar(&gy, 2.0)?)
//!         });
//!     }
//!     builder.finalize()?;
//!     Ok(y)
//! }
//!
//! let ctx = Context::new();
//! let x = Array::scalar(3.0, &ctx.native_device());
//! x.require_grad(None)?;
//! double(&x)?.backward(None, Default::default())?;
//! assert_eq!(x.grad(None)?.unwrap().item()?, 2.0);
//! # Ok::<(), GradError>(())
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use smallvec::SmallVec;

use super::array_node::ArrayNode;
use super::backward_context::BackwardContext;
use super::op_node::{BackwardFunction, OpNode};
use super::retained::{RetainedInputToken, RetainedOutputToken};
use crate::array::Array;
use crate::context::{BackpropId, Context};
use crate::error::GradError;

/// Records one operation invocation on every backprop id that needs it.
pub struct BackwardBuilder {
    name: String,
    context: Context,
    inputs: Vec<Array>,
    outputs: Vec<Array>,
    has_float_output: bool,
    op_node_map: RefCell<BTreeMap<BackpropId, Rc<OpNode>>>,
    targeted_inputs: RefCell<Vec<bool>>,
    retained_input_indices: RefCell<BTreeSet<usize>>,
    retained_output_indices: RefCell<BTreeSet<usize>>,
    finalized: Cell<bool>,
}

impl BackwardBuilder {
    /// Start recording operation `name`.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if there are no outputs, if an output already
    /// takes part in a graph, or if an output is the same array as an input.
    /// Returns [`GradError::ContextMismatch`] if the arrays live on different
    /// contexts.
    pub fn new(name: &str, inputs: &[&Array], outputs: &[&Array]) -> Result<Self, GradError> {
        let Some(first) = outputs.first() else {
            return Err(GradError::protocol(format!("{name}: operation has no outputs")));
        };
        let context = first.context().clone();
        if inputs
            .iter()
            .chain(outputs)
            .any(|array| !array.context().ptr_eq(&context))
        {
            return Err(GradError::ContextMismatch);
        }
        for (i, output) in outputs.iter().enumerate() {
            if output.body().has_nodes() {
                return Err(GradError::protocol(format!(
                    "{name}: output {i} already takes part in a graph"
                )));
            }
            if inputs.iter().any(|input| input.is_same_body(output)) {
                return Err(GradError::protocol(format!(
                    "{name}: output {i} aliases an input"
                )));
            }
        }
        Ok(Self {
            name: name.to_string(),
            context,
            inputs: inputs.iter().map(|&a| a.clone()).collect(),
            outputs: outputs.iter().map(|&a| a.clone()).collect(),
            has_float_output: outputs.iter().any(|a| a.dtype().is_float()),
            op_node_map: RefCell::new(BTreeMap::new()),
            targeted_inputs: RefCell::new(vec![false; inputs.len()]),
            retained_input_indices: RefCell::new(BTreeSet::new()),
            retained_output_indices: RefCell::new(BTreeSet::new()),
            finalized: Cell::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a group of inputs differentiated by one backward function.
    ///
    /// Each input index may belong to at most one target.
    pub fn create_target(&self, input_indices: &[usize]) -> Result<Target<'_>, GradError> {
        {
            let mut targeted = self.targeted_inputs.borrow_mut();
            for &index in input_indices {
                match targeted.get_mut(index) {
                    None => {
                        return Err(GradError::protocol(format!(
                            "{}: input index {index} out of range ({} inputs)",
                            self.name,
                            self.inputs.len()
                        )));
                    }
                    Some(true) => {
                        return Err(GradError::protocol(format!(
                            "{}: input index {index} already has a backward function",
                            self.name
                        )));
                    }
                    Some(flag) => *flag = true,
                }
            }
        }

        let mut graph_to_inputs: BTreeMap<BackpropId, Vec<(usize, Rc<ArrayNode>)>> =
            BTreeMap::new();
        if self.has_float_output {
            for &index in input_indices {
                for node in self.inputs[index].body().nodes() {
                    let backprop_id = node.backprop_id();
                    if self.context.check_valid_backprop_id(backprop_id).is_ok()
                        && self.context.is_backprop_required(backprop_id)
                    {
                        graph_to_inputs
                            .entry(backprop_id)
                            .or_default()
                            .push((index, node));
                    }
                }
            }
        }

        Ok(Target {
            builder: self,
            input_indices: input_indices.iter().copied().collect(),
            graph_to_inputs,
        })
    }

    /// Keep input `index` available to backward functions.
    pub fn retain_input(&self, index: usize) -> Result<RetainedInputToken, GradError> {
        let input = self.inputs.get(index).ok_or_else(|| {
            GradError::protocol(format!(
                "{}: cannot retain input {index} of {}",
                self.name,
                self.inputs.len()
            ))
        })?;
        self.retained_input_indices.borrow_mut().insert(index);
        Ok(RetainedInputToken::new(index, input))
    }

    /// Keep `output` available to backward functions. `output` must be one of
    /// the arrays the builder was created with.
    pub fn retain_output(&self, output: &Array) -> Result<RetainedOutputToken, GradError> {
        let index = self
            .outputs
            .iter()
            .position(|candidate| candidate.is_same_body(output))
            .ok_or_else(|| {
                GradError::protocol(format!(
                    "{}: retained array is not an output of the operation",
                    self.name
                ))
            })?;
        self.retained_output_indices.borrow_mut().insert(index);
        Ok(RetainedOutputToken::new(index, output))
    }

    fn find_or_create_op_node(&self, backprop_id: BackpropId) -> Rc<OpNode> {
        let mut map = self.op_node_map.borrow_mut();
        Rc::clone(map.entry(backprop_id).or_insert_with(|| {
            OpNode::create_with_output_array_nodes(
                &self.name,
                backprop_id,
                self.inputs.len(),
                &self.outputs,
            )
        }))
    }

    /// Finish recording. Links each op node to the outer-graph nodes of the
    /// retained inputs and outputs.
    pub fn finalize(self) -> Result<(), GradError> {
        {
            let op_nodes = self.op_node_map.borrow();
            let retained_inputs = self.retained_input_indices.borrow();
            let retained_outputs = self.retained_output_indices.borrow();
            for (&backprop_id, op_node) in op_nodes.iter() {
                for &index in retained_inputs.iter() {
                    for node in self.inputs[index].body().nodes() {
                        if node.backprop_id() < backprop_id {
                            op_node.add_outer_graph_input_array_node(index, node);
                        }
                    }
                }
                for &index in retained_outputs.iter() {
                    for node in self.outputs[index].body().nodes() {
                        if node.backprop_id() < backprop_id {
                            op_node.add_outer_graph_output_array_node(index, node);
                        }
                    }
                }
            }
        }
        self.finalized.set(true);
        Ok(())
    }
}

impl Drop for BackwardBuilder {
    fn drop(&mut self) {
        if !self.finalized.get() && !self.op_node_map.borrow().is_empty() {
            log::warn!("backward builder for '{}' dropped before finalize", self.name);
        }
    }
}

/// A group of inputs sharing one backward function.
pub struct Target<'a> {
    builder: &'a BackwardBuilder,
    input_indices: SmallVec<[usize; 4]>,
    graph_to_inputs: BTreeMap<BackpropId, Vec<(usize, Rc<ArrayNode>)>>,
}

impl Target<'_> {
    /// Whether some backprop id needs gradients of these inputs. When it
    /// returns false, [`Target::define`] does nothing.
    pub fn is_definition_required(&self) -> bool {
        !self.graph_to_inputs.is_empty()
    }

    pub fn input_indices(&self) -> &[usize] {
        &self.input_indices
    }

    /// Register `backward_fn` on every backprop id that needs it.
    ///
    /// The function receives the gradients of the outputs and must set the
    /// gradient of each input in the target, addressed by its position in
    /// the target.
    pub fn define<F>(self, backward_fn: F)
    where
        F: Fn(&mut BackwardContext<'_>) -> Result<(), GradError> + 'static,
    {
        if self.graph_to_inputs.is_empty() {
            return;
        }
        let backward_fn: BackwardFunction = Rc::new(backward_fn);
        for (&backprop_id, input_nodes) in &self.graph_to_inputs {
            let op_node = self.builder.find_or_create_op_node(backprop_id);
            op_node.register_backward_function(
                input_nodes,
                &self.input_indices,
                Rc::clone(&backward_fn),
            );
        }
    }
}
