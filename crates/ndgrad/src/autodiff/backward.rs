//! Backward pass execution for reverse-mode automatic differentiation.
//!
//! Op nodes are visited in non-increasing rank order. A node's rank is
//! higher than that of every node feeding it, so by the time a node is
//! popped every contribution to its output gradients has been accumulated.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;

use super::array_node::ArrayNode;
use super::backward_context::{BackwardContext, RetainedArrays};
use super::op_node::OpNode;
use crate::array::Array;
use crate::backprop_mode::BackpropModeScope;
use crate::context::{BackpropId, Context};
use crate::error::{GradError, consistency_check};
use crate::operations;
use crate::storage::DataBuffer;

/// Whether the graph of the backward pass itself is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DoubleBackpropOption {
    /// Release the graph while it is traversed.
    #[default]
    Disable,
    /// Keep the graph and record backward computations on outer graphs, so
    /// that the resulting gradients can be differentiated again.
    Enable,
}

/// Compute gradients of `outputs` with respect to every array tracked on
/// `backprop_id` (the default id when `None`).
///
/// Outputs without a gradient are seeded with ones. Afterwards each reachable
/// array node holds the accumulated gradient; intermediate nodes that are not
/// among `outputs` are cleared once consumed.
///
/// # Errors
///
/// Returns a protocol error if an output is not tracked on `backprop_id`.
/// Errors raised by backward functions abort the traversal; gradients
/// accumulated so far stay in place.
///
/// # Example
///
/// ```
/// use ndgrad::autodiff::{DoubleBackpropOption, backward};
/// use ndgrad::operations::multiply;
/// use ndgrad::{Array, Context};
///
/// let ctx = Context::new();
/// let device = ctx.native_device();
/// let a = Array::scalar(3.0, &device);
/// let b = Array::scalar(2.0, &device);
/// a.require_grad(None).unwrap();
/// b.require_grad(None).unwrap();
///
/// let y = multiply(&a, &b).unwrap();
/// backward(&[&y], None, DoubleBackpropOption::Disable).unwrap();
/// assert_eq!(a.grad(None).unwrap().unwrap().item().unwrap(), 2.0);
/// assert_eq!(b.grad(None).unwrap().unwrap().item().unwrap(), 3.0);
/// ```
pub fn backward(
    outputs: &[&Array],
    backprop_id: Option<BackpropId>,
    option: DoubleBackpropOption,
) -> Result<(), GradError> {
    let Some(first) = outputs.first() else {
        return Ok(());
    };
    let context = first.context().clone();
    let backprop_id = context.resolve_backprop_id(backprop_id)?;
    let output_nodes = tracked_nodes(outputs, backprop_id)?;
    for (output, node) in outputs.iter().zip(&output_nodes) {
        if !node.grad().is_some() {
            node.grad().set(Array::ones_like(output));
        }
    }
    BackwardImpl::new(context, backprop_id, option, output_nodes, Vec::new()).run()
}

/// Compute gradients of `outputs` with respect to `inputs` and return them,
/// leaving every stored gradient as it was.
///
/// `output_grads` seeds the outputs; ones are used when it is `None`. An input
/// that receives no gradient yields `None`.
///
/// # Example
///
/// ```
/// use ndgrad::autodiff::{DoubleBackpropOption, grad};
/// use ndgrad::operations::square;
/// use ndgrad::{Array, Context};
///
/// let ctx = Context::new();
/// let x = Array::scalar(3.0, &ctx.native_device());
/// x.require_grad(None).unwrap();
/// let y = square(&x).unwrap();
///
/// let gx = grad(&[&y], &[&x], None, DoubleBackpropOption::Disable, None).unwrap();
/// assert_eq!(gx[0].as_ref().unwrap().item().unwrap(), 6.0);
/// assert!(x.grad(None).unwrap().is_none());
/// ```
pub fn grad(
    outputs: &[&Array],
    inputs: &[&Array],
    backprop_id: Option<BackpropId>,
    option: DoubleBackpropOption,
    output_grads: Option<&[Array]>,
) -> Result<Vec<Option<Array>>, GradError> {
    let Some(first) = outputs.first() else {
        return Ok(vec![None; inputs.len()]);
    };
    let context = first.context().clone();
    let backprop_id = context.resolve_backprop_id(backprop_id)?;
    let output_nodes = tracked_nodes(outputs, backprop_id)?;
    if let Some(seeds) = output_grads {
        if seeds.len() != outputs.len() {
            return Err(GradError::protocol(format!(
                "grad: {} output gradients given for {} outputs",
                seeds.len(),
                outputs.len()
            )));
        }
        for (node, seed) in output_nodes.iter().zip(seeds) {
            super::validate_gradient(node.shape(), node.dtype(), node.device(), seed)?;
        }
    }
    let input_nodes: Vec<Option<Rc<ArrayNode>>> = inputs
        .iter()
        .map(|input| input.body().find_node(backprop_id))
        .collect();

    // Stash stored gradients; the pass must start from a clean slate and
    // leave no trace.
    let mut stashed: Vec<(Rc<ArrayNode>, Option<Array>)> = Vec::new();
    for node in output_nodes.iter().chain(input_nodes.iter().flatten()) {
        if !stashed.iter().any(|(n, _)| Rc::ptr_eq(n, node)) {
            stashed.push((Rc::clone(node), node.grad().take()));
        }
    }
    for (i, node) in output_nodes.iter().enumerate() {
        let seed = match output_grads {
            Some(seeds) => seeds[i].clone(),
            None => Array::ones(node.shape(), node.dtype(), node.device()),
        };
        node.grad().set(seed);
    }

    let retained: Vec<Rc<ArrayNode>> = input_nodes.iter().flatten().cloned().collect();
    let mut backward_impl = BackwardImpl::new(context, backprop_id, option, output_nodes, retained);
    backward_impl.touched = Some(Vec::new());
    let result = backward_impl.run();

    let grads = input_nodes
        .iter()
        .map(|node| node.as_ref().and_then(|n| n.grad().get()))
        .collect();
    for (node, previous) in backward_impl.touched.take().into_iter().flatten().rev() {
        node.grad().replace(previous);
    }
    for (node, previous) in stashed {
        node.grad().replace(previous);
    }
    result.map(|()| grads)
}

fn tracked_nodes(
    outputs: &[&Array],
    backprop_id: BackpropId,
) -> Result<Vec<Rc<ArrayNode>>, GradError> {
    outputs
        .iter()
        .map(|output| {
            output.body().find_node(backprop_id).ok_or_else(|| {
                GradError::protocol("backward: output array is not tracked on the backprop id")
            })
        })
        .collect()
}

/// Heap entry; higher rank first, then first pushed.
struct Candidate {
    rank: usize,
    seq: Reverse<usize>,
    op_node: Rc<OpNode>,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.rank, self.seq).cmp(&(other.rank, other.seq))
    }
}

fn op_node_key(op_node: &Rc<OpNode>) -> usize {
    Rc::as_ptr(op_node) as usize
}

struct BackwardImpl {
    context: Context,
    backprop_id: BackpropId,
    option: DoubleBackpropOption,
    /// Nodes whose gradients survive the pass: requested outputs and, for
    /// `grad`, the inputs.
    kept_nodes: Vec<Rc<ArrayNode>>,
    candidates: BinaryHeap<Candidate>,
    /// For each queued op node, the output nodes that received gradients.
    /// Holding them keeps the gradients alive after the consuming op node
    /// released its inputs.
    pending_outputs: HashMap<usize, Vec<Rc<ArrayNode>>>,
    /// When set, gradients of other nodes are moved out before the pass
    /// first reads or changes them, and restored afterwards.
    touched: Option<Vec<(Rc<ArrayNode>, Option<Array>)>>,
    seq: usize,
}

impl BackwardImpl {
    fn new(
        context: Context,
        backprop_id: BackpropId,
        option: DoubleBackpropOption,
        output_nodes: Vec<Rc<ArrayNode>>,
        retained_nodes: Vec<Rc<ArrayNode>>,
    ) -> Self {
        let mut this = Self {
            context,
            backprop_id,
            option,
            kept_nodes: Vec::new(),
            candidates: BinaryHeap::new(),
            pending_outputs: HashMap::new(),
            touched: None,
            seq: 0,
        };
        for node in &output_nodes {
            this.push_creator(node);
        }
        this.kept_nodes = output_nodes;
        this.kept_nodes.extend(retained_nodes);
        this
    }

    fn push_creator(&mut self, node: &Rc<ArrayNode>) {
        let Some(op_node) = node.creator_op_node() else {
            return;
        };
        let key = op_node_key(&op_node);
        let pending = self.pending_outputs.entry(key).or_default();
        let first_visit = pending.is_empty();
        if !pending.iter().any(|n| Rc::ptr_eq(n, node)) {
            pending.push(Rc::clone(node));
        }
        if first_visit {
            self.candidates.push(Candidate {
                rank: op_node.rank(),
                seq: Reverse(self.seq),
                op_node,
            });
            self.seq += 1;
        }
    }

    fn is_kept(&self, node: &Rc<ArrayNode>) -> bool {
        self.kept_nodes.iter().any(|n| Rc::ptr_eq(n, node))
    }

    fn record_touched(&mut self, node: &Rc<ArrayNode>) {
        if self.is_kept(node) {
            return;
        }
        if let Some(touched) = &mut self.touched {
            if !touched.iter().any(|(n, _)| Rc::ptr_eq(n, node)) {
                touched.push((Rc::clone(node), node.grad().take()));
            }
        }
    }

    fn run(&mut self) -> Result<(), GradError> {
        log::debug!(
            "backward on '{}' from {} output(s), double backprop {:?}",
            self.context
                .backprop_id_name(self.backprop_id)
                .unwrap_or_default(),
            self.kept_nodes.len(),
            self.option
        );
        let mut processed = 0usize;
        let mut last_rank = usize::MAX;
        while let Some(Candidate { op_node, rank, .. }) = self.candidates.pop() {
            consistency_check!(rank <= last_rank, "op nodes popped out of rank order");
            last_rank = rank;
            let pending = self
                .pending_outputs
                .remove(&op_node_key(&op_node))
                .unwrap_or_default();
            log::trace!("backward through '{}' (rank {rank})", op_node.name());
            self.process(&op_node)?;
            drop(pending);
            processed += 1;
        }
        log::debug!("backward finished after {processed} op node(s)");
        Ok(())
    }

    /// Backward functions run without recording on this graph or any inner
    /// one. Outer graphs are recorded only for double backprop.
    fn mode_scope(&self) -> Result<BackpropModeScope, GradError> {
        match self.option {
            DoubleBackpropOption::Disable => BackpropModeScope::no_backprop(&self.context, &[]),
            DoubleBackpropOption::Enable => {
                let mut ids = vec![self.backprop_id];
                ids.extend(self.context.inner_backprop_ids(self.backprop_id));
                BackpropModeScope::no_backprop(&self.context, &ids)
            }
        }
    }

    fn process(&mut self, op_node: &Rc<OpNode>) -> Result<(), GradError> {
        let output_nodes: Vec<Option<Rc<ArrayNode>>> = (0..op_node.output_count())
            .map(|i| op_node.output_array_node(i))
            .collect();
        for node in output_nodes.iter().flatten() {
            self.record_touched(node);
        }
        let output_grads: Vec<Option<Array>> = output_nodes
            .iter()
            .map(|node| node.as_ref().and_then(|n| n.grad().get()))
            .collect();

        let _scope = self.mode_scope()?;

        let mut input_grads: Vec<Option<Array>> = vec![None; op_node.input_count()];
        let mut retained = RetainedArrays::default();
        for entry in op_node.backward_entries() {
            let mut ctx =
                BackwardContext::new(op_node, entry.input_indices(), &output_grads, &mut retained);
            entry.call(&mut ctx)?;
            for (index, grad) in ctx.into_input_grads() {
                input_grads[index] = Some(grad);
            }
        }
        drop(retained);

        for node in output_nodes.iter().flatten() {
            if !self.is_kept(node) {
                node.grad().clear();
            }
        }

        self.accumulate_input_grads(op_node, input_grads, &output_grads)?;

        if self.option == DoubleBackpropOption::Disable {
            op_node.unchain();
        }
        Ok(())
    }

    fn accumulate_input_grads(
        &mut self,
        op_node: &Rc<OpNode>,
        input_grads: Vec<Option<Array>>,
        output_grads: &[Option<Array>],
    ) -> Result<(), GradError> {
        let in_place = self.option == DoubleBackpropOption::Disable;
        let mut seen: Vec<DataBuffer> = output_grads
            .iter()
            .flatten()
            .map(|g| g.data().clone())
            .collect();

        for (index, grad) in input_grads.into_iter().enumerate() {
            let (Some(node), Some(mut grad)) = (op_node.input_array_node(index), grad) else {
                continue;
            };
            let existing_aliases = node
                .grad()
                .get()
                .is_some_and(|existing| existing.shares_storage_with(&grad));
            if existing_aliases || seen.iter().any(|buffer| buffer.ptr_eq(grad.data())) {
                grad = match self.option {
                    DoubleBackpropOption::Disable => grad.copy(),
                    DoubleBackpropOption::Enable => operations::copy(&grad)?,
                };
            }
            seen.push(grad.data().clone());
            self.record_touched(&node);
            node.grad().accumulate(grad, in_place)?;
            self.push_creator(&node);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::{add, multiply, multiply_scalar, split, square};

    #[test]
    fn test_backward_without_outputs_is_noop() {
        assert!(backward(&[], None, DoubleBackpropOption::Disable).is_ok());
    }

    #[test]
    fn test_backward_on_untracked_output_fails() {
        let ctx = Context::new();
        let y = Array::scalar(1.0, &ctx.native_device());
        assert!(matches!(
            backward(&[&y], None, DoubleBackpropOption::Disable),
            Err(GradError::Protocol(_))
        ));
    }

    #[test]
    fn test_leaf_output_is_seeded() {
        let ctx = Context::new();
        let x = Array::from_vec(vec![1.0, 2.0], &[2], &ctx.native_device()).unwrap();
        x.require_grad(None).unwrap();
        backward(&[&x], None, DoubleBackpropOption::Disable).unwrap();
        assert_eq!(x.grad(None).unwrap().unwrap().to_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_existing_output_grad_is_used_as_seed() {
        let ctx = Context::new();
        let x = Array::scalar(3.0, &ctx.native_device());
        x.require_grad(None).unwrap();
        let y = multiply(&x, &x).unwrap();
        y.require_grad(None).unwrap();
        y.set_grad(Array::scalar(0.5, &ctx.native_device()), None)
            .unwrap();
        backward(&[&y], None, DoubleBackpropOption::Disable).unwrap();
        assert_eq!(x.grad(None).unwrap().unwrap().item().unwrap(), 3.0);
    }

    #[test]
    fn test_intermediate_grads_are_cleared() {
        let ctx = Context::new();
        let d = ctx.native_device();
        let x = Array::scalar(1.0, &d);
        x.require_grad(None).unwrap();
        let h = add(&x, &x).unwrap();
        let y = multiply(&h, &h).unwrap();
        backward(&[&y], None, DoubleBackpropOption::Disable).unwrap();
        assert!(h.grad(None).unwrap().is_none());
        assert_eq!(y.grad(None).unwrap().unwrap().item().unwrap(), 1.0);
        assert_eq!(x.grad(None).unwrap().unwrap().item().unwrap(), 8.0);
    }

    #[test]
    fn test_grad_leaves_stored_gradients_untouched() {
        let ctx = Context::new();
        let d = ctx.native_device();
        let x = Array::scalar(2.0, &d);
        x.require_grad(None).unwrap();
        x.set_grad(Array::scalar(10.0, &d), None).unwrap();
        let y = multiply(&x, &x).unwrap();

        let grads = grad(&[&y], &[&x], None, DoubleBackpropOption::Disable, None).unwrap();
        assert_eq!(grads[0].as_ref().unwrap().item().unwrap(), 4.0);
        assert_eq!(x.grad(None).unwrap().unwrap().item().unwrap(), 10.0);
        assert!(y.grad(None).unwrap().is_none());
    }

    #[test]
    fn test_grad_leaves_other_leaves_untouched() {
        let ctx = Context::new();
        let d = ctx.native_device();
        let x = Array::scalar(2.0, &d);
        let w = Array::scalar(5.0, &d);
        x.require_grad(None).unwrap();
        w.require_grad(None).unwrap();
        let y = multiply(&x, &w).unwrap();

        let grads = grad(&[&y], &[&x], None, DoubleBackpropOption::Disable, None).unwrap();
        assert_eq!(grads[0].as_ref().unwrap().item().unwrap(), 5.0);
        assert!(w.grad(None).unwrap().is_none());
    }

    fn grad_through_stale_intermediate(first: DoubleBackpropOption, second: DoubleBackpropOption) {
        let ctx = Context::new();
        let d = ctx.native_device();
        let x = Array::scalar(2.0, &d);
        x.require_grad(None).unwrap();
        let h = square(&x).unwrap();
        backward(&[&h], None, first).unwrap();
        assert_eq!(h.grad(None).unwrap().unwrap().item().unwrap(), 1.0);
        assert_eq!(x.grad(None).unwrap().unwrap().item().unwrap(), 4.0);

        let y = multiply_scalar(&h, 3.0).unwrap();
        let grads = grad(&[&y], &[&x], None, second, None).unwrap();
        assert_eq!(grads[0].as_ref().unwrap().item().unwrap(), 12.0);
        assert_eq!(h.grad(None).unwrap().unwrap().item().unwrap(), 1.0);
        assert_eq!(x.grad(None).unwrap().unwrap().item().unwrap(), 4.0);
    }

    #[test]
    fn test_grad_ignores_stored_intermediate_gradient() {
        grad_through_stale_intermediate(
            DoubleBackpropOption::Enable,
            DoubleBackpropOption::Disable,
        );
    }

    #[test]
    fn test_grad_ignores_stored_intermediate_gradient_with_double_backprop() {
        grad_through_stale_intermediate(
            DoubleBackpropOption::Enable,
            DoubleBackpropOption::Enable,
        );
    }

    #[test]
    fn test_grad_ignores_stored_sibling_output_gradient() {
        let ctx = Context::new();
        let d = ctx.native_device();
        let x = Array::from_vec(vec![1.0, 2.0], &[2], &d).unwrap();
        x.require_grad(None).unwrap();
        let parts = split(&x, &[1, 1]).unwrap();
        backward(&[&parts[0]], None, DoubleBackpropOption::Enable).unwrap();
        assert_eq!(parts[0].grad(None).unwrap().unwrap().to_vec(), vec![1.0]);

        let y = square(&parts[1]).unwrap();
        let grads = grad(&[&y], &[&x], None, DoubleBackpropOption::Disable, None).unwrap();
        assert_eq!(grads[0].as_ref().unwrap().to_vec(), vec![0.0, 4.0]);
        assert_eq!(parts[0].grad(None).unwrap().unwrap().to_vec(), vec![1.0]);
        assert_eq!(x.grad(None).unwrap().unwrap().to_vec(), vec![1.0, 0.0]);
    }

    #[test]
    fn test_grad_with_explicit_seed() {
        let ctx = Context::new();
        let d = ctx.native_device();
        let x = Array::scalar(2.0, &d);
        x.require_grad(None).unwrap();
        let y = multiply(&x, &x).unwrap();
        let seed = [Array::scalar(3.0, &d)];
        let grads = grad(&[&y], &[&x], None, DoubleBackpropOption::Disable, Some(&seed)).unwrap();
        assert_eq!(grads[0].as_ref().unwrap().item().unwrap(), 12.0);
    }

    #[test]
    fn test_grad_seed_count_mismatch() {
        let ctx = Context::new();
        let d = ctx.native_device();
        let x = Array::scalar(2.0, &d);
        x.require_grad(None).unwrap();
        let y = multiply(&x, &x).unwrap();
        let result = grad(&[&y], &[&x], None, DoubleBackpropOption::Disable, Some(&[]));
        assert!(matches!(result, Err(GradError::Protocol(_))));
    }

    #[test]
    fn test_candidate_order() {
        let ctx = Context::new();
        let d = ctx.native_device();
        let id = ctx.default_backprop_id();
        let y = Array::scalar(1.0, &d);
        let op_node = OpNode::create_with_output_array_nodes("op", id, 0, &[y]);
        let mut heap = BinaryHeap::new();
        for (rank, seq) in [(1, 0), (3, 1), (3, 2), (2, 3)] {
            heap.push(Candidate {
                rank,
                seq: Reverse(seq),
                op_node: Rc::clone(&op_node),
            });
        }
        let order: Vec<(usize, usize)> = std::iter::from_fn(|| heap.pop())
            .map(|c| (c.rank, c.seq.0))
            .collect();
        assert_eq!(order, vec![(3, 1), (3, 2), (2, 3), (1, 0)]);
    }
}
