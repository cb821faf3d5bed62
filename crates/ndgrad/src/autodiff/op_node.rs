//! Operation nodes and their backward functions.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use smallvec::SmallVec;

use super::array_node::{ArrayNode, ArrayProps};
use super::backward_context::BackwardContext;
use crate::array::Array;
use crate::context::BackpropId;
use crate::error::{GradError, consistency_check};

/// A backward function. It reads output gradients from the context and sets
/// the gradients of the inputs it was registered for.
pub type BackwardFunction = Rc<dyn Fn(&mut BackwardContext<'_>) -> Result<(), GradError>>;

/// One backward function together with the input indices it serves.
#[derive(Clone)]
pub struct BackwardEntry {
    input_indices: SmallVec<[usize; 4]>,
    backward_fn: BackwardFunction,
}

impl BackwardEntry {
    pub fn input_indices(&self) -> &[usize] {
        &self.input_indices
    }

    pub(crate) fn call(&self, ctx: &mut BackwardContext<'_>) -> Result<(), GradError> {
        (self.backward_fn)(ctx)
    }
}

impl fmt::Debug for BackwardEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackwardEntry")
            .field("input_indices", &self.input_indices)
            .finish()
    }
}

/// Node of one operation invocation on one backprop id.
///
/// Input array nodes are owned; output array nodes are referred to weakly
/// and can be told apart from dead ones through their recorded properties.
/// For retained inputs and outputs the node also owns the corresponding
/// array nodes of outer backprop ids, which lets a backward function rebuild
/// a forward value that still connects to those outer graphs.
pub struct OpNode {
    name: String,
    backprop_id: BackpropId,
    rank: Cell<usize>,
    input_array_nodes: RefCell<Vec<Option<Rc<ArrayNode>>>>,
    output_array_props: Vec<ArrayProps>,
    output_array_nodes: RefCell<Vec<Weak<ArrayNode>>>,
    backward_entries: RefCell<Vec<BackwardEntry>>,
    outer_graphs_input_array_nodes: RefCell<BTreeMap<BackpropId, Vec<Option<Rc<ArrayNode>>>>>,
    outer_graphs_output_array_nodes: RefCell<BTreeMap<BackpropId, Vec<Option<Rc<ArrayNode>>>>>,
}

impl OpNode {
    /// Create the node of an operation on `backprop_id` together with fresh
    /// array nodes for each floating output. Non-floating outputs keep a
    /// permanently dead slot.
    pub(crate) fn create_with_output_array_nodes(
        name: &str,
        backprop_id: BackpropId,
        input_count: usize,
        outputs: &[Array],
    ) -> Rc<Self> {
        let op_node = Rc::new(Self {
            name: name.to_string(),
            backprop_id,
            rank: Cell::new(0),
            input_array_nodes: RefCell::new(vec![None; input_count]),
            output_array_props: outputs.iter().map(ArrayProps::of).collect(),
            output_array_nodes: RefCell::new(Vec::with_capacity(outputs.len())),
            backward_entries: RefCell::new(Vec::new()),
            outer_graphs_input_array_nodes: RefCell::new(BTreeMap::new()),
            outer_graphs_output_array_nodes: RefCell::new(BTreeMap::new()),
        });

        for output in outputs {
            let weak = if output.dtype().is_float() {
                let node =
                    ArrayNode::new(output.shape(), output.dtype(), output.device(), backprop_id);
                node.set_body(Rc::downgrade(output.body()));
                node.set_creator_op_node(Some(Rc::clone(&op_node)));
                output.body().add_node(Rc::clone(&node));
                Rc::downgrade(&node)
            } else {
                Weak::new()
            };
            op_node.output_array_nodes.borrow_mut().push(weak);
        }
        op_node
    }

    /// Register a backward function for `input_indices`. `input_array_nodes`
    /// lists the inputs among them that are tracked on this node's id.
    pub(crate) fn register_backward_function(
        &self,
        input_array_nodes: &[(usize, Rc<ArrayNode>)],
        input_indices: &[usize],
        backward_fn: BackwardFunction,
    ) {
        let mut slots = self.input_array_nodes.borrow_mut();
        for (index, node) in input_array_nodes {
            consistency_check!(
                node.backprop_id() == self.backprop_id,
                "input array node belongs to another backprop id"
            );
            let slot = &mut slots[*index];
            consistency_check!(
                slot.as_ref().is_none_or(|existing| Rc::ptr_eq(existing, node)),
                "input slot {} of {} overwritten",
                index,
                self.name
            );
            *slot = Some(Rc::clone(node));
            self.rank.set(self.rank.get().max(node.rank() + 1));
        }
        self.backward_entries.borrow_mut().push(BackwardEntry {
            input_indices: input_indices.iter().copied().collect(),
            backward_fn,
        });
    }

    pub(crate) fn add_outer_graph_input_array_node(
        &self,
        input_index: usize,
        node: Rc<ArrayNode>,
    ) {
        Self::add_outer_edge(
            &self.outer_graphs_input_array_nodes,
            self.input_count(),
            self.backprop_id,
            input_index,
            node,
        );
    }

    pub(crate) fn add_outer_graph_output_array_node(
        &self,
        output_index: usize,
        node: Rc<ArrayNode>,
    ) {
        Self::add_outer_edge(
            &self.outer_graphs_output_array_nodes,
            self.output_count(),
            self.backprop_id,
            output_index,
            node,
        );
    }

    fn add_outer_edge(
        edges: &RefCell<BTreeMap<BackpropId, Vec<Option<Rc<ArrayNode>>>>>,
        count: usize,
        backprop_id: BackpropId,
        index: usize,
        node: Rc<ArrayNode>,
    ) {
        consistency_check!(
            node.backprop_id() < backprop_id,
            "cross-graph edge to a backprop id that is not outer"
        );
        let mut edges = edges.borrow_mut();
        let slots = edges
            .entry(node.backprop_id())
            .or_insert_with(|| vec![None; count]);
        slots[index] = Some(node);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backprop_id(&self) -> BackpropId {
        self.backprop_id
    }

    /// One more than the highest rank among the tracked inputs.
    pub fn rank(&self) -> usize {
        self.rank.get()
    }

    pub fn input_count(&self) -> usize {
        self.input_array_nodes.borrow().len()
    }

    pub fn output_count(&self) -> usize {
        self.output_array_props.len()
    }

    pub fn input_array_node(&self, index: usize) -> Option<Rc<ArrayNode>> {
        self.input_array_nodes.borrow().get(index).cloned().flatten()
    }

    pub fn input_array_nodes(&self) -> Vec<Option<Rc<ArrayNode>>> {
        self.input_array_nodes.borrow().clone()
    }

    /// The output array node, if it is still alive.
    pub fn output_array_node(&self, index: usize) -> Option<Rc<ArrayNode>> {
        self.output_array_nodes
            .borrow()
            .get(index)
            .and_then(Weak::upgrade)
    }

    pub fn output_array_props(&self, index: usize) -> &ArrayProps {
        &self.output_array_props[index]
    }

    pub fn backward_entry_count(&self) -> usize {
        self.backward_entries.borrow().len()
    }

    pub(crate) fn backward_entries(&self) -> Vec<BackwardEntry> {
        self.backward_entries.borrow().clone()
    }

    /// Nodes of input `index` on outer backprop ids, outermost first.
    pub fn outer_graphs_input_array_nodes(&self, index: usize) -> Vec<Rc<ArrayNode>> {
        Self::outer_nodes_at(&self.outer_graphs_input_array_nodes, index)
    }

    /// Nodes of output `index` on outer backprop ids, outermost first.
    pub fn outer_graphs_output_array_nodes(&self, index: usize) -> Vec<Rc<ArrayNode>> {
        Self::outer_nodes_at(&self.outer_graphs_output_array_nodes, index)
    }

    fn outer_nodes_at(
        edges: &RefCell<BTreeMap<BackpropId, Vec<Option<Rc<ArrayNode>>>>>,
        index: usize,
    ) -> Vec<Rc<ArrayNode>> {
        edges
            .borrow()
            .values()
            .filter_map(|slots| slots.get(index).cloned().flatten())
            .collect()
    }

    /// Sever the node from the graph: its outputs lose their creator and
    /// everything the node owned is released.
    pub(crate) fn unchain(&self) {
        for weak in self.output_array_nodes.borrow().iter() {
            if let Some(node) = weak.upgrade() {
                node.set_creator_op_node(None);
            }
        }
        self.input_array_nodes
            .borrow_mut()
            .iter_mut()
            .for_each(|slot| *slot = None);
        self.backward_entries.borrow_mut().clear();
        self.outer_graphs_input_array_nodes.borrow_mut().clear();
        self.outer_graphs_output_array_nodes.borrow_mut().clear();
    }
}

impl fmt::Debug for OpNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpNode")
            .field("name", &self.name)
            .field("backprop_id", &self.backprop_id.ordinal())
            .field("rank", &self.rank.get())
            .field("inputs", &self.input_count())
            .field("outputs", &self.output_count())
            .field("backward_entries", &self.backward_entry_count())
            .finish()
    }
}
