//! Array nodes: the per-(array, backprop id) participants of a graph.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use super::gradient::GradientHolder;
use super::op_node::OpNode;
use crate::array::{Array, ArrayBody};
use crate::context::BackpropId;
use crate::device::Device;
use crate::dtype::DType;
use crate::error::GradError;

/// Shape, dtype and device recorded for an array that may no longer exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayProps {
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub device: Device,
}

impl ArrayProps {
    pub fn of(array: &Array) -> Self {
        Self {
            shape: array.shape().to_vec(),
            dtype: array.dtype(),
            device: array.device().clone(),
        }
    }
}

/// Node of one array on one backprop id.
///
/// The body owns its nodes; a node only refers back to its body weakly. A
/// node owns its creator [`OpNode`], which in turn owns the nodes of its
/// inputs, so ownership always points from later values to earlier ones.
pub struct ArrayNode {
    props: ArrayProps,
    backprop_id: BackpropId,
    body: RefCell<Weak<ArrayBody>>,
    creator_op_node: RefCell<Option<Rc<OpNode>>>,
    grad: GradientHolder,
}

impl ArrayNode {
    pub(crate) fn new(
        shape: &[usize],
        dtype: DType,
        device: &Device,
        backprop_id: BackpropId,
    ) -> Rc<Self> {
        Rc::new(Self {
            props: ArrayProps {
                shape: shape.to_vec(),
                dtype,
                device: device.clone(),
            },
            backprop_id,
            body: RefCell::new(Weak::new()),
            creator_op_node: RefCell::new(None),
            grad: GradientHolder::new(),
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.props.shape
    }

    pub fn dtype(&self) -> DType {
        self.props.dtype
    }

    pub fn device(&self) -> &Device {
        &self.props.device
    }

    pub fn props(&self) -> &ArrayProps {
        &self.props
    }

    pub fn backprop_id(&self) -> BackpropId {
        self.backprop_id
    }

    /// Length of the longest creator chain below this node; 0 for a leaf.
    pub fn rank(&self) -> usize {
        self.creator_op_node
            .borrow()
            .as_ref()
            .map_or(0, |op_node| op_node.rank())
    }

    pub fn creator_op_node(&self) -> Option<Rc<OpNode>> {
        self.creator_op_node.borrow().clone()
    }

    pub fn has_creator(&self) -> bool {
        self.creator_op_node.borrow().is_some()
    }

    pub(crate) fn set_creator_op_node(&self, op_node: Option<Rc<OpNode>>) {
        *self.creator_op_node.borrow_mut() = op_node;
    }

    /// The owning body, if it is still alive.
    pub fn body(&self) -> Option<Rc<ArrayBody>> {
        self.body.borrow().upgrade()
    }

    pub(crate) fn set_body(&self, body: Weak<ArrayBody>) {
        *self.body.borrow_mut() = body;
    }

    /// An array handle to the owning body, if it is still alive.
    pub fn array(&self) -> Option<Array> {
        self.body().map(Array::from_body)
    }

    pub fn grad(&self) -> &GradientHolder {
        &self.grad
    }
}

impl fmt::Debug for ArrayNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayNode")
            .field("shape", &self.props.shape)
            .field("dtype", &self.props.dtype)
            .field("backprop_id", &self.backprop_id.ordinal())
            .field("rank", &self.rank())
            .field("has_grad", &self.grad.is_some())
            .finish()
    }
}

/// Check that `grad` can be the gradient of an array with the given
/// properties.
pub(crate) fn validate_gradient(
    shape: &[usize],
    dtype: DType,
    device: &Device,
    grad: &Array,
) -> Result<(), GradError> {
    if grad.shape() != shape {
        return Err(GradError::DimensionMismatch {
            expected: shape.to_vec(),
            actual: grad.shape().to_vec(),
        });
    }
    if grad.dtype() != dtype {
        return Err(GradError::DTypeMismatch {
            lhs: dtype,
            rhs: grad.dtype(),
        });
    }
    if grad.device() != device {
        return Err(GradError::DeviceMismatch {
            lhs: device.name(),
            rhs: grad.device().name(),
        });
    }
    Ok(())
}
