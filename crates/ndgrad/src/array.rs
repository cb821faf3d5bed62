//! Array values.
//!
//! An [`Array`] is a cheap handle to a shared [`ArrayBody`]. The body owns the
//! element buffer view (shape, strides, offset), the dtype, the device and,
//! for floating dtypes, one [`ArrayNode`] per backprop id the array takes part
//! in. Elements are stored in column-major order and every body views a
//! contiguous range of its buffer.
//!
//! # Example
//!
//! ```
//! use ndgrad::{Array, Context, DType};
//!
//! let ctx = Context::new();
//! let device = ctx.native_device();
//! let a = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], &device).unwrap();
//! assert_eq!(a.shape(), &[2, 3]);
//! assert_eq!(a.dtype(), DType::Float64);
//! assert_eq!(a.to_vec(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! ```

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::autodiff::{
    ArrayNode, BackwardBuilder, DoubleBackpropOption, backward, validate_gradient,
};
use crate::backend::{KernelBackend, NativeBackend};
use crate::backprop_mode::BackpropModeScope;
use crate::context::{BackpropId, Context};
use crate::device::Device;
use crate::dtype::DType;
use crate::error::{GradError, consistency_check};
use crate::storage::DataBuffer;
use crate::strides::{compute_strides, element_count};

/// Shared state behind one or more [`Array`] handles.
pub struct ArrayBody {
    shape: Vec<usize>,
    strides: Vec<usize>,
    dtype: DType,
    device: Device,
    data: DataBuffer,
    offset: usize,
    nodes: RefCell<Vec<Rc<ArrayNode>>>,
}

impl ArrayBody {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of array nodes, one per backprop id the body is tracked on.
    pub fn node_count(&self) -> usize {
        self.nodes.borrow().len()
    }

    /// Array node of the body on `backprop_id`, if any.
    pub(crate) fn find_node(&self, backprop_id: BackpropId) -> Option<Rc<ArrayNode>> {
        let node = self
            .nodes
            .borrow()
            .iter()
            .find(|node| node.backprop_id() == backprop_id)
            .cloned()?;
        self.check_owned(&node);
        Some(node)
    }

    pub(crate) fn nodes(&self) -> Vec<Rc<ArrayNode>> {
        let nodes = self.nodes.borrow().clone();
        for node in &nodes {
            self.check_owned(node);
        }
        nodes
    }

    /// A node held by a body must point back at that body while it lives.
    fn check_owned(&self, node: &ArrayNode) {
        consistency_check!(
            node.body()
                .is_none_or(|body| std::ptr::eq(Rc::as_ptr(&body), self)),
            "array node refers to a different body"
        );
    }

    pub(crate) fn has_nodes(&self) -> bool {
        !self.nodes.borrow().is_empty()
    }

    /// Attach `node`, keeping nodes ordered by backprop id.
    pub(crate) fn add_node(&self, node: Rc<ArrayNode>) {
        consistency_check!(
            self.dtype.is_float(),
            "array node attached to a {} body",
            self.dtype
        );
        let mut nodes = self.nodes.borrow_mut();
        consistency_check!(
            nodes.iter().all(|n| n.backprop_id() != node.backprop_id()),
            "duplicate array node for one backprop id"
        );
        let pos = nodes
            .iter()
            .position(|n| n.backprop_id() > node.backprop_id())
            .unwrap_or(nodes.len());
        nodes.insert(pos, node);
    }
}

/// Handle to an n-dimensional array.
///
/// Cloning the handle aliases the same body, so gradient state is shared
/// between clones.
#[derive(Clone)]
pub struct Array {
    body: Rc<ArrayBody>,
}

impl Array {
    /// Build an array over `len(shape)` elements of `data` starting at `offset`.
    pub(crate) fn from_parts(
        shape: &[usize],
        dtype: DType,
        device: &Device,
        data: DataBuffer,
        offset: usize,
    ) -> Self {
        consistency_check!(
            offset + element_count(shape) <= data.len(),
            "array view exceeds its buffer"
        );
        Self {
            body: Rc::new(ArrayBody {
                shape: shape.to_vec(),
                strides: compute_strides(shape),
                dtype,
                device: device.clone(),
                data,
                offset,
                nodes: RefCell::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn from_body(body: Rc<ArrayBody>) -> Self {
        Self { body }
    }

    /// Create an array from owned values, casting them through `dtype`.
    pub(crate) fn from_values(
        mut data: Vec<f64>,
        shape: &[usize],
        dtype: DType,
        device: &Device,
    ) -> Self {
        if dtype != DType::Float64 {
            data.iter_mut().for_each(|x| *x = dtype.cast(*x));
        }
        Self::from_parts(shape, dtype, device, DataBuffer::from_vec(data), 0)
    }

    /// Create a `float64` array from column-major data.
    pub fn from_vec(data: Vec<f64>, shape: &[usize], device: &Device) -> Result<Self, GradError> {
        Self::from_vec_with_dtype(data, shape, DType::Float64, device)
    }

    /// Create an array of the given dtype from column-major data.
    ///
    /// # Errors
    ///
    /// Returns [`GradError::ShapeMismatch`] if `data.len()` does not equal the
    /// number of elements of `shape`.
    pub fn from_vec_with_dtype(
        data: Vec<f64>,
        shape: &[usize],
        dtype: DType,
        device: &Device,
    ) -> Result<Self, GradError> {
        let expected = element_count(shape);
        if data.len() != expected {
            return Err(GradError::ShapeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self::from_values(data, shape, dtype, device))
    }

    /// A 0-dimensional `float64` array.
    pub fn scalar(value: f64, device: &Device) -> Self {
        Self::from_values(vec![value], &[], DType::Float64, device)
    }

    /// An array filled with `value`.
    pub fn full(shape: &[usize], value: f64, dtype: DType, device: &Device) -> Self {
        NativeBackend::fill(shape, dtype, device, value)
    }

    /// A zero-filled array.
    pub fn zeros(shape: &[usize], dtype: DType, device: &Device) -> Self {
        Self::full(shape, 0.0, dtype, device)
    }

    /// A one-filled array.
    pub fn ones(shape: &[usize], dtype: DType, device: &Device) -> Self {
        Self::full(shape, 1.0, dtype, device)
    }

    /// Zeros with the shape, dtype and device of `other`.
    pub fn zeros_like(other: &Array) -> Self {
        Self::zeros(other.shape(), other.dtype(), other.device())
    }

    /// Ones with the shape, dtype and device of `other`.
    pub fn ones_like(other: &Array) -> Self {
        Self::ones(other.shape(), other.dtype(), other.device())
    }

    pub fn shape(&self) -> &[usize] {
        &self.body.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.body.strides
    }

    pub fn ndim(&self) -> usize {
        self.body.shape.len()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        element_count(&self.body.shape)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        self.body.dtype
    }

    pub fn device(&self) -> &Device {
        &self.body.device
    }

    pub fn context(&self) -> &Context {
        self.body.device.context()
    }

    /// Offset of the first element in the backing buffer.
    pub fn offset(&self) -> usize {
        self.body.offset
    }

    pub(crate) fn body(&self) -> &Rc<ArrayBody> {
        &self.body
    }

    pub(crate) fn data(&self) -> &DataBuffer {
        &self.body.data
    }

    /// Elements in column-major order.
    pub fn to_vec(&self) -> Vec<f64> {
        let data = self.body.data.borrow();
        data[self.body.offset..self.body.offset + self.len()].to_vec()
    }

    /// The single element of a one-element array.
    pub fn item(&self) -> Result<f64, GradError> {
        if self.len() != 1 {
            return Err(GradError::NotAScalar {
                shape: self.shape().to_vec(),
            });
        }
        Ok(self.body.data.borrow()[self.body.offset])
    }

    /// Whether both handles alias one body.
    pub fn is_same_body(&self, other: &Array) -> bool {
        Rc::ptr_eq(&self.body, &other.body)
    }

    /// Whether both arrays view the same buffer.
    pub fn shares_storage_with(&self, other: &Array) -> bool {
        self.body.data.ptr_eq(&other.body.data)
    }

    /// Whether this handle is the only reference to an untracked body with
    /// its own buffer, so that writing into it is unobservable.
    pub(crate) fn is_exclusive(&self) -> bool {
        Rc::strong_count(&self.body) == 1 && self.body.data.is_unique() && !self.body.has_nodes()
    }

    /// A fresh array with the same values, not connected to any graph.
    pub fn copy(&self) -> Array {
        Self::from_parts(
            self.shape(),
            self.dtype(),
            self.device(),
            DataBuffer::from_vec(self.to_vec()),
            0,
        )
    }

    /// Array node of this array on `backprop_id` (the default id when `None`).
    pub fn array_node(
        &self,
        backprop_id: Option<BackpropId>,
    ) -> Result<Option<Rc<ArrayNode>>, GradError> {
        let backprop_id = self.context().resolve_backprop_id(backprop_id)?;
        Ok(self.body.find_node(backprop_id))
    }

    /// Start tracking this array on `backprop_id`.
    ///
    /// Does nothing if the array is already tracked there.
    ///
    /// # Errors
    ///
    /// Returns [`GradError::NonFloatGrad`] for non-floating dtypes.
    pub fn require_grad(&self, backprop_id: Option<BackpropId>) -> Result<&Self, GradError> {
        let backprop_id = self.context().resolve_backprop_id(backprop_id)?;
        if !self.dtype().is_float() {
            return Err(GradError::NonFloatGrad {
                dtype: self.dtype(),
            });
        }
        if self.body.find_node(backprop_id).is_none() {
            let node = ArrayNode::new(self.shape(), self.dtype(), self.device(), backprop_id);
            node.set_body(Rc::downgrade(&self.body));
            self.body.add_node(node);
        }
        Ok(self)
    }

    /// Whether the array carries a node on `backprop_id`.
    pub fn is_grad_required(&self, backprop_id: Option<BackpropId>) -> Result<bool, GradError> {
        Ok(self.array_node(backprop_id)?.is_some())
    }

    /// Whether operations on this array currently extend the graph of
    /// `backprop_id`, taking the mode scopes of the context into account.
    pub fn is_backprop_required(&self, backprop_id: Option<BackpropId>) -> Result<bool, GradError> {
        let backprop_id = self.context().resolve_backprop_id(backprop_id)?;
        Ok(self.body.find_node(backprop_id).is_some()
            && self.context().is_backprop_required(backprop_id))
    }

    /// Gradient accumulated on `backprop_id`, if any.
    pub fn grad(&self, backprop_id: Option<BackpropId>) -> Result<Option<Array>, GradError> {
        Ok(self
            .array_node(backprop_id)?
            .and_then(|node| node.grad().get()))
    }

    /// Replace the gradient stored on `backprop_id`.
    pub fn set_grad(&self, grad: Array, backprop_id: Option<BackpropId>) -> Result<(), GradError> {
        let node = self.tracked_node(backprop_id, "set_grad")?;
        validate_gradient(self.shape(), self.dtype(), self.device(), &grad)?;
        node.grad().set(grad);
        Ok(())
    }

    /// Drop the gradient stored on `backprop_id`.
    pub fn clear_grad(&self, backprop_id: Option<BackpropId>) -> Result<(), GradError> {
        self.tracked_node(backprop_id, "clear_grad")?.grad().clear();
        Ok(())
    }

    fn tracked_node(
        &self,
        backprop_id: Option<BackpropId>,
        what: &str,
    ) -> Result<Rc<ArrayNode>, GradError> {
        self.array_node(backprop_id)?.ok_or_else(|| {
            GradError::protocol(format!("{what}: array is not tracked on this backprop id"))
        })
    }

    /// Run backpropagation from this array alone.
    pub fn backward(
        &self,
        backprop_id: Option<BackpropId>,
        option: DoubleBackpropOption,
    ) -> Result<(), GradError> {
        backward(&[self], backprop_id, option)
    }

    /// A view of this array cut off from the graphs of `backprop_ids` (every
    /// graph when empty). Graphs not listed stay connected through an identity
    /// backward function.
    pub fn as_grad_stopped(&self, backprop_ids: &[BackpropId]) -> Result<Array, GradError> {
        let out = Self::from_parts(
            self.shape(),
            self.dtype(),
            self.device(),
            self.data().clone(),
            self.offset(),
        );
        let _scope = BackpropModeScope::no_backprop(self.context(), backprop_ids)?;
        if !self.body.has_nodes() || backprop_ids.is_empty() {
            return Ok(out);
        }
        let builder = BackwardBuilder::new("as_grad_stopped", &[self], &[&out])?;
        let target = builder.create_target(&[0])?;
        if target.is_definition_required() {
            target.define(|ctx| {
                let gy = ctx.output_grad(0)?;
                ctx.set_input_grad(0, gy)
            });
        }
        builder.finalize()?;
        Ok(out)
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Array")
            .field("shape", &self.shape())
            .field("dtype", &self.dtype())
            .field("device", &self.device().name())
            .field("data", &self.to_vec())
            .field("backprop_ids", &self.body.node_count())
            .finish()
    }
}
