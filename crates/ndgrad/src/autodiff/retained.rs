//! Retained input and output tokens.
//!
//! A backward function must not capture the arrays of its own operation:
//! an output captured by the function would own its array node, which owns
//! the op node, which owns the function. Instead it captures a token that
//! records where the array sits in the operation and how to rebuild it, and
//! resolves the token through the [`BackwardContext`](super::BackwardContext)
//! when it runs.

use crate::array::Array;
use crate::device::Device;
use crate::dtype::DType;
use crate::storage::DataBuffer;

/// Data needed to rebuild an array whose body has died.
#[derive(Debug, Clone)]
pub(crate) struct ArrayParams {
    pub(crate) shape: Vec<usize>,
    pub(crate) dtype: DType,
    pub(crate) device: Device,
    pub(crate) data: DataBuffer,
    pub(crate) offset: usize,
}

impl ArrayParams {
    fn of(array: &Array) -> Self {
        Self {
            shape: array.shape().to_vec(),
            dtype: array.dtype(),
            device: array.device().clone(),
            data: array.data().clone(),
            offset: array.offset(),
        }
    }

    /// A new body over the recorded buffer, not attached to any graph.
    pub(crate) fn rebuild(&self) -> Array {
        Array::from_parts(
            &self.shape,
            self.dtype,
            &self.device,
            self.data.clone(),
            self.offset,
        )
    }
}

/// Handle to an operation input kept for its backward function.
#[derive(Debug, Clone)]
pub struct RetainedInputToken {
    index: usize,
    params: ArrayParams,
}

impl RetainedInputToken {
    pub(crate) fn new(index: usize, array: &Array) -> Self {
        Self {
            index,
            params: ArrayParams::of(array),
        }
    }

    /// Position among the operation's inputs.
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn params(&self) -> &ArrayParams {
        &self.params
    }
}

/// Handle to an operation output kept for its backward function.
#[derive(Debug, Clone)]
pub struct RetainedOutputToken {
    index: usize,
    params: ArrayParams,
}

impl RetainedOutputToken {
    pub(crate) fn new(index: usize, array: &Array) -> Self {
        Self {
            index,
            params: ArrayParams::of(array),
        }
    }

    /// Position among the operation's outputs.
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn params(&self) -> &ArrayParams {
        &self.params
    }
}
