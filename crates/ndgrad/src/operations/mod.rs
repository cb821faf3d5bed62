//! Differentiable array operations.
//!
//! Every operation follows the same two steps:
//!
//! ```text
//! 1. Forward: compute output values through the kernel backend
//!     → never touches a graph
//!
//! 2. Record: BackwardBuilder over (inputs, outputs)
//!     → one Target per group of inputs sharing a backward function
//!     → retain the inputs/outputs the backward function reads
//!     → finalize
//! ```
//!
//! Backward functions are written with these same operations, so when the
//! backward pass keeps outer graphs alive the gradients become
//! differentiable themselves.

mod arithmetic;
mod manipulation;
mod math;
mod reduction;

pub use arithmetic::{
    add, add_scalar, divide, multiply, multiply_add, multiply_scalar, negative, subtract,
};
pub use manipulation::{concatenate, copy, reshape, split};
pub use math::{exp, log, sqrt, square};
pub use reduction::{broadcast_to, sum};

use crate::array::Array;
use crate::error::GradError;

/// Check that two operands agree in shape, dtype and device.
pub(crate) fn check_same_layout(a: &Array, b: &Array) -> Result<(), GradError> {
    if a.shape() != b.shape() {
        return Err(GradError::DimensionMismatch {
            expected: a.shape().to_vec(),
            actual: b.shape().to_vec(),
        });
    }
    if a.dtype() != b.dtype() {
        return Err(GradError::DTypeMismatch {
            lhs: a.dtype(),
            rhs: b.dtype(),
        });
    }
    if a.device() != b.device() {
        return Err(GradError::DeviceMismatch {
            lhs: a.device().name(),
            rhs: b.device().name(),
        });
    }
    Ok(())
}
