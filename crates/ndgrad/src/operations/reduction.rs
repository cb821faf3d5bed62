//! Reductions and their adjoint broadcasts.

use super::manipulation::reshape;
use crate::array::Array;
use crate::autodiff::BackwardBuilder;
use crate::backend::{KernelBackend, NativeBackend};
use crate::error::GradError;

/// Sum of all elements, as a 0-dimensional array.
///
/// # Example
///
/// ```
/// use ndgrad::operations::sum;
/// use ndgrad::{Array, Context};
///
/// let device = Context::new().native_device();
/// let x = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2], &device).unwrap();
/// assert_eq!(sum(&x).unwrap().item().unwrap(), 10.0);
/// ```
pub fn sum(x: &Array) -> Result<Array, GradError> {
    let out = NativeBackend::sum(x);

    let builder = BackwardBuilder::new("sum", &[x], &[&out])?;
    let target = builder.create_target(&[0])?;
    if target.is_definition_required() {
        let shape = x.shape().to_vec();
        target.define(move |ctx| {
            let gy = ctx.output_grad(0)?;
            ctx.set_input_grad(0, broadcast_to(&gy, &shape)?)
        });
    }
    builder.finalize()?;
    Ok(out)
}

/// Repeat the single element of `x` over `shape`.
///
/// # Errors
///
/// Returns [`GradError::NotAScalar`] if `x` has more than one element.
pub fn broadcast_to(x: &Array, shape: &[usize]) -> Result<Array, GradError> {
    let value = x.item()?;
    let out = NativeBackend::fill(shape, x.dtype(), x.device(), value);

    let builder = BackwardBuilder::new("broadcast_to", &[x], &[&out])?;
    let target = builder.create_target(&[0])?;
    if target.is_definition_required() {
        let x_shape = x.shape().to_vec();
        target.define(move |ctx| {
            let gy = ctx.output_grad(0)?;
            ctx.set_input_grad(0, reshape(&sum(&gy)?, &x_shape)?)
        });
    }
    builder.finalize()?;
    Ok(out)
}
