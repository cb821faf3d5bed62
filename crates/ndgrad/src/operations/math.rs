//! Element-wise math functions.

use super::arithmetic::{divide, multiply, multiply_scalar};
use crate::array::Array;
use crate::autodiff::BackwardBuilder;
use crate::backend::{KernelBackend, NativeBackend};
use crate::error::GradError;

/// Element-wise `e^x`.
///
/// # Example
///
/// ```
/// use ndgrad::operations::exp;
/// use ndgrad::{Array, Context};
///
/// let device = Context::new().native_device();
/// let x = Array::from_vec(vec![0.0, 1.0], &[2], &device).unwrap();
/// let y = exp(&x).unwrap().to_vec();
/// assert_eq!(y[0], 1.0);
/// assert!((y[1] - std::f64::consts::E).abs() < 1e-12);
/// ```
pub fn exp(x: &Array) -> Result<Array, GradError> {
    let out = NativeBackend::unary(x, f64::exp);

    let builder = BackwardBuilder::new("exp", &[x], &[&out])?;
    let target = builder.create_target(&[0])?;
    if target.is_definition_required() {
        let out_tok = builder.retain_output(&out)?;
        target.define(move |ctx| {
            let gy = ctx.output_grad(0)?;
            let out = ctx.get_retained_output(&out_tok)?;
            ctx.set_input_grad(0, multiply(&gy, &out)?)
        });
    }
    builder.finalize()?;
    Ok(out)
}

/// Element-wise natural logarithm.
pub fn log(x: &Array) -> Result<Array, GradError> {
    let out = NativeBackend::unary(x, f64::ln);

    let builder = BackwardBuilder::new("log", &[x], &[&out])?;
    let target = builder.create_target(&[0])?;
    if target.is_definition_required() {
        let x_tok = builder.retain_input(0)?;
        target.define(move |ctx| {
            let gy = ctx.output_grad(0)?;
            let x = ctx.get_retained_input(&x_tok)?;
            ctx.set_input_grad(0, divide(&gy, &x)?)
        });
    }
    builder.finalize()?;
    Ok(out)
}

/// Element-wise `x^2`.
pub fn square(x: &Array) -> Result<Array, GradError> {
    let out = NativeBackend::unary(x, |v| v * v);

    let builder = BackwardBuilder::new("square", &[x], &[&out])?;
    let target = builder.create_target(&[0])?;
    if target.is_definition_required() {
        let x_tok = builder.retain_input(0)?;
        target.define(move |ctx| {
            let gy = ctx.output_grad(0)?;
            let x = ctx.get_retained_input(&x_tok)?;
            ctx.set_input_grad(0, multiply_scalar(&multiply(&gy, &x)?, 2.0)?)
        });
    }
    builder.finalize()?;
    Ok(out)
}

/// Element-wise square root.
pub fn sqrt(x: &Array) -> Result<Array, GradError> {
    let out = NativeBackend::unary(x, f64::sqrt);

    let builder = BackwardBuilder::new("sqrt", &[x], &[&out])?;
    let target = builder.create_target(&[0])?;
    if target.is_definition_required() {
        let out_tok = builder.retain_output(&out)?;
        target.define(move |ctx| {
            let gy = ctx.output_grad(0)?;
            let out = ctx.get_retained_output(&out_tok)?;
            ctx.set_input_grad(0, divide(&gy, &multiply_scalar(&out, 2.0)?)?)
        });
    }
    builder.finalize()?;
    Ok(out)
}
