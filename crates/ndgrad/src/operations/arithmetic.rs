//! Element-wise arithmetic.

use super::check_same_layout;
use crate::array::Array;
use crate::autodiff::BackwardBuilder;
use crate::backend::{KernelBackend, NativeBackend};
use crate::error::GradError;

/// Element-wise `a + b`.
///
/// # Example
///
/// ```
/// use ndgrad::operations::add;
/// use ndgrad::{Array, Context};
///
/// let device = Context::new().native_device();
/// let a = Array::from_vec(vec![1.0, 2.0], &[2], &device).unwrap();
/// let b = Array::from_vec(vec![10.0, 20.0], &[2], &device).unwrap();
/// assert_eq!(add(&a, &b).unwrap().to_vec(), vec![11.0, 22.0]);
/// ```
pub fn add(a: &Array, b: &Array) -> Result<Array, GradError> {
    check_same_layout(a, b)?;
    let out = NativeBackend::binary(a, b, |x, y| x + y);

    let builder = BackwardBuilder::new("add", &[a, b], &[&out])?;
    let target = builder.create_target(&[0, 1])?;
    if target.is_definition_required() {
        target.define(|ctx| {
            let gy = ctx.output_grad(0)?;
            ctx.set_input_grad(0, gy.clone())?;
            ctx.set_input_grad(1, gy)
        });
    }
    builder.finalize()?;
    Ok(out)
}

/// Element-wise `a - b`.
pub fn subtract(a: &Array, b: &Array) -> Result<Array, GradError> {
    check_same_layout(a, b)?;
    let out = NativeBackend::binary(a, b, |x, y| x - y);

    let builder = BackwardBuilder::new("subtract", &[a, b], &[&out])?;
    let target = builder.create_target(&[0, 1])?;
    if target.is_definition_required() {
        target.define(|ctx| {
            let gy = ctx.output_grad(0)?;
            if ctx.is_input_grad_required(1) {
                ctx.set_input_grad(1, negative(&gy)?)?;
            }
            ctx.set_input_grad(0, gy)
        });
    }
    builder.finalize()?;
    Ok(out)
}

/// Element-wise `a * b`.
pub fn multiply(a: &Array, b: &Array) -> Result<Array, GradError> {
    check_same_layout(a, b)?;
    let out = NativeBackend::binary(a, b, |x, y| x * y);

    let builder = BackwardBuilder::new("multiply", &[a, b], &[&out])?;
    let target = builder.create_target(&[0])?;
    if target.is_definition_required() {
        let b_tok = builder.retain_input(1)?;
        target.define(move |ctx| {
            let gy = ctx.output_grad(0)?;
            let b = ctx.get_retained_input(&b_tok)?;
            ctx.set_input_grad(0, multiply(&gy, &b)?)
        });
    }
    let target = builder.create_target(&[1])?;
    if target.is_definition_required() {
        let a_tok = builder.retain_input(0)?;
        target.define(move |ctx| {
            let gy = ctx.output_grad(0)?;
            let a = ctx.get_retained_input(&a_tok)?;
            ctx.set_input_grad(0, multiply(&gy, &a)?)
        });
    }
    builder.finalize()?;
    Ok(out)
}

/// Element-wise `a / b`.
pub fn divide(a: &Array, b: &Array) -> Result<Array, GradError> {
    check_same_layout(a, b)?;
    let out = NativeBackend::binary(a, b, |x, y| x / y);

    let builder = BackwardBuilder::new("divide", &[a, b], &[&out])?;
    let target = builder.create_target(&[0, 1])?;
    if target.is_definition_required() {
        let a_tok = builder.retain_input(0)?;
        let b_tok = builder.retain_input(1)?;
        target.define(move |ctx| {
            let gy = ctx.output_grad(0)?;
            let b = ctx.get_retained_input(&b_tok)?;
            let ga = divide(&gy, &b)?;
            if ctx.is_input_grad_required(1) {
                // d(a/b)/db = -a / b^2
                let a = ctx.get_retained_input(&a_tok)?;
                let gb = negative(&divide(&multiply(&ga, &a)?, &b)?)?;
                ctx.set_input_grad(1, gb)?;
            }
            ctx.set_input_grad(0, ga)
        });
    }
    builder.finalize()?;
    Ok(out)
}

/// Element-wise `-x`.
pub fn negative(x: &Array) -> Result<Array, GradError> {
    let out = NativeBackend::unary(x, |v| -v);

    let builder = BackwardBuilder::new("negative", &[x], &[&out])?;
    let target = builder.create_target(&[0])?;
    if target.is_definition_required() {
        target.define(|ctx| {
            let gy = ctx.output_grad(0)?;
            ctx.set_input_grad(0, negative(&gy)?)
        });
    }
    builder.finalize()?;
    Ok(out)
}

/// Element-wise `x + value`.
pub fn add_scalar(x: &Array, value: f64) -> Result<Array, GradError> {
    let out = NativeBackend::unary(x, |v| v + value);

    let builder = BackwardBuilder::new("add_scalar", &[x], &[&out])?;
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

/// Element-wise `x * value`.
pub fn multiply_scalar(x: &Array, value: f64) -> Result<Array, GradError> {
    let out = NativeBackend::unary(x, |v| v * value);

    let builder = BackwardBuilder::new("multiply_scalar", &[x], &[&out])?;
    let target = builder.create_target(&[0])?;
    if target.is_definition_required() {
        target.define(move |ctx| {
            let gy = ctx.output_grad(0)?;
            ctx.set_input_grad(0, multiply_scalar(&gy, value)?)
        });
    }
    builder.finalize()?;
    Ok(out)
}

/// Fused `a * b + c`.
///
/// The product and the addend are differentiated by separate backward
/// functions.
pub fn multiply_add(a: &Array, b: &Array, c: &Array) -> Result<Array, GradError> {
    check_same_layout(a, b)?;
    check_same_layout(a, c)?;
    let product = NativeBackend::binary(a, b, |x, y| x * y);
    let out = NativeBackend::binary(&product, c, |x, y| x + y);
    drop(product);

    let builder = BackwardBuilder::new("multiply_add", &[a, b, c], &[&out])?;
    let target = builder.create_target(&[0, 1])?;
    if target.is_definition_required() {
        let a_tok = builder.retain_input(0)?;
        let b_tok = builder.retain_input(1)?;
        target.define(move |ctx| {
            let gy = ctx.output_grad(0)?;
            if ctx.is_input_grad_required(0) {
                let b = ctx.get_retained_input(&b_tok)?;
                ctx.set_input_grad(0, multiply(&gy, &b)?)?;
            }
            if ctx.is_input_grad_required(1) {
                let a = ctx.get_retained_input(&a_tok)?;
                ctx.set_input_grad(1, multiply(&gy, &a)?)?;
            }
            Ok(())
        });
    }
    let target = builder.create_target(&[2])?;
    if target.is_definition_required() {
        target.define(|ctx| {
            let gy = ctx.output_grad(0)?;
            ctx.set_input_grad(0, gy)
        });
    }
    builder.finalize()?;
    Ok(out)
}
