//! Integration tests for the autodiff engine.
//!
//! Tests graph construction, backward traversal and gradient accumulation,
//! with numerical gradient checks.

use std::cell::RefCell;
use std::rc::Rc;

use approx::assert_relative_eq;
use ndgrad::autodiff::{BackwardBuilder, DoubleBackpropOption, backward, grad};
use ndgrad::operations::{
    add, add_scalar, concatenate, divide, exp, log, multiply, multiply_scalar, split, square,
    subtract, sum,
};
use ndgrad::{Array, BackpropScope, Context, DType, Device, GradError};
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Compute numerical gradient using central difference.
///
/// grad_i ≈ (f(x + eps*e_i) - f(x - eps*e_i)) / (2*eps)
fn numerical_gradient<F>(f: F, x: &[f64], eps: f64) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64,
{
    let mut grad = vec![0.0; x.len()];
    let mut x_plus = x.to_vec();
    let mut x_minus = x.to_vec();

    for i in 0..x.len() {
        x_plus[i] = x[i] + eps;
        x_minus[i] = x[i] - eps;

        let f_plus = f(&x_plus);
        let f_minus = f(&x_minus);
        grad[i] = (f_plus - f_minus) / (2.0 * eps);

        x_plus[i] = x[i];
        x_minus[i] = x[i];
    }
    grad
}

fn leaf(value: f64, device: &Device) -> Array {
    let a = Array::scalar(value, device);
    a.require_grad(None).unwrap();
    a
}

fn grad_value(a: &Array) -> f64 {
    a.grad(None).unwrap().unwrap().item().unwrap()
}

#[test]
fn test_chain_rule() {
    let ctx = Context::new();
    let d = ctx.native_device();
    let x = leaf(2.0, &d);
    let y = leaf(3.0, &d);

    // z = x * (x + y)
    let z = multiply(&x, &add(&x, &y).unwrap()).unwrap();
    assert_eq!(z.item().unwrap(), 10.0);
    backward(&[&z], None, DoubleBackpropOption::Disable).unwrap();

    assert_eq!(grad_value(&x), 7.0);
    assert_eq!(grad_value(&y), 2.0);
}

#[test]
fn test_same_input_twice() {
    let ctx = Context::new();
    let a = leaf(5.0, &ctx.native_device());
    let y = add(&a, &a).unwrap();
    y.backward(None, DoubleBackpropOption::Disable).unwrap();
    assert_eq!(grad_value(&a), 2.0);
}

#[test]
fn test_gradients_accumulate_across_passes() {
    let ctx = Context::new();
    let x = leaf(3.0, &ctx.native_device());
    for _ in 0..2 {
        square(&x)
            .unwrap()
            .backward(None, DoubleBackpropOption::Disable)
            .unwrap();
    }
    assert_eq!(grad_value(&x), 12.0);
}

#[test]
fn test_multi_output_backward() {
    let ctx = Context::new();
    let d = ctx.native_device();
    let x = Array::from_vec(vec![3.0, 7.0], &[2], &d).unwrap();
    x.require_grad(None).unwrap();

    let parts = split(&x, &[1, 1]).unwrap();
    // y = 3 * p0 * p1
    let y = sum(&multiply_scalar(&multiply(&parts[0], &parts[1]).unwrap(), 3.0).unwrap()).unwrap();
    y.backward(None, DoubleBackpropOption::Disable).unwrap();

    assert_eq!(x.grad(None).unwrap().unwrap().to_vec(), vec![21.0, 9.0]);
}

#[test]
fn test_multiple_outputs_seeded_together() {
    let ctx = Context::new();
    let d = ctx.native_device();
    let a = leaf(2.0, &d);
    let b = leaf(3.0, &d);

    let z = multiply(&a, &b).unwrap();
    let y1 = multiply(&a, &z).unwrap();
    let y2 = multiply(&b, &z).unwrap();
    backward(&[&y1, &y2], None, DoubleBackpropOption::Disable).unwrap();

    assert_eq!(grad_value(&a), 21.0);
    assert_eq!(grad_value(&b), 16.0);
    // Requested outputs keep their seeds; the shared intermediate does not.
    assert_eq!(grad_value(&y1), 1.0);
    assert!(z.grad(None).unwrap().is_none());
}

#[test]
fn test_graphs_are_isolated() {
    let ctx = Context::new();
    let d = ctx.native_device();
    let scope = BackpropScope::new(&ctx, "inner");
    let inner = scope.backprop_id();

    let x = Array::scalar(3.0, &d);
    x.require_grad(None).unwrap();
    x.require_grad(Some(inner)).unwrap();
    let w = Array::scalar(5.0, &d);
    w.require_grad(Some(inner)).unwrap();

    let y = multiply(&x, &w).unwrap();
    assert!(y.is_grad_required(None).unwrap());
    assert!(y.is_grad_required(Some(inner)).unwrap());

    backward(&[&y], Some(inner), DoubleBackpropOption::Disable).unwrap();
    assert_eq!(x.grad(Some(inner)).unwrap().unwrap().item().unwrap(), 5.0);
    assert_eq!(w.grad(Some(inner)).unwrap().unwrap().item().unwrap(), 3.0);
    assert!(x.grad(None).unwrap().is_none());

    // The outer graph is still intact.
    backward(&[&y], None, DoubleBackpropOption::Disable).unwrap();
    assert_eq!(grad_value(&x), 5.0);
}

#[test]
fn test_disable_releases_graph() {
    let ctx = Context::new();
    let x = leaf(2.0, &ctx.native_device());
    let y = multiply(&x, &x).unwrap();
    let node = y.array_node(None).unwrap().unwrap();
    let op_node = node.creator_op_node().unwrap();

    y.backward(None, DoubleBackpropOption::Disable).unwrap();

    assert!(!node.has_creator());
    assert_eq!(op_node.backward_entry_count(), 0);
    assert!(op_node.input_array_node(0).is_none());
}

#[test]
fn test_enable_keeps_graph() {
    let ctx = Context::new();
    let x = leaf(2.0, &ctx.native_device());
    let y = multiply(&x, &x).unwrap();
    let node = y.array_node(None).unwrap().unwrap();

    y.backward(None, DoubleBackpropOption::Enable).unwrap();
    assert!(node.has_creator());
    let op_node = node.creator_op_node().unwrap();
    assert_eq!(op_node.backward_entry_count(), 2);
    assert_eq!(grad_value(&x), 4.0);

    // The graph can be traversed again.
    y.clear_grad(None).unwrap();
    y.backward(None, DoubleBackpropOption::Enable).unwrap();
    assert_eq!(grad_value(&x), 8.0);
}

#[test]
fn test_backward_on_untracked_array() {
    let ctx = Context::new();
    let y = Array::scalar(1.0, &ctx.native_device());
    let err = y.backward(None, DoubleBackpropOption::Disable).unwrap_err();
    assert!(matches!(err, GradError::Protocol(_)));
}

#[test]
fn test_backward_on_released_id() {
    let ctx = Context::new();
    let x = Array::scalar(1.0, &ctx.native_device());
    let id = {
        let scope = BackpropScope::new(&ctx, "temp");
        x.require_grad(Some(scope.backprop_id())).unwrap();
        scope.backprop_id()
    };
    assert!(matches!(
        x.backward(Some(id), DoubleBackpropOption::Disable),
        Err(GradError::BackpropIdReleased { .. })
    ));
}

#[test]
fn test_retain_output_rejects_other_arrays() {
    let ctx = Context::new();
    let d = ctx.native_device();
    let x = leaf(1.0, &d);
    let y = Array::scalar(2.0, &d);
    let other = Array::scalar(3.0, &d);

    let builder = BackwardBuilder::new("custom", &[&x], &[&y]).unwrap();
    assert!(matches!(
        builder.retain_output(&other),
        Err(GradError::Protocol(_))
    ));
    assert!(matches!(builder.retain_input(1), Err(GradError::Protocol(_))));
    builder.finalize().unwrap();
}

#[test]
fn test_builder_rejects_tracked_output() {
    let ctx = Context::new();
    let x = leaf(1.0, &ctx.native_device());
    assert!(matches!(
        BackwardBuilder::new("custom", &[], &[&x]),
        Err(GradError::Protocol(_))
    ));
}

#[test]
fn test_backward_function_error_is_propagated() {
    let ctx = Context::new();
    let d = ctx.native_device();
    let x = leaf(1.0, &d);
    let y = Array::scalar(1.0, &d);

    let builder = BackwardBuilder::new("failing", &[&x], &[&y]).unwrap();
    let target = builder.create_target(&[0]).unwrap();
    assert!(target.is_definition_required());
    target.define(|_ctx| Err(GradError::protocol("failing: no derivative")));
    builder.finalize().unwrap();

    let err = y.backward(None, DoubleBackpropOption::Disable).unwrap_err();
    assert!(matches!(err, GradError::Protocol(msg) if msg.contains("no derivative")));
}

#[test]
fn test_wrong_gradient_shape_is_rejected() {
    let ctx = Context::new();
    let d = ctx.native_device();
    let x = Array::from_vec(vec![1.0, 2.0], &[2], &d).unwrap();
    x.require_grad(None).unwrap();
    let y = x.copy();

    let builder = BackwardBuilder::new("bad_shape", &[&x], &[&y]).unwrap();
    let target = builder.create_target(&[0]).unwrap();
    target.define(|ctx| {
        let gy = ctx.output_grad(0)?;
        ctx.set_input_grad(0, sum(&gy)?)
    });
    builder.finalize().unwrap();

    assert!(matches!(
        y.backward(None, DoubleBackpropOption::Disable),
        Err(GradError::DimensionMismatch { .. })
    ));
}

/// Two outputs `[x, 2x]` whose backward function records every gradient
/// array it reads for the second output.
fn record_second_output_grads(x: &Array, seen: Rc<RefCell<Vec<Array>>>) -> (Array, Array) {
    let d = x.device();
    let values = x.to_vec();
    let y0 = Array::from_vec(values.clone(), x.shape(), d).unwrap();
    let y1 = Array::from_vec(values.iter().map(|v| 2.0 * v).collect(), x.shape(), d).unwrap();

    let builder = BackwardBuilder::new("fork", &[x], &[&y0, &y1]).unwrap();
    let target = builder.create_target(&[0]).unwrap();
    target.define(move |ctx| {
        let gy0 = ctx.output_grad(0)?;
        let first = ctx.output_grad(1)?;
        let second = ctx.output_grad(1)?;
        seen.borrow_mut().push(first.clone());
        seen.borrow_mut().push(second);
        ctx.set_input_grad(0, add(&gy0, &multiply_scalar(&first, 2.0)?)?)
    });
    builder.finalize().unwrap();
    (y0, y1)
}

#[test]
fn test_missing_output_grad_reads_as_stable_zeros() {
    let ctx = Context::new();
    let d = ctx.native_device();
    let x = Array::from_vec(vec![1.0, 2.0], &[2], &d).unwrap();
    x.require_grad(None).unwrap();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let (y0, y1) = record_second_output_grads(&x, Rc::clone(&seen));
    sum(&y0)
        .unwrap()
        .backward(None, DoubleBackpropOption::Disable)
        .unwrap();

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].is_same_body(&seen[1]));
    assert_eq!(seen[0].to_vec(), vec![0.0, 0.0]);
    // The zeros never reach the output's gradient holder.
    assert!(y1.grad(None).unwrap().is_none());
    assert_eq!(x.grad(None).unwrap().unwrap().to_vec(), vec![1.0, 1.0]);
}

#[test]
fn test_rank_orders_diamond() {
    let ctx = Context::new();
    let d = ctx.native_device();
    let x = leaf(0.5, &d);

    // x -> exp -> h1 --\
    //   \-> square -> h2 -> multiply -> h3 -> add -> y
    let h1 = exp(&x).unwrap();
    let h2 = square(&x).unwrap();
    let h3 = multiply_scalar(&h2, 3.0).unwrap();
    let y = add(&h1, &h3).unwrap();

    let rank = |a: &Array| a.array_node(None).unwrap().unwrap().rank();
    assert_eq!(rank(&x), 0);
    assert_eq!(rank(&h1), 1);
    assert_eq!(rank(&h2), 1);
    assert_eq!(rank(&h3), 2);
    assert_eq!(rank(&y), 3);

    y.backward(None, DoubleBackpropOption::Disable).unwrap();
    assert_relative_eq!(grad_value(&x), 0.5f64.exp() + 3.0, epsilon = 1e-12);
}

#[test]
fn test_grad_returns_none_for_unreached_input() {
    let ctx = Context::new();
    let d = ctx.native_device();
    let x = leaf(2.0, &d);
    let unused = leaf(1.0, &d);
    let y = square(&x).unwrap();
    let grads = grad(&[&y], &[&x, &unused], None, DoubleBackpropOption::Disable, None).unwrap();
    assert_eq!(grads[0].as_ref().unwrap().item().unwrap(), 4.0);
    assert!(grads[1].is_none());
}

#[test]
fn test_integer_output_is_not_tracked() {
    let ctx = Context::new();
    let d = ctx.native_device();
    let x = leaf(1.5, &d);
    let y = Array::from_vec_with_dtype(vec![1.0], &[], DType::Int32, &d).unwrap();

    let builder = BackwardBuilder::new("floor", &[&x], &[&y]).unwrap();
    let target = builder.create_target(&[0]).unwrap();
    assert!(!target.is_definition_required());
    builder.finalize().unwrap();
    assert!(!y.is_grad_required(None).unwrap());
}

fn loss(x: &Array, w: &Array) -> Result<Array, GradError> {
    // sum(log(x^2 + 1) * w - exp(w) / (x^2 + 1))
    let p = add_scalar(&square(x)?, 1.0)?;
    let lhs = multiply(&log(&p)?, w)?;
    let rhs = divide(&exp(w)?, &p)?;
    sum(&subtract(&lhs, &rhs)?)
}

#[test]
fn test_numerical_gradient_random_inputs() {
    let eps = 1e-6;
    let ctx = Context::new();
    let d = ctx.native_device();
    let mut rng = StdRng::seed_from_u64(42);
    let x_data = Array::random_normal_with_rng(&[2, 3], DType::Float64, &d, &mut rng).to_vec();
    let w_data = Array::random_normal_with_rng(&[2, 3], DType::Float64, &d, &mut rng).to_vec();

    let loss_x = |v: &[f64]| -> f64 {
        let x = Array::from_vec(v.to_vec(), &[2, 3], &d).unwrap();
        let w = Array::from_vec(w_data.clone(), &[2, 3], &d).unwrap();
        loss(&x, &w).unwrap().item().unwrap()
    };
    let loss_w = |v: &[f64]| -> f64 {
        let x = Array::from_vec(x_data.clone(), &[2, 3], &d).unwrap();
        let w = Array::from_vec(v.to_vec(), &[2, 3], &d).unwrap();
        loss(&x, &w).unwrap().item().unwrap()
    };
    let numerical_x = numerical_gradient(loss_x, &x_data, eps);
    let numerical_w = numerical_gradient(loss_w, &w_data, eps);

    let x = Array::from_vec(x_data.clone(), &[2, 3], &d).unwrap();
    let w = Array::from_vec(w_data.clone(), &[2, 3], &d).unwrap();
    x.require_grad(None).unwrap();
    w.require_grad(None).unwrap();
    loss(&x, &w)
        .unwrap()
        .backward(None, DoubleBackpropOption::Disable)
        .unwrap();

    let analytical_x = x.grad(None).unwrap().unwrap().to_vec();
    let analytical_w = w.grad(None).unwrap().unwrap().to_vec();
    for (analytical, numerical) in analytical_x.iter().zip(&numerical_x) {
        assert_relative_eq!(analytical, numerical, epsilon = 1e-5);
    }
    for (analytical, numerical) in analytical_w.iter().zip(&numerical_w) {
        assert_relative_eq!(analytical, numerical, epsilon = 1e-5);
    }
}

#[test]
fn test_numerical_gradient_split_concatenate() {
    let eps = 1e-6;
    let ctx = Context::new();
    let d = ctx.native_device();
    let mut rng = StdRng::seed_from_u64(7);
    let x_data = Array::random_uniform_with_rng(&[2, 4], DType::Float64, &d, &mut rng).to_vec();

    // Swap the halves along the last axis and weight them.
    let f = |x: &Array| -> Result<Array, GradError> {
        let parts = split(x, &[1, 3])?;
        let swapped = concatenate(&[&square(&parts[1])?, &parts[0]])?;
        let weights = Array::from_vec((1..=8).map(f64::from).collect(), &[2, 4], x.device())?;
        sum(&multiply(&swapped, &weights)?)
    };

    let numerical = numerical_gradient(
        |v| {
            let x = Array::from_vec(v.to_vec(), &[2, 4], &d).unwrap();
            f(&x).unwrap().item().unwrap()
        },
        &x_data,
        eps,
    );

    let x = Array::from_vec(x_data.clone(), &[2, 4], &d).unwrap();
    x.require_grad(None).unwrap();
    f(&x)
        .unwrap()
        .backward(None, DoubleBackpropOption::Disable)
        .unwrap();
    let analytical = x.grad(None).unwrap().unwrap().to_vec();
    for (a, n) in analytical.iter().zip(&numerical) {
        assert_relative_eq!(a, n, epsilon = 1e-5);
    }
}
