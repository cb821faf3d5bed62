//! Shape manipulation: views, copies, splits and joins.
//!
//! Splits and joins work along the last axis. In column-major order that
//! axis varies slowest, so every piece is a contiguous range of the buffer
//! and `split` can return views.

use crate::array::Array;
use crate::autodiff::BackwardBuilder;
use crate::backend::{KernelBackend, NativeBackend};
use crate::error::GradError;
use crate::strides::{element_count, last_axis_block, with_last_axis};

/// A view of `x` with a new shape and the same elements.
///
/// # Errors
///
/// Returns [`GradError::ShapeMismatch`] if the element counts differ.
///
/// # Example
///
/// ```
/// use ndgrad::operations::reshape;
/// use ndgrad::{Array, Context};
///
/// let device = Context::new().native_device();
/// let x = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], &device).unwrap();
/// let y = reshape(&x, &[3, 2]).unwrap();
/// assert_eq!(y.shape(), &[3, 2]);
/// assert!(y.shares_storage_with(&x));
/// ```
pub fn reshape(x: &Array, shape: &[usize]) -> Result<Array, GradError> {
    if element_count(shape) != x.len() {
        return Err(GradError::ShapeMismatch {
            expected: x.len(),
            actual: element_count(shape),
        });
    }
    let out = Array::from_parts(shape, x.dtype(), x.device(), x.data().clone(), x.offset());

    let builder = BackwardBuilder::new("reshape", &[x], &[&out])?;
    let target = builder.create_target(&[0])?;
    if target.is_definition_required() {
        let x_shape = x.shape().to_vec();
        target.define(move |ctx| {
            let gy = ctx.output_grad(0)?;
            ctx.set_input_grad(0, reshape(&gy, &x_shape)?)
        });
    }
    builder.finalize()?;
    Ok(out)
}

/// A copy of `x` in a fresh buffer that stays connected to the graphs of `x`.
pub fn copy(x: &Array) -> Result<Array, GradError> {
    let out = x.copy();

    let builder = BackwardBuilder::new("copy", &[x], &[&out])?;
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

/// Split `x` along its last axis into pieces of the given lengths.
///
/// The pieces are views of `x`.
///
/// # Example
///
/// ```
/// use ndgrad::operations::split;
/// use ndgrad::{Array, Context};
///
/// let device = Context::new().native_device();
/// let x = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], &device).unwrap();
/// let parts = split(&x, &[1, 2]).unwrap();
/// assert_eq!(parts[0].to_vec(), vec![1.0, 2.0]);
/// assert_eq!(parts[1].to_vec(), vec![3.0, 4.0, 5.0, 6.0]);
/// ```
pub fn split(x: &Array, sizes: &[usize]) -> Result<Vec<Array>, GradError> {
    let total: usize = sizes.iter().sum();
    let Some(&last) = x.shape().last() else {
        return Err(GradError::DimensionMismatch {
            expected: vec![total],
            actual: Vec::new(),
        });
    };
    if total != last {
        return Err(GradError::ShapeMismatch {
            expected: last,
            actual: total,
        });
    }
    if sizes.is_empty() {
        return Ok(Vec::new());
    }

    let block = last_axis_block(x.shape());
    let mut start = 0;
    let outputs: Vec<Array> = sizes
        .iter()
        .map(|&size| {
            let offset = x.offset() + block * start;
            start += size;
            Array::from_parts(
                &with_last_axis(x.shape(), size),
                x.dtype(),
                x.device(),
                x.data().clone(),
                offset,
            )
        })
        .collect();

    let output_refs: Vec<&Array> = outputs.iter().collect();
    let builder = BackwardBuilder::new("split", &[x], &output_refs)?;
    let target = builder.create_target(&[0])?;
    if target.is_definition_required() {
        target.define(|ctx| {
            let gys = (0..ctx.output_count())
                .map(|i| ctx.output_grad(i))
                .collect::<Result<Vec<_>, _>>()?;
            let gy_refs: Vec<&Array> = gys.iter().collect();
            ctx.set_input_grad(0, concatenate(&gy_refs)?)
        });
    }
    builder.finalize()?;
    Ok(outputs)
}

/// Join arrays along their last axis.
///
/// All arrays must agree on every other axis, on dtype and on device.
pub fn concatenate(arrays: &[&Array]) -> Result<Array, GradError> {
    let Some(first) = arrays.first() else {
        return Err(GradError::protocol("concatenate: no arrays given"));
    };
    let Some((_, leading)) = first.shape().split_last() else {
        return Err(GradError::DimensionMismatch {
            expected: vec![1],
            actual: Vec::new(),
        });
    };
    let mut sizes = Vec::with_capacity(arrays.len());
    for array in arrays {
        match array.shape().split_last() {
            Some((&size, rest)) if rest == leading => sizes.push(size),
            _ => {
                return Err(GradError::DimensionMismatch {
                    expected: first.shape().to_vec(),
                    actual: array.shape().to_vec(),
                });
            }
        }
        if array.dtype() != first.dtype() {
            return Err(GradError::DTypeMismatch {
                lhs: first.dtype(),
                rhs: array.dtype(),
            });
        }
        if array.device() != first.device() {
            return Err(GradError::DeviceMismatch {
                lhs: first.device().name(),
                rhs: array.device().name(),
            });
        }
    }
    let shape = with_last_axis(first.shape(), sizes.iter().sum());
    let out = NativeBackend::concatenate(arrays, &shape, first.dtype(), first.device());

    let builder = BackwardBuilder::new("concatenate", arrays, &[&out])?;
    let indices: Vec<usize> = (0..arrays.len()).collect();
    let target = builder.create_target(&indices)?;
    if target.is_definition_required() {
        target.define(move |ctx| {
            let gy = ctx.output_grad(0)?;
            for (k, gx) in split(&gy, &sizes)?.into_iter().enumerate() {
                if ctx.is_input_grad_required(k) {
                    ctx.set_input_grad(k, gx)?;
                }
            }
            Ok(())
        });
    }
    builder.finalize()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::DoubleBackpropOption;
    use crate::context::Context;
    use crate::dtype::DType;
    use crate::operations::{multiply_scalar, sum};

    #[test]
    fn test_reshape_backward() {
        let d = Context::new().native_device();
        let x = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2], &d).unwrap();
        x.require_grad(None).unwrap();
        let y = reshape(&x, &[4]).unwrap();
        sum(&multiply_scalar(&y, 2.0).unwrap())
            .unwrap()
            .backward(None, DoubleBackpropOption::Disable)
            .unwrap();
        let g = x.grad(None).unwrap().unwrap();
        assert_eq!(g.shape(), &[2, 2]);
        assert_eq!(g.to_vec(), vec![2.0; 4]);
    }

    #[test]
    fn test_reshape_count_mismatch() {
        let d = Context::new().native_device();
        let x = Array::zeros(&[2, 2], DType::Float64, &d);
        assert!(matches!(
            reshape(&x, &[3]),
            Err(GradError::ShapeMismatch {
                expected: 4,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_copy_is_fresh_and_differentiable() {
        let d = Context::new().native_device();
        let x = Array::from_vec(vec![1.0, 2.0], &[2], &d).unwrap();
        x.require_grad(None).unwrap();
        let y = copy(&x).unwrap();
        assert!(!y.shares_storage_with(&x));
        sum(&y)
            .unwrap()
            .backward(None, DoubleBackpropOption::Disable)
            .unwrap();
        assert_eq!(x.grad(None).unwrap().unwrap().to_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_split_views() {
        let d = Context::new().native_device();
        let x = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], &d).unwrap();
        let parts = split(&x, &[2, 1]).unwrap();
        assert_eq!(parts[0].shape(), &[2, 2]);
        assert_eq!(parts[1].shape(), &[2, 1]);
        assert_eq!(parts[1].offset(), 4);
        assert!(parts[1].shares_storage_with(&x));
        assert_eq!(parts[1].to_vec(), vec![5.0, 6.0]);
    }

    #[test]
    fn test_split_backward_fills_missing_gradients_with_zeros() {
        let d = Context::new().native_device();
        let x = Array::from_vec(vec![1.0, 2.0, 3.0], &[3], &d).unwrap();
        x.require_grad(None).unwrap();
        let parts = split(&x, &[1, 2]).unwrap();
        // Only the second piece contributes.
        sum(&multiply_scalar(&parts[1], 3.0).unwrap())
            .unwrap()
            .backward(None, DoubleBackpropOption::Disable)
            .unwrap();
        assert_eq!(x.grad(None).unwrap().unwrap().to_vec(), vec![0.0, 3.0, 3.0]);
    }

    #[test]
    fn test_split_size_mismatch() {
        let d = Context::new().native_device();
        let x = Array::zeros(&[3], DType::Float64, &d);
        assert!(matches!(
            split(&x, &[1, 1]),
            Err(GradError::ShapeMismatch { .. })
        ));
        let s = Array::scalar(1.0, &d);
        assert!(split(&s, &[1]).is_err());
    }

    #[test]
    fn test_split_empty_axis_into_no_pieces() {
        let d = Context::new().native_device();
        let x = Array::zeros(&[2, 0], DType::Float64, &d);
        x.require_grad(None).unwrap();
        assert!(split(&x, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_concatenate_backward() {
        let d = Context::new().native_device();
        let a = Array::from_vec(vec![1.0, 2.0], &[2, 1], &d).unwrap();
        let b = Array::from_vec(vec![3.0, 4.0, 5.0, 6.0], &[2, 2], &d).unwrap();
        a.require_grad(None).unwrap();
        b.require_grad(None).unwrap();
        let y = concatenate(&[&a, &b]).unwrap();
        assert_eq!(y.shape(), &[2, 3]);
        let w = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], &d).unwrap();
        sum(&crate::operations::multiply(&y, &w).unwrap())
            .unwrap()
            .backward(None, DoubleBackpropOption::Disable)
            .unwrap();
        assert_eq!(a.grad(None).unwrap().unwrap().to_vec(), vec![1.0, 2.0]);
        assert_eq!(
            b.grad(None).unwrap().unwrap().to_vec(),
            vec![3.0, 4.0, 5.0, 6.0]
        );
    }

    #[test]
    fn test_concatenate_same_array_twice() {
        let d = Context::new().native_device();
        let a = Array::from_vec(vec![1.0, 2.0], &[2], &d).unwrap();
        a.require_grad(None).unwrap();
        let y = concatenate(&[&a, &a]).unwrap();
        sum(&y)
            .unwrap()
            .backward(None, DoubleBackpropOption::Disable)
            .unwrap();
        assert_eq!(a.grad(None).unwrap().unwrap().to_vec(), vec![2.0, 2.0]);
    }

    #[test]
    fn test_concatenate_mismatched_leading_axes() {
        let d = Context::new().native_device();
        let a = Array::zeros(&[2, 1], DType::Float64, &d);
        let b = Array::zeros(&[3, 1], DType::Float64, &d);
        assert!(matches!(
            concatenate(&[&a, &b]),
            Err(GradError::DimensionMismatch { .. })
        ));
        assert!(concatenate(&[]).is_err());
    }
}
