//! Native (loop-based) backend implementation.

use crate::array::Array;
use crate::backend::KernelBackend;
use crate::device::Device;
use crate::dtype::DType;
use crate::error::consistency_check;
use crate::strides::element_count;

/// Native backend using plain loops over contiguous buffers.
pub struct NativeBackend;

impl KernelBackend for NativeBackend {
    fn fill(shape: &[usize], dtype: DType, device: &Device, value: f64) -> Array {
        Array::from_values(vec![value; element_count(shape)], shape, dtype, device)
    }

    fn unary<F: Fn(f64) -> f64>(x: &Array, f: F) -> Array {
        let data: Vec<f64> = x.to_vec().into_iter().map(f).collect();
        Array::from_values(data, x.shape(), x.dtype(), x.device())
    }

    fn binary<F: Fn(f64, f64) -> f64>(a: &Array, b: &Array, f: F) -> Array {
        consistency_check!(a.shape() == b.shape(), "binary kernel on mismatched shapes");
        let rhs = b.to_vec();
        let data: Vec<f64> = a
            .to_vec()
            .into_iter()
            .zip(rhs)
            .map(|(x, y)| f(x, y))
            .collect();
        Array::from_values(data, a.shape(), a.dtype(), a.device())
    }

    fn add_assign(dest: &Array, src: &Array) {
        consistency_check!(
            dest.shape() == src.shape(),
            "add_assign on mismatched shapes"
        );
        // Read first: src may view the same buffer.
        let rhs = src.to_vec();
        let dtype = dest.dtype();
        let offset = dest.offset();
        let mut data = dest.data().borrow_mut();
        for (x, y) in data[offset..offset + rhs.len()].iter_mut().zip(rhs) {
            *x = dtype.cast(*x + y);
        }
    }

    fn sum(x: &Array) -> Array {
        let total: f64 = x.to_vec().iter().sum();
        Array::from_values(vec![total], &[], x.dtype(), x.device())
    }

    fn concatenate(arrays: &[&Array], shape: &[usize], dtype: DType, device: &Device) -> Array {
        let mut data = Vec::with_capacity(element_count(shape));
        for array in arrays {
            data.extend(array.to_vec());
        }
        consistency_check!(
            data.len() == element_count(shape),
            "concatenated length does not match the result shape"
        );
        Array::from_values(data, shape, dtype, device)
    }
}
