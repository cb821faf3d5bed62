//! Kernel backend trait.

use crate::array::Array;
use crate::device::Device;
use crate::dtype::DType;

/// Backend trait for the element kernels behind array operations.
///
/// Kernels only compute values. They never look at array nodes and never
/// extend a graph; building the graph is the job of the operation calling
/// them. Every kernel returns a freshly allocated array unless it is an
/// `_assign` variant.
///
/// Callers validate shapes, dtypes and devices before dispatching; a kernel
/// may assume its arguments agree.
pub trait KernelBackend {
    /// Allocate an array filled with `value`.
    fn fill(shape: &[usize], dtype: DType, device: &Device, value: f64) -> Array;

    /// Apply `f` element-wise. The result has the dtype of `x`.
    fn unary<F: Fn(f64) -> f64>(x: &Array, f: F) -> Array;

    /// Apply `f` element-wise over two arrays of one shape. The result has
    /// the dtype of `a`.
    fn binary<F: Fn(f64, f64) -> f64>(a: &Array, b: &Array, f: F) -> Array;

    /// Add `src` into `dest` in place.
    fn add_assign(dest: &Array, src: &Array);

    /// Sum of all elements as a 0-dimensional array.
    fn sum(x: &Array) -> Array;

    /// Join arrays along their last axis into an array of `shape`.
    fn concatenate(arrays: &[&Array], shape: &[usize], dtype: DType, device: &Device) -> Array;
}
