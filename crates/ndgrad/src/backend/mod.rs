//! Backend abstraction for array kernels.
//!
//! Operations compute their values through a [`KernelBackend`] and only then
//! record themselves on the gradient graph, so kernels stay oblivious of
//! differentiation.
//!
//! # Backends
//!
//! - `NativeBackend`: loop-based implementation over contiguous buffers

mod kernel;
mod native;

pub use kernel::KernelBackend;
pub use native::NativeBackend;
