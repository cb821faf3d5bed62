//! ndgrad - reverse-mode automatic differentiation for n-dimensional arrays
//!
//! Arrays carry one gradient graph per backprop id. Graphs for different ids
//! are built side by side by the same operations and are differentiated
//! independently, which makes higher-order derivatives a matter of running
//! backward on an inner graph with double backprop enabled and then on an
//! outer one.
//!
//! # Architecture
//!
//! ```text
//! Level 1: Operations (operations module)
//!     → add, multiply, exp, sum, split, concatenate, ...
//!     → each computes its result, then records itself with BackwardBuilder
//!
//! Level 2: Graph engine (autodiff module)
//!     → ArrayNode / OpNode graph, backward, grad
//!
//! Level 3: Kernels (backend module)
//!     → NativeBackend (contiguous column-major loops)
//! ```
//!
//! # Example
//!
//! ```
//! use ndgrad::operations::{add, multiply};
//! use ndgrad::{Array, Context, DoubleBackpropOption};
//!
//! let ctx = Context::new();
//! let device = ctx.native_device();
//! let x = Array::scalar(2.0, &device);
//! let y = Array::scalar(3.0, &device);
//! x.require_grad(None).unwrap();
//! y.require_grad(None).unwrap();
//!
//! // z = x * (x + y)
//! let z = multiply(&x, &add(&x, &y).unwrap()).unwrap();
//! z.backward(None, DoubleBackpropOption::Disable).unwrap();
//!
//! assert_eq!(x.grad(None).unwrap().unwrap().item().unwrap(), 7.0);
//! assert_eq!(y.grad(None).unwrap().unwrap().item().unwrap(), 2.0);
//! ```

pub mod array;
pub mod autodiff;
pub mod backend;
pub mod backprop_mode;
pub mod context;
pub mod device;
pub mod dtype;
pub mod error;
pub mod operations;
mod random;
pub mod storage;
pub mod strides;

pub use array::{Array, ArrayBody};
pub use autodiff::{BackwardBuilder, DoubleBackpropOption, backward, grad};
pub use backprop_mode::{BackpropMode, BackpropModeScope};
pub use context::{BackpropId, BackpropScope, Context};
pub use device::Device;
pub use dtype::DType;
pub use error::GradError;
