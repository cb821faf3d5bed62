//! Error types for ndgrad.

use crate::dtype::DType;
use thiserror::Error;

/// Errors that can occur in array operations and gradient computation.
#[derive(Debug, Error)]
pub enum GradError {
    /// Element count mismatch between data and shape.
    #[error("shape mismatch: expected {expected} elements, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// Shapes of two arrays (or an array and a gradient) differ.
    #[error("dimension mismatch: expected shape {expected:?}, got {actual:?}")]
    DimensionMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Dtypes of two arrays (or an array and a gradient) differ.
    #[error("dtype mismatch: {lhs} vs {rhs}")]
    DTypeMismatch { lhs: DType, rhs: DType },

    /// Devices of two arrays (or an array and a gradient) differ.
    #[error("device mismatch: {lhs} vs {rhs}")]
    DeviceMismatch { lhs: String, rhs: String },

    /// Only floating-point arrays can take part in differentiation.
    #[error("array with dtype {dtype} cannot require gradient")]
    NonFloatGrad { dtype: DType },

    /// Tried to read a single element from an array with more than one.
    #[error("not a scalar: array has shape {shape:?}")]
    NotAScalar { shape: Vec<usize> },

    /// A graph-construction or backward contract was violated.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The backprop id was released by its scope.
    #[error("backprop id '{name}' is already released")]
    BackpropIdReleased { name: String },

    /// The backprop id belongs to another context.
    #[error("backprop id does not belong to this context")]
    ContextMismatch,

    /// The default backprop id lives as long as its context.
    #[error("the default backprop id cannot be released")]
    DefaultBackpropIdRelease,
}

impl GradError {
    /// Create a protocol error from any message.
    pub fn protocol(message: impl Into<String>) -> Self {
        GradError::Protocol(message.into())
    }
}

/// Internal consistency check.
///
/// Panics when debug assertions or the `consistency-checks` feature are
/// enabled; otherwise the condition is never evaluated. A failure means an
/// engine defect, not a user error.
macro_rules! consistency_check {
    ($cond:expr, $($arg:tt)+) => {
        if cfg!(any(debug_assertions, feature = "consistency-checks")) && !$cond {
            panic!("internal consistency error: {}", format_args!($($arg)+));
        }
    };
}

pub(crate) use consistency_check;
