//! Element types of arrays.
//!
//! Every array stores its elements as `f64` in a [`DataBuffer`](crate::storage::DataBuffer);
//! the dtype decides which values are representable and whether the array may
//! take part in differentiation.

use std::fmt;

/// Element type of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    Bool,
    Int32,
    Int64,
    Float32,
    #[default]
    Float64,
}

impl DType {
    /// Whether this is a floating-point dtype.
    ///
    /// Only floating arrays can carry array nodes or gradients.
    pub fn is_float(self) -> bool {
        matches!(self, DType::Float32 | DType::Float64)
    }

    /// Round a value to the nearest one representable in this dtype.
    pub fn cast(self, value: f64) -> f64 {
        match self {
            DType::Bool => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            DType::Int32 => value as i32 as f64,
            DType::Int64 => value as i64 as f64,
            DType::Float32 => value as f32 as f64,
            DType::Float64 => value,
        }
    }

    /// Short name, as used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
