//! Storage for array data.
//!
//! Storage is always a flat buffer of elements; shape, strides, offset and
//! dtype come from the array body that views it.

mod buffer;

pub use buffer::DataBuffer;
