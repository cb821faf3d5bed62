//! Devices.
//!
//! Only the native (CPU) backend exists. A device is still a first-class value
//! because it ties every array to the [`Context`] whose backprop ids and mode
//! stack govern its graphs.

use crate::context::Context;
use std::fmt;

/// A native device owned by a context.
#[derive(Clone)]
pub struct Device {
    context: Context,
    index: usize,
}

impl Device {
    /// Device `index` of `context`.
    pub fn new(context: &Context, index: usize) -> Self {
        Self {
            context: context.clone(),
            index,
        }
    }

    /// Owning context.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Device index within the native backend.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Qualified name, e.g. `native:0`.
    pub fn name(&self) -> String {
        format!("native:{}", self.index)
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.context.ptr_eq(&other.context) && self.index == other.index
    }
}

impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({}, context={})", self.name(), self.context.id())
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl Context {
    /// The first native device of this context.
    pub fn native_device(&self) -> Device {
        Device::new(self, 0)
    }
}
