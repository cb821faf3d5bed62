//! Gradient storage for one array node.

use std::cell::RefCell;
use std::fmt;

use crate::array::Array;
use crate::backend::{KernelBackend, NativeBackend};
use crate::error::GradError;
use crate::operations::add;

/// Optional gradient slot of one (array, backprop id) pair.
///
/// Readers get a cloned handle; the slot itself is only replaced or, when
/// [`GradientHolder::accumulate`] may prove nobody else observes the stored
/// array, summed into in place.
#[derive(Default)]
pub struct GradientHolder {
    grad: RefCell<Option<Array>>,
}

impl GradientHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the stored gradient.
    pub fn get(&self) -> Option<Array> {
        self.grad.borrow().clone()
    }

    /// Replace the stored gradient.
    pub fn set(&self, grad: Array) {
        *self.grad.borrow_mut() = Some(grad);
    }

    /// Remove and return the stored gradient.
    pub fn take(&self) -> Option<Array> {
        self.grad.borrow_mut().take()
    }

    /// Restore a previously taken state.
    pub fn replace(&self, grad: Option<Array>) -> Option<Array> {
        std::mem::replace(&mut *self.grad.borrow_mut(), grad)
    }

    pub fn clear(&self) {
        self.grad.borrow_mut().take();
    }

    pub fn is_some(&self) -> bool {
        self.grad.borrow().is_some()
    }

    /// Add `grad` to the stored gradient, or store it if the slot is empty.
    ///
    /// With `in_place` set, a stored gradient that no other handle can observe
    /// is updated in its own buffer; otherwise the sum is a new array built
    /// through the differentiable `add`, so that it may extend outer graphs.
    pub fn accumulate(&self, grad: Array, in_place: bool) -> Result<(), GradError> {
        let Some(current) = self.take() else {
            self.set(grad);
            return Ok(());
        };
        if in_place && current.is_exclusive() {
            NativeBackend::add_assign(&current, &grad);
            self.set(current);
            return Ok(());
        }
        match add(&current, &grad) {
            Ok(sum) => {
                self.set(sum);
                Ok(())
            }
            Err(err) => {
                self.set(current);
                Err(err)
            }
        }
    }
}

impl fmt::Debug for GradientHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GradientHolder")
            .field("grad", &*self.grad.borrow())
            .finish()
    }
}
