//! Shared element buffer backing array bodies.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

/// Shared, interior-mutable element buffer.
///
/// Several array bodies may view one buffer (reshape, split, stopped
/// gradients). Cloning a `DataBuffer` clones the handle, not the data; two
/// handles compare identical with [`DataBuffer::ptr_eq`] when they back the
/// same allocation. That identity is what the backward pass uses to detect
/// gradient aliasing.
#[derive(Clone)]
pub struct DataBuffer {
    data: Rc<RefCell<Vec<f64>>>,
}

impl DataBuffer {
    /// Create a buffer taking ownership of `data`.
    pub fn from_vec(data: Vec<f64>) -> Self {
        Self {
            data: Rc::new(RefCell::new(data)),
        }
    }

    /// Number of elements in the buffer.
    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the elements.
    pub fn borrow(&self) -> Ref<'_, Vec<f64>> {
        self.data.borrow()
    }

    /// Mutably borrow the elements.
    pub fn borrow_mut(&self) -> RefMut<'_, Vec<f64>> {
        self.data.borrow_mut()
    }

    /// Whether both handles refer to the same allocation.
    pub fn ptr_eq(&self, other: &DataBuffer) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }

    /// Whether this handle is the only one referring to the allocation.
    pub fn is_unique(&self) -> bool {
        Rc::strong_count(&self.data) == 1
    }
}

impl fmt::Debug for DataBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBuffer")
            .field("len", &self.len())
            .field("handles", &Rc::strong_count(&self.data))
            .finish()
    }
}
