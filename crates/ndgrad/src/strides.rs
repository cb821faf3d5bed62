//! Shape and stride utilities.
//!
//! Arrays are laid out in column-major (Fortran) order. In that order the
//! last axis varies slowest, so a contiguous range of the last axis is a
//! contiguous range of the buffer.

/// Compute column-major strides from shape.
///
/// For shape [d0, d1, d2, ...], returns strides [1, d0, d0*d1, ...].
///
/// # Examples
///
/// ```
/// use ndgrad::strides::compute_strides;
///
/// assert_eq!(compute_strides(&[3, 4, 5]), vec![1, 3, 12]);
/// assert_eq!(compute_strides(&[]), Vec::<usize>::new());
/// ```
pub fn compute_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = Vec::with_capacity(shape.len());
    let mut stride = 1;
    for &dim in shape {
        strides.push(stride);
        stride *= dim;
    }
    strides
}

/// Number of elements held by an array of this shape.
///
/// A 0-dimensional shape holds exactly one element.
#[inline]
pub fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Number of elements in one unit step along the last axis.
///
/// This is the size of the block that moves together when an array is cut
/// along its last axis.
pub fn last_axis_block(shape: &[usize]) -> usize {
    match shape.split_last() {
        Some((_, leading)) => element_count(leading),
        None => 1,
    }
}

/// Shape with the last axis replaced by `len`.
pub fn with_last_axis(shape: &[usize], len: usize) -> Vec<usize> {
    let mut out = shape.to_vec();
    if let Some(last) = out.last_mut() {
        *last = len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_strides() {
        assert_eq!(compute_strides(&[2, 3]), vec![1, 2]);
        assert_eq!(compute_strides(&[5]), vec![1]);
    }

    #[test]
    fn test_element_count_scalar() {
        assert_eq!(element_count(&[]), 1);
        assert_eq!(element_count(&[2, 0]), 0);
        assert_eq!(element_count(&[2, 3, 4]), 24);
    }

    #[test]
    fn test_last_axis_block() {
        assert_eq!(last_axis_block(&[2, 3, 4]), 6);
        assert_eq!(last_axis_block(&[7]), 1);
        assert_eq!(last_axis_block(&[]), 1);
    }

    #[test]
    fn test_with_last_axis() {
        assert_eq!(with_last_axis(&[2, 6], 3), vec![2, 3]);
        assert_eq!(with_last_axis(&[], 3), Vec::<usize>::new());
    }
}
