//! Random array construction.
//!
//! This module provides functions for creating arrays with random values.

use rand::Rng;
use rand::distr::StandardUniform;
use rand_distr::StandardNormal;

use crate::array::Array;
use crate::device::Device;
use crate::dtype::DType;
use crate::strides::element_count;

impl Array {
    /// Create an array with uniform random values in [0, 1).
    ///
    /// # Example
    ///
    /// ```
    /// use ndgrad::{Array, Context, DType};
    ///
    /// let device = Context::new().native_device();
    /// let a = Array::random_uniform(&[2, 3], DType::Float64, &device);
    /// assert_eq!(a.shape(), &[2, 3]);
    /// assert!(a.to_vec().iter().all(|&v| (0.0..1.0).contains(&v)));
    /// ```
    pub fn random_uniform(shape: &[usize], dtype: DType, device: &Device) -> Self {
        Self::random_uniform_with_rng(shape, dtype, device, &mut rand::rng())
    }

    /// Create an array with uniform random values using a specific RNG.
    ///
    /// This is useful for reproducible results with a seeded RNG.
    ///
    /// # Example
    ///
    /// ```
    /// use ndgrad::{Array, Context, DType};
    /// use rand::SeedableRng;
    /// use rand::rngs::StdRng;
    ///
    /// let device = Context::new().native_device();
    /// let mut rng = StdRng::seed_from_u64(42);
    /// let a = Array::random_uniform_with_rng(&[2, 3], DType::Float64, &device, &mut rng);
    ///
    /// let mut rng = StdRng::seed_from_u64(42);
    /// let b = Array::random_uniform_with_rng(&[2, 3], DType::Float64, &device, &mut rng);
    ///
    /// assert_eq!(a.to_vec(), b.to_vec());
    /// ```
    pub fn random_uniform_with_rng<R: Rng>(
        shape: &[usize],
        dtype: DType,
        device: &Device,
        rng: &mut R,
    ) -> Self {
        let data: Vec<f64> = (0..element_count(shape))
            .map(|_| rng.sample(StandardUniform))
            .collect();
        Self::from_values(data, shape, dtype, device)
    }

    /// Create an array with standard normal random values.
    ///
    /// # Example
    ///
    /// ```
    /// use ndgrad::{Array, Context, DType};
    ///
    /// let device = Context::new().native_device();
    /// let a = Array::random_normal(&[4], DType::Float32, &device);
    /// assert_eq!(a.len(), 4);
    /// assert_eq!(a.dtype(), DType::Float32);
    /// ```
    pub fn random_normal(shape: &[usize], dtype: DType, device: &Device) -> Self {
        Self::random_normal_with_rng(shape, dtype, device, &mut rand::rng())
    }

    /// Create an array with standard normal random values using a specific RNG.
    pub fn random_normal_with_rng<R: Rng>(
        shape: &[usize],
        dtype: DType,
        device: &Device,
        rng: &mut R,
    ) -> Self {
        let data: Vec<f64> = (0..element_count(shape))
            .map(|_| rng.sample(StandardNormal))
            .collect();
        Self::from_values(data, shape, dtype, device)
    }
}
