//! Dense partition-local vector.

use serde::{Deserialize, Serialize};
use tessera_core::{Result, ShardError};

/// A dense vector storing every element, zeros included.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DenseVector {
    values: Vec<f64>,
}

impl DenseVector {
    /// Creates a zero vector of the given length.
    pub fn new(len: usize) -> Self {
        Self {
            values: vec![0.0; len],
        }
    }

    /// Wraps existing values.
    pub fn from_values(values: Vec<f64>) -> Self {
        Self { values }
    }

    /// Returns the dimension of the vector.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the vector has no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the raw values.
    #[inline]
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    /// Returns the element at `index`, or `None` past the end.
    #[inline]
    pub fn get(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied()
    }

    fn slot(&mut self, index: usize) -> Result<&mut f64> {
        let len = self.values.len() as u64;
        self.values.get_mut(index).ok_or(ShardError::OutOfRange {
            index: index as u64,
            lower: 0,
            upper: len,
        })
    }

    /// Sets the element at `index`.
    pub fn set(&mut self, index: usize, value: f64) -> Result<()> {
        *self.slot(index)? = value;
        Ok(())
    }

    /// Adds `delta` to the element at `index`.
    pub fn plus_by(&mut self, index: usize, delta: f64) -> Result<()> {
        *self.slot(index)? += delta;
        Ok(())
    }

    /// Multiplies every element by `factor`.
    pub fn times_by(&mut self, factor: f64) {
        self.values.iter_mut().for_each(|v| *v *= factor);
    }

    /// Sum of all elements.
    pub fn sum(&self) -> f64 {
        self.values.iter().sum()
    }

    /// Sum of squared elements.
    pub fn squared_norm(&self) -> f64 {
        self.values.iter().map(|v| v * v).sum()
    }

    /// Number of non-zero elements.
    pub fn nonzero_count(&self) -> usize {
        self.values.iter().filter(|v| **v != 0.0).count()
    }

    /// Iterates over non-zero elements as `(index, value)`.
    pub fn iter_active(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0.0)
            .map(|(i, v)| (i, *v))
    }
}
