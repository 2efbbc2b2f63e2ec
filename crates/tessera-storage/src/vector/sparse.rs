//! Hash-backed sparse vector with unsorted entries.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tessera_core::{Result, ShardError};

/// A sparse vector holding only explicitly stored entries.
///
/// Stored entries are never purged implicitly: `times_by(0.0)` leaves zero
/// entries behind and [`SparseVector::nonzero_count`] keeps counting them
/// until [`SparseVector::compact`] runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SparseParts")]
pub struct SparseVector {
    dim: usize,
    entries: HashMap<usize, f64>,
}

#[derive(Deserialize)]
struct SparseParts {
    dim: usize,
    entries: HashMap<usize, f64>,
}

impl TryFrom<SparseParts> for SparseVector {
    type Error = ShardError;

    fn try_from(parts: SparseParts) -> Result<Self> {
        if let Some(&index) = parts.entries.keys().find(|&&i| i >= parts.dim) {
            return Err(ShardError::OutOfRange {
                index: index as u64,
                lower: 0,
                upper: parts.dim as u64,
            });
        }
        Ok(Self {
            dim: parts.dim,
            entries: parts.entries,
        })
    }
}

impl SparseVector {
    /// Creates an empty sparse vector of dimension `dim`.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            entries: HashMap::new(),
        }
    }

    /// Creates a sparse vector from `(index, value)` pairs.
    ///
    /// Repeated indexes accumulate.
    pub fn from_pairs(dim: usize, pairs: impl IntoIterator<Item = (usize, f64)>) -> Result<Self> {
        let mut v = Self::new(dim);
        for (i, value) in pairs {
            v.plus_by(i, value)?;
        }
        Ok(v)
    }

    /// Returns the dimension of the vector.
    #[inline]
    pub fn len(&self) -> usize {
        self.dim
    }

    /// Returns true if the dimension is zero.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dim == 0
    }

    fn check(&self, index: usize) -> Result<()> {
        if index < self.dim {
            Ok(())
        } else {
            Err(ShardError::OutOfRange {
                index: index as u64,
                lower: 0,
                upper: self.dim as u64,
            })
        }
    }

    /// Returns the element at `index`; absent entries read as zero.
    pub fn get(&self, index: usize) -> Option<f64> {
        if index >= self.dim {
            return None;
        }
        Some(self.entries.get(&index).copied().unwrap_or(0.0))
    }

    /// Stores `value` at `index`.
    pub fn set(&mut self, index: usize, value: f64) -> Result<()> {
        self.check(index)?;
        self.entries.insert(index, value);
        Ok(())
    }

    /// Adds `delta` to the element at `index`.
    pub fn plus_by(&mut self, index: usize, delta: f64) -> Result<()> {
        self.check(index)?;
        *self.entries.entry(index).or_insert(0.0) += delta;
        Ok(())
    }

    /// Multiplies every stored entry by `factor`.
    pub fn times_by(&mut self, factor: f64) {
        self.entries.values_mut().for_each(|v| *v *= factor);
    }

    /// Sum of all entries.
    pub fn sum(&self) -> f64 {
        self.entries.values().sum()
    }

    /// Sum of squared entries.
    pub fn squared_norm(&self) -> f64 {
        self.entries.values().map(|v| v * v).sum()
    }

    /// Number of stored entries, explicit zeros included.
    pub fn nonzero_count(&self) -> usize {
        self.entries.len()
    }

    /// Drops stored entries whose value is zero.
    pub fn compact(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, v| *v != 0.0);
        before - self.entries.len()
    }

    /// Iterates over stored entries in arbitrary order.
    pub fn iter_active(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.entries.iter().map(|(i, v)| (*i, *v))
    }
}
