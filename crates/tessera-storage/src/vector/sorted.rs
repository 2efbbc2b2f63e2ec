//! Sparse vector with indices kept in ascending order.

use serde::{Deserialize, Serialize};
use tessera_core::{Result, ShardError};

/// A sparse vector stored as parallel, ascending `indices` and `values`.
///
/// Lookups are binary searches; inserting a new index shifts the tail.
/// Zero entries behave as in [`super::SparseVector`]: they stay stored until
/// [`SortedSparseVector::compact`] runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SortedSparseParts")]
pub struct SortedSparseVector {
    dim: usize,
    indices: Vec<usize>,
    values: Vec<f64>,
}

#[derive(Deserialize)]
struct SortedSparseParts {
    dim: usize,
    indices: Vec<usize>,
    values: Vec<f64>,
}

impl TryFrom<SortedSparseParts> for SortedSparseVector {
    type Error = ShardError;

    fn try_from(parts: SortedSparseParts) -> Result<Self> {
        Self::from_sorted(parts.dim, parts.indices, parts.values)
    }
}

impl SortedSparseVector {
    /// Creates an empty vector of dimension `dim`.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            indices: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Builds a vector from indices that are already strictly ascending.
    pub fn from_sorted(dim: usize, indices: Vec<usize>, values: Vec<f64>) -> Result<Self> {
        if indices.len() != values.len() {
            return Err(ShardError::InvalidRequest(format!(
                "{} indices but {} values",
                indices.len(),
                values.len()
            )));
        }
        if indices.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ShardError::InvalidRequest(
                "indices must be strictly ascending".to_string(),
            ));
        }
        if let Some(&last) = indices.last() {
            if last >= dim {
                return Err(ShardError::OutOfRange {
                    index: last as u64,
                    lower: 0,
                    upper: dim as u64,
                });
            }
        }
        Ok(Self {
            dim,
            indices,
            values,
        })
    }

    /// Builds a vector from unordered pairs; repeated indexes accumulate.
    pub fn from_pairs(dim: usize, mut pairs: Vec<(usize, f64)>) -> Result<Self> {
        pairs.sort_by_key(|(i, _)| *i);
        let mut v = Self::new(dim);
        for (i, value) in pairs {
            if i >= dim {
                return Err(ShardError::OutOfRange {
                    index: i as u64,
                    lower: 0,
                    upper: dim as u64,
                });
            }
            match v.indices.last() {
                Some(&last) if last == i => {
                    if let Some(tail) = v.values.last_mut() {
                        *tail += value;
                    }
                }
                _ => {
                    v.indices.push(i);
                    v.values.push(value);
                }
            }
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

    /// Stored indices, ascending.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Stored values, aligned with [`SortedSparseVector::indices`].
    pub fn values(&self) -> &[f64] {
        &self.values
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
        match self.indices.binary_search(&index) {
            Ok(pos) => Some(self.values[pos]),
            Err(_) => Some(0.0),
        }
    }

    fn slot(&mut self, index: usize) -> Result<&mut f64> {
        self.check(index)?;
        let pos = match self.indices.binary_search(&index) {
            Ok(pos) => pos,
            Err(pos) => {
                self.indices.insert(pos, index);
                self.values.insert(pos, 0.0);
                pos
            }
        };
        Ok(&mut self.values[pos])
    }

    /// Stores `value` at `index`.
    pub fn set(&mut self, index: usize, value: f64) -> Result<()> {
        *self.slot(index)? = value;
        Ok(())
    }

    /// Adds `delta` to the element at `index`.
    pub fn plus_by(&mut self, index: usize, delta: f64) -> Result<()> {
        *self.slot(index)? += delta;
        Ok(())
    }

    /// Multiplies every stored entry by `factor`.
    pub fn times_by(&mut self, factor: f64) {
        self.values.iter_mut().for_each(|v| *v *= factor);
    }

    /// Sum of all entries.
    pub fn sum(&self) -> f64 {
        self.values.iter().sum()
    }

    /// Sum of squared entries.
    pub fn squared_norm(&self) -> f64 {
        self.values.iter().map(|v| v * v).sum()
    }

    /// Number of stored entries, explicit zeros included.
    pub fn nonzero_count(&self) -> usize {
        self.indices.len()
    }

    /// Drops stored entries whose value is zero.
    pub fn compact(&mut self) -> usize {
        let before = self.indices.len();
        let mut keep = 0;
        for pos in 0..before {
            if self.values[pos] != 0.0 {
                self.indices[keep] = self.indices[pos];
                self.values[keep] = self.values[pos];
                keep += 1;
            }
        }
        self.indices.truncate(keep);
        self.values.truncate(keep);
        before - keep
    }

    /// Iterates over stored entries in ascending index order.
    pub fn iter_active(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.indices.iter().copied().zip(self.values.iter().copied())
    }
}
