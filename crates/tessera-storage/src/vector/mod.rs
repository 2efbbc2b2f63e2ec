//! Partition-local vectors and the composite vector stitched from them.
//!
//! # Representations
//!
//! - [`DenseVector`]: every element stored
//! - [`SparseVector`]: hash-backed, unsorted entries
//! - [`SortedSparseVector`]: parallel ascending indices/values
//! - [`CompositeVector`]: a logical vector over `[0, dim)` backed by one
//!   [`PhysicalVector`] per partition
//!
//! Operations that accept "any vector" take a [`VectorRef`] and dispatch with
//! a single `match` on its tag. The set of shapes is closed.

mod composite;
mod concurrent;
mod dense;
mod sorted;
mod sparse;

pub use composite::CompositeVector;
pub use concurrent::ConcurrentCompositeVector;
pub use dense::DenseVector;
pub use sorted::SortedSparseVector;
pub use sparse::SparseVector;

use serde::{Deserialize, Serialize};
use tessera_core::Result;

/// The runtime shape of a vector operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VectorShape {
    Dense,
    Sparse,
    SortedSparse,
    Composite,
}

/// Which physical representation to allocate for a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Dense,
    #[default]
    Sparse,
    SortedSparse,
}

// =============================================================================
// Physical Vector
// =============================================================================

/// Storage owned by a single partition, addressed with local indexes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PhysicalVector {
    Dense(DenseVector),
    Sparse(SparseVector),
    SortedSparse(SortedSparseVector),
}

impl PhysicalVector {
    /// Allocates an empty vector of the given kind and length.
    pub fn with_kind(kind: StorageKind, len: usize) -> Self {
        match kind {
            StorageKind::Dense => PhysicalVector::Dense(DenseVector::new(len)),
            StorageKind::Sparse => PhysicalVector::Sparse(SparseVector::new(len)),
            StorageKind::SortedSparse => {
                PhysicalVector::SortedSparse(SortedSparseVector::new(len))
            }
        }
    }

    /// Returns the representation of this vector.
    pub fn shape(&self) -> VectorShape {
        match self {
            PhysicalVector::Dense(_) => VectorShape::Dense,
            PhysicalVector::Sparse(_) => VectorShape::Sparse,
            PhysicalVector::SortedSparse(_) => VectorShape::SortedSparse,
        }
    }

    /// Returns the local dimension.
    pub fn len(&self) -> usize {
        match self {
            PhysicalVector::Dense(v) => v.len(),
            PhysicalVector::Sparse(v) => v.len(),
            PhysicalVector::SortedSparse(v) => v.len(),
        }
    }

    /// Returns true if the local dimension is zero.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        match self {
            PhysicalVector::Dense(v) => v.get(index),
            PhysicalVector::Sparse(v) => v.get(index),
            PhysicalVector::SortedSparse(v) => v.get(index),
        }
    }

    pub fn set(&mut self, index: usize, value: f64) -> Result<()> {
        match self {
            PhysicalVector::Dense(v) => v.set(index, value),
            PhysicalVector::Sparse(v) => v.set(index, value),
            PhysicalVector::SortedSparse(v) => v.set(index, value),
        }
    }

    pub fn plus_by(&mut self, index: usize, delta: f64) -> Result<()> {
        match self {
            PhysicalVector::Dense(v) => v.plus_by(index, delta),
            PhysicalVector::Sparse(v) => v.plus_by(index, delta),
            PhysicalVector::SortedSparse(v) => v.plus_by(index, delta),
        }
    }

    pub fn times_by(&mut self, factor: f64) {
        match self {
            PhysicalVector::Dense(v) => v.times_by(factor),
            PhysicalVector::Sparse(v) => v.times_by(factor),
            PhysicalVector::SortedSparse(v) => v.times_by(factor),
        }
    }

    pub fn sum(&self) -> f64 {
        match self {
            PhysicalVector::Dense(v) => v.sum(),
            PhysicalVector::Sparse(v) => v.sum(),
            PhysicalVector::SortedSparse(v) => v.sum(),
        }
    }

    pub fn squared_norm(&self) -> f64 {
        match self {
            PhysicalVector::Dense(v) => v.squared_norm(),
            PhysicalVector::Sparse(v) => v.squared_norm(),
            PhysicalVector::SortedSparse(v) => v.squared_norm(),
        }
    }

    /// Non-zero elements for dense storage, stored entries for sparse storage.
    pub fn nonzero_count(&self) -> usize {
        match self {
            PhysicalVector::Dense(v) => v.nonzero_count(),
            PhysicalVector::Sparse(v) => v.nonzero_count(),
            PhysicalVector::SortedSparse(v) => v.nonzero_count(),
        }
    }

    /// Purges stored zeros from sparse storage. Dense storage has nothing to purge.
    pub fn compact(&mut self) -> usize {
        match self {
            PhysicalVector::Dense(_) => 0,
            PhysicalVector::Sparse(v) => v.compact(),
            PhysicalVector::SortedSparse(v) => v.compact(),
        }
    }

    /// Iterates over active `(local_index, value)` entries.
    pub fn iter_active(&self) -> Box<dyn Iterator<Item = (usize, f64)> + '_> {
        match self {
            PhysicalVector::Dense(v) => Box::new(v.iter_active()),
            PhysicalVector::Sparse(v) => Box::new(v.iter_active()),
            PhysicalVector::SortedSparse(v) => Box::new(v.iter_active()),
        }
    }

    /// Adds `factor * other` element-wise. Both vectors must have the same length.
    pub fn plus_by_vector(&mut self, other: &PhysicalVector, factor: f64) -> Result<()> {
        if let (PhysicalVector::Dense(a), PhysicalVector::Dense(b)) = (&mut *self, other) {
            for (i, v) in b.as_slice().iter().enumerate() {
                if *v != 0.0 {
                    a.plus_by(i, v * factor)?;
                }
            }
            return Ok(());
        }
        for (i, v) in other.iter_active() {
            self.plus_by(i, v * factor)?;
        }
        Ok(())
    }

    /// Dot product with another vector of the same length.
    pub fn dot(&self, other: &PhysicalVector) -> f64 {
        // Iterate the sparser side and probe the other.
        let (outer, inner) = if self.nonzero_count() <= other.nonzero_count() {
            (self, other)
        } else {
            (other, self)
        };
        outer
            .iter_active()
            .map(|(i, v)| v * inner.get(i).unwrap_or(0.0))
            .sum()
    }

    /// Borrows this vector as a generic operand.
    pub fn as_operand(&self) -> VectorRef<'_> {
        match self {
            PhysicalVector::Dense(v) => VectorRef::Dense(v),
            PhysicalVector::Sparse(v) => VectorRef::Sparse(v),
            PhysicalVector::SortedSparse(v) => VectorRef::SortedSparse(v),
        }
    }
}

// =============================================================================
// Operand References
// =============================================================================

/// A borrowed vector of any supported shape, used as the right-hand operand
/// of composite accumulation and dot products.
#[derive(Debug, Clone, Copy)]
pub enum VectorRef<'a> {
    Dense(&'a DenseVector),
    Sparse(&'a SparseVector),
    SortedSparse(&'a SortedSparseVector),
    Composite(&'a CompositeVector),
}

impl VectorRef<'_> {
    /// Returns the operand's shape tag.
    pub fn shape(&self) -> VectorShape {
        match self {
            VectorRef::Dense(_) => VectorShape::Dense,
            VectorRef::Sparse(_) => VectorShape::Sparse,
            VectorRef::SortedSparse(_) => VectorShape::SortedSparse,
            VectorRef::Composite(_) => VectorShape::Composite,
        }
    }

    /// Returns the operand's global dimension.
    pub fn dim(&self) -> u64 {
        match self {
            VectorRef::Dense(v) => v.len() as u64,
            VectorRef::Sparse(v) => v.len() as u64,
            VectorRef::SortedSparse(v) => v.len() as u64,
            VectorRef::Composite(v) => v.dim(),
        }
    }
}

impl<'a> From<&'a DenseVector> for VectorRef<'a> {
    fn from(v: &'a DenseVector) -> Self {
        VectorRef::Dense(v)
    }
}

impl<'a> From<&'a SparseVector> for VectorRef<'a> {
    fn from(v: &'a SparseVector) -> Self {
        VectorRef::Sparse(v)
    }
}

impl<'a> From<&'a SortedSparseVector> for VectorRef<'a> {
    fn from(v: &'a SortedSparseVector) -> Self {
        VectorRef::SortedSparse(v)
    }
}

impl<'a> From<&'a CompositeVector> for VectorRef<'a> {
    fn from(v: &'a CompositeVector) -> Self {
        VectorRef::Composite(v)
    }
}

impl<'a> From<&'a PhysicalVector> for VectorRef<'a> {
    fn from(v: &'a PhysicalVector) -> Self {
        v.as_operand()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_physical_dispatch() {
        for kind in [StorageKind::Dense, StorageKind::Sparse, StorageKind::SortedSparse] {
            let mut v = PhysicalVector::with_kind(kind, 8);
            v.set(3, 2.0).unwrap();
            v.plus_by(3, 1.0).unwrap();
            v.plus_by(7, 4.0).unwrap();
            assert_eq!(v.len(), 8);
            assert_eq!(v.get(3), Some(3.0));
            assert_eq!(v.sum(), 7.0);
            assert_eq!(v.squared_norm(), 25.0);
            assert_eq!(v.nonzero_count(), 2);
            assert!(v.set(8, 1.0).is_err());
        }
    }

    #[test]
    fn test_physical_plus_and_dot_across_kinds() {
        let mut a = PhysicalVector::with_kind(StorageKind::Dense, 5);
        let mut b = PhysicalVector::with_kind(StorageKind::SortedSparse, 5);
        a.set(1, 2.0).unwrap();
        a.set(4, 1.0).unwrap();
        b.set(1, 3.0).unwrap();
        b.set(2, 5.0).unwrap();

        assert_eq!(a.dot(&b), 6.0);
        assert_eq!(b.dot(&a), 6.0);

        a.plus_by_vector(&b, 2.0).unwrap();
        assert_eq!(a.get(1), Some(8.0));
        assert_eq!(a.get(2), Some(10.0));
        assert_eq!(a.get(4), Some(1.0));
    }

    #[test]
    fn test_operand_shapes() {
        let dense = DenseVector::new(4);
        let sparse = SparseVector::new(6);
        assert_eq!(VectorRef::from(&dense).shape(), VectorShape::Dense);
        assert_eq!(VectorRef::from(&dense).dim(), 4);
        assert_eq!(VectorRef::from(&sparse).shape(), VectorShape::Sparse);
        assert_eq!(VectorRef::from(&sparse).dim(), 6);
    }
}
