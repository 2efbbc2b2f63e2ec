//! Composite vector: one logical row stitched from partition-local storage.
//!
//! A [`CompositeVector`] covers `[0, dim)` with an ordered array of
//! `(PartitionKey, PhysicalVector)` pairs. A global index `i` is routed to the
//! partition whose column range contains it (binary search over the sorted
//! start columns) and translated to the local index `i - start_col`.

use super::{DenseVector, PhysicalVector, SortedSparseVector, SparseVector, StorageKind, VectorRef};
use crate::directory::MatrixLayout;
use serde::{Deserialize, Serialize};
use tessera_core::{MatrixId, PartitionKey, Result, RowId, ShardError};

/// A logical vector backed by one physical vector per partition.
///
/// Cloning deep-copies every backing vector; the clone shares no storage with
/// the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CompositeVectorParts")]
pub struct CompositeVector {
    matrix_id: MatrixId,
    row_id: RowId,
    dim: u64,
    keys: Vec<PartitionKey>,
    /// `keys[i].start_col`, kept separately for binary search.
    starts: Vec<u64>,
    vectors: Vec<PhysicalVector>,
}

/// Wire form of [`CompositeVector`]; decoding re-runs the layout checks.
#[derive(Deserialize)]
struct CompositeVectorParts {
    matrix_id: MatrixId,
    row_id: RowId,
    dim: u64,
    keys: Vec<PartitionKey>,
    #[allow(dead_code)]
    starts: Vec<u64>,
    vectors: Vec<PhysicalVector>,
}

impl TryFrom<CompositeVectorParts> for CompositeVector {
    type Error = ShardError;

    fn try_from(parts: CompositeVectorParts) -> Result<Self> {
        if parts.keys.len() != parts.vectors.len() {
            return Err(ShardError::AmbiguousLayout(format!(
                "{} partition keys but {} vectors",
                parts.keys.len(),
                parts.vectors.len()
            )));
        }
        let pairs = parts.keys.into_iter().zip(parts.vectors).collect();
        Self::new(parts.matrix_id, parts.row_id, parts.dim, pairs)
    }
}

impl CompositeVector {
    /// Builds a composite vector from explicit partitions.
    ///
    /// The partitions are sorted by `start_col` and must tile `[0, dim)`;
    /// every physical vector's length must equal its partition's width.
    pub fn new(
        matrix_id: MatrixId,
        row_id: RowId,
        dim: u64,
        mut parts: Vec<(PartitionKey, PhysicalVector)>,
    ) -> Result<Self> {
        if parts.is_empty() {
            return Err(ShardError::AmbiguousLayout(
                "composite vector needs at least one partition".to_string(),
            ));
        }
        parts.sort_by_key(|(k, _)| k.start_col);

        let mut next_col = 0u64;
        for (key, vector) in &parts {
            if key.start_col != next_col || key.end_col <= key.start_col {
                return Err(ShardError::AmbiguousLayout(format!(
                    "partition {} does not continue the column range at {}",
                    key, next_col
                )));
            }
            if vector.len() as u64 != key.width() {
                return Err(ShardError::DimensionMismatch {
                    expected: key.width(),
                    actual: vector.len() as u64,
                });
            }
            next_col = key.end_col;
        }
        if next_col != dim {
            return Err(ShardError::AmbiguousLayout(format!(
                "partitions cover columns up to {}, expected {}",
                next_col, dim
            )));
        }

        let (keys, vectors): (Vec<_>, Vec<_>) = parts.into_iter().unzip();
        let starts = keys.iter().map(|k| k.start_col).collect();
        Ok(Self {
            matrix_id,
            row_id,
            dim,
            keys,
            starts,
            vectors,
        })
    }

    /// Reassembles a vector from parts that were taken out of a valid one.
    pub(super) fn from_validated(
        matrix_id: MatrixId,
        row_id: RowId,
        dim: u64,
        keys: Vec<PartitionKey>,
        vectors: Vec<PhysicalVector>,
    ) -> Self {
        let starts = keys.iter().map(|k| k.start_col).collect();
        Self {
            matrix_id,
            row_id,
            dim,
            keys,
            starts,
            vectors,
        }
    }

    /// Allocates an empty composite vector for `row_id` following a layout.
    pub fn for_row(layout: &MatrixLayout, row_id: RowId, kind: StorageKind) -> Result<Self> {
        let parts = layout
            .partitions_for_row(row_id.as_u64())?
            .iter()
            .map(|k| (*k, PhysicalVector::with_kind(kind, k.width() as usize)))
            .collect();
        Self::new(layout.matrix_id(), row_id, layout.cols(), parts)
    }

    /// Returns the matrix this vector belongs to.
    pub fn matrix_id(&self) -> MatrixId {
        self.matrix_id
    }

    /// Returns the row this vector represents.
    pub fn row_id(&self) -> RowId {
        self.row_id
    }

    /// Returns the global dimension.
    pub fn dim(&self) -> u64 {
        self.dim
    }

    /// Number of backing partitions.
    pub fn num_partitions(&self) -> usize {
        self.keys.len()
    }

    /// Partition keys in column order.
    pub fn keys(&self) -> &[PartitionKey] {
        &self.keys
    }

    /// Iterates over `(key, physical vector)` pairs in column order.
    pub fn partitions(&self) -> impl Iterator<Item = (&PartitionKey, &PhysicalVector)> {
        self.keys.iter().zip(self.vectors.iter())
    }

    /// Mutable access to the storage of one partition.
    pub fn partition_mut(&mut self, key: &PartitionKey) -> Option<&mut PhysicalVector> {
        let pos = self.starts.binary_search(&key.start_col).ok()?;
        if self.keys[pos] != *key {
            return None;
        }
        self.vectors.get_mut(pos)
    }

    /// Splits the vector back into its partitions.
    pub fn into_parts(self) -> Vec<(PartitionKey, PhysicalVector)> {
        self.keys.into_iter().zip(self.vectors).collect()
    }

    /// Returns `(partition position, local index)` for a global index.
    fn locate(&self, index: u64) -> Result<(usize, usize)> {
        if index >= self.dim {
            return Err(ShardError::OutOfRange {
                index,
                lower: 0,
                upper: self.dim,
            });
        }
        let out_of_range = || ShardError::OutOfRange {
            index,
            lower: 0,
            upper: self.dim,
        };
        let pos = self
            .starts
            .partition_point(|&s| s <= index)
            .checked_sub(1)
            .ok_or_else(out_of_range)?;
        let local = index - self.starts[pos];
        Ok((pos, local as usize))
    }

    fn same_layout(&self, other: &CompositeVector) -> bool {
        self.dim == other.dim && self.keys.len() == other.keys.len() && self.starts == other.starts
    }

    fn check_dim(&self, other: &VectorRef<'_>) -> Result<()> {
        let actual = other.dim();
        if actual != self.dim {
            return Err(ShardError::DimensionMismatch {
                expected: self.dim,
                actual,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Element operations
    // =========================================================================

    /// Returns the element at global `index`.
    pub fn get(&self, index: u64) -> Result<f64> {
        let (pos, local) = self.locate(index)?;
        Ok(self.vectors[pos].get(local).unwrap_or(0.0))
    }

    /// Sets the element at global `index`.
    pub fn set(&mut self, index: u64, value: f64) -> Result<()> {
        let (pos, local) = self.locate(index)?;
        self.vectors[pos].set(local, value)
    }

    /// Adds `delta` to the element at global `index`.
    pub fn plus_by_index(&mut self, index: u64, delta: f64) -> Result<&mut Self> {
        let (pos, local) = self.locate(index)?;
        self.vectors[pos].plus_by(local, delta)?;
        Ok(self)
    }

    // =========================================================================
    // Whole-vector operations
    // =========================================================================

    /// Adds `factor * other` to this vector.
    ///
    /// The accumulation strategy is picked by the operand's shape:
    /// dense operands are sliced per partition, sorted sparse operands are
    /// walked with a single cursor, unsorted sparse operands are routed entry
    /// by entry, and composites with the same layout are added partition by
    /// partition.
    pub fn plus_by<'a>(&mut self, other: impl Into<VectorRef<'a>>, factor: f64) -> Result<&mut Self> {
        let other = other.into();
        self.check_dim(&other)?;
        match other {
            VectorRef::Dense(v) => self.plus_dense(v, factor)?,
            VectorRef::Sparse(v) => self.plus_sparse(v, factor)?,
            VectorRef::SortedSparse(v) => self.plus_sorted(v, factor)?,
            VectorRef::Composite(v) => self.plus_composite(v, factor)?,
        }
        Ok(self)
    }

    fn plus_dense(&mut self, other: &DenseVector, factor: f64) -> Result<()> {
        let values = other.as_slice();
        for (key, vector) in self.keys.iter().zip(self.vectors.iter_mut()) {
            let slice = &values[key.start_col as usize..key.end_col as usize];
            for (local, v) in slice.iter().enumerate() {
                if *v != 0.0 {
                    vector.plus_by(local, v * factor)?;
                }
            }
        }
        Ok(())
    }

    fn plus_sparse(&mut self, other: &SparseVector, factor: f64) -> Result<()> {
        for (i, v) in other.iter_active() {
            let (pos, local) = self.locate(i as u64)?;
            self.vectors[pos].plus_by(local, v * factor)?;
        }
        Ok(())
    }

    fn plus_sorted(&mut self, other: &SortedSparseVector, factor: f64) -> Result<()> {
        let indices = other.indices();
        let values = other.values();
        let mut cursor = 0;
        for (key, vector) in self.keys.iter().zip(self.vectors.iter_mut()) {
            while cursor < indices.len() && (indices[cursor] as u64) < key.end_col {
                let local = (indices[cursor] as u64 - key.start_col) as usize;
                vector.plus_by(local, values[cursor] * factor)?;
                cursor += 1;
            }
        }
        Ok(())
    }

    fn plus_composite(&mut self, other: &CompositeVector, factor: f64) -> Result<()> {
        if self.same_layout(other) {
            for (mine, theirs) in self.vectors.iter_mut().zip(other.vectors.iter()) {
                mine.plus_by_vector(theirs, factor)?;
            }
            return Ok(());
        }
        for (key, vector) in other.partitions() {
            for (local, v) in vector.iter_active() {
                let (pos, mine) = self.locate(key.start_col + local as u64)?;
                self.vectors[pos].plus_by(mine, v * factor)?;
            }
        }
        Ok(())
    }

    /// Dot product with a vector of any shape.
    pub fn dot<'a>(&self, other: impl Into<VectorRef<'a>>) -> Result<f64> {
        let other = other.into();
        self.check_dim(&other)?;
        let dot = match other {
            VectorRef::Dense(v) => {
                let values = v.as_slice();
                self.partitions()
                    .map(|(key, vector)| {
                        vector
                            .iter_active()
                            .map(|(local, x)| x * values[key.start_col as usize + local])
                            .sum::<f64>()
                    })
                    .sum()
            }
            VectorRef::Sparse(v) => self.dot_entries(v.iter_active())?,
            VectorRef::SortedSparse(v) => self.dot_entries(v.iter_active())?,
            VectorRef::Composite(v) if self.same_layout(v) => self
                .vectors
                .iter()
                .zip(v.vectors.iter())
                .map(|(a, b)| a.dot(b))
                .sum(),
            VectorRef::Composite(v) => {
                let mut acc = 0.0;
                for (key, vector) in v.partitions() {
                    for (local, x) in vector.iter_active() {
                        acc += x * self.get(key.start_col + local as u64)?;
                    }
                }
                acc
            }
        };
        Ok(dot)
    }

    fn dot_entries(&self, entries: impl Iterator<Item = (usize, f64)>) -> Result<f64> {
        let mut acc = 0.0;
        for (i, v) in entries {
            acc += v * self.get(i as u64)?;
        }
        Ok(acc)
    }

    /// Multiplies every element by `factor` in place.
    ///
    /// Sparse partitions keep their stored entries, so multiplying by zero
    /// does not lower [`CompositeVector::nonzero_count`]; call
    /// [`CompositeVector::compact`] to purge them.
    pub fn times_by(&mut self, factor: f64) -> &mut Self {
        self.vectors.iter_mut().for_each(|v| v.times_by(factor));
        self
    }

    /// Returns a scaled deep copy.
    pub fn times(&self, factor: f64) -> Self {
        let mut scaled = self.clone();
        scaled.times_by(factor);
        scaled
    }

    /// Sum of all elements.
    pub fn sum(&self) -> f64 {
        self.vectors.iter().map(|v| v.sum()).sum()
    }

    /// Sum of squared elements.
    pub fn squared_norm(&self) -> f64 {
        self.vectors.iter().map(|v| v.squared_norm()).sum()
    }

    /// Non-zero elements of dense partitions plus stored entries of sparse ones.
    pub fn nonzero_count(&self) -> usize {
        self.vectors.iter().map(|v| v.nonzero_count()).sum()
    }

    /// Purges stored zeros from every sparse partition; returns how many were dropped.
    pub fn compact(&mut self) -> usize {
        self.vectors.iter_mut().map(|v| v.compact()).sum()
    }

    /// Iterates over active entries with global indexes, in column order for
    /// dense and sorted partitions.
    pub fn iter_active(&self) -> impl Iterator<Item = (u64, f64)> + '_ {
        self.partitions().flat_map(|(key, vector)| {
            let start = key.start_col;
            vector
                .iter_active()
                .map(move |(local, v)| (start + local as u64, v))
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
