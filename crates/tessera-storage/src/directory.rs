//! Partition directory: how each matrix is divided into partitions.
//!
//! A [`MatrixLayout`] is the static description of one matrix: a set of
//! [`PartitionKey`]s whose row bands tile `[0, rows)` and whose column ranges
//! tile `[0, cols)` inside every band. Layouts are validated eagerly when they
//! are built, so splitting and lookups never see overlapping or gapped ranges.
//!
//! ```text
//!          cols 0 ........ 2500 ........ 5000 ........ 7500 ........ 10000
//! rows 0  ┌──────────────┬──────────────┬──────────────┬──────────────┐
//!         │      p0      │      p1      │      p2      │      p3      │
//! rows 1  └──────────────┴──────────────┴──────────────┴──────────────┘
//! ```
//!
//! The [`PartitionDirectory`] is the registry of layouts for every matrix and
//! the default [`PartitionProvider`] handed to the request splitter.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tessera_core::{MatrixId, PartitionId, PartitionKey, Result, RowId, ShardError};

/// Source of partition layouts, consulted once per split operation.
///
/// Implementations must be deterministic for the duration of one split: the
/// same matrix and row must always yield the same ordered partitions.
pub trait PartitionProvider: Send + Sync {
    /// Returns the partitions covering `row_id` of `matrix_id`, sorted by `start_col`.
    fn list_partitions(&self, matrix_id: MatrixId, row_id: RowId) -> Result<Vec<PartitionKey>>;
}

// =============================================================================
// Matrix Layout
// =============================================================================

/// Validated partition layout of a single matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MatrixLayoutParts")]
pub struct MatrixLayout {
    matrix_id: MatrixId,
    rows: u64,
    cols: u64,
    /// Row bands sorted by `start_row`; each band's keys are sorted by `start_col`.
    bands: Vec<RowBand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RowBand {
    start_row: u64,
    end_row: u64,
    keys: Vec<PartitionKey>,
    starts: Vec<u64>,
}

/// Wire form of [`MatrixLayout`]; decoding rebuilds it through [`MatrixLayout::new`].
#[derive(Deserialize)]
struct MatrixLayoutParts {
    matrix_id: MatrixId,
    rows: u64,
    cols: u64,
    bands: Vec<RowBand>,
}

impl TryFrom<MatrixLayoutParts> for MatrixLayout {
    type Error = ShardError;

    fn try_from(parts: MatrixLayoutParts) -> Result<Self> {
        let keys = parts.bands.into_iter().flat_map(|b| b.keys).collect();
        Self::new(parts.matrix_id, parts.rows, parts.cols, keys)
    }
}

impl MatrixLayout {
    /// Builds a layout from explicit partition keys.
    ///
    /// Rejects with [`ShardError::AmbiguousLayout`] when the keys are empty,
    /// belong to another matrix, have empty ranges, overlap, leave gaps, or
    /// share a `start_col` within a row band.
    pub fn new(matrix_id: MatrixId, rows: u64, cols: u64, keys: Vec<PartitionKey>) -> Result<Self> {
        if keys.is_empty() {
            return Err(ShardError::AmbiguousLayout(format!(
                "matrix {} has no partitions",
                matrix_id
            )));
        }
        if rows == 0 || cols == 0 {
            return Err(ShardError::AmbiguousLayout(format!(
                "matrix {} has an empty shape {}x{}",
                matrix_id, rows, cols
            )));
        }

        let mut by_band: BTreeMap<(u64, u64), Vec<PartitionKey>> = BTreeMap::new();
        for key in keys {
            if key.matrix_id != matrix_id {
                return Err(ShardError::AmbiguousLayout(format!(
                    "partition {} belongs to matrix {}, not {}",
                    key.partition_id, key.matrix_id, matrix_id
                )));
            }
            if key.start_row >= key.end_row || key.start_col >= key.end_col {
                return Err(ShardError::AmbiguousLayout(format!(
                    "partition {} has an empty range",
                    key
                )));
            }
            by_band
                .entry((key.start_row, key.end_row))
                .or_default()
                .push(key);
        }

        let mut bands = Vec::with_capacity(by_band.len());
        let mut next_row = 0u64;
        for ((start_row, end_row), mut band_keys) in by_band {
            if start_row != next_row {
                return Err(ShardError::AmbiguousLayout(format!(
                    "row bands of matrix {} are not contiguous at row {} (next band starts at {})",
                    matrix_id, next_row, start_row
                )));
            }
            next_row = end_row;

            band_keys.sort_by_key(|k| k.start_col);
            let mut next_col = 0u64;
            for key in &band_keys {
                if key.start_col < next_col {
                    return Err(ShardError::AmbiguousLayout(format!(
                        "partition {} overlaps column {}",
                        key, key.start_col
                    )));
                }
                if key.start_col > next_col {
                    return Err(ShardError::AmbiguousLayout(format!(
                        "columns {}..{} of rows {}..{} are not covered",
                        next_col, key.start_col, start_row, end_row
                    )));
                }
                next_col = key.end_col;
            }
            if next_col != cols {
                return Err(ShardError::AmbiguousLayout(format!(
                    "rows {}..{} cover columns up to {}, expected {}",
                    start_row, end_row, next_col, cols
                )));
            }

            let starts = band_keys.iter().map(|k| k.start_col).collect();
            bands.push(RowBand {
                start_row,
                end_row,
                keys: band_keys,
                starts,
            });
        }
        if next_row != rows {
            return Err(ShardError::AmbiguousLayout(format!(
                "row bands of matrix {} cover rows up to {}, expected {}",
                matrix_id, next_row, rows
            )));
        }

        Ok(Self {
            matrix_id,
            rows,
            cols,
            bands,
        })
    }

    /// Creates a uniform grid of `row_blocks x col_blocks` partitions.
    ///
    /// Blocks have equal size except the last row and column blocks, which
    /// absorb the remainder. Partition ids are assigned row-major.
    pub fn uniform(
        matrix_id: MatrixId,
        rows: u64,
        cols: u64,
        row_blocks: u64,
        col_blocks: u64,
    ) -> Result<Self> {
        if row_blocks == 0 || col_blocks == 0 || row_blocks > rows || col_blocks > cols {
            return Err(ShardError::AmbiguousLayout(format!(
                "cannot split {}x{} into {}x{} blocks",
                rows, cols, row_blocks, col_blocks
            )));
        }

        let row_size = rows / row_blocks;
        let col_size = cols / col_blocks;
        let mut keys = Vec::with_capacity((row_blocks * col_blocks) as usize);
        let mut next_id = 0u32;
        for r in 0..row_blocks {
            let start_row = r * row_size;
            let end_row = if r + 1 == row_blocks { rows } else { start_row + row_size };
            for c in 0..col_blocks {
                let start_col = c * col_size;
                let end_col = if c + 1 == col_blocks { cols } else { start_col + col_size };
                keys.push(PartitionKey::new(
                    matrix_id,
                    PartitionId::new(next_id),
                    start_row,
                    end_row,
                    start_col,
                    end_col,
                ));
                next_id += 1;
            }
        }
        Self::new(matrix_id, rows, cols, keys)
    }

    /// Returns the matrix this layout describes.
    pub fn matrix_id(&self) -> MatrixId {
        self.matrix_id
    }

    /// Number of rows.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Number of columns (the dimension of each row vector).
    pub fn cols(&self) -> u64 {
        self.cols
    }

    /// Total number of partitions.
    pub fn num_partitions(&self) -> usize {
        self.bands.iter().map(|b| b.keys.len()).sum()
    }

    /// Iterates over every partition key, band by band.
    pub fn partitions(&self) -> impl Iterator<Item = &PartitionKey> {
        self.bands.iter().flat_map(|b| b.keys.iter())
    }

    fn band_for_row(&self, row: u64) -> Result<&RowBand> {
        if row >= self.rows {
            return Err(ShardError::OutOfRange {
                index: row,
                lower: 0,
                upper: self.rows,
            });
        }
        let pos = self.bands.partition_point(|b| b.end_row <= row);
        self.bands.get(pos).ok_or(ShardError::OutOfRange {
            index: row,
            lower: 0,
            upper: self.rows,
        })
    }

    /// Returns the partitions covering `row`, sorted by `start_col`.
    pub fn partitions_for_row(&self, row: u64) -> Result<&[PartitionKey]> {
        Ok(&self.band_for_row(row)?.keys)
    }

    /// Finds the partition owning the cell `(row, col)` by binary search.
    pub fn partition_for(&self, row: u64, col: u64) -> Result<PartitionKey> {
        let band = self.band_for_row(row)?;
        if col >= self.cols {
            return Err(ShardError::OutOfRange {
                index: col,
                lower: 0,
                upper: self.cols,
            });
        }
        band.starts
            .partition_point(|&s| s <= col)
            .checked_sub(1)
            .map(|pos| band.keys[pos])
            .ok_or(ShardError::OutOfRange {
                index: col,
                lower: 0,
                upper: self.cols,
            })
    }

    /// Describes the layout for debugging.
    pub fn describe(&self) -> String {
        format!(
            "MatrixLayout(matrix={}, shape={}x{}, bands={}, partitions={})",
            self.matrix_id,
            self.rows,
            self.cols,
            self.bands.len(),
            self.num_partitions()
        )
    }
}

// =============================================================================
// Directory
// =============================================================================

/// Registry of matrix layouts.
///
/// Layouts are shared behind `Arc`, so readers keep a consistent view even if
/// a matrix is re-registered while they hold it.
#[derive(Default)]
pub struct PartitionDirectory {
    layouts: DashMap<MatrixId, Arc<MatrixLayout>>,
}

impl PartitionDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the layout of a matrix.
    pub fn register(&self, layout: MatrixLayout) -> Arc<MatrixLayout> {
        let layout = Arc::new(layout);
        tracing::debug!(layout = %layout.describe(), "Registered matrix layout");
        self.layouts.insert(layout.matrix_id(), layout.clone());
        layout
    }

    /// Removes a matrix, returning its layout if it was registered.
    pub fn unregister(&self, matrix_id: MatrixId) -> Option<Arc<MatrixLayout>> {
        self.layouts.remove(&matrix_id).map(|(_, layout)| layout)
    }

    /// Returns the layout of a matrix.
    pub fn layout(&self, matrix_id: MatrixId) -> Result<Arc<MatrixLayout>> {
        self.layouts
            .get(&matrix_id)
            .map(|entry| entry.value().clone())
            .ok_or(ShardError::UnknownMatrix(matrix_id))
    }

    /// Number of registered matrices.
    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    /// Returns true if no matrix is registered.
    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }
}

impl PartitionProvider for PartitionDirectory {
    fn list_partitions(&self, matrix_id: MatrixId, row_id: RowId) -> Result<Vec<PartitionKey>> {
        let layout = self.layout(matrix_id)?;
        Ok(layout.partitions_for_row(row_id.as_u64())?.to_vec())
    }
}

impl PartitionProvider for MatrixLayout {
    fn list_partitions(&self, matrix_id: MatrixId, row_id: RowId) -> Result<Vec<PartitionKey>> {
        if matrix_id != self.matrix_id {
            return Err(ShardError::UnknownMatrix(matrix_id));
        }
        Ok(self.partitions_for_row(row_id.as_u64())?.to_vec())
    }
}

impl std::fmt::Debug for PartitionDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionDirectory")
            .field("matrices", &self.layouts.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
