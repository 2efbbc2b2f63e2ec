//! # Tessera Core
//!
//! Core types shared by every Tessera crate.
//!
//! This crate provides the fundamental building blocks:
//! - [`MatrixId`], [`RowId`], [`PartitionId`] and [`OperationId`] - Type-safe identifiers
//! - [`PartitionKey`] - The column/row rectangle owned by one shard
//! - [`ShardError`] - The error taxonomy for splitting, dispatch and aggregation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

// =============================================================================
// Identifiers (Newtypes for type safety)
// =============================================================================

/// Identifies one logical matrix (or table) in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct MatrixId(pub u32);

impl MatrixId {
    /// Creates a new MatrixId.
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MatrixId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

impl From<u32> for MatrixId {
    #[inline]
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Identifies a row inside a matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RowId(pub u64);

impl RowId {
    /// Creates a new RowId.
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl From<u64> for RowId {
    #[inline]
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Identifies a partition within a matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PartitionId(pub u32);

impl PartitionId {
    /// Creates a new PartitionId.
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Identifies one dispatched logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct OperationId(pub u64);

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

impl OperationId {
    /// Creates an OperationId from a raw value.
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocates the next process-unique operation id.
    pub fn next() -> Self {
        Self(NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

// =============================================================================
// Partition Keys
// =============================================================================

/// The rectangle of a matrix owned by one shard.
///
/// Row and column ranges are half-open: a key owns rows
/// `[start_row, end_row)` and columns `[start_col, end_col)`.
/// Keys are immutable once built; the partition directory hands out copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    /// Matrix this partition belongs to.
    pub matrix_id: MatrixId,
    /// Partition identifier, unique within the matrix.
    pub partition_id: PartitionId,
    /// First row owned by this partition.
    pub start_row: u64,
    /// One past the last row owned by this partition.
    pub end_row: u64,
    /// First column owned by this partition.
    pub start_col: u64,
    /// One past the last column owned by this partition.
    pub end_col: u64,
}

impl PartitionKey {
    /// Creates a new partition key.
    pub const fn new(
        matrix_id: MatrixId,
        partition_id: PartitionId,
        start_row: u64,
        end_row: u64,
        start_col: u64,
        end_col: u64,
    ) -> Self {
        Self {
            matrix_id,
            partition_id,
            start_row,
            end_row,
            start_col,
            end_col,
        }
    }

    /// Number of columns owned by this partition.
    #[inline]
    pub const fn width(&self) -> u64 {
        self.end_col.saturating_sub(self.start_col)
    }

    /// Returns true if `col` falls inside the column range.
    #[inline]
    pub const fn contains_col(&self, col: u64) -> bool {
        col >= self.start_col && col < self.end_col
    }

    /// Returns true if `row` falls inside the row range.
    #[inline]
    pub const fn contains_row(&self, row: u64) -> bool {
        row >= self.start_row && row < self.end_row
    }

    /// Translates a global column index to the partition-local index.
    ///
    /// Returns `None` when the column is not owned by this partition.
    #[inline]
    pub fn local_index(&self, col: u64) -> Option<usize> {
        if self.contains_col(col) {
            Some((col - self.start_col) as usize)
        } else {
            None
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}[rows {}..{}, cols {}..{}]",
            self.matrix_id,
            self.partition_id,
            self.start_row,
            self.end_row,
            self.start_col,
            self.end_col
        )
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while splitting, dispatching or aggregating partitioned operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShardError {
    /// Index outside every known partition. A caller or configuration bug.
    #[error("Index {index} is outside the partitioned range [{lower}, {upper})")]
    OutOfRange { index: u64, lower: u64, upper: u64 },

    /// A single shard's executor failed.
    #[error("Partition {partition} unavailable: {reason}")]
    PartitionUnavailable {
        partition: PartitionKey,
        reason: String,
    },

    /// The dispatch deadline passed before this partition completed.
    #[error("Partition {partition} timed out after {after_ms}ms")]
    Timeout { partition: PartitionKey, after_ms: u64 },

    /// The aggregate was cancelled before this partition's task started.
    #[error("Partition {partition} cancelled before execution")]
    Cancelled { partition: PartitionKey },

    /// Overlapping, gapped or tied partition ranges.
    #[error("Ambiguous partition layout: {0}")]
    AmbiguousLayout(String),

    /// No layout is registered for the matrix.
    #[error("Matrix {0} is not registered")]
    UnknownMatrix(MatrixId),

    /// Vector operands disagree on dimension.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: u64, actual: u64 },

    /// Malformed logical request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The worker runtime could not be started.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl ShardError {
    /// Returns the partition this error is attributed to, if any.
    pub fn partition(&self) -> Option<&PartitionKey> {
        match self {
            ShardError::PartitionUnavailable { partition, .. }
            | ShardError::Timeout { partition, .. }
            | ShardError::Cancelled { partition } => Some(partition),
            _ => None,
        }
    }

    /// Returns true for errors that are recorded per partition rather than
    /// raised to the caller immediately.
    pub fn is_partition_failure(&self) -> bool {
        self.partition().is_some()
    }
}

/// Result type for partitioned operations.
pub type Result<T> = std::result::Result<T, ShardError>;

// =============================================================================
// Tests
// =============================================================================
