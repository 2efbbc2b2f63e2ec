//! Logical requests issued by clients and the per-partition sub-requests they
//! are split into.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tessera_core::{MatrixId, OperationId, PartitionKey, RowId};

/// A client-issued operation against one row of a matrix.
///
/// Requests are immutable once built; splitting borrows them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogicalRequest {
    /// Read an unordered set of column indexes.
    IndexGet {
        matrix_id: MatrixId,
        row_id: RowId,
        indexes: Vec<u64>,
    },
    /// Add `deltas[i]` to column `indexes[i]`.
    IndexUpdate {
        matrix_id: MatrixId,
        row_id: RowId,
        indexes: Vec<u64>,
        deltas: Vec<f64>,
    },
    /// Read the half-open column range `[start, end)`.
    RangeGet {
        matrix_id: MatrixId,
        row_id: RowId,
        start: u64,
        end: u64,
    },
    /// Indexes already grouped by the partition that owns them.
    Resolved {
        matrix_id: MatrixId,
        row_id: RowId,
        parts: BTreeMap<PartitionKey, Vec<u64>>,
    },
}

impl LogicalRequest {
    pub fn index_get(matrix_id: MatrixId, row_id: RowId, indexes: Vec<u64>) -> Self {
        LogicalRequest::IndexGet {
            matrix_id,
            row_id,
            indexes,
        }
    }

    pub fn index_update(matrix_id: MatrixId, row_id: RowId, indexes: Vec<u64>, deltas: Vec<f64>) -> Self {
        LogicalRequest::IndexUpdate {
            matrix_id,
            row_id,
            indexes,
            deltas,
        }
    }

    pub fn range_get(matrix_id: MatrixId, row_id: RowId, start: u64, end: u64) -> Self {
        LogicalRequest::RangeGet {
            matrix_id,
            row_id,
            start,
            end,
        }
    }

    /// Returns the targeted matrix.
    pub fn matrix_id(&self) -> MatrixId {
        match self {
            LogicalRequest::IndexGet { matrix_id, .. }
            | LogicalRequest::IndexUpdate { matrix_id, .. }
            | LogicalRequest::RangeGet { matrix_id, .. }
            | LogicalRequest::Resolved { matrix_id, .. } => *matrix_id,
        }
    }

    /// Returns the targeted row.
    pub fn row_id(&self) -> RowId {
        match self {
            LogicalRequest::IndexGet { row_id, .. }
            | LogicalRequest::IndexUpdate { row_id, .. }
            | LogicalRequest::RangeGet { row_id, .. }
            | LogicalRequest::Resolved { row_id, .. } => *row_id,
        }
    }

    /// Short name used in log events.
    pub fn kind(&self) -> &'static str {
        match self {
            LogicalRequest::IndexGet { .. } => "index_get",
            LogicalRequest::IndexUpdate { .. } => "index_update",
            LogicalRequest::RangeGet { .. } => "range_get",
            LogicalRequest::Resolved { .. } => "resolved",
        }
    }
}

/// The slice of a logical request owned by one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubRequestPayload {
    /// Ascending global indexes, all inside the partition's column range.
    Indexes(Vec<u64>),
    /// Ascending global indexes with their deltas.
    Update { indexes: Vec<u64>, deltas: Vec<f64> },
    /// Column range clamped to the partition; empty when `start == end`.
    Range { start: u64, end: u64 },
}

impl SubRequestPayload {
    /// Number of indexes (or columns, for ranges) covered.
    pub fn len(&self) -> usize {
        match self {
            SubRequestPayload::Indexes(indexes) => indexes.len(),
            SubRequestPayload::Update { indexes, .. } => indexes.len(),
            SubRequestPayload::Range { start, end } => end.saturating_sub(*start) as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indexes carried by index-based payloads; empty for ranges.
    pub fn indexes(&self) -> &[u64] {
        match self {
            SubRequestPayload::Indexes(indexes) => indexes,
            SubRequestPayload::Update { indexes, .. } => indexes,
            SubRequestPayload::Range { .. } => &[],
        }
    }
}

/// One unit of work for a single partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSubRequest {
    pub operation_id: OperationId,
    pub matrix_id: MatrixId,
    pub row_id: RowId,
    pub partition: PartitionKey,
    pub payload: SubRequestPayload,
}

impl PartitionSubRequest {
    /// Returns true when the partition has nothing to do for this operation.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_len() {
        assert_eq!(SubRequestPayload::Indexes(vec![1, 2, 3]).len(), 3);
        assert_eq!(SubRequestPayload::Range { start: 10, end: 25 }.len(), 15);
        assert!(SubRequestPayload::Range { start: 7, end: 7 }.is_empty());
        // Inverted ranges cover nothing.
        assert!(SubRequestPayload::Range { start: 9, end: 2 }.is_empty());
    }
}
