//! Splits logical requests into one sub-request per partition.
//!
//! Index sets are sorted once and walked against the partitions (sorted by
//! `start_col`) with two cursors, so a split costs `O(n log n + p log p)` and
//! each partition receives one contiguous slice of the sorted indexes.

use crate::request::{LogicalRequest, PartitionSubRequest, SubRequestPayload};
use std::ops::Range;
use std::time::Instant;
use tessera_core::{MatrixId, OperationId, PartitionKey, Result, RowId, ShardError};
use tessera_storage::PartitionProvider;

/// Turns logical requests into partition sub-requests for one operation.
///
/// Splitting is pure: it never mutates the request and yields identical
/// sub-requests every time it is called with the same input.
#[derive(Debug, Clone, Copy)]
pub struct RequestSplitter {
    operation_id: OperationId,
}

impl Default for RequestSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestSplitter {
    /// Creates a splitter for a freshly allocated operation.
    pub fn new() -> Self {
        Self::for_operation(OperationId::next())
    }

    /// Creates a splitter stamping sub-requests with `operation_id`.
    pub fn for_operation(operation_id: OperationId) -> Self {
        Self { operation_id }
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    /// Splits using the partitions listed by `provider` for the request's row.
    pub fn split_with(
        &self,
        request: &LogicalRequest,
        provider: &dyn PartitionProvider,
    ) -> Result<Vec<PartitionSubRequest>> {
        let partitions = provider.list_partitions(request.matrix_id(), request.row_id())?;
        self.split(request, &partitions)
    }

    /// Splits `request` across `partitions`.
    ///
    /// Index-based requests produce exactly one sub-request per partition,
    /// empty ones included, ordered by `start_col`. Pre-resolved requests
    /// produce one sub-request per map entry and ignore `partitions`.
    pub fn split(
        &self,
        request: &LogicalRequest,
        partitions: &[PartitionKey],
    ) -> Result<Vec<PartitionSubRequest>> {
        let started = Instant::now();
        let subs: Vec<PartitionSubRequest> = match request {
            LogicalRequest::IndexGet {
                matrix_id,
                row_id,
                indexes,
            } => {
                let parts = sorted_partitions(*matrix_id, *row_id, partitions)?;
                let mut sorted = indexes.clone();
                sorted.sort_unstable();
                let slices = slice_by_partition(&sorted, &parts)?;
                parts
                    .iter()
                    .zip(slices)
                    .map(|(key, range)| {
                        self.sub_request(request, *key, SubRequestPayload::Indexes(sorted[range].to_vec()))
                    })
                    .collect()
            }
            LogicalRequest::IndexUpdate {
                matrix_id,
                row_id,
                indexes,
                deltas,
            } => {
                if indexes.len() != deltas.len() {
                    return Err(ShardError::InvalidRequest(format!(
                        "{} indexes but {} deltas",
                        indexes.len(),
                        deltas.len()
                    )));
                }
                let parts = sorted_partitions(*matrix_id, *row_id, partitions)?;
                let mut pairs: Vec<(u64, f64)> =
                    indexes.iter().copied().zip(deltas.iter().copied()).collect();
                pairs.sort_by_key(|(i, _)| *i);
                let (sorted, deltas): (Vec<u64>, Vec<f64>) = pairs.into_iter().unzip();
                let slices = slice_by_partition(&sorted, &parts)?;
                parts
                    .iter()
                    .zip(slices)
                    .map(|(key, range)| {
                        let payload = SubRequestPayload::Update {
                            indexes: sorted[range.clone()].to_vec(),
                            deltas: deltas[range].to_vec(),
                        };
                        self.sub_request(request, *key, payload)
                    })
                    .collect()
            }
            LogicalRequest::RangeGet {
                matrix_id,
                row_id,
                start,
                end,
            } => {
                let parts = sorted_partitions(*matrix_id, *row_id, partitions)?;
                clamp_range(*start, *end, &parts)?
                    .into_iter()
                    .map(|(key, (s, e))| {
                        self.sub_request(request, key, SubRequestPayload::Range { start: s, end: e })
                    })
                    .collect()
            }
            LogicalRequest::Resolved {
                matrix_id,
                row_id,
                parts,
            } => self.split_resolved(request, *matrix_id, *row_id, parts)?,
        };

        tracing::debug!(
            operation = %self.operation_id,
            kind = request.kind(),
            sub_requests = subs.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Split request"
        );
        Ok(subs)
    }

    fn split_resolved<'a>(
        &self,
        request: &LogicalRequest,
        matrix_id: MatrixId,
        row_id: RowId,
        parts: impl IntoIterator<Item = (&'a PartitionKey, &'a Vec<u64>)>,
    ) -> Result<Vec<PartitionSubRequest>> {
        let mut subs = Vec::new();
        for (key, indexes) in parts {
            if key.matrix_id != matrix_id || !key.contains_row(row_id.as_u64()) {
                return Err(ShardError::InvalidRequest(format!(
                    "partition {} does not hold row {} of matrix {}",
                    key, row_id, matrix_id
                )));
            }
            let mut sorted = indexes.clone();
            sorted.sort_unstable();
            if let Some(&bad) = sorted.iter().find(|&&i| !key.contains_col(i)) {
                return Err(ShardError::OutOfRange {
                    index: bad,
                    lower: key.start_col,
                    upper: key.end_col,
                });
            }
            subs.push(self.sub_request(request, *key, SubRequestPayload::Indexes(sorted)));
        }
        subs.sort_by_key(|s| (s.partition.start_col, s.partition.partition_id));
        Ok(subs)
    }

    fn sub_request(
        &self,
        request: &LogicalRequest,
        partition: PartitionKey,
        payload: SubRequestPayload,
    ) -> PartitionSubRequest {
        PartitionSubRequest {
            operation_id: self.operation_id,
            matrix_id: request.matrix_id(),
            row_id: request.row_id(),
            partition,
            payload,
        }
    }
}

/// Copies and sorts the partitions by `start_col`, rejecting ties, overlaps and
/// partitions that do not hold the requested row.
fn sorted_partitions(
    matrix_id: MatrixId,
    row_id: RowId,
    partitions: &[PartitionKey],
) -> Result<Vec<PartitionKey>> {
    if partitions.is_empty() {
        return Err(ShardError::AmbiguousLayout(format!(
            "no partitions for matrix {}",
            matrix_id
        )));
    }
    let mut sorted = partitions.to_vec();
    sorted.sort_by_key(|k| k.start_col);
    for key in &sorted {
        if key.matrix_id != matrix_id {
            return Err(ShardError::AmbiguousLayout(format!(
                "partition {} does not belong to matrix {}",
                key, matrix_id
            )));
        }
        if !key.contains_row(row_id.as_u64()) {
            return Err(ShardError::InvalidRequest(format!(
                "partition {} does not hold row {} of matrix {}",
                key, row_id, matrix_id
            )));
        }
    }
    for pair in sorted.windows(2) {
        if pair[0].start_col == pair[1].start_col {
            return Err(ShardError::AmbiguousLayout(format!(
                "partitions {} and {} start at the same column",
                pair[0], pair[1]
            )));
        }
        if pair[0].end_col > pair[1].start_col {
            return Err(ShardError::AmbiguousLayout(format!(
                "partitions {} and {} overlap",
                pair[0], pair[1]
            )));
        }
    }
    Ok(sorted)
}

/// Two-cursor walk: returns, per partition, the range of `sorted` it owns.
fn slice_by_partition(sorted: &[u64], parts: &[PartitionKey]) -> Result<Vec<Range<usize>>> {
    let mut slices = Vec::with_capacity(parts.len());
    let mut cursor = 0;
    for key in parts {
        let begin = cursor;
        while cursor < sorted.len() && sorted[cursor] < key.end_col {
            if sorted[cursor] < key.start_col {
                return Err(ShardError::OutOfRange {
                    index: sorted[cursor],
                    lower: key.start_col,
                    upper: key.end_col,
                });
            }
            cursor += 1;
        }
        slices.push(begin..cursor);
    }
    if let Some(&index) = sorted.get(cursor) {
        return Err(ShardError::OutOfRange {
            index,
            lower: parts[0].start_col,
            upper: parts[parts.len() - 1].end_col,
        });
    }
    Ok(slices)
}

/// Clamps `[start, end)` to every partition; partitions outside the range get
/// an empty range at their own `start_col`.
fn clamp_range(start: u64, end: u64, parts: &[PartitionKey]) -> Result<Vec<(PartitionKey, (u64, u64))>> {
    if start > end {
        return Err(ShardError::InvalidRequest(format!(
            "range start {} is past its end {}",
            start, end
        )));
    }
    let mut clamped = Vec::with_capacity(parts.len());
    let mut next = start;
    for key in parts {
        let s = start.max(key.start_col);
        let e = end.min(key.end_col);
        if s < e {
            if s > next {
                return Err(ShardError::OutOfRange {
                    index: next,
                    lower: key.start_col,
                    upper: key.end_col,
                });
            }
            next = e;
            clamped.push((*key, (s, e)));
        } else {
            clamped.push((*key, (key.start_col, key.start_col)));
        }
    }
    if next < end {
        return Err(ShardError::OutOfRange {
            index: next,
            lower: parts[0].start_col,
            upper: parts[parts.len() - 1].end_col,
        });
    }
    Ok(clamped)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::index::sample;
    use rand::SeedableRng;
    use std::collections::BTreeMap;
    use tessera_core::PartitionId;
    use tessera_storage::{MatrixLayout, PartitionDirectory};

    const M: MatrixId = MatrixId::new(0);
    const ROW: RowId = RowId::new(0);

    fn layout() -> MatrixLayout {
        MatrixLayout::uniform(M, 1, 10_000, 1, 4).unwrap()
    }

    fn partitions() -> Vec<PartitionKey> {
        layout().partitions().copied().collect()
    }

    fn random_indexes(seed: u64) -> Vec<u64> {
        let mut rng = StdRng::seed_from_u64(seed);
        sample(&mut rng, 10_000, 100)
            .into_iter()
            .map(|i| i as u64)
            .collect()
    }

    #[test]
    fn test_split_covers_every_index_once() {
        let indexes = random_indexes(1);
        let request = LogicalRequest::index_get(M, ROW, indexes.clone());
        let subs = RequestSplitter::new().split(&request, &partitions()).unwrap();

        assert_eq!(subs.len(), 4);
        let mut union = Vec::new();
        for sub in &subs {
            let own = sub.payload.indexes();
            assert!(own.windows(2).all(|w| w[0] <= w[1]));
            assert!(own.iter().all(|&i| sub.partition.contains_col(i)));
            union.extend_from_slice(own);
        }
        let mut expected = indexes;
        expected.sort_unstable();
        assert_eq!(union, expected);
    }

    #[test]
    fn test_split_output_follows_start_col() {
        let mut parts = partitions();
        parts.reverse();
        let request = LogicalRequest::index_get(M, ROW, vec![9_000, 10, 5_000]);
        let subs = RequestSplitter::new().split(&request, &parts).unwrap();
        let starts: Vec<_> = subs.iter().map(|s| s.partition.start_col).collect();
        assert_eq!(starts, vec![0, 2_500, 5_000, 7_500]);
    }

    #[test]
    fn test_empty_partitions_still_get_sub_requests() {
        let request = LogicalRequest::index_get(M, ROW, vec![1, 2, 3]);
        let subs = RequestSplitter::new().split(&request, &partitions()).unwrap();
        assert_eq!(subs.len(), 4);
        assert_eq!(subs[0].payload, SubRequestPayload::Indexes(vec![1, 2, 3]));
        assert!(subs[1..].iter().all(|s| s.is_empty()));
    }

    #[test]
    fn test_split_is_idempotent() {
        let request = LogicalRequest::index_get(M, ROW, random_indexes(2));
        let snapshot = request.clone();
        let splitter = RequestSplitter::new();

        let first = splitter.split(&request, &partitions()).unwrap();
        let second = splitter.split(&request, &partitions()).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            bincode::serialize(&first).unwrap(),
            bincode::serialize(&second).unwrap()
        );
        assert_eq!(request, snapshot);
    }

    #[test]
    fn test_out_of_range_index() {
        let request = LogicalRequest::index_get(M, ROW, vec![5, 10_000]);
        let err = RequestSplitter::new().split(&request, &partitions()).unwrap_err();
        assert_eq!(
            err,
            ShardError::OutOfRange {
                index: 10_000,
                lower: 0,
                upper: 10_000
            }
        );
    }

    #[test]
    fn test_index_in_gap_is_out_of_range() {
        let parts = vec![
            PartitionKey::new(M, PartitionId::new(0), 0, 1, 0, 10),
            PartitionKey::new(M, PartitionId::new(1), 0, 1, 20, 30),
        ];
        let request = LogicalRequest::index_get(M, ROW, vec![15]);
        assert!(matches!(
            RequestSplitter::new().split(&request, &parts),
            Err(ShardError::OutOfRange { index: 15, .. })
        ));
    }

    #[test]
    fn test_tied_start_is_ambiguous() {
        let parts = vec![
            PartitionKey::new(M, PartitionId::new(0), 0, 1, 0, 10),
            PartitionKey::new(M, PartitionId::new(1), 0, 1, 0, 20),
        ];
        let request = LogicalRequest::index_get(M, ROW, vec![1]);
        assert!(matches!(
            RequestSplitter::new().split(&request, &parts),
            Err(ShardError::AmbiguousLayout(_))
        ));
    }

    #[test]
    fn test_update_keeps_deltas_with_indexes() {
        let request = LogicalRequest::index_update(
            M,
            ROW,
            vec![7_600, 3, 2_600, 3],
            vec![1.0, 2.0, 3.0, 4.0],
        );
        let subs = RequestSplitter::new().split(&request, &partitions()).unwrap();
        assert_eq!(
            subs[0].payload,
            SubRequestPayload::Update {
                indexes: vec![3, 3],
                deltas: vec![2.0, 4.0]
            }
        );
        assert_eq!(
            subs[1].payload,
            SubRequestPayload::Update {
                indexes: vec![2_600],
                deltas: vec![3.0]
            }
        );
        assert!(subs[2].is_empty());
        assert_eq!(subs[3].payload.indexes(), &[7_600]);
    }

    #[test]
    fn test_update_length_mismatch() {
        let request = LogicalRequest::index_update(M, ROW, vec![1, 2], vec![1.0]);
        assert!(matches!(
            RequestSplitter::new().split(&request, &partitions()),
            Err(ShardError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_range_is_clamped_per_partition() {
        let request = LogicalRequest::range_get(M, ROW, 2_000, 5_100);
        let subs = RequestSplitter::new().split(&request, &partitions()).unwrap();
        let ranges: Vec<_> = subs.iter().map(|s| s.payload.clone()).collect();
        assert_eq!(
            ranges,
            vec![
                SubRequestPayload::Range { start: 2_000, end: 2_500 },
                SubRequestPayload::Range { start: 2_500, end: 5_000 },
                SubRequestPayload::Range { start: 5_000, end: 5_100 },
                SubRequestPayload::Range { start: 7_500, end: 7_500 },
            ]
        );
    }

    #[test]
    fn test_range_errors() {
        let splitter = RequestSplitter::new();
        let reversed = LogicalRequest::range_get(M, ROW, 10, 5);
        assert!(matches!(
            splitter.split(&reversed, &partitions()),
            Err(ShardError::InvalidRequest(_))
        ));
        let past_end = LogicalRequest::range_get(M, ROW, 9_000, 10_001);
        assert!(matches!(
            splitter.split(&past_end, &partitions()),
            Err(ShardError::OutOfRange { index: 10_000, .. })
        ));
    }

    #[test]
    fn test_resolved_one_sub_request_per_entry() {
        let parts = partitions();
        let mut map = BTreeMap::new();
        map.insert(parts[2], vec![5_010, 5_001]);
        map.insert(parts[0], vec![7]);
        let request = LogicalRequest::Resolved {
            matrix_id: M,
            row_id: ROW,
            parts: map,
        };
        let subs = RequestSplitter::new().split(&request, &[]).unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].partition, parts[0]);
        assert_eq!(subs[1].payload, SubRequestPayload::Indexes(vec![5_001, 5_010]));
    }

    #[test]
    fn test_resolved_rejects_foreign_index() {
        let parts = partitions();
        let mut map = BTreeMap::new();
        map.insert(parts[1], vec![2_600, 100]);
        let request = LogicalRequest::Resolved {
            matrix_id: M,
            row_id: ROW,
            parts: map,
        };
        assert!(matches!(
            RequestSplitter::new().split(&request, &[]),
            Err(ShardError::OutOfRange { index: 100, .. })
        ));
    }

    #[test]
    fn test_split_with_directory() {
        let directory = PartitionDirectory::new();
        directory.register(layout());
        let request = LogicalRequest::index_get(M, ROW, vec![0, 9_999]);
        let subs = RequestSplitter::new().split_with(&request, &directory).unwrap();
        assert_eq!(subs.len(), 4);

        let unknown = LogicalRequest::index_get(MatrixId::new(5), ROW, vec![0]);
        assert_eq!(
            RequestSplitter::new().split_with(&unknown, &directory),
            Err(ShardError::UnknownMatrix(MatrixId::new(5)))
        );
    }

    #[test]
    fn test_partitions_of_another_row_band_are_rejected() {
        let banded = MatrixLayout::uniform(M, 4, 10_000, 2, 4).unwrap();
        let lower_band = banded.partitions_for_row(3).unwrap().to_vec();
        let splitter = RequestSplitter::new();

        for request in [
            LogicalRequest::index_get(M, ROW, vec![1]),
            LogicalRequest::index_update(M, ROW, vec![1], vec![1.0]),
            LogicalRequest::range_get(M, ROW, 0, 10),
        ] {
            assert!(matches!(
                splitter.split(&request, &lower_band),
                Err(ShardError::InvalidRequest(_))
            ));
        }

        let request = LogicalRequest::index_get(M, RowId::new(3), vec![1]);
        assert_eq!(splitter.split(&request, &lower_band).unwrap().len(), 4);
    }
}
