//! Utilities for merging partition replies into one logical result.
//!
//! All merges are best effort: failed partitions are skipped, so the output
//! covers only the partitions that succeeded. Check
//! [`AggregateOutcome::contains_failures`] when completeness matters.

use crate::result::AggregateOutcome;
use crate::vector_executor::PartitionReply;
use tessera_core::{PartitionKey, Result};
use tessera_storage::SortedSparseVector;

/// Stitches `Values` replies into a sorted sparse vector of dimension `dim`.
///
/// Indexes read more than once appear once in the output.
pub fn index_values(dim: u64, outcome: &AggregateOutcome<PartitionReply>) -> Result<SortedSparseVector> {
    let mut indices = Vec::new();
    let mut values = Vec::new();
    for (_, reply) in outcome.successes() {
        if let PartitionReply::Values {
            indexes,
            values: vals,
        } = reply
        {
            for (&i, &v) in indexes.iter().zip(vals) {
                if indices.last() != Some(&(i as usize)) {
                    indices.push(i as usize);
                    values.push(v);
                }
            }
        }
    }
    // Partitions report in start_col order with ascending indexes, so the
    // concatenation is already sorted unless the caller mixed layouts.
    if indices.windows(2).any(|w| w[0] > w[1]) {
        let pairs: Vec<(usize, f64)> = indices.into_iter().zip(values).collect();
        return dedup_sorted(dim, pairs);
    }
    SortedSparseVector::from_sorted(dim as usize, indices, values)
}

fn dedup_sorted(dim: u64, mut pairs: Vec<(usize, f64)>) -> Result<SortedSparseVector> {
    pairs.sort_by_key(|(i, _)| *i);
    pairs.dedup_by_key(|(i, _)| *i);
    let (indices, values) = pairs.into_iter().unzip();
    SortedSparseVector::from_sorted(dim as usize, indices, values)
}

/// Total number of deltas acknowledged by `Applied` replies.
pub fn applied_count(outcome: &AggregateOutcome<PartitionReply>) -> usize {
    outcome
        .successes()
        .map(|(_, reply)| match reply {
            PartitionReply::Applied(n) => *n,
            _ => 0,
        })
        .sum()
}

/// Concatenates `Range` replies into ascending `(index, value)` entries.
pub fn range_entries(outcome: &AggregateOutcome<PartitionReply>) -> Vec<(u64, f64)> {
    let mut entries: Vec<(u64, f64)> = outcome
        .successes()
        .filter_map(|(_, reply)| match reply {
            PartitionReply::Range(entries) => Some(entries.iter().copied()),
            _ => None,
        })
        .flatten()
        .collect();
    entries.sort_by_key(|(i, _)| *i);
    entries
}

/// Partitions whose outcome was a failure.
pub fn missing_partitions<T>(outcome: &AggregateOutcome<T>) -> Vec<PartitionKey> {
    outcome.failures().map(|(key, _)| *key).collect()
}
