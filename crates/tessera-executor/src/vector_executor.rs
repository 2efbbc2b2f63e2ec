//! In-process partition executor backed by a [`ConcurrentCompositeVector`].

use crate::dispatcher::{ExecutorError, PartitionExecutor};
use crate::request::{PartitionSubRequest, SubRequestPayload};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tessera_core::ShardError;
use tessera_storage::ConcurrentCompositeVector;

/// What a partition sends back for one sub-request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PartitionReply {
    /// Values read for `indexes`, aligned by position.
    Values { indexes: Vec<u64>, values: Vec<f64> },
    /// Number of deltas applied.
    Applied(usize),
    /// Active `(index, value)` entries of a range read, ascending.
    Range(Vec<(u64, f64)>),
}

/// Serves sub-requests for the partitions of one shared row vector.
#[derive(Debug, Clone)]
pub struct VectorExecutor {
    vector: Arc<ConcurrentCompositeVector>,
}

impl VectorExecutor {
    pub fn new(vector: Arc<ConcurrentCompositeVector>) -> Self {
        Self { vector }
    }

    pub fn vector(&self) -> &Arc<ConcurrentCompositeVector> {
        &self.vector
    }
}

impl PartitionExecutor<PartitionReply> for VectorExecutor {
    fn execute(&self, request: &PartitionSubRequest) -> Result<PartitionReply, ExecutorError> {
        if request.matrix_id != self.vector.matrix_id() || request.row_id != self.vector.row_id() {
            return Err(Box::new(ShardError::PartitionUnavailable {
                partition: request.partition,
                reason: format!(
                    "request for {}/{} sent to vector {}/{}",
                    request.matrix_id,
                    request.row_id,
                    self.vector.matrix_id(),
                    self.vector.row_id()
                ),
            }));
        }

        let key = &request.partition;
        let reply = match &request.payload {
            SubRequestPayload::Indexes(indexes) => PartitionReply::Values {
                values: self.vector.apply_get(key, indexes)?,
                indexes: indexes.clone(),
            },
            SubRequestPayload::Update { indexes, deltas } => {
                PartitionReply::Applied(self.vector.apply_update(key, indexes, deltas)?)
            }
            SubRequestPayload::Range { start, end } => {
                PartitionReply::Range(self.vector.apply_range(key, *start, *end)?)
            }
        };
        tracing::trace!(
            operation = %request.operation_id,
            partition = %key,
            size = request.payload.len(),
            "Served sub-request"
        );
        Ok(reply)
    }
}
