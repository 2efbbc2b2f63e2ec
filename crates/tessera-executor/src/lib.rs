//! # Tessera Executor
//!
//! Turns one logical request into per-partition work and back:
//!
//! 1. [`RequestSplitter`] splits a [`LogicalRequest`] into one
//!    [`PartitionSubRequest`] per partition.
//! 2. [`ShardDispatcher`] runs them on a bounded worker pool through a
//!    [`PartitionExecutor`].
//! 3. [`ShardResult`] aggregates the outcomes, tolerating partial failure;
//!    [`merge`] stitches successful replies back together.
//!
//! ```ignore
//! let subs = RequestSplitter::new().split_with(&request, &directory)?;
//! let result = dispatcher.dispatch(subs, Arc::new(VectorExecutor::new(vector)));
//! if result.wait() == ShardStatus::Done {
//!     let values = merge::index_values(dim, &result.into_outcome())?;
//! }
//! ```

pub mod dispatcher;
pub mod merge;
pub mod request;
pub mod result;
pub mod splitter;
pub mod vector_executor;

pub use dispatcher::{ExecutorError, PartitionExecutor, ShardDispatcher};
pub use request::{LogicalRequest, PartitionSubRequest, SubRequestPayload};
pub use result::{AggregateOutcome, PartitionOutcome, ShardResult, ShardStatus};
pub use splitter::RequestSplitter;
pub use vector_executor::{PartitionReply, VectorExecutor};
