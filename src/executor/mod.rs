pub mod fused;

pub use fused::FusedExecutor;

use std::sync::Arc;

use crate::backend::BackendError;
use crate::plan::CollectivePlan;
use crate::store::{RequestId, RequestStore};

/// Execution capability behind the scheduler: decides how ready requests are
/// fused into groups and how each group is issued to the communication
/// backend. One concrete variant is constructed at startup from configuration
/// and never switched at runtime.
pub trait Executor: Send {
    /// One-time setup tying the executor to the store; pre-allocates one
    /// communicator per distinct device set.
    fn init(&mut self, plan: &CollectivePlan, store: Arc<RequestStore>)
        -> Result<(), BackendError>;

    /// Partitions a batch of ready request ids into fusable groups. The
    /// partition is order-preserving and contiguous: a later-priority request
    /// never jumps ahead of an earlier one.
    fn group_requests(&self, request_ids: &[RequestId]) -> Vec<Vec<RequestId>>;

    /// Issues one group as a single fused backend call and fires every
    /// contribution's completion continuation with the shared result.
    fn execute_requests(&mut self, request_ids: &[RequestId]);
}
