use std::sync::Arc;

use thiserror::Error;

use crate::plan::{DataType, DeviceDesc, OpKind, ReduceOpKind};

/// Stable identity of one backend communicator, created once per distinct
/// device set and reused across rounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CommunicatorHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct StreamId(pub usize);

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("communicator setup: {0}")]
    CommunicatorSetup(String),
    #[error("communication library: {0}")]
    Library(String),
}

/// Failure of one fused launch, delivered to every completion continuation in
/// the affected group. Cheap to clone so a single backend error fans out.
#[derive(Clone, Debug, Error)]
#[error("{0}")]
pub struct ExecutionError(pub Arc<BackendError>);

impl From<BackendError> for ExecutionError {
    fn from(err: BackendError) -> Self {
        ExecutionError(Arc::new(err))
    }
}

/// One local rank's part of a fused backend launch.
#[derive(Clone, Debug)]
pub struct CollectiveCall {
    pub name: String,
    pub op: OpKind,
    pub reduce_op: Option<ReduceOpKind>,
    pub root: Option<u32>,
    pub data_type: DataType,
    pub global_rank: usize,
    pub send_buf: usize,
    pub recv_buf: usize,
    pub elem_cnt: usize,
}

/// Boundary to the communication primitive library. Implementations wrap an
/// NCCL-like transport; this crate only requires that a device set maps to a
/// stable communicator and that a batch of calls can be issued on a stream.
pub trait CommBackend: Send {
    fn create_communicator(
        &mut self,
        device_set: &[DeviceDesc],
    ) -> Result<CommunicatorHandle, BackendError>;

    fn launch(
        &mut self,
        comm: CommunicatorHandle,
        stream: StreamId,
        calls: &[CollectiveCall],
    ) -> Result<(), BackendError>;
}
