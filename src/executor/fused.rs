use std::sync::Arc;

use crate::backend::{
    BackendError, CollectiveCall, CommBackend, CommunicatorHandle, ExecutionError, StreamId,
};
use crate::config::SchedulerConfig;
use crate::plan::CollectivePlan;
use crate::store::{DeviceSetId, RequestId, RequestStore};

use super::Executor;

/// Stream-pool executor for NCCL-like backends. Fuses adjacent ready requests
/// that share a device set, bounded by a byte threshold and an op-count cap,
/// and pipelines unrelated groups by drawing streams round-robin from a fixed
/// pool.
pub struct FusedExecutor<B: CommBackend> {
    backend: B,
    store: Option<Arc<RequestStore>>,
    /// Indexed by `DeviceSetId`; created once at init, reused across rounds.
    communicators: Vec<CommunicatorHandle>,
    num_streams: usize,
    fusion_threshold: usize,
    fusion_max_ops: usize,
    current_stream_id: usize,
}

impl<B: CommBackend> FusedExecutor<B> {
    pub fn new(backend: B, config: &SchedulerConfig) -> Self {
        assert!(config.num_streams > 0, "stream pool must not be empty");
        assert!(config.fusion_max_ops > 0, "fusion_max_ops must be positive");
        FusedExecutor {
            backend,
            store: None,
            communicators: Vec::new(),
            num_streams: config.num_streams,
            fusion_threshold: config.fusion_threshold_bytes(),
            fusion_max_ops: config.fusion_max_ops,
            current_stream_id: 0,
        }
    }

    fn store(&self) -> &Arc<RequestStore> {
        self.store.as_ref().expect("executor not initialized")
    }
}

impl<B: CommBackend> Executor for FusedExecutor<B> {
    fn init(
        &mut self,
        plan: &CollectivePlan,
        store: Arc<RequestStore>,
    ) -> Result<(), BackendError> {
        for i in 0..store.device_set_count() {
            let device_set = store.device_set(DeviceSetId(i as u32));
            let comm = self.backend.create_communicator(device_set)?;
            self.communicators.push(comm);
        }
        log::debug!(
            "fused executor: {} requests, {} communicators, {} streams",
            plan.requests().count(),
            self.communicators.len(),
            self.num_streams
        );
        self.store = Some(store);
        Ok(())
    }

    fn group_requests(&self, request_ids: &[RequestId]) -> Vec<Vec<RequestId>> {
        let store = self.store();
        let mut groups: Vec<Vec<RequestId>> = Vec::new();
        let mut current: Vec<RequestId> = Vec::new();
        let mut current_bytes = 0usize;
        let mut current_set = DeviceSetId(0);
        for &id in request_ids {
            let entry = store.entry(id);
            let split = !current.is_empty()
                && (entry.device_set_id() != current_set
                    || current_bytes + entry.size_in_bytes() > self.fusion_threshold
                    || current.len() >= self.fusion_max_ops);
            if split {
                groups.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            if current.is_empty() {
                current_set = entry.device_set_id();
            }
            current_bytes += entry.size_in_bytes();
            current.push(id);
        }
        if !current.is_empty() {
            groups.push(current);
        }
        groups
    }

    fn execute_requests(&mut self, request_ids: &[RequestId]) {
        assert!(
            !request_ids.is_empty(),
            "fusion policy produced an empty group"
        );
        let store = Arc::clone(self.store());
        let device_set_id = store.entry(request_ids[0]).device_set_id();

        let mut calls = Vec::new();
        for &id in request_ids {
            let entry = store.entry(id);
            assert_eq!(
                entry.device_set_id(),
                device_set_id,
                "grouped requests span device sets"
            );
            let op_desc = &entry.desc().op_desc;
            for local_rank in 0..entry.local_rank_count() {
                let request = entry.get_runtime_request(local_rank);
                calls.push(CollectiveCall {
                    name: op_desc.name.clone(),
                    op: op_desc.op,
                    reduce_op: op_desc.reduce_op,
                    root: op_desc.root,
                    data_type: op_desc.data_type,
                    global_rank: entry.global_rank_for_local_rank(local_rank),
                    send_buf: request.send_buf,
                    recv_buf: request.recv_buf,
                    elem_cnt: request.elem_cnt,
                });
            }
        }

        let comm = self.communicators[device_set_id.0 as usize];
        let stream = StreamId(self.current_stream_id);
        self.current_stream_id = (self.current_stream_id + 1) % self.num_streams;

        log::trace!(
            "launching group of {} requests ({} calls) on stream {}",
            request_ids.len(),
            calls.len(),
            stream.0
        );
        let result = self
            .backend
            .launch(comm, stream, &calls)
            .map_err(ExecutionError::from);
        if let Err(err) = &result {
            log::error!(
                "backend launch failed for group starting at {}: {}",
                store.entry(request_ids[0]).name(),
                err
            );
        }

        // Drain every entry in the group before any continuation fires, so a
        // continuation that synchronously starts the next round never finds a
        // not-yet-drained slot. Entries drain even on failure so the next
        // round is not blocked.
        let mut drained = Vec::new();
        for &id in request_ids {
            let entry = store.entry(id);
            drained.extend(entry.reset_runtime_request().into_iter().flatten());
        }
        for request in drained {
            request.complete(result.clone());
        }
    }
}
