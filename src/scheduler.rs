use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender, TryRecvError};
use thiserror::Error;

use crate::config::SchedulerConfig;
use crate::executor::Executor;
use crate::plan::CollectivePlan;
use crate::request::{RankDesc, RuntimeRequest};
use crate::store::{RequestId, RequestStore, StoreError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    NotFound(#[from] StoreError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Caller-held token binding one (request, local rank) pairing. Created once,
/// reused across rounds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestHandle {
    request_id: RequestId,
    local_rank: usize,
}

impl RequestHandle {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }
}

enum SchedulerMessage {
    Ready(RequestId),
    Shutdown,
}

/// The orchestrator callers interact with. Owns the request store and an
/// execution worker thread; `schedule` records a contribution and, on the
/// ready edge, hands the request id to the worker without ever blocking on
/// remote ranks.
pub struct Scheduler {
    store: Arc<RequestStore>,
    ready_tx: Sender<SchedulerMessage>,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(
        plan: &CollectivePlan,
        config: &SchedulerConfig,
        mut executor: Box<dyn Executor>,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(RequestStore::new(plan, config.machine_id)?);
        executor.init(plan, Arc::clone(&store))?;
        let (ready_tx, ready_rx) = crossbeam::channel::unbounded();
        let worker = thread::Builder::new()
            .name("collsched-exec".to_owned())
            .spawn(move || run_executor(executor, ready_rx))?;
        log::info!(
            "scheduler started: {} requests ({} multi-node)",
            store.request_count(),
            store.max_multi_node_request_id()
        );
        Ok(Scheduler {
            store,
            ready_tx,
            worker: Some(worker),
        })
    }

    pub fn store(&self) -> &RequestStore {
        &self.store
    }

    pub fn create_request_handle(
        &self,
        rank_desc: &RankDesc,
    ) -> Result<RequestHandle, SchedulerError> {
        let request_id = self.store.request_id_for_name(&rank_desc.name)?;
        let entry = self.store.entry(request_id);
        let local_rank = entry
            .local_rank_for_global_rank(rank_desc.global_rank)
            .ok_or_else(|| {
                SchedulerError::InvalidArgument(format!(
                    "global rank {} of request {} is not local to this machine",
                    rank_desc.global_rank, rank_desc.name
                ))
            })?;
        Ok(RequestHandle {
            request_id,
            local_rank,
        })
    }

    /// Records one contribution. Returns immediately; waiting for remote ranks
    /// is implicit in the entry not reaching ready. Concurrent calls for
    /// different requests never contend; same-request calls serialize on the
    /// entry's own lock.
    pub fn schedule(&self, handle: &RequestHandle, request: Arc<RuntimeRequest>) {
        let entry = self.store.entry(handle.request_id);
        assert_eq!(
            request.elem_cnt,
            entry.elem_cnt(),
            "request {}: contribution element count {} does not match descriptor element count {}",
            entry.name(),
            request.elem_cnt,
            entry.elem_cnt()
        );
        if entry.add_runtime_request(handle.local_rank, request) {
            log::trace!("request {} locally ready", entry.name());
            self.ready_tx
                .send(SchedulerMessage::Ready(handle.request_id))
                .expect("execution worker exited");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = self.ready_tx.send(SchedulerMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Worker loop: block on the first ready id, then drain the channel so
/// simultaneously-ready requests land in one batch and the grouping policy
/// sees all fusion opportunities. Batches execute in store priority order.
fn run_executor(mut executor: Box<dyn Executor>, ready_rx: Receiver<SchedulerMessage>) {
    let mut shutdown = false;
    while !shutdown {
        let mut batch = Vec::new();
        match ready_rx.recv() {
            Ok(SchedulerMessage::Ready(id)) => batch.push(id),
            Ok(SchedulerMessage::Shutdown) | Err(_) => return,
        }
        loop {
            match ready_rx.try_recv() {
                Ok(SchedulerMessage::Ready(id)) => batch.push(id),
                Ok(SchedulerMessage::Shutdown) | Err(TryRecvError::Disconnected) => {
                    shutdown = true;
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
        batch.sort_unstable();
        log::trace!("executing batch of {} ready requests", batch.len());
        for group in executor.group_requests(&batch) {
            executor.execute_requests(&group);
        }
    }
}
