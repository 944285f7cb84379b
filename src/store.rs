use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::plan::{CollectivePlan, DeviceDesc, JobId, PlanError, RequestDesc};
use crate::request::RuntimeRequest;

/// Index of a request in the store's priority order. Identical on every
/// machine in the cluster, since the order is derived from plan data only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RequestId(pub u32);

/// Interned identity of a device set; requests with equal device sets share
/// one id and therefore one backend communicator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct DeviceSetId(pub u32);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no request named {0}")]
    NotFound(String),
}

struct EntryState {
    slots: Vec<Option<Arc<RuntimeRequest>>>,
    arrived: usize,
}

/// Per-request rendezvous state: one slot per locally-owned rank, an arrival
/// counter, and the descriptor-derived metadata computed once at construction.
pub struct RequestEntry {
    job_id: JobId,
    desc: RequestDesc,
    local_device_vec: Vec<DeviceDesc>,
    global_rank_to_local_rank: HashMap<usize, usize>,
    local_rank_to_global_rank: Vec<usize>,
    node_count: usize,
    elem_cnt: usize,
    size_in_bytes: usize,
    device_set_id: DeviceSetId,
    state: Mutex<EntryState>,
}

impl RequestEntry {
    fn new(job_id: JobId, desc: RequestDesc, machine_id: u32, device_set_id: DeviceSetId) -> Self {
        let mut local_device_vec = Vec::new();
        let mut global_rank_to_local_rank = HashMap::new();
        let mut local_rank_to_global_rank = Vec::new();
        let mut node_ids = BTreeSet::new();
        for (global_rank, device) in desc.device_set.iter().enumerate() {
            if device.machine_id == machine_id {
                global_rank_to_local_rank.insert(global_rank, local_rank_to_global_rank.len());
                local_rank_to_global_rank.push(global_rank);
                local_device_vec.push(*device);
            }
            node_ids.insert(device.machine_id);
        }
        let local_rank_count = local_device_vec.len();
        let elem_cnt = desc.op_desc.elem_cnt();
        let size_in_bytes = desc.op_desc.size_in_bytes();
        RequestEntry {
            job_id,
            desc,
            local_device_vec,
            global_rank_to_local_rank,
            local_rank_to_global_rank,
            node_count: node_ids.len(),
            elem_cnt,
            size_in_bytes,
            device_set_id,
            state: Mutex::new(EntryState {
                slots: (0..local_rank_count).map(|_| None).collect(),
                arrived: 0,
            }),
        }
    }

    /// Records one local rank's contribution and returns whether this arrival
    /// completed the local rendezvous. The returned ready-signal is the sole
    /// trigger for execution; no polling exists. Double submission into an
    /// occupied slot is a scheduling bug upstream and aborts.
    pub fn add_runtime_request(&self, local_rank: usize, request: Arc<RuntimeRequest>) -> bool {
        let mut state = self.state.lock().unwrap();
        assert!(
            local_rank < state.slots.len(),
            "request {}: local rank {} out of range (local rank count {})",
            self.name(),
            local_rank,
            state.slots.len()
        );
        assert!(
            state.slots[local_rank].is_none(),
            "request {}: duplicate contribution for local rank {} within one round",
            self.name(),
            local_rank
        );
        state.slots[local_rank] = Some(request);
        state.arrived += 1;
        state.arrived == state.slots.len()
    }

    /// Reads one contribution without tearing down the round.
    pub fn get_runtime_request(&self, local_rank: usize) -> Arc<RuntimeRequest> {
        let state = self.state.lock().unwrap();
        state.slots[local_rank]
            .as_ref()
            .unwrap_or_else(|| panic!("request {}: local rank {} has no contribution", self.name(), local_rank))
            .clone()
    }

    /// Drains all slots and zeroes the counter, returning the round's
    /// contributions. Called once per ready round by the executing side.
    pub fn reset_runtime_request(&self) -> Vec<Option<Arc<RuntimeRequest>>> {
        let mut state = self.state.lock().unwrap();
        let empty = (0..state.slots.len()).map(|_| None).collect();
        let drained = std::mem::replace(&mut state.slots, empty);
        state.arrived = 0;
        drained
    }

    pub fn name(&self) -> &str {
        &self.desc.op_desc.name
    }

    pub fn desc(&self) -> &RequestDesc {
        &self.desc
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn local_rank_count(&self) -> usize {
        self.local_device_vec.len()
    }

    pub fn local_device_vec(&self) -> &[DeviceDesc] {
        &self.local_device_vec
    }

    pub fn local_rank_for_global_rank(&self, global_rank: usize) -> Option<usize> {
        self.global_rank_to_local_rank.get(&global_rank).copied()
    }

    pub fn global_rank_for_local_rank(&self, local_rank: usize) -> usize {
        self.local_rank_to_global_rank[local_rank]
    }

    /// Number of distinct machines in the device set. Scheduling priority
    /// only; local readiness never depends on it.
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn elem_cnt(&self) -> usize {
        self.elem_cnt
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    pub fn device_set_id(&self) -> DeviceSetId {
        self.device_set_id
    }
}

/// Sole owner of all request entries, sorted at construction by
/// `(node_count desc, name asc)` so every machine traverses requests in the
/// same order; multi-machine collectives go first to overlap their network
/// latency with local work.
pub struct RequestStore {
    entries: Vec<RequestEntry>,
    name_to_request_id: HashMap<String, RequestId>,
    device_sets: Vec<Vec<DeviceDesc>>,
    max_multi_node_request_id: usize,
}

impl RequestStore {
    pub fn new(plan: &CollectivePlan, machine_id: u32) -> Result<Self, PlanError> {
        plan.validate()?;
        let mut descs: Vec<(JobId, RequestDesc)> = plan
            .requests()
            .map(|(job_id, desc)| (job_id, desc.clone()))
            .collect();
        descs.sort_by(|(_, a), (_, b)| {
            b.device_set_node_count()
                .cmp(&a.device_set_node_count())
                .then_with(|| a.op_desc.name.cmp(&b.op_desc.name))
        });

        let mut device_sets: Vec<Vec<DeviceDesc>> = Vec::new();
        let mut device_set_ids: HashMap<Vec<DeviceDesc>, DeviceSetId> = HashMap::new();
        let mut entries = Vec::with_capacity(descs.len());
        for (job_id, desc) in descs {
            let device_set_id = *device_set_ids
                .entry(desc.device_set.clone())
                .or_insert_with(|| {
                    device_sets.push(desc.device_set.clone());
                    DeviceSetId((device_sets.len() - 1) as u32)
                });
            entries.push(RequestEntry::new(job_id, desc, machine_id, device_set_id));
        }

        let mut name_to_request_id = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            name_to_request_id.insert(entry.name().to_owned(), RequestId(i as u32));
        }
        let max_multi_node_request_id = entries.iter().filter(|e| e.node_count() > 1).count();
        Ok(RequestStore {
            entries,
            name_to_request_id,
            device_sets,
            max_multi_node_request_id,
        })
    }

    pub fn entry(&self, request_id: RequestId) -> &RequestEntry {
        &self.entries[request_id.0 as usize]
    }

    pub fn request_id_for_name(&self, name: &str) -> Result<RequestId, StoreError> {
        self.name_to_request_id
            .get(name)
            .copied()
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))
    }

    pub fn request_count(&self) -> usize {
        self.entries.len()
    }

    /// Priority boundary: request ids below it span multiple machines and
    /// need cross-machine rendezvous; ids at or above it are purely local.
    pub fn max_multi_node_request_id(&self) -> usize {
        self.max_multi_node_request_id
    }

    pub fn device_set(&self, id: DeviceSetId) -> &[DeviceDesc] {
        &self.device_sets[id.0 as usize]
    }

    pub fn device_set_count(&self) -> usize {
        self.device_sets.len()
    }
}

impl RequestDesc {
    fn device_set_node_count(&self) -> usize {
        self.device_set
            .iter()
            .map(|d| d.machine_id)
            .collect::<BTreeSet<_>>()
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::test_util::*;

    fn dummy_request() -> Arc<RuntimeRequest> {
        RuntimeRequest::new(0, 0, 16, |_| {})
    }

    #[test]
    fn kth_arrival_signals_ready_exactly_once() {
        let plan = plan_of(vec![allreduce_desc(
            "allreduce_0",
            16,
            vec![device(0, 0), device(0, 1), device(0, 2)],
        )]);
        let store = RequestStore::new(&plan, 0).unwrap();
        let entry = store.entry(RequestId(0));
        assert!(!entry.add_runtime_request(0, dummy_request()));
        assert!(!entry.add_runtime_request(2, dummy_request()));
        assert!(entry.add_runtime_request(1, dummy_request()));
    }

    #[test]
    fn reset_round_trip() {
        let plan = plan_of(vec![allreduce_desc(
            "allreduce_0",
            16,
            vec![device(0, 0), device(0, 1)],
        )]);
        let store = RequestStore::new(&plan, 0).unwrap();
        let entry = store.entry(RequestId(0));
        assert!(!entry.add_runtime_request(0, dummy_request()));
        assert!(entry.add_runtime_request(1, dummy_request()));
        let drained = entry.reset_runtime_request();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|slot| slot.is_some()));
        // next round reaches ready again
        assert!(!entry.add_runtime_request(1, dummy_request()));
        assert!(entry.add_runtime_request(0, dummy_request()));
    }

    #[test]
    #[should_panic(expected = "duplicate contribution")]
    fn double_submission_aborts() {
        let plan = plan_of(vec![allreduce_desc(
            "allreduce_0",
            16,
            vec![device(0, 0), device(0, 1)],
        )]);
        let store = RequestStore::new(&plan, 0).unwrap();
        let entry = store.entry(RequestId(0));
        entry.add_runtime_request(0, dummy_request());
        entry.add_runtime_request(0, dummy_request());
    }

    #[test]
    fn multi_node_requests_sort_first() {
        // "a_local" sorts before "b_multi" by name, but node count dominates.
        let plan = plan_of(vec![
            allreduce_desc("a_local", 16, vec![device(0, 0)]),
            allreduce_desc(
                "b_multi",
                16,
                vec![device(0, 1), device(1, 0), device(2, 0)],
            ),
        ]);
        let store = RequestStore::new(&plan, 0).unwrap();
        assert_eq!(store.entry(RequestId(0)).name(), "b_multi");
        assert_eq!(store.entry(RequestId(1)).name(), "a_local");
        assert_eq!(store.max_multi_node_request_id(), 1);
    }

    #[test]
    fn name_tie_break_is_lexicographic() {
        let plan = plan_of(vec![
            allreduce_desc("b", 16, vec![device(0, 0), device(1, 0)]),
            allreduce_desc("a", 16, vec![device(0, 1), device(1, 1)]),
        ]);
        let store = RequestStore::new(&plan, 0).unwrap();
        assert_eq!(store.entry(RequestId(0)).name(), "a");
        assert_eq!(store.entry(RequestId(1)).name(), "b");
    }

    #[test]
    fn local_participation_restricted_to_this_machine() {
        let plan = plan_of(vec![allreduce_desc(
            "allreduce_0",
            16,
            vec![device(0, 0), device(1, 0), device(0, 1), device(1, 1)],
        )]);
        let store = RequestStore::new(&plan, 1).unwrap();
        let entry = store.entry(RequestId(0));
        assert_eq!(entry.local_rank_count(), 2);
        assert_eq!(entry.local_rank_for_global_rank(1), Some(0));
        assert_eq!(entry.local_rank_for_global_rank(3), Some(1));
        assert_eq!(entry.local_rank_for_global_rank(0), None);
        assert_eq!(entry.global_rank_for_local_rank(0), 1);
        assert_eq!(entry.global_rank_for_local_rank(1), 3);
        assert_eq!(entry.node_count(), 2);
    }

    #[test]
    fn readiness_is_machine_local() {
        // The request spans two machines; machine 0 owns a single rank and
        // its entry becomes ready after that one submission.
        let plan = plan_of(vec![allreduce_desc(
            "allreduce_0",
            16,
            vec![device(0, 0), device(1, 0)],
        )]);
        let store = RequestStore::new(&plan, 0).unwrap();
        let entry = store.entry(RequestId(0));
        assert_eq!(entry.local_rank_count(), 1);
        assert!(entry.add_runtime_request(0, dummy_request()));
    }

    #[test]
    fn device_sets_interned() {
        let plan = plan_of(vec![
            allreduce_desc("a", 16, vec![device(0, 0), device(0, 1)]),
            allreduce_desc("b", 16, vec![device(0, 0), device(0, 1)]),
            allreduce_desc("c", 16, vec![device(0, 0)]),
        ]);
        let store = RequestStore::new(&plan, 0).unwrap();
        let a = store.request_id_for_name("a").unwrap();
        let b = store.request_id_for_name("b").unwrap();
        let c = store.request_id_for_name("c").unwrap();
        assert_eq!(
            store.entry(a).device_set_id(),
            store.entry(b).device_set_id()
        );
        assert_ne!(
            store.entry(a).device_set_id(),
            store.entry(c).device_set_id()
        );
        assert_eq!(store.device_set_count(), 2);
    }

    #[test]
    fn unknown_name_is_not_found() {
        let plan = plan_of(vec![allreduce_desc("a", 16, vec![device(0, 0)])]);
        let store = RequestStore::new(&plan, 0).unwrap();
        assert!(matches!(
            store.request_id_for_name("missing"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn concurrent_arrivals_signal_ready_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let devices = (0..8).map(|i| device(0, i)).collect();
        let plan = plan_of(vec![allreduce_desc("allreduce_0", 16, devices)]);
        let store = Arc::new(RequestStore::new(&plan, 0).unwrap());
        let ready_edges = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|local_rank| {
                let store = Arc::clone(&store);
                let ready_edges = Arc::clone(&ready_edges);
                std::thread::spawn(move || {
                    let entry = store.entry(RequestId(0));
                    if entry.add_runtime_request(local_rank, RuntimeRequest::new(0, 0, 16, |_| {})) {
                        ready_edges.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(ready_edges.load(Ordering::SeqCst), 1);
    }
}
