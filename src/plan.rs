use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct JobId(pub u32);

/// One participant slot in a device set: which machine, and which device on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceDesc {
    pub machine_id: u32,
    pub device_idx: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    AllReduce,
    AllGather,
    ReduceScatter,
    Broadcast,
    Reduce,
}

impl OpKind {
    pub fn has_reduce_op(&self) -> bool {
        matches!(self, OpKind::AllReduce | OpKind::ReduceScatter | OpKind::Reduce)
    }

    pub fn has_root(&self) -> bool {
        matches!(self, OpKind::Broadcast | OpKind::Reduce)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceOpKind {
    Sum,
    Prod,
    Max,
    Min,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int8,
    Uint8,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float16,
    Float32,
    Float64,
}

impl DataType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Int8 | DataType::Uint8 => 1,
            DataType::Float16 => 2,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::Uint64 | DataType::Float64 => 8,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpDesc {
    /// Globally unique name of the collective operation.
    pub name: String,
    pub op: OpKind,
    /// Required for reducing ops, must be absent otherwise.
    pub reduce_op: Option<ReduceOpKind>,
    /// Global root rank for rooted ops (broadcast, reduce).
    pub root: Option<u32>,
    pub data_type: DataType,
    pub shape: Vec<i64>,
}

impl OpDesc {
    pub fn elem_cnt(&self) -> usize {
        self.shape.iter().product::<i64>() as usize
    }

    pub fn size_in_bytes(&self) -> usize {
        self.elem_cnt() * self.data_type.size_in_bytes()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestDesc {
    pub op_desc: OpDesc,
    /// Ordered mapping from global rank to device.
    pub device_set: Vec<DeviceDesc>,
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("duplicate request name {0}")]
    DuplicateRequestName(String),
    #[error("request {0}: empty device set")]
    EmptyDeviceSet(String),
    #[error("request {name}: device (machine {machine_id}, device {device_idx}) listed twice")]
    DuplicateDevice {
        name: String,
        machine_id: u32,
        device_idx: u32,
    },
    #[error("request {name}: non-positive shape dim {dim}")]
    InvalidShape { name: String, dim: i64 },
    #[error("request {0}: shape byte size overflows")]
    ShapeOverflow(String),
    #[error("request {0}: {1:?} requires a reduce_op")]
    MissingReduceOp(String, OpKind),
    #[error("request {0}: {1:?} does not take a reduce_op")]
    SpuriousReduceOp(String, OpKind),
    #[error("request {name}: root rank {root} outside device set of size {num_ranks}")]
    RootOutOfRange {
        name: String,
        root: u32,
        num_ranks: usize,
    },
    #[error("request {0}: {1:?} requires a root rank")]
    MissingRoot(String, OpKind),
}

/// Immutable description of every collective request in the cluster, produced
/// by the graph compiler and identical on all machines.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CollectivePlan {
    pub jobs: BTreeMap<JobId, Vec<RequestDesc>>,
}

impl CollectivePlan {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let plan: CollectivePlan = bincode::deserialize(bytes)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn requests(&self) -> impl Iterator<Item = (JobId, &RequestDesc)> {
        self.jobs
            .iter()
            .flat_map(|(job_id, descs)| descs.iter().map(move |desc| (*job_id, desc)))
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        let mut names = HashSet::new();
        for (_, desc) in self.requests() {
            let name = &desc.op_desc.name;
            if !names.insert(name.clone()) {
                return Err(PlanError::DuplicateRequestName(name.clone()));
            }
            if desc.device_set.is_empty() {
                return Err(PlanError::EmptyDeviceSet(name.clone()));
            }
            let mut devices = HashSet::new();
            for device in &desc.device_set {
                if !devices.insert(*device) {
                    return Err(PlanError::DuplicateDevice {
                        name: name.clone(),
                        machine_id: device.machine_id,
                        device_idx: device.device_idx,
                    });
                }
            }
            for &dim in &desc.op_desc.shape {
                if dim <= 0 {
                    return Err(PlanError::InvalidShape {
                        name: name.clone(),
                        dim,
                    });
                }
            }
            let size_in_bytes = desc
                .op_desc
                .shape
                .iter()
                .try_fold(1i64, |acc, &dim| acc.checked_mul(dim))
                .and_then(|elem_cnt| {
                    elem_cnt.checked_mul(desc.op_desc.data_type.size_in_bytes() as i64)
                });
            if size_in_bytes.is_none() {
                return Err(PlanError::ShapeOverflow(name.clone()));
            }
            let op = desc.op_desc.op;
            match (op.has_reduce_op(), desc.op_desc.reduce_op) {
                (true, None) => return Err(PlanError::MissingReduceOp(name.clone(), op)),
                (false, Some(_)) => return Err(PlanError::SpuriousReduceOp(name.clone(), op)),
                _ => {}
            }
            match (op.has_root(), desc.op_desc.root) {
                (true, None) => return Err(PlanError::MissingRoot(name.clone(), op)),
                (true, Some(root)) if root as usize >= desc.device_set.len() => {
                    return Err(PlanError::RootOutOfRange {
                        name: name.clone(),
                        root,
                        num_ranks: desc.device_set.len(),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    pub fn device(machine_id: u32, device_idx: u32) -> DeviceDesc {
        DeviceDesc {
            machine_id,
            device_idx,
        }
    }

    pub fn allreduce_desc(name: &str, elem_cnt: i64, device_set: Vec<DeviceDesc>) -> RequestDesc {
        RequestDesc {
            op_desc: OpDesc {
                name: name.to_owned(),
                op: OpKind::AllReduce,
                reduce_op: Some(ReduceOpKind::Sum),
                root: None,
                data_type: DataType::Float32,
                shape: vec![elem_cnt],
            },
            device_set,
        }
    }

    pub fn plan_of(descs: Vec<RequestDesc>) -> CollectivePlan {
        let mut jobs = BTreeMap::new();
        jobs.insert(JobId(0), descs);
        CollectivePlan { jobs }
    }
}
