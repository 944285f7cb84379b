pub mod backend;
pub mod config;
pub mod executor;
pub mod plan;
pub mod request;
pub mod scheduler;
pub mod store;

pub use config::SchedulerConfig;
pub use plan::CollectivePlan;
pub use request::{RankDesc, RuntimeRequest};
pub use scheduler::{RequestHandle, Scheduler};
pub use store::{RequestId, RequestStore};
