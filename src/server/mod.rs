//! Maekawa server runtime modules: transport, replica event loop, mutex
//! handle, and workload driver.

mod handle;
mod replica;
mod transport;
mod workload;

pub use handle::MutexHandle;
pub use replica::{MaekawaReplica, ReplicaConfigMaekawa, RunSummary};
pub use workload::run_workload;
