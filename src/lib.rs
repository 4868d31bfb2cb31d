//! Maekawa distributed mutual exclusion: a fixed population of nodes takes
//! turns in a critical section by collecting grants from intersecting
//! request quorums, ordered by Lamport timestamps.
//!
//! The protocol core in [`protocol`] is a pure state machine; the server
//! runtime wraps it in a tokio event loop over TCP links.

#[macro_use]
mod utils;

pub mod protocol;
mod server;

pub use utils::{logger_init, Bitmap, MaekawaError};

pub use protocol::{
    Envelope, MaekawaNode, MsgKind, NodeId, NodeState, QuorumScheme,
    QuorumTable, TerminationTracker, Timestamp,
};

pub use server::{
    run_workload, MaekawaReplica, MutexHandle, ReplicaConfigMaekawa,
    RunSummary,
};
