//! Maekawa mutual exclusion protocol core: logical clocks, request quorums,
//! deferred-request queues, the per-node state machine, and termination
//! tracking. Nothing in here performs I/O.

mod clock;
mod messages;
mod node;
mod queue;
mod quorum;
mod termination;

#[cfg(test)]
mod sim_tests;

/// Node ID type, dense in `0..population`.
pub type NodeId = u8;

/// Lamport timestamp type.
pub type Timestamp = u64;

pub use clock::LamportClock;
pub use messages::{Envelope, MsgKind, Outgoing};
pub use node::{Effects, MaekawaNode, NodeState};
pub use queue::RequestQueue;
pub use quorum::{QuorumScheme, QuorumTable};
pub use termination::TerminationTracker;
