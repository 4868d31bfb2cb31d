//! Requester-side handle to a running replica.

use crate::protocol::NodeId;
use crate::utils::MaekawaError;

use tokio::sync::{mpsc, oneshot};

/// Command from a `MutexHandle` to its replica's event loop. Each carries the
/// sender on which the loop reports the outcome.
#[derive(Debug)]
pub(crate) enum HandleCmd {
    /// Start contending; answered once the node is inside the CS.
    Acquire {
        tx_done: oneshot::Sender<Result<(), MaekawaError>>,
    },

    /// Leave the CS; answered once RELEASEs have been handed to transport.
    Release {
        tx_done: oneshot::Sender<Result<(), MaekawaError>>,
    },
}

/// Handle through which application code enters and exits the critical
/// section guarded by one replica. Cheap to clone; all clones drive the same
/// node, so callers must serialize acquire/release among themselves.
#[derive(Debug, Clone)]
pub struct MutexHandle {
    /// ID of the node this handle drives.
    id: NodeId,

    /// Sender side of the command channel into the replica loop.
    tx_cmd: mpsc::Sender<HandleCmd>,
}

impl MutexHandle {
    pub(crate) fn new(id: NodeId, tx_cmd: mpsc::Sender<HandleCmd>) -> Self {
        MutexHandle { id, tx_cmd }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Suspends until this node holds the critical section. Fails with an
    /// `Anomaly` if the node is not idle, or with a `Msg` error if the replica
    /// has stopped.
    pub async fn acquire(&self) -> Result<(), MaekawaError> {
        let (tx_done, rx_done) = oneshot::channel();
        self.tx_cmd.send(HandleCmd::Acquire { tx_done }).await?;
        rx_done.await?
    }

    /// Leaves the critical section. Fails with an `Anomaly` if the node is
    /// not inside it.
    pub async fn release(&self) -> Result<(), MaekawaError> {
        let (tx_done, rx_done) = oneshot::channel();
        self.tx_cmd.send(HandleCmd::Release { tx_done }).await?;
        rx_done.await?
    }
}
